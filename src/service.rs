use std::path::Path;
use std::sync::{Arc, OnceLock};

use ab_glyph::FontVec;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::classifier::{Classifier, ClassifierConfig};
use crate::error::{DecodeError, LoadError, ServiceError};
use crate::labels::RiskLevel;
use crate::postprocess::Prediction;
use crate::preprocess::{PreprocessMethod, Processor};
use crate::visualize::{encode_png, render_gradcam};

/// Shortest payload worth decoding.
pub const MIN_PAYLOAD_LEN: usize = 10;

/// Transport-independent prediction request.
#[derive(Debug, Clone, Default)]
pub struct DiagnosisRequest {
    pub image_base64: String,
    /// `None` selects the default method.
    pub preprocessing: Option<String>,
    pub include_gradcam: bool,
}

#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub prediction: Prediction,
    pub risk: RiskLevel,
    pub recommendation: &'static str,
    pub preprocessing: PreprocessMethod,
    /// Side-by-side Grad-CAM panel, PNG encoded.
    pub gradcam_png: Option<Vec<u8>>,
}

impl Diagnosis {
    pub fn label(&self) -> &'static str {
        self.prediction.label()
    }
}

/// Owns the model slot and runs the request pipeline.
///
/// The slot starts empty; [`DiagnosisService::load`] fills it once. Until
/// then every request fails with [`ServiceError::ModelNotLoaded`].
pub struct DiagnosisService {
    config: ClassifierConfig,
    processor: Processor,
    classifier: OnceLock<Arc<Classifier>>,
    font: Option<FontVec>,
}

impl DiagnosisService {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            processor: Processor::new(config.preprocess.clone()),
            config,
            classifier: OnceLock::new(),
            font: None,
        }
    }

    /// Service with an already loaded classifier.
    pub fn with_classifier(classifier: Classifier) -> Self {
        let service = Self::new(classifier.config().clone());
        let _ = service.classifier.set(Arc::new(classifier));
        service
    }

    /// Caption Grad-CAM panels with this font.
    pub fn with_font(mut self, font: FontVec) -> Self {
        self.font = Some(font);
        self
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.classifier.get().is_some()
    }

    /// Load the checkpoint into the model slot. Blocking.
    pub fn load(&self, path: &Path) -> Result<(), LoadError> {
        if self.is_loaded() {
            warn!("Model already loaded, ignoring {:?}", path);
            return Ok(());
        }
        info!("Loading model from {:?}", path);
        let classifier = Classifier::load(path, self.config.clone())?;
        if self.classifier.set(Arc::new(classifier)).is_err() {
            warn!("Model was loaded concurrently, keeping the first one");
        }
        info!("Model loaded");
        Ok(())
    }

    fn classifier(&self) -> Result<&Arc<Classifier>, ServiceError> {
        self.classifier.get().ok_or(ServiceError::ModelNotLoaded)
    }

    /// Full pipeline for a base64 payload. Blocking.
    pub fn diagnose(&self, request: &DiagnosisRequest) -> Result<Diagnosis, ServiceError> {
        // model availability is checked before the payload is looked at
        self.classifier()?;

        let bytes = decode_base64(&request.image_base64)?;
        let image = image::load_from_memory(&bytes).map_err(DecodeError::from)?;
        let method = match request.preprocessing.as_deref() {
            Some(name) => name.parse::<PreprocessMethod>()?,
            None => PreprocessMethod::default(),
        };
        self.diagnose_image(&image, method, request.include_gradcam)
    }

    /// Pipeline for an already decoded image. Blocking.
    pub fn diagnose_image(
        &self,
        image: &DynamicImage,
        method: PreprocessMethod,
        include_gradcam: bool,
    ) -> Result<Diagnosis, ServiceError> {
        let classifier = self.classifier()?;
        let (resized, input) = self.processor.preprocess_one(image, method)?;
        debug!("Preprocessed input {:?} with {}", input.shape(), method.name());

        let prediction = classifier.predict(&input)?;
        info!(
            diagnosis = prediction.label(),
            confidence = prediction.confidence,
            "Prediction complete"
        );

        let gradcam_png = if include_gradcam {
            let heatmap = classifier.explain(&input, prediction.index)?;
            let panel = render_gradcam(&resized, &heatmap, prediction.label(), self.font.as_ref())?;
            Some(encode_png(&panel)?)
        } else {
            None
        };

        Ok(Diagnosis {
            risk: prediction.grade.risk(),
            recommendation: prediction.grade.recommendation(),
            preprocessing: method,
            gradcam_png,
            prediction,
        })
    }
}

/// Decode a base64 image payload. Whitespace is ignored and a
/// `data:<mime>;base64,` prefix is stripped.
pub fn decode_base64(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let body = match compact.strip_prefix("data:") {
        Some(rest) => rest.split_once(";base64,").map_or(compact.as_str(), |(_, b)| b),
        None => compact.as_str(),
    };
    if body.len() < MIN_PAYLOAD_LEN {
        return Err(DecodeError::PayloadTooShort);
    }
    Ok(STANDARD.decode(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ExplainBackend;
    use crate::labels::DrGrade;
    use image::{Rgb, RgbImage};

    fn png_base64(w: u32, h: u32) -> String {
        let img = RgbImage::from_fn(w, h, |x, y| Rgb([(x * 7) as u8, (y * 5) as u8, 90]));
        STANDARD.encode(encode_png(&img).unwrap())
    }

    fn tiny_service() -> DiagnosisService {
        let config = ClassifierConfig::tiny();
        let model = config.network.init::<ExplainBackend>(&Default::default());
        DiagnosisService::with_classifier(Classifier::from_model(model, config))
    }

    #[test]
    fn base64_tolerates_whitespace_and_data_url() {
        let raw = b"fundus-bytes-0123";
        let encoded = STANDARD.encode(raw);
        let (head, tail) = encoded.split_at(6);
        let spaced = format!("  {head}\n{tail} ");
        assert_eq!(decode_base64(&spaced).unwrap(), raw);
        let data_url = format!("data:image/png;base64,{encoded}");
        assert_eq!(decode_base64(&data_url).unwrap(), raw);
    }

    #[test]
    fn short_or_malformed_payloads_are_decode_errors() {
        assert!(matches!(decode_base64("abc"), Err(DecodeError::PayloadTooShort)));
        assert!(matches!(
            decode_base64("this is not base64!!"),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn unloaded_service_refuses_before_decoding() {
        let service = DiagnosisService::new(ClassifierConfig::tiny());
        assert!(!service.is_loaded());
        let request = DiagnosisRequest {
            image_base64: "!!!".into(),
            ..Default::default()
        };
        assert!(matches!(
            service.diagnose(&request),
            Err(ServiceError::ModelNotLoaded)
        ));
    }

    #[test]
    fn missing_checkpoint_leaves_service_unloaded() {
        let service = DiagnosisService::new(ClassifierConfig::tiny());
        let err = service.load(Path::new("/nonexistent/best_model.pth")).unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
        assert!(!service.is_loaded());
    }

    #[test]
    fn checkpoint_on_disk_loads_into_slot() {
        let config = ClassifierConfig::tiny();
        let model = config.network.init::<ExplainBackend>(&Default::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.mpk");
        crate::checkpoint::save_checkpoint(&model, &path).unwrap();

        let service = DiagnosisService::new(config);
        service.load(&path).unwrap();
        assert!(service.is_loaded());
    }

    #[test]
    fn image_bytes_that_are_not_an_image_fail_decoding() {
        let request = DiagnosisRequest {
            image_base64: STANDARD.encode(b"plain text, not a picture"),
            ..Default::default()
        };
        assert!(matches!(
            tiny_service().diagnose(&request),
            Err(ServiceError::Decode(DecodeError::Image(_)))
        ));
    }

    #[test]
    fn unknown_preprocessing_is_a_decode_error() {
        let request = DiagnosisRequest {
            image_base64: png_base64(40, 40),
            preprocessing: Some("clahe".into()),
            include_gradcam: false,
        };
        assert!(matches!(
            tiny_service().diagnose(&request),
            Err(ServiceError::Decode(DecodeError::UnsupportedPreprocessing(_)))
        ));
    }

    #[test]
    fn diagnosis_is_consistent_with_prediction() {
        let service = tiny_service();
        let request = DiagnosisRequest {
            image_base64: png_base64(48, 40),
            preprocessing: Some("gaussian_filtered".into()),
            include_gradcam: true,
        };
        let diagnosis = service.diagnose(&request).unwrap();
        let grade = DrGrade::from_index(diagnosis.prediction.index).unwrap();
        assert_eq!(diagnosis.label(), grade.label());
        assert_eq!(diagnosis.risk, grade.risk());
        assert_eq!(diagnosis.preprocessing, PreprocessMethod::GaussianFiltered);

        let png = diagnosis.gradcam_png.unwrap();
        let panel = image::load_from_memory(&png).unwrap();
        assert_eq!((panel.width(), panel.height()), (64, 32));

        let again = service.diagnose(&request).unwrap();
        assert_eq!(again.prediction, diagnosis.prediction);
    }
}
