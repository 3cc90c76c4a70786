//! REST surface: `/`, `/health`, `/api/v1/predict`.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::InvalidHeaderValue;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{AllowHeaders, AllowMethods, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::error::{DecodeError, ServiceError};
use crate::labels::RiskLevel;
use crate::service::{Diagnosis, DiagnosisRequest, DiagnosisService};

pub type SharedService = Arc<DiagnosisService>;

/// Request bodies above this size are rejected before decoding.
pub const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MimeType {
    #[default]
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/jpg")]
    Jpg,
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub image_base64: String,
    #[serde(default)]
    pub mime_type: MimeType,
    #[serde(default)]
    pub preprocessing_method: Option<String>,
    #[serde(default)]
    pub include_gradcam: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RawPrediction {
    pub index: usize,
    pub logits: Vec<f32>,
    pub probabilities: Vec<f32>,
    pub preprocessing: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictResponse {
    pub diagnosis: String,
    /// Percentage, two decimals.
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub recommendations: String,
    pub raw_prediction: RawPrediction,
    /// Base64 PNG of the Grad-CAM panel.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gradcam: Option<String>,
}

impl From<Diagnosis> for PredictResponse {
    fn from(d: Diagnosis) -> Self {
        Self {
            diagnosis: d.label().to_string(),
            confidence: percent(d.prediction.confidence),
            risk_level: d.risk,
            recommendations: d.recommendation.to_string(),
            raw_prediction: RawPrediction {
                index: d.prediction.index,
                logits: d.prediction.logits,
                probabilities: d.prediction.probabilities,
                preprocessing: d.preprocessing.name().to_string(),
            },
            gradcam: d.gradcam_png.map(|png| STANDARD.encode(png)),
        }
    }
}

fn percent(p: f32) -> f64 {
    (p as f64 * 10_000.0).round() / 100.0
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
}

/// Failure as an HTTP response with a `{"detail": ...}` body. Server errors
/// get a generic `detail`; the full error chain is logged.
#[derive(Debug)]
pub enum ApiError {
    Service(ServiceError),
    /// Body was not a valid `PredictRequest`.
    Body(JsonRejection),
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self::Service(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::Body(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Body(rejection) => rejection.status(),
            ApiError::Service(ServiceError::ModelNotLoaded) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Service(ServiceError::Decode(_)) => StatusCode::BAD_REQUEST,
            ApiError::Service(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn detail(&self) -> String {
        match self {
            ApiError::Body(rejection) => rejection.body_text(),
            ApiError::Service(ServiceError::ModelNotLoaded) => "Model not loaded".to_string(),
            ApiError::Service(ServiceError::Decode(
                DecodeError::PayloadTooShort | DecodeError::Base64(_),
            )) => "Invalid base64 image payload".to_string(),
            ApiError::Service(ServiceError::Decode(DecodeError::UnsupportedPreprocessing(name))) => {
                format!("Unsupported preprocessing method: {name}")
            }
            ApiError::Service(ServiceError::Decode(_)) => "Invalid image data".to_string(),
            ApiError::Service(_) => "Inference error".to_string(),
        }
    }

    fn error(&self) -> &(dyn std::error::Error + 'static) {
        match self {
            ApiError::Service(e) => e,
            ApiError::Body(e) => e,
        }
    }
}

/// `outer: inner: innermost`
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        chain.push_str(": ");
        chain.push_str(&e.to_string());
        source = e.source();
    }
    chain
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let chain = error_chain(self.error());
        if status.is_server_error() {
            error!("Request failed ({status}): {chain}");
        } else {
            warn!("Rejected request ({status}): {chain}");
        }
        (status, Json(json!({ "detail": self.detail() }))).into_response()
    }
}

/// GET / - liveness banner
pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Backend is running",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /health
pub async fn health(State(service): State<SharedService>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model_loaded: service.is_loaded(),
    })
}

/// POST /api/v1/predict
pub async fn predict(
    State(service): State<SharedService>,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let Json(body) = payload?;
    debug!(
        "Predict request: {:?}, {} base64 chars",
        body.mime_type,
        body.image_base64.len()
    );
    let request = DiagnosisRequest {
        image_base64: body.image_base64,
        preprocessing: body.preprocessing_method,
        include_gradcam: body.include_gradcam,
    };
    let diagnosis = tokio::task::spawn_blocking(move || service.diagnose(&request))
        .await
        .map_err(|e| ServiceError::Join(e.to_string()))??;
    Ok(Json(diagnosis.into()))
}

pub fn router(service: SharedService, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/v1/predict", post(predict))
        .with_state(service)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// `*` allows any origin without credentials; anything else allows exactly
/// that origin with credentials.
pub fn cors_layer(origin: &str) -> Result<CorsLayer, InvalidHeaderValue> {
    if origin.trim() == "*" {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    }
    Ok(CorsLayer::new()
        .allow_origin(HeaderValue::from_str(origin.trim())?)
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request()))
}
