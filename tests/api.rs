use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http_body_util::BodyExt;
use image::{Rgb, RgbImage};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::{Value, json};
use tower::ServiceExt;

use retinoscan::api::{HealthResponse, PredictResponse};
use retinoscan::classifier::ExplainBackend;
use retinoscan::labels::CLASS_LABELS;
use retinoscan::visualize::encode_png;
use retinoscan::{
    Classifier, ClassifierConfig, DiagnosisService, DrGrade, RiskLevel, cors_layer, router,
};

fn app(service: DiagnosisService) -> Router {
    router(Arc::new(service), cors_layer("*").unwrap())
}

fn loaded_app() -> Router {
    let config = ClassifierConfig::tiny();
    let model = config.network.init::<ExplainBackend>(&Default::default());
    app(DiagnosisService::with_classifier(Classifier::from_model(model, config)))
}

fn random_png_base64(seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let img = RgbImage::from_fn(64, 48, |_, _| Rgb([rng.r#gen(), rng.r#gen(), rng.r#gen()]));
    STANDARD.encode(encode_png(&img).unwrap())
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn post_predict(app: Router, body: Value) -> (StatusCode, Value) {
    let request = Request::post("/api/v1/predict")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn root_reports_running() {
    let (status, body) = get(loaded_app(), "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Backend is running");
}

#[tokio::test]
async fn health_tracks_model_state() {
    let (status, body) = get(app(DiagnosisService::new(ClassifierConfig::tiny())), "/health").await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = serde_json::from_value(body).unwrap();
    assert_eq!(health.status, "ok");
    assert!(!health.model_loaded);

    let (_, body) = get(loaded_app(), "/health").await;
    let health: HealthResponse = serde_json::from_value(body).unwrap();
    assert!(health.model_loaded);
}

#[tokio::test]
async fn predict_without_model_is_unavailable() {
    let (status, body) = post_predict(
        app(DiagnosisService::new(ClassifierConfig::tiny())),
        json!({ "image_base64": random_png_base64(1) }),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["detail"], "Model not loaded");
}

#[tokio::test]
async fn malformed_base64_is_a_client_error() {
    let (status, body) = post_predict(
        loaded_app(),
        json!({ "image_base64": "@@@@ not base64 at all @@@@", "mime_type": "image/png" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Invalid base64 image payload");
}

#[tokio::test]
async fn short_payload_is_a_client_error() {
    let (status, _) = post_predict(loaded_app(), json!({ "image_base64": "  abc  " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn undecodable_image_is_a_client_error() {
    let payload = STANDARD.encode(b"these bytes are valid base64 but not an image");
    let (status, body) = post_predict(loaded_app(), json!({ "image_base64": payload })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Invalid image data");
}

#[tokio::test]
async fn unsupported_mime_type_is_rejected_by_schema() {
    let (status, body) = post_predict(
        loaded_app(),
        json!({ "image_base64": random_png_base64(2), "mime_type": "image/gif" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.starts_with("Failed to deserialize the JSON body"), "{detail}");
    assert!(detail.contains("mime_type"), "{detail}");
}

#[tokio::test]
async fn malformed_json_gets_a_detail_body() {
    let request = Request::post("/api/v1/predict")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"image_base64": "#))
        .unwrap();
    let response = loaded_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.starts_with("Failed to parse the request body as JSON"), "{detail}");
}

#[tokio::test]
async fn missing_content_type_gets_a_detail_body() {
    let request = Request::post("/api/v1/predict")
        .body(Body::from(json!({ "image_base64": random_png_base64(6) }).to_string()))
        .unwrap();
    let response = loaded_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn valid_image_is_graded() {
    let (status, body) = post_predict(
        loaded_app(),
        json!({ "image_base64": random_png_base64(3), "mime_type": "image/png" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body.get("gradcam").is_none());

    let response: PredictResponse = serde_json::from_value(body).unwrap();
    assert!(CLASS_LABELS.contains(&response.diagnosis.as_str()));
    assert!((0.0..=100.0).contains(&response.confidence));
    let scaled = response.confidence * 100.0;
    assert!((scaled - scaled.round()).abs() < 1e-6);

    let grade = DrGrade::from_index(response.raw_prediction.index).unwrap();
    assert_eq!(grade.label(), response.diagnosis);
    assert_eq!(response.risk_level, grade.risk());
    assert_ne!(response.risk_level, RiskLevel::Unknown);
    assert_eq!(response.recommendations, grade.recommendation());
    assert_eq!(response.raw_prediction.logits.len(), 5);
    assert_eq!(response.raw_prediction.preprocessing, "rescale_1_255");
    let total: f32 = response.raw_prediction.probabilities.iter().sum();
    assert!((total - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn repeated_requests_agree() {
    let app = loaded_app();
    let body = json!({ "image_base64": random_png_base64(4) });
    let (_, first) = post_predict(app.clone(), body.clone()).await;
    let (_, second) = post_predict(app, body).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn gradcam_panel_is_returned_on_request() {
    let payload = format!("data:image/png;base64,{}", random_png_base64(5));
    let (status, body) = post_predict(
        loaded_app(),
        json!({
            "image_base64": payload,
            "preprocessing_method": "gaussian_filtered",
            "include_gradcam": true,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["rawPrediction"]["preprocessing"], "gaussian_filtered");

    let png = STANDARD.decode(body["gradcam"].as_str().unwrap()).unwrap();
    let panel = image::load_from_memory(&png).unwrap();
    assert_eq!((panel.width(), panel.height()), (64, 32));
}
