use crate::{
    model_service::SegmentationModel,
    prediction::PredictionOutcome,
    preprocess::{decode_upload, PreprocessError},
    server::SharedState,
};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use image::{DynamicImage, ImageFormat, RgbImage};
use serde::Serialize;
use std::{io::Cursor, time::Instant};
use thiserror::Error;
use tracing::instrument;

const ROUTE: &str = "/predict";
pub const DETECTIONS_HEADER: &str = "x-detections";

#[derive(Error, Debug)]
pub enum PredictImageError {
    #[error("Invalid upload: {0}")]
    Upload(#[from] PreprocessError),
    #[error("{0}")]
    Prediction(String),
    #[error("Image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("HTTP builder failed: {0}")]
    HttpBuilder(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for PredictImageError {
    fn into_response(self) -> Response {
        let status = match &self {
            PredictImageError::Upload(PreprocessError::UnsupportedFormat(_)) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            PredictImageError::Upload(_) => StatusCode::BAD_REQUEST,
            PredictImageError::Prediction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PredictImageError::Encode(_) | PredictImageError::HttpBuilder(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Vec::new();
    image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
    Ok(buffer)
}

#[instrument(skip(state, image_data), fields(bytes = image_data.len()))]
pub async fn predict_image<M: SegmentationModel>(
    State(state): State<SharedState<M>>,
    image_data: Bytes,
) -> Result<Response, PredictImageError> {
    state.metrics.record_request(ROUTE);

    let image = decode_upload(&image_data)?;

    let start = Instant::now();
    let outcome = state
        .predictor
        .predict_blocking(DynamicImage::ImageRgb8(image))
        .await;
    state
        .metrics
        .record_prediction_duration(start.elapsed().as_millis() as u64, ROUTE);

    let annotated = match outcome {
        PredictionOutcome::Segmented(annotated) => annotated,
        PredictionOutcome::Failed { message } => {
            state.metrics.record_prediction_failure(ROUTE);
            return Err(PredictImageError::Prediction(message));
        }
    };

    let png = encode_png(&annotated.image)?;

    Response::builder()
        .header(header::CONTENT_TYPE, "image/png")
        .header(DETECTIONS_HEADER, annotated.detections.to_string())
        .body(Body::from(png))
        .map_err(|e| PredictImageError::HttpBuilder(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        labels::ClassLabels,
        model_cache::ModelCache,
        model_service::{ModelError, ModelOutput},
        postprocess::PostprocessParams,
        prediction::Predictor,
        routes::render_index_page,
        telemetry::Metrics,
    };
    use image::Rgb;
    use ndarray::{Array, Array4, IxDyn};
    use std::sync::Arc;

    struct EmptyModelService {}

    impl SegmentationModel for EmptyModelService {
        fn run(&self, _input: &Array4<f32>) -> Result<ModelOutput, ModelError> {
            Ok(ModelOutput {
                detections: Array::zeros(IxDyn(&[1, 5, 3])),
                prototypes: None,
            })
        }
    }

    struct FailingModelService {}

    impl SegmentationModel for FailingModelService {
        fn run(&self, _input: &Array4<f32>) -> Result<ModelOutput, ModelError> {
            Err(ModelError::Inference("session closed".to_string()))
        }
    }

    fn state<M: SegmentationModel>(model: M) -> SharedState<M> {
        let params = PostprocessParams {
            input_size: 640,
            min_probability: 0.25,
            iou_threshold: 0.7,
            mask_threshold: 0.5,
        };
        SharedState {
            predictor: Predictor::new(
                Arc::new(model),
                Arc::new(ClassLabels::default()),
                params,
                None,
            ),
            models: Arc::new(ModelCache::new(|| {
                Err(ModelError::Load("weights/unused.onnx".to_string()))
            })),
            index_page: Arc::new(render_index_page("Lung Cancer Detection")),
            logo: Bytes::from_static(b"logo"),
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    fn png_upload() -> Bytes {
        let image = RgbImage::from_pixel(32, 24, Rgb([90, 90, 90]));
        Bytes::from(encode_png(&image).unwrap())
    }

    #[tokio::test]
    async fn test_predict_image_returns_png() {
        let response = predict_image(State(state(EmptyModelService {})), png_upload())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(response.headers()[DETECTIONS_HEADER], "0");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let decoded = image::load_from_memory(&body).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[tokio::test]
    async fn test_predict_image_reports_failure() {
        let error = predict_image(State(state(FailingModelService {})), png_upload())
            .await
            .unwrap_err();

        assert!(error.to_string().contains("session closed"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"]
            .as_str()
            .unwrap()
            .starts_with("Prediction Error: "));
    }

    #[tokio::test]
    async fn test_predict_image_rejects_bad_uploads() {
        let error = predict_image(
            State(state(EmptyModelService {})),
            Bytes::from_static(b"GIF89a\x01\x00\x01\x00"),
        )
        .await
        .unwrap_err();
        assert_eq!(
            error.into_response().status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );

        let error = predict_image(State(state(EmptyModelService {})), Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);

        let error = predict_image(
            State(state(EmptyModelService {})),
            Bytes::from_static(b"not an image"),
        )
        .await
        .unwrap_err();
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
