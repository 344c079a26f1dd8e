use crate::{
    annotate::render_detections,
    labels::ClassLabels,
    model_service::{ModelError, SegmentationModel},
    postprocess::{decode_output, PostprocessError, PostprocessParams},
    preprocess::{image_to_tensor, PreprocessError},
};
use ab_glyph::FontVec;
use image::{DynamicImage, RgbImage};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("{0}")]
    Preprocess(#[from] PreprocessError),
    #[error("{0}")]
    Model(#[from] ModelError),
    #[error("{0}")]
    Postprocess(#[from] PostprocessError),
    #[error("prediction worker panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone)]
pub struct AnnotatedImage {
    pub image: RgbImage,
    pub detections: usize,
}

/// Result of one prediction request. Failures are reported here instead of
/// being returned as errors so a bad upload never takes the page down.
#[derive(Debug, Clone)]
pub enum PredictionOutcome {
    Segmented(AnnotatedImage),
    Failed { message: String },
}

impl PredictionOutcome {
    pub fn failed(error: PredictionError) -> Self {
        PredictionOutcome::Failed {
            message: format!("Prediction Error: {}", error),
        }
    }

    pub fn into_image(self) -> Option<RgbImage> {
        match self {
            PredictionOutcome::Segmented(annotated) => Some(annotated.image),
            PredictionOutcome::Failed { .. } => None,
        }
    }
}

pub struct Predictor<M: SegmentationModel> {
    model: Arc<M>,
    labels: Arc<ClassLabels>,
    params: PostprocessParams,
    font: Option<Arc<FontVec>>,
}

impl<M: SegmentationModel> Clone for Predictor<M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            labels: self.labels.clone(),
            params: self.params,
            font: self.font.clone(),
        }
    }
}

impl<M: SegmentationModel> Predictor<M> {
    pub fn new(
        model: Arc<M>,
        labels: Arc<ClassLabels>,
        params: PostprocessParams,
        font: Option<Arc<FontVec>>,
    ) -> Self {
        Self {
            model,
            labels,
            params,
            font,
        }
    }

    #[instrument(skip_all, fields(width = image.width(), height = image.height()))]
    pub fn predict(&self, image: &DynamicImage) -> PredictionOutcome {
        match self.try_predict(image) {
            Ok(annotated) => {
                tracing::info!("Prediction returned {} detections", annotated.detections);
                PredictionOutcome::Segmented(annotated)
            }
            Err(e) => {
                tracing::error!("Prediction failed: {}", e);
                PredictionOutcome::failed(e)
            }
        }
    }

    /// Runs `predict` on the blocking pool; a panic inside the model call is
    /// reported as a failed outcome.
    pub async fn predict_blocking(&self, image: DynamicImage) -> PredictionOutcome {
        let predictor = self.clone();
        match tokio::task::spawn_blocking(move || predictor.predict(&image)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Prediction worker failed: {}", e);
                PredictionOutcome::failed(PredictionError::Panicked(e.to_string()))
            }
        }
    }

    fn try_predict(&self, image: &DynamicImage) -> Result<AnnotatedImage, PredictionError> {
        let rgb = image.to_rgb8();
        let input = image_to_tensor(image, self.params.input_size)?;

        let output = self.model.run(&input)?;
        let detections = decode_output(&output, rgb.width(), rgb.height(), &self.params)?;

        for (i, detection) in detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: class_id={}, confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1}), mask={}",
                i,
                detection.class_id,
                detection.confidence,
                detection.bbox.x1,
                detection.bbox.y1,
                detection.bbox.x2,
                detection.bbox.y2,
                detection.mask.is_some()
            );
        }

        let image = render_detections(&rgb, &detections, &self.labels, self.font.as_deref());

        Ok(AnnotatedImage {
            image,
            detections: detections.len(),
        })
    }
}
