use ndarray::{Array4, ArrayD};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Unexpected model output: {0}")]
    Output(String),
}

/// Raw tensors produced by one forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `[1, 4 + classes + mask_dim, candidates]`
    pub detections: ArrayD<f32>,
    /// `[1, mask_dim, height, width]`, absent for detection-only models.
    pub prototypes: Option<ArrayD<f32>>,
}

pub trait SegmentationModel: Send + Sync + 'static {
    fn run(&self, input: &Array4<f32>) -> Result<ModelOutput, ModelError>;
}
