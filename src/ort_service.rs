use crate::{
    config::{ModelConfig, Validatable},
    model_service::{ModelError, ModelOutput, SegmentationModel},
};
use ndarray::{Array4, ArrayD};
use ort::{
    execution_providers::TensorRTExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
    value::{DynValue, TensorRef},
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

const DETECTIONS_OUTPUT: &str = "output0";
const PROTOTYPES_OUTPUT: &str = "output1";

pub struct OrtModelService {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    has_prototypes: bool,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> Result<Self, ModelError> {
        if model_config.use_tensorrt {
            ort::init()
                .with_execution_providers([TensorRTExecutionProvider::default()
                    .with_engine_cache(true)
                    .build()])
                .commit()
                .map_err(|e| ModelError::Load(e.to_string()))?;
        }

        let model_path = model_config.get_path();
        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(&model_path)?;
                Ok(Mutex::new(session))
            })
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| ModelError::Load(format!("{:?}: {}", model_path, e)))?;

        let has_prototypes = match sessions.first() {
            Some(session) => {
                let session = session
                    .lock()
                    .map_err(|e| ModelError::Load(format!("session mutex poisoned: {}", e)))?;
                session
                    .outputs
                    .iter()
                    .any(|output| output.name == PROTOTYPES_OUTPUT)
            }
            None => false,
        };

        tracing::info!(
            "Created {} ONNX sessions from {:?} (segmentation: {})",
            num_instances,
            model_path,
            has_prototypes
        );

        Ok(Self {
            sessions,
            counter: AtomicUsize::new(0),
            has_prototypes,
        })
    }
}

fn extract(value: &DynValue, name: &str) -> Result<ArrayD<f32>, ModelError> {
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| ModelError::Output(format!("failed to extract {}: {}", name, e)))?;

    ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
        .map_err(|e| ModelError::Output(format!("invalid {} shape: {}", name, e)))
}

impl SegmentationModel for OrtModelService {
    fn run(&self, input: &Array4<f32>) -> Result<ModelOutput, ModelError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| ModelError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| ModelError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelError::Inference(e.to_string()))?;

        let detections = extract(&outputs[DETECTIONS_OUTPUT], DETECTIONS_OUTPUT)?;
        let prototypes = if self.has_prototypes {
            Some(extract(&outputs[PROTOTYPES_OUTPUT], PROTOTYPES_OUTPUT)?)
        } else {
            None
        };

        Ok(ModelOutput {
            detections,
            prototypes,
        })
    }
}
