//! Black-box forward-pass providers
//!
//! The tiled processor only needs "map an N×3×H×W normalized batch to an
//! N×C×h×w score tensor". Concrete providers are chosen once from a
//! [`BackboneConfig`] and used through the [`NetworkBackbone`] trait.

use crate::onnx_utils::{create_cpu_only_session, create_optimized_session};
use crate::InferenceError;
use ndarray::{Array4, ArrayView4};
use ort::{session::Session, value::TensorRef};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

/// Forward-pass capability of a segmentation network
///
/// Implementations must be callable from several worker threads; providers
/// backed by a single accelerator context serialize calls internally.
pub trait NetworkBackbone: Send + Sync {
    /// Human-readable name for logging
    fn name(&self) -> &str;

    /// Number of output classes (C in the N×C×h×w output)
    fn num_classes(&self) -> usize;

    /// Largest (height, width) the network accepts, if bounded
    fn max_input_size(&self) -> Option<(usize, usize)> {
        None
    }

    /// Run a normalized N×3×H×W batch through the network
    fn forward(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>, InferenceError>;
}

/// Backbone selection, resolved once by [`build_backbone`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackboneConfig {
    /// ONNX model exported with an N×3×H×W input and N×C×h×w output
    Onnx {
        model_path: PathBuf,
        num_classes: usize,
        /// Upper bound on crop size for fixed-shape exports
        #[serde(default)]
        max_input_size: Option<(usize, usize)>,
        /// Skip CoreML/CUDA execution providers
        #[serde(default)]
        cpu_only: bool,
    },
}

/// Instantiate the backbone described by `config`
///
/// # Errors
/// Returns `MissingCheckpoint` when the model file does not exist, before
/// any session is created.
pub fn build_backbone(config: &BackboneConfig) -> Result<Box<dyn NetworkBackbone>, InferenceError> {
    match config {
        BackboneConfig::Onnx {
            model_path,
            num_classes,
            max_input_size,
            cpu_only,
        } => {
            let backbone = OnnxBackbone::new(model_path.clone(), *num_classes, *cpu_only)?
                .with_max_input_size(*max_input_size);
            Ok(Box::new(backbone))
        }
    }
}

/// ONNX Runtime backbone; session calls are funneled through a mutex
pub struct OnnxBackbone {
    name: String,
    session: Mutex<Session>,
    num_classes: usize,
    max_input_size: Option<(usize, usize)>,
}

impl OnnxBackbone {
    /// Load an ONNX model
    ///
    /// # Arguments
    /// * `model_path` - Path to the exported network
    /// * `num_classes` - Expected number of output channels
    /// * `cpu_only` - Restrict execution to the CPU provider
    pub fn new(model_path: PathBuf, num_classes: usize, cpu_only: bool) -> Result<Self, InferenceError> {
        if !model_path.exists() {
            return Err(InferenceError::MissingCheckpoint(model_path));
        }
        info!("=> loading checkpoint '{}'", model_path.display());

        let session = if cpu_only {
            create_cpu_only_session(&model_path)?
        } else {
            create_optimized_session(&model_path)?
        };

        info!(
            "=> loaded checkpoint '{}' ({} classes)",
            model_path.display(),
            num_classes
        );

        Ok(Self {
            name: model_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "onnx".to_string()),
            session: Mutex::new(session),
            num_classes,
            max_input_size: None,
        })
    }

    #[must_use]
    pub fn with_max_input_size(mut self, max_input_size: Option<(usize, usize)>) -> Self {
        self.max_input_size = max_input_size;
        self
    }
}

impl NetworkBackbone for OnnxBackbone {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn max_input_size(&self) -> Option<(usize, usize)> {
        self.max_input_size
    }

    fn forward(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>, InferenceError> {
        let input_tensor = TensorRef::from_array_view(batch)
            .map_err(|e| InferenceError::Inference(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| InferenceError::Inference(format!("Failed to lock session mutex: {e}")))?;

        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(|e| InferenceError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
            InferenceError::Inference(format!("Failed to extract tensor: {e}"))
        })?;

        debug!("ONNX output shape: {:?}", shape);

        if shape.len() != 4 {
            return Err(InferenceError::InvalidOutputShape(shape.to_vec()));
        }
        let dims = (
            shape[0] as usize,
            shape[1] as usize,
            shape[2] as usize,
            shape[3] as usize,
        );
        if dims.0 != batch.len_of(ndarray::Axis(0)) || dims.1 != self.num_classes {
            return Err(InferenceError::InvalidOutputShape(shape.to_vec()));
        }

        Array4::from_shape_vec(dims, data.to_vec())
            .map_err(|e| InferenceError::Inference(format!("Failed to shape output: {e}")))
    }
}
