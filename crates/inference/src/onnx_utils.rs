//! ONNX Runtime session creation
//!
//! Sessions are built with full graph optimization and intra-op parallelism
//! sized to the physical core count (or `SEMSEG_THREADS`). Accelerated
//! sessions try CoreML, then CUDA, then CPU; if CoreML rejects the graph the
//! session is rebuilt with CUDA/CPU only.

use crate::InferenceError;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, warn};

/// Environment variable bounding intra-op and rayon thread counts
pub const THREADS_ENV: &str = "SEMSEG_THREADS";

/// Thread count from `SEMSEG_THREADS`, falling back to physical cores
#[must_use]
pub fn configured_threads() -> usize {
    std::env::var(THREADS_ENV)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or_else(num_cpus::get_physical)
}

fn builder_error(e: impl std::fmt::Display) -> InferenceError {
    InferenceError::ModelLoad {
        path: String::new(),
        error: format!("Failed to create session builder: {e}"),
    }
}

fn base_builder() -> Result<SessionBuilder, InferenceError> {
    Session::builder()
        .map_err(builder_error)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(builder_error)?
        .with_intra_threads(configured_threads())
        .map_err(builder_error)?
        .with_memory_pattern(true)
        .map_err(builder_error)
}

fn load_error(model_path: &Path, e: impl std::fmt::Display) -> InferenceError {
    InferenceError::ModelLoad {
        path: model_path.display().to_string(),
        error: e.to_string(),
    }
}

/// Create a session with hardware acceleration where available
///
/// # Errors
/// `MissingCheckpoint` if the file is absent, `ModelLoad` if every provider
/// combination fails.
pub fn create_optimized_session(model_path: &Path) -> Result<Session, InferenceError> {
    if !model_path.exists() {
        return Err(InferenceError::MissingCheckpoint(model_path.to_path_buf()));
    }

    let start = Instant::now();
    let session = base_builder()?
        .with_execution_providers([
            CoreMLExecutionProvider::default().with_subgraphs(true).build(),
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ])
        .map_err(builder_error)?
        .commit_from_file(model_path);

    match session {
        Ok(session) => {
            debug!(
                "Session created for {} in {:.3}s",
                model_path.display(),
                start.elapsed().as_secs_f64()
            );
            Ok(session)
        }
        Err(e) => {
            let error_msg = e.to_string();
            if !(error_msg.contains("CoreML") || error_msg.contains("MLModel")) {
                return Err(load_error(model_path, error_msg));
            }

            warn!(
                "CoreML failed for {}: {}; retrying with CUDA/CPU only",
                model_path.display(),
                error_msg
            );
            base_builder()?
                .with_execution_providers([
                    CUDAExecutionProvider::default().build(),
                    CPUExecutionProvider::default().build(),
                ])
                .map_err(builder_error)?
                .commit_from_file(model_path)
                .map_err(|e| load_error(model_path, format!("CoreML failed, CPU/CUDA also failed: {e}")))
        }
    }
}

/// Create a CPU-only session
pub fn create_cpu_only_session(model_path: &Path) -> Result<Session, InferenceError> {
    if !model_path.exists() {
        return Err(InferenceError::MissingCheckpoint(model_path.to_path_buf()));
    }

    base_builder()?
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .map_err(builder_error)?
        .commit_from_file(model_path)
        .map_err(|e| load_error(model_path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_file() {
        let path = Path::new("/nonexistent/seg.onnx");
        assert!(matches!(
            create_cpu_only_session(path),
            Err(InferenceError::MissingCheckpoint(_))
        ));
        assert!(matches!(
            create_optimized_session(path),
            Err(InferenceError::MissingCheckpoint(_))
        ));
    }

    #[test]
    fn test_configured_threads_positive() {
        assert!(configured_threads() > 0);
    }
}
