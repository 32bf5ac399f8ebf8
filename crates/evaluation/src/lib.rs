//! Accuracy evaluation of saved label predictions
//!
//! [`AccuracyCalculator`] reads `<save_folder>/gray/<key>.png` predictions
//! next to their ground truth, folds every pair into one
//! [`ConfusionAggregator`], and reports per-class IoU/accuracy plus mIoU,
//! mAcc and allAcc to the log, `results.txt` and `confusion_matrix.json`.

pub mod calculator;
pub mod confusion;
pub mod report;

pub use calculator::{
    AccuracyCalculator, EvaluationConfig, EvaluationSummary, MissingPredictionPolicy,
    PredictionTally,
};
pub use confusion::{ConfusionAggregator, SegmentationMetrics};
pub use report::{format_results, ConfusionReport};

use semseg_common::SegmentationError;
use semseg_taxonomy::TaxonomyError;
use std::path::PathBuf;
use thiserror::Error;

/// Evaluation errors
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Invalid evaluation configuration: {0}")]
    InvalidConfig(String),

    #[error("Prediction file not found: {}", .0.display())]
    MissingPrediction(PathBuf),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error(transparent)]
    Taxonomy(#[from] TaxonomyError),

    #[error(transparent)]
    Segmentation(#[from] SegmentationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<EvaluationError> for SegmentationError {
    fn from(err: EvaluationError) -> Self {
        match err {
            EvaluationError::InvalidConfig(msg) => SegmentationError::InvalidConfig(msg),
            EvaluationError::MissingPrediction(path) => SegmentationError::MissingPrediction(path),
            EvaluationError::ShapeMismatch(msg) => SegmentationError::ShapeMismatch(msg),
            EvaluationError::Taxonomy(e) => e.into(),
            EvaluationError::Segmentation(e) => e,
            EvaluationError::Io(e) => SegmentationError::IoError(e),
            EvaluationError::Yaml(e) => SegmentationError::InvalidConfig(e.to_string()),
            other => SegmentationError::Other(other.to_string()),
        }
    }
}
