//! Tiled multi-scale semantic segmentation inference
//!
//! An image is rescaled once per configured scale, each rescaled copy is run
//! through the backbone in overlapping crops by [`TiledScaleProcessor`], and
//! the per-scale probability maps are averaged and reduced to a label map by
//! [`MultiScaleFuser`]. [`InferenceTask`] drives this over a single image, a
//! directory, or an image list and writes gray label PNGs.

pub mod backbone;
pub mod fusion;
pub mod onnx_utils;
pub mod resize;
pub mod task;
pub mod tiling;

pub use backbone::{build_backbone, BackboneConfig, NetworkBackbone, OnnxBackbone};
pub use fusion::{argmax_classes, MultiScaleFuser};
pub use task::{InferenceSummary, InferenceTask};
pub use tiling::{Tile, TileGrid, TiledScaleProcessor, TilingSettings};

use semseg_common::SegmentationError;
use semseg_taxonomy::{ScoreSpace, TaxonomyError, TaxonomyMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Inference errors
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Invalid inference configuration: {0}")]
    InvalidConfig(String),

    #[error("No checkpoint found at '{}'", .0.display())]
    MissingCheckpoint(PathBuf),

    #[error("Failed to load model from {path}: {error}")]
    ModelLoad { path: String, error: String },

    #[error("Forward pass failed: {0}")]
    Inference(String),

    #[error("Unexpected backbone output shape: {0:?}")]
    InvalidOutputShape(Vec<i64>),

    #[error("Failed to stitch tile predictions: {0}")]
    Stitching(String),

    #[error(transparent)]
    Taxonomy(#[from] TaxonomyError),

    #[error(transparent)]
    Segmentation(#[from] SegmentationError),

    #[error("Failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<InferenceError> for SegmentationError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::InvalidConfig(msg) => SegmentationError::InvalidConfig(msg),
            InferenceError::MissingCheckpoint(path) => SegmentationError::MissingCheckpoint(path),
            InferenceError::Taxonomy(e) => e.into(),
            InferenceError::Segmentation(e) => e,
            InferenceError::Yaml(e) => SegmentationError::InvalidConfig(e.to_string()),
            shape @ InferenceError::InvalidOutputShape(_) => {
                SegmentationError::ShapeMismatch(shape.to_string())
            }
            other => SegmentationError::Backend(other.to_string()),
        }
    }
}

fn default_scales() -> Vec<f32> {
    vec![1.0]
}

fn default_true() -> bool {
    true
}

fn default_print_freq() -> usize {
    10
}

fn default_save_folder() -> PathBuf {
    PathBuf::from("output")
}

/// Configuration of an inference run
///
/// Tiling settings are flattened into the top level of the YAML document:
///
/// ```yaml
/// base_size: 720
/// crop_h: 473
/// crop_w: 473
/// scales: [0.5, 0.75, 1.0, 1.25, 1.5, 1.75]
/// taxonomy_mode: universal
/// save_folder: results/ade20k
/// backbone:
///   kind: onnx
///   model_path: models/mseg-3m.onnx
///   num_classes: 194
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(flatten)]
    pub tiling: TilingSettings,

    /// Scale factors applied to `base_size`; one pass per entry
    #[serde(default = "default_scales")]
    pub scales: Vec<f32>,

    /// Use the bare file stem as the output key
    #[serde(default = "default_true")]
    pub img_name_unique: bool,

    /// Log progress every this many images
    #[serde(default = "default_print_freq")]
    pub print_freq: usize,

    #[serde(default = "default_save_folder")]
    pub save_folder: PathBuf,

    /// Prefix for relative paths in image lists
    #[serde(default)]
    pub data_root: Option<PathBuf>,

    #[serde(default)]
    pub taxonomy_mode: TaxonomyMode,

    #[serde(default)]
    pub score_space: ScoreSpace,

    #[serde(default)]
    pub backbone: Option<BackboneConfig>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            tiling: TilingSettings::default(),
            scales: default_scales(),
            img_name_unique: true,
            print_freq: default_print_freq(),
            save_folder: default_save_folder(),
            data_root: None,
            taxonomy_mode: TaxonomyMode::default(),
            score_space: ScoreSpace::default(),
            backbone: None,
        }
    }
}

impl InferenceConfig {
    /// Load and validate a YAML config file
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(SegmentationError::from)?;
        debug!("Loaded inference config from {}", path.display());
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, InferenceError> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// `ms` for multi-scale runs, `ss` for a single scale
    #[must_use]
    pub fn scale_label(&self) -> &'static str {
        if self.scales.len() > 1 {
            "ms"
        } else {
            "ss"
        }
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.scales.is_empty() {
            return Err(InferenceError::InvalidConfig(
                "at least one scale is required".to_string(),
            ));
        }
        if let Some(bad) = self.scales.iter().find(|s| !(**s > 0.0) || !s.is_finite()) {
            return Err(InferenceError::InvalidConfig(format!(
                "scales must be positive, got {bad}"
            )));
        }
        if self.print_freq == 0 {
            return Err(InferenceError::InvalidConfig(
                "print_freq must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
