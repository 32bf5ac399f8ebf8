/// Common types and utilities for tiled segmentation inference and evaluation
pub mod data_list;
pub mod image_io;

use ndarray::{Array2, Array3};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub use data_list::{list_images_in_dir, read_data_list, DataItem};

/// Default ground-truth sentinel excluded from metric computation
pub const DEFAULT_IGNORE_INDEX: u32 = 255;

/// Number of parent directories folded into a unique image key
pub const UNIQUE_KEY_PARENT_DIRS: usize = 3;

/// Segmentation errors
#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "Unrecognized taxonomy mode: {0:?} (expected one of: universal, remap_to_dataset, pass_through)"
    )]
    UnrecognizedTaxonomyMode(String),

    #[error("No checkpoint found at '{}'", .0.display())]
    MissingCheckpoint(PathBuf),

    #[error("Prediction file not found: {}", .0.display())]
    MissingPrediction(PathBuf),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    ImageError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<image::ImageError> for SegmentationError {
    fn from(err: image::ImageError) -> Self {
        SegmentationError::ImageError(err.to_string())
    }
}

/// Result type for segmentation operations
pub type Result<T> = std::result::Result<T, SegmentationError>;

/// H×W×3 RGB image in raw pixel range (0..=255), not normalized
pub type ImageF32 = Array3<f32>;

/// H×W×C per-pixel class scores
pub type ScoreMap = Array3<f32>;

/// H×W predicted class ids
pub type LabelMap = Array2<u16>;

/// H×W ground-truth class ids
pub type TargetMap = Array2<u32>;

/// Derive a key for images whose file stems are not globally unique
/// (e.g. ScanNet frames), by joining the last three parent directory names
/// with the stem.
///
/// `a/b/c/d/frame.jpg` becomes `b_c_d_frame`.
#[must_use]
pub fn unique_key(path: &Path) -> String {
    let stem = file_stem(path);
    let parents: Vec<String> = path
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let skip = parents.len().saturating_sub(UNIQUE_KEY_PARENT_DIRS);
    let mut parts: Vec<String> = parents.into_iter().skip(skip).collect();
    parts.push(stem);
    parts.join("_")
}

/// Key under which an image's prediction is stored in `<save_folder>/gray/`
#[must_use]
pub fn image_key(path: &Path, img_name_unique: bool) -> String {
    if img_name_unique {
        file_stem(path)
    } else {
        unique_key(path)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Path of the gray label prediction for `key` under `save_folder`
#[must_use]
pub fn prediction_path(save_folder: &Path, key: &str) -> PathBuf {
    save_folder.join("gray").join(format!("{key}.png"))
}
