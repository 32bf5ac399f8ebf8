//! Conversion between a model's universal class space and an evaluation taxonomy
//!
//! Predictions are converted before the argmax: scores of universal classes
//! that feed the same dataset class are summed as probabilities, so the
//! decision is taken on the mixture and never on individual universal
//! classes. Ground-truth labels are converted with a fixed lookup table.
//!
//! # Example
//! ```no_run
//! use semseg_taxonomy::{ScoreSpace, TaxonomyConfig, TaxonomyMapper, TaxonomyMode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TaxonomyConfig::from_yaml("taxonomy/camvid.yaml")?;
//! let mode: TaxonomyMode = "remap_to_dataset".parse()?;
//! let mapper = TaxonomyMapper::new(mode, ScoreSpace::Probabilities, &config)?;
//! println!("{} evaluation classes", mapper.num_eval_classes());
//! # Ok(())
//! # }
//! ```

pub mod config;

pub use config::TaxonomyConfig;

use ndarray::{Array2, Array3, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use semseg_common::{SegmentationError, TargetMap};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

/// Errors raised while building or applying a taxonomy mapping
#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error(
        "Unrecognized taxonomy mode: {0:?} (expected one of: universal, remap_to_dataset, pass_through)"
    )]
    UnrecognizedMode(String),

    #[error("Invalid taxonomy configuration: {0}")]
    InvalidConfig(String),

    #[error("Score tensor has {got} classes, taxonomy expects {expected}")]
    ClassCountMismatch { expected: usize, got: usize },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TaxonomyError> for SegmentationError {
    fn from(err: TaxonomyError) -> Self {
        match err {
            TaxonomyError::UnrecognizedMode(mode) => {
                SegmentationError::UnrecognizedTaxonomyMode(mode)
            }
            TaxonomyError::ClassCountMismatch { .. } => {
                SegmentationError::ShapeMismatch(err.to_string())
            }
            TaxonomyError::Io(e) => SegmentationError::IoError(e),
            other => SegmentationError::InvalidConfig(other.to_string()),
        }
    }
}

/// Which taxonomy the predictions are produced in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TaxonomyMode {
    /// Softmax over universal classes, no remapping
    #[default]
    Universal,
    /// Universal scores collapsed into the dataset's classes before the argmax
    RemapToDataset,
    /// Universal predictions; ground truth is remapped into universal ids and
    /// universal classes the dataset never uses are excluded from the means
    PassThroughWithExternalRemap,
}

impl TaxonomyMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxonomyMode::Universal => "universal",
            TaxonomyMode::RemapToDataset => "remap_to_dataset",
            TaxonomyMode::PassThroughWithExternalRemap => "pass_through",
        }
    }
}

impl fmt::Display for TaxonomyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaxonomyMode {
    type Err = TaxonomyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "universal" => Ok(TaxonomyMode::Universal),
            "remap_to_dataset" | "test_dataset" => Ok(TaxonomyMode::RemapToDataset),
            "pass_through" | "pass_through_with_external_remap" => {
                Ok(TaxonomyMode::PassThroughWithExternalRemap)
            }
            other => Err(TaxonomyError::UnrecognizedMode(other.to_string())),
        }
    }
}

impl TryFrom<String> for TaxonomyMode {
    type Error = TaxonomyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaxonomyMode> for String {
    fn from(mode: TaxonomyMode) -> Self {
        mode.as_str().to_string()
    }
}

/// Where the dataset remap is applied relative to the softmax
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSpace {
    /// Softmax over universal classes, then sum probabilities per dataset class
    #[default]
    Probabilities,
    /// Sum raw logits per dataset class, then softmax over dataset classes
    Logits,
}

/// Numerically stable softmax over the class axis of a C×H×W tensor
#[must_use]
pub fn softmax_channels(scores: ArrayView3<f32>) -> Array3<f32> {
    let mut out = scores.to_owned();
    for mut lane in out.lanes_mut(Axis(0)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    out
}

/// Apply a target×source class matrix to a source×H×W tensor
fn apply_class_matrix(matrix: &Array2<f32>, scores: ArrayView3<f32>) -> Array3<f32> {
    let (classes, height, width) = scores.dim();
    let flat = Array2::from_shape_fn((classes, height * width), |(c, i)| {
        scores[[c, i / width, i % width]]
    });
    let mapped = matrix.dot(&flat);
    let targets = matrix.nrows();
    Array3::from_shape_fn((targets, height, width), |(c, y, x)| {
        mapped[[c, y * width + x]]
    })
}

/// Converts predicted scores and ground-truth labels between taxonomies
#[derive(Debug, Clone)]
pub struct TaxonomyMapper {
    mode: TaxonomyMode,
    score_space: ScoreSpace,
    num_model_classes: usize,
    remap: Option<Array2<f32>>,
    label_lookup: Option<Vec<u32>>,
    ignore_index: u32,
    class_names: Vec<String>,
    excluded: BTreeSet<usize>,
}

impl TaxonomyMapper {
    /// Build a mapper for `mode`
    ///
    /// # Errors
    /// Returns an error when the configuration lacks what the mode needs
    /// (a dataset mapping for `RemapToDataset`, a label lookup for
    /// `PassThroughWithExternalRemap`) or when lookup targets are out of range.
    pub fn new(
        mode: TaxonomyMode,
        score_space: ScoreSpace,
        config: &TaxonomyConfig,
    ) -> Result<Self, TaxonomyError> {
        config.validate()?;
        let num_model_classes = config.universal_classes.len();

        let (remap, class_names) = match mode {
            TaxonomyMode::Universal | TaxonomyMode::PassThroughWithExternalRemap => {
                (None, config.universal_classes.clone())
            }
            TaxonomyMode::RemapToDataset => {
                if !config.has_dataset_mapping() {
                    return Err(TaxonomyError::InvalidConfig(format!(
                        "mode {mode} needs dataset_classes and dataset_to_universal for {}",
                        config.dataset
                    )));
                }
                (Some(config.remap_matrix()), config.dataset_classes.clone())
            }
        };

        if mode == TaxonomyMode::PassThroughWithExternalRemap && config.label_lookup.is_empty() {
            return Err(TaxonomyError::InvalidConfig(format!(
                "mode {mode} needs a label_lookup from {} labels to universal ids",
                config.dataset
            )));
        }

        let num_eval_classes = class_names.len();
        let ignore_index = config.ignore_index;
        if let Some((native, eval)) = config
            .label_lookup
            .iter()
            .find(|(_, eval)| **eval != ignore_index && **eval as usize >= num_eval_classes)
        {
            return Err(TaxonomyError::InvalidConfig(format!(
                "label_lookup maps {native} to {eval}, outside {num_eval_classes} evaluation classes"
            )));
        }

        let label_lookup = if config.label_lookup.is_empty() {
            None
        } else {
            let size = config.label_lookup.keys().max().map_or(0, |&k| k as usize + 1);
            let mut table = vec![ignore_index; size];
            for (&native, &eval) in &config.label_lookup {
                table[native as usize] = eval;
            }
            Some(table)
        };

        let excluded = if mode == TaxonomyMode::PassThroughWithExternalRemap {
            let used: BTreeSet<usize> = config
                .label_lookup
                .values()
                .filter(|&&eval| eval != ignore_index)
                .map(|&eval| eval as usize)
                .collect();
            (0..num_eval_classes).filter(|c| !used.contains(c)).collect()
        } else {
            BTreeSet::new()
        };

        info!(
            "Taxonomy mode {} for {}: {} model classes -> {} evaluation classes ({} excluded)",
            mode,
            config.dataset,
            num_model_classes,
            num_eval_classes,
            excluded.len()
        );

        Ok(Self {
            mode,
            score_space,
            num_model_classes,
            remap,
            label_lookup,
            ignore_index,
            class_names,
            excluded,
        })
    }

    #[must_use]
    pub fn mode(&self) -> TaxonomyMode {
        self.mode
    }

    #[must_use]
    pub fn score_space(&self) -> ScoreSpace {
        self.score_space
    }

    /// Number of classes the backbone emits
    #[must_use]
    pub fn num_model_classes(&self) -> usize {
        self.num_model_classes
    }

    /// Number of classes after `transform_scores`
    #[must_use]
    pub fn num_eval_classes(&self) -> usize {
        self.class_names.len()
    }

    #[must_use]
    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    #[must_use]
    pub fn ignore_index(&self) -> u32 {
        self.ignore_index
    }

    /// Evaluation classes left out of mean metrics
    #[must_use]
    pub fn excluded_classes(&self) -> &BTreeSet<usize> {
        &self.excluded
    }

    /// Whether mean metrics should skip `excluded_classes`
    #[must_use]
    pub fn exclude_in_metrics(&self) -> bool {
        self.mode == TaxonomyMode::PassThroughWithExternalRemap
    }

    /// Turn raw C×H×W backbone scores into probabilities in the evaluation
    /// taxonomy. Exactly one softmax is applied.
    pub fn transform_scores(&self, scores: ArrayView3<f32>) -> Result<Array3<f32>, TaxonomyError> {
        let classes = scores.len_of(Axis(0));
        if classes != self.num_model_classes {
            return Err(TaxonomyError::ClassCountMismatch {
                expected: self.num_model_classes,
                got: classes,
            });
        }

        let out = match (&self.remap, self.score_space) {
            (None, _) => softmax_channels(scores),
            (Some(matrix), ScoreSpace::Probabilities) => {
                let probs = softmax_channels(scores);
                apply_class_matrix(matrix, probs.view())
            }
            (Some(matrix), ScoreSpace::Logits) => {
                let logits = apply_class_matrix(matrix, scores);
                softmax_channels(logits.view())
            }
        };
        Ok(out)
    }

    /// Map a native ground-truth label map into evaluation ids
    ///
    /// Ids without a lookup entry become the ignore sentinel. Without a
    /// lookup table labels are returned unchanged.
    #[must_use]
    pub fn transform_label(&self, target: &TargetMap) -> TargetMap {
        match &self.label_lookup {
            None => target.clone(),
            Some(table) => {
                let ignore = self.ignore_index;
                target.mapv(|label| {
                    if label == ignore {
                        ignore
                    } else {
                        table.get(label as usize).copied().unwrap_or(ignore)
                    }
                })
            }
        }
    }

    /// Map a single native label id
    #[must_use]
    pub fn transform_label_id(&self, label: u32) -> u32 {
        match &self.label_lookup {
            None => label,
            Some(_) if label == self.ignore_index => label,
            Some(table) => table.get(label as usize).copied().unwrap_or(self.ignore_index),
        }
    }
}
