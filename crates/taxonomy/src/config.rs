//! YAML description of a universal taxonomy and one evaluation dataset

use crate::TaxonomyError;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use semseg_common::DEFAULT_IGNORE_INDEX;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Largest native label id accepted in `label_lookup`
pub const MAX_NATIVE_LABEL: u32 = u16::MAX as u32;

fn default_ignore_index() -> u32 {
    DEFAULT_IGNORE_INDEX
}

/// Taxonomy description
///
/// ```yaml
/// dataset: camvid
/// universal_classes: [road, sidewalk, car, bus]
/// dataset_classes: [road, vehicle]
/// dataset_to_universal:
///   - [0, 1]
///   - [2, 3]
/// label_lookup: {0: 0, 1: 1}
/// ignore_index: 255
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyConfig {
    /// Name of the evaluation dataset
    pub dataset: String,
    /// Model's native class names, in output-channel order
    pub universal_classes: Vec<String>,
    /// Evaluation class names of the dataset
    #[serde(default)]
    pub dataset_classes: Vec<String>,
    /// For each dataset class, the universal classes whose scores it collects
    #[serde(default)]
    pub dataset_to_universal: Vec<Vec<usize>>,
    /// Native ground-truth id to evaluation id; unlisted ids become `ignore_index`
    #[serde(default)]
    pub label_lookup: BTreeMap<u32, u32>,
    /// Ground-truth sentinel excluded from metrics
    #[serde(default = "default_ignore_index")]
    pub ignore_index: u32,
}

impl TaxonomyConfig {
    /// Taxonomy with only a universal class list and no dataset mapping
    #[must_use]
    pub fn universal_only(dataset: impl Into<String>, universal_classes: Vec<String>) -> Self {
        Self {
            dataset: dataset.into(),
            universal_classes,
            dataset_classes: Vec::new(),
            dataset_to_universal: Vec::new(),
            label_lookup: BTreeMap::new(),
            ignore_index: DEFAULT_IGNORE_INDEX,
        }
    }

    /// Load and validate a taxonomy from YAML
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, TaxonomyError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_yaml_str(&contents)?;
        debug!(
            "Loaded taxonomy for {} from {} ({} universal, {} dataset classes)",
            config.dataset,
            path.as_ref().display(),
            config.universal_classes.len(),
            config.dataset_classes.len()
        );
        Ok(config)
    }

    /// Parse and validate a taxonomy from a YAML string
    pub fn from_yaml_str(contents: &str) -> Result<Self, TaxonomyError> {
        let config: TaxonomyConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), TaxonomyError> {
        if self.universal_classes.is_empty() {
            return Err(TaxonomyError::InvalidConfig(
                "universal_classes must not be empty".to_string(),
            ));
        }

        if self.dataset_to_universal.len() != self.dataset_classes.len() {
            return Err(TaxonomyError::InvalidConfig(format!(
                "dataset_to_universal has {} rows but dataset_classes has {} names",
                self.dataset_to_universal.len(),
                self.dataset_classes.len()
            )));
        }

        let num_universal = self.universal_classes.len();
        for (dataset_id, sources) in self.dataset_to_universal.iter().enumerate() {
            if let Some(&bad) = sources.iter().find(|&&u| u >= num_universal) {
                return Err(TaxonomyError::InvalidConfig(format!(
                    "dataset class {dataset_id} ({}) references universal class {bad}, \
                     but only {num_universal} exist",
                    self.dataset_classes[dataset_id]
                )));
            }
        }

        if let Some(&key) = self.label_lookup.keys().find(|&&k| k > MAX_NATIVE_LABEL) {
            return Err(TaxonomyError::InvalidConfig(format!(
                "label_lookup key {key} exceeds {MAX_NATIVE_LABEL}"
            )));
        }

        Ok(())
    }

    /// Whether a universal-to-dataset mapping is present
    #[must_use]
    pub fn has_dataset_mapping(&self) -> bool {
        !self.dataset_classes.is_empty()
    }

    /// Dense dataset×universal matrix with a 1.0 for every contributing class
    #[must_use]
    pub fn remap_matrix(&self) -> Array2<f32> {
        let mut matrix = Array2::zeros((self.dataset_classes.len(), self.universal_classes.len()));
        for (dataset_id, sources) in self.dataset_to_universal.iter().enumerate() {
            for &universal_id in sources {
                matrix[[dataset_id, universal_id]] = 1.0;
            }
        }
        matrix
    }
}
