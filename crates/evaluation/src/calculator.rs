//! Accuracy of saved predictions against ground truth

use crate::confusion::{ConfusionAggregator, SegmentationMetrics};
use crate::report::{class_lines, format_results, summary_line, write_results, ConfusionReport};
use crate::EvaluationError;
use rayon::prelude::*;
use semseg_common::image_io::{load_label_map, load_target_map};
use semseg_common::{image_key, prediction_path, read_data_list, DataItem, SegmentationError};
use semseg_taxonomy::{TaxonomyMapper, TaxonomyMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// What to do when a prediction PNG is missing or unreadable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPredictionPolicy {
    /// Stop the run with an error
    #[default]
    Abort,
    /// Log a warning, leave the image out, and keep aggregating
    SkipAndWarn,
}

fn default_save_folder() -> PathBuf {
    PathBuf::from("output")
}

fn default_true() -> bool {
    true
}

fn default_vis_freq() -> usize {
    20
}

/// Configuration of an evaluation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Folder holding `gray/` predictions; reports are written here too
    #[serde(default = "default_save_folder")]
    pub save_folder: PathBuf,

    /// `<image> <target>` list file
    pub data_list: PathBuf,

    /// Prefix for relative paths in the data list
    #[serde(default)]
    pub data_root: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub img_name_unique: bool,

    /// Log running accuracy every this many images
    #[serde(default = "default_vis_freq")]
    pub vis_freq: usize,

    #[serde(default)]
    pub missing_prediction: MissingPredictionPolicy,

    #[serde(default)]
    pub taxonomy_mode: TaxonomyMode,

    /// Evaluate images on the rayon pool
    #[serde(default)]
    pub parallel: bool,

    /// Model identifier echoed in the results log
    #[serde(default)]
    pub model_name: Option<String>,
}

impl EvaluationConfig {
    #[must_use]
    pub fn new(data_list: impl Into<PathBuf>, save_folder: impl Into<PathBuf>) -> Self {
        Self {
            save_folder: save_folder.into(),
            data_list: data_list.into(),
            data_root: None,
            img_name_unique: true,
            vis_freq: default_vis_freq(),
            missing_prediction: MissingPredictionPolicy::default(),
            taxonomy_mode: TaxonomyMode::default(),
            parallel: false,
            model_name: None,
        }
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, EvaluationError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, EvaluationError> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EvaluationError> {
        if self.vis_freq == 0 {
            return Err(EvaluationError::InvalidConfig(
                "vis_freq must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of [`AccuracyCalculator::execute`]
#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub metrics: SegmentationMetrics,
    pub evaluated: usize,
    /// Predictions left out under [`MissingPredictionPolicy::SkipAndWarn`]
    pub skipped: Vec<PathBuf>,
    pub results_path: PathBuf,
    pub confusion_path: PathBuf,
}

/// Confusion matrix of a run plus per-image bookkeeping
#[derive(Debug, Clone)]
pub struct PredictionTally {
    pub aggregator: ConfusionAggregator,
    pub evaluated: usize,
    pub skipped: Vec<PathBuf>,
}

/// Compares `<save_folder>/gray/<key>.png` predictions with ground truth
pub struct AccuracyCalculator {
    config: EvaluationConfig,
    mapper: Arc<TaxonomyMapper>,
    dataset: String,
}

impl AccuracyCalculator {
    pub fn new(
        config: EvaluationConfig,
        mapper: Arc<TaxonomyMapper>,
        dataset: impl Into<String>,
    ) -> Result<Self, EvaluationError> {
        config.validate()?;
        if config.taxonomy_mode != mapper.mode() {
            return Err(EvaluationError::InvalidConfig(format!(
                "evaluation mode {} does not match taxonomy mapper mode {}",
                config.taxonomy_mode,
                mapper.mode()
            )));
        }
        Ok(Self {
            config,
            mapper,
            dataset: dataset.into(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Classes left out of mean metrics and of the per-class report
    #[must_use]
    pub fn exclusion_set(&self) -> Option<&BTreeSet<usize>> {
        self.mapper
            .exclude_in_metrics()
            .then(|| self.mapper.excluded_classes())
    }

    fn data_items(&self) -> Result<Vec<DataItem>, EvaluationError> {
        let items = read_data_list(&self.config.data_list, self.config.data_root.as_deref())?;
        if let Some(item) = items.iter().find(|item| item.target.is_none()) {
            return Err(EvaluationError::InvalidConfig(format!(
                "{}: no ground truth listed for {}",
                self.config.data_list.display(),
                item.image.display()
            )));
        }
        Ok(items)
    }

    /// Fold every listed image into one confusion matrix
    pub fn evaluate_predictions(&self) -> Result<PredictionTally, EvaluationError> {
        let items = self.data_items()?;
        let total = items.len();
        let aggregator = Mutex::new(ConfusionAggregator::new(
            self.mapper.num_eval_classes(),
            self.mapper.ignore_index(),
        ));
        let skipped = Mutex::new(Vec::new());
        let done = AtomicUsize::new(0);

        // Unreadable or wrongly sized predictions follow the configured policy
        let skip_or_abort = |key: &str, pred_path: PathBuf, err: EvaluationError| {
            match self.config.missing_prediction {
                MissingPredictionPolicy::Abort => Err(err),
                MissingPredictionPolicy::SkipAndWarn => {
                    warn!("Skipping {}: {}", key, err);
                    lock(&skipped)?.push(pred_path);
                    Ok::<(), EvaluationError>(())
                }
            }
        };

        let evaluate = |item: &DataItem| -> Result<(), EvaluationError> {
            let key = image_key(&item.image, self.config.img_name_unique);
            let pred_path = prediction_path(&self.config.save_folder, &key);

            let pred = match load_label_map(&pred_path) {
                Ok(pred) => pred,
                Err(err) => {
                    let err = prediction_error(err, pred_path.clone());
                    return skip_or_abort(&key, pred_path, err);
                }
            };

            let Some(target_path) = item.target.as_deref() else {
                return Err(EvaluationError::InvalidConfig(format!(
                    "no ground truth listed for {}",
                    item.image.display()
                )));
            };
            let target = self.mapper.transform_label(&load_target_map(target_path)?);
            if pred.dim() != target.dim() {
                let err = EvaluationError::ShapeMismatch(format!(
                    "prediction {:?} vs target {:?} for {}",
                    pred.dim(),
                    target.dim(),
                    pred_path.display()
                ));
                return skip_or_abort(&key, pred_path, err);
            }

            let accuracy = {
                let mut aggregator = lock(&aggregator)?;
                aggregator.update(pred.view(), target.view())?;
                aggregator.pixel_accuracy()
            };

            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            if n % self.config.vis_freq == 0 {
                info!(
                    "Evaluating {}/{} on image {}.png, accuracy {:.4}.",
                    n, total, key, accuracy
                );
            }
            debug!("{} vs {}", pred_path.display(), target_path.display());
            Ok(())
        };

        if self.config.parallel {
            items.par_iter().try_for_each(evaluate)?;
        } else {
            items.iter().try_for_each(evaluate)?;
        }

        let aggregator = into_inner(aggregator)?;
        let skipped = into_inner(skipped)?;
        if aggregator.skipped_predictions() > 0 {
            warn!(
                "{} pixels had predictions outside the {} evaluation classes",
                aggregator.skipped_predictions(),
                aggregator.num_classes()
            );
        }
        Ok(PredictionTally {
            aggregator,
            evaluated: done.into_inner(),
            skipped,
        })
    }

    /// Evaluate, log the results, and write `results.txt` and
    /// `confusion_matrix.json`
    pub fn execute(&self) -> Result<EvaluationSummary, EvaluationError> {
        let PredictionTally {
            aggregator,
            evaluated,
            skipped,
        } = self.evaluate_predictions()?;
        let exclude = self.exclusion_set();
        let metrics = aggregator.metrics(exclude);
        let class_names = self.mapper.class_names();

        info!(
            "{} {}",
            self.dataset,
            self.config.model_name.as_deref().unwrap_or("")
        );
        info!("{}", summary_line(&metrics));
        for line in class_lines(&metrics, class_names, exclude) {
            info!("{}", line);
        }

        let contents = format_results(&metrics, class_names, exclude);
        let results_path = write_results(&self.config.save_folder, &contents)?;

        let confusion_path = ConfusionReport::new(
            &self.dataset,
            class_names,
            exclude,
            &aggregator,
            metrics.clone(),
        )
        .write(&self.config.save_folder)?;

        Ok(EvaluationSummary {
            metrics,
            evaluated,
            skipped,
            results_path,
            confusion_path,
        })
    }
}

fn prediction_error(err: SegmentationError, pred_path: PathBuf) -> EvaluationError {
    match err {
        SegmentationError::MissingPrediction(path) => EvaluationError::MissingPrediction(path),
        SegmentationError::IoError(_) => EvaluationError::MissingPrediction(pred_path),
        other => EvaluationError::Segmentation(other),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, EvaluationError> {
    mutex.lock().map_err(|e| {
        EvaluationError::Segmentation(SegmentationError::Other(format!("lock poisoned: {e}")))
    })
}

fn into_inner<T>(mutex: Mutex<T>) -> Result<T, EvaluationError> {
    mutex.into_inner().map_err(|e| {
        EvaluationError::Segmentation(SegmentationError::Other(format!("lock poisoned: {e}")))
    })
}
