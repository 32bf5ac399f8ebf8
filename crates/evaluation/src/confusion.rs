//! Global confusion matrix and the metrics derived from it

use crate::EvaluationError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::Serialize;
use std::collections::BTreeSet;

/// Per-class and summary segmentation metrics
///
/// Per-class values are `None` when their denominator is zero (the class
/// never occurs in ground truth or prediction). Such classes are left out of
/// `miou`/`macc`, as are excluded classes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentationMetrics {
    pub iou: Vec<Option<f64>>,
    pub accuracy: Vec<Option<f64>>,
    pub miou: f64,
    pub macc: f64,
    pub all_acc: f64,
}

/// C×C pixel counts indexed `[target][prediction]`
///
/// Labelled pixels whose prediction falls outside `[0, C)` are kept per
/// target class in `missed`. They count against their target class and the
/// overall accuracy but are no false positive for any class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionAggregator {
    num_classes: usize,
    ignore_index: u32,
    counts: Array2<u64>,
    missed: Array1<u64>,
}

impl ConfusionAggregator {
    #[must_use]
    pub fn new(num_classes: usize, ignore_index: u32) -> Self {
        Self {
            num_classes,
            ignore_index,
            counts: Array2::zeros((num_classes, num_classes)),
            missed: Array1::zeros(num_classes),
        }
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    #[must_use]
    pub fn ignore_index(&self) -> u32 {
        self.ignore_index
    }

    #[must_use]
    pub fn counts(&self) -> ArrayView2<'_, u64> {
        self.counts.view()
    }

    /// Per target class, labelled pixels predicted outside `[0, C)`
    #[must_use]
    pub fn missed(&self) -> ArrayView1<'_, u64> {
        self.missed.view()
    }

    /// Pixels with a valid target whose prediction was outside `[0, C)`
    #[must_use]
    pub fn skipped_predictions(&self) -> u64 {
        self.missed.sum()
    }

    /// Number of labelled pixels counted, out-of-range predictions included
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.sum() + self.missed.sum()
    }

    /// Fold one image into the matrix
    ///
    /// Pixels whose target is the ignore sentinel or outside `[0, C)` are
    /// skipped silently. A prediction outside `[0, C)` is a miss for its
    /// target class.
    ///
    /// # Errors
    /// `ShapeMismatch` when prediction and target differ in size.
    pub fn update(
        &mut self,
        pred: ArrayView2<u16>,
        target: ArrayView2<u32>,
    ) -> Result<(), EvaluationError> {
        if pred.dim() != target.dim() {
            return Err(EvaluationError::ShapeMismatch(format!(
                "prediction {:?} vs target {:?}",
                pred.dim(),
                target.dim()
            )));
        }

        let num_classes = self.num_classes;
        let ignore = self.ignore_index;
        let counts = &mut self.counts;
        let missed = &mut self.missed;

        Zip::from(pred).and(target).for_each(|&p, &t| {
            let t = t as usize;
            if t == ignore as usize || t >= num_classes {
                return;
            }
            let p = usize::from(p);
            if p >= num_classes {
                missed[t] += 1;
            } else {
                counts[[t, p]] += 1;
            }
        });
        Ok(())
    }

    /// Add another aggregator's counts into this one
    pub fn merge(&mut self, other: &Self) -> Result<(), EvaluationError> {
        if other.num_classes != self.num_classes {
            return Err(EvaluationError::ShapeMismatch(format!(
                "cannot merge {} classes into {}",
                other.num_classes, self.num_classes
            )));
        }
        self.counts += &other.counts;
        self.missed += &other.missed;
        Ok(())
    }

    /// Overall pixel accuracy so far; 0.0 before any pixel is counted
    #[must_use]
    pub fn pixel_accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.counts.diag().sum() as f64 / total as f64
        }
    }

    /// Compute metrics, leaving `exclude` out of the means
    #[must_use]
    pub fn metrics(&self, exclude: Option<&BTreeSet<usize>>) -> SegmentationMetrics {
        let target_totals = self.counts.sum_axis(Axis(1)) + &self.missed;
        let pred_totals = self.counts.sum_axis(Axis(0));

        let mut iou = Vec::with_capacity(self.num_classes);
        let mut accuracy = Vec::with_capacity(self.num_classes);
        for k in 0..self.num_classes {
            let tp = self.counts[[k, k]];
            let union = target_totals[k] + pred_totals[k] - tp;
            iou.push((union > 0).then(|| tp as f64 / union as f64));
            accuracy.push((target_totals[k] > 0).then(|| tp as f64 / target_totals[k] as f64));
        }

        let included = |k: &usize| exclude.map_or(true, |ids| !ids.contains(k));
        let mean = |values: &[Option<f64>]| -> f64 {
            let defined: Vec<f64> = values
                .iter()
                .enumerate()
                .filter(|(k, _)| included(k))
                .filter_map(|(_, v)| *v)
                .collect();
            if defined.is_empty() {
                0.0
            } else {
                defined.iter().sum::<f64>() / defined.len() as f64
            }
        };

        SegmentationMetrics {
            miou: mean(&iou),
            macc: mean(&accuracy),
            all_acc: self.pixel_accuracy(),
            iou,
            accuracy,
        }
    }
}
