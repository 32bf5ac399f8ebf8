//! Multi-scale fusion of score maps into a label map

use crate::InferenceError;
use ndarray::{Array2, Array3, ArrayView3, Axis, Zip};
use semseg_common::{LabelMap, ScoreMap};

/// Largest class count representable in a [`LabelMap`]
pub const MAX_LABEL_CLASSES: usize = u16::MAX as usize + 1;

/// Running mean of per-scale H×W×C score maps
///
/// Maps are added one scale at a time so only a single full-resolution sum
/// is held in memory.
#[derive(Debug, Default)]
pub struct MultiScaleFuser {
    sum: Option<Array3<f32>>,
    count: usize,
}

impl MultiScaleFuser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of score maps added so far
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Add one scale's score map
    pub fn add(&mut self, scores: ArrayView3<f32>) -> Result<(), InferenceError> {
        match &mut self.sum {
            None => self.sum = Some(scores.to_owned()),
            Some(sum) => {
                if sum.dim() != scores.dim() {
                    return Err(InferenceError::Stitching(format!(
                        "score map {:?} does not match previous scales {:?}",
                        scores.dim(),
                        sum.dim()
                    )));
                }
                *sum += &scores;
            }
        }
        self.count += 1;
        Ok(())
    }

    /// Mean over the added scales
    pub fn mean(&self) -> Result<Array3<f32>, InferenceError> {
        match &self.sum {
            Some(sum) => Ok(sum / self.count as f32),
            None => Err(InferenceError::Stitching(
                "no score maps to fuse".to_string(),
            )),
        }
    }

    /// Average the added maps and take the per-pixel argmax
    pub fn finish(self) -> Result<LabelMap, InferenceError> {
        let mean = self.mean()?;
        argmax_classes(mean.view())
    }

    /// Fuse a full set of per-scale score maps
    pub fn fuse(score_maps: &[ScoreMap]) -> Result<LabelMap, InferenceError> {
        let mut fuser = Self::new();
        for scores in score_maps {
            fuser.add(scores.view())?;
        }
        fuser.finish()
    }
}

/// Per-pixel index of the largest score along the class axis of an H×W×C
/// map. Ties resolve to the lowest class index.
pub fn argmax_classes(scores: ArrayView3<f32>) -> Result<LabelMap, InferenceError> {
    let (height, width, classes) = scores.dim();
    if classes == 0 {
        return Err(InferenceError::Stitching(
            "score map has no classes".to_string(),
        ));
    }
    if classes > MAX_LABEL_CLASSES {
        return Err(InferenceError::InvalidConfig(format!(
            "{classes} classes do not fit in a 16-bit label map"
        )));
    }

    let mut labels: LabelMap = Array2::zeros((height, width));
    Zip::from(&mut labels)
        .and(scores.lanes(Axis(2)))
        .for_each(|label, lane| {
            let mut best = 0usize;
            let mut best_score = lane[0];
            for (class, &score) in lane.iter().enumerate().skip(1) {
                // strict comparison keeps the lowest index on ties
                if score > best_score || (best_score.is_nan() && !score.is_nan()) {
                    best = class;
                    best_score = score;
                }
            }
            *label = best as u16;
        });
    Ok(labels)
}
