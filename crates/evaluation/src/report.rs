//! `results.txt` and `confusion_matrix.json` writers

use crate::confusion::{ConfusionAggregator, SegmentationMetrics};
use crate::EvaluationError;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const RESULTS_FILE: &str = "results.txt";
pub const CONFUSION_FILE: &str = "confusion_matrix.json";

fn metric(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.4}"),
        None => "nan".to_string(),
    }
}

/// Summary line
#[must_use]
pub fn summary_line(metrics: &SegmentationMetrics) -> String {
    format!(
        "Eval result: mIoU/mAcc/allAcc {:.4}/{:.4}/{:.4}.",
        metrics.miou, metrics.macc, metrics.all_acc
    )
}

/// Per-class lines for every class not in `exclude`
#[must_use]
pub fn class_lines(
    metrics: &SegmentationMetrics,
    class_names: &[String],
    exclude: Option<&BTreeSet<usize>>,
) -> Vec<String> {
    (0..metrics.iou.len())
        .filter(|k| exclude.map_or(true, |ids| !ids.contains(k)))
        .map(|k| {
            let name = class_names.get(k).map_or("", String::as_str);
            format!(
                "Class_{:02} result: iou/accuracy {}/{}, name: {}.",
                k,
                metric(metrics.iou[k]),
                metric(metrics.accuracy[k]),
                name
            )
        })
        .collect()
}

/// Full `results.txt` contents
#[must_use]
pub fn format_results(
    metrics: &SegmentationMetrics,
    class_names: &[String],
    exclude: Option<&BTreeSet<usize>>,
) -> String {
    let mut out = summary_line(metrics);
    out.push('\n');
    for line in class_lines(metrics, class_names, exclude) {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Write `results.txt` into `save_folder`
pub fn write_results(save_folder: &Path, contents: &str) -> Result<PathBuf, EvaluationError> {
    fs::create_dir_all(save_folder)?;
    let path = save_folder.join(RESULTS_FILE);
    fs::write(&path, contents)?;
    debug!("Wrote {}", path.display());
    Ok(path)
}

/// Serialized form of a finished evaluation
#[derive(Debug, Clone, Serialize)]
pub struct ConfusionReport {
    pub dataset: String,
    pub class_names: Vec<String>,
    pub excluded_classes: Vec<usize>,
    pub skipped_predictions: u64,
    /// Per target class, pixels predicted outside the class range
    pub missed: Vec<u64>,
    /// Row-major `[target][prediction]` pixel counts
    pub counts: Vec<Vec<u64>>,
    pub metrics: SegmentationMetrics,
}

impl ConfusionReport {
    #[must_use]
    pub fn new(
        dataset: &str,
        class_names: &[String],
        excluded: Option<&BTreeSet<usize>>,
        aggregator: &ConfusionAggregator,
        metrics: SegmentationMetrics,
    ) -> Self {
        Self {
            dataset: dataset.to_string(),
            class_names: class_names.to_vec(),
            excluded_classes: excluded.map(|ids| ids.iter().copied().collect()).unwrap_or_default(),
            skipped_predictions: aggregator.skipped_predictions(),
            missed: aggregator.missed().to_vec(),
            counts: aggregator
                .counts()
                .outer_iter()
                .map(|row| row.to_vec())
                .collect(),
            metrics,
        }
    }

    /// Write `confusion_matrix.json` into `save_folder`
    pub fn write(&self, save_folder: &Path) -> Result<PathBuf, EvaluationError> {
        fs::create_dir_all(save_folder)?;
        let path = save_folder.join(CONFUSION_FILE);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        debug!("Wrote {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> SegmentationMetrics {
        SegmentationMetrics {
            iou: vec![Some(0.5), None, Some(1.0 / 3.0)],
            accuracy: vec![Some(0.75), None, Some(1.0)],
            miou: 0.41666,
            macc: 0.875,
            all_acc: 0.8,
        }
    }

    fn names() -> Vec<String> {
        vec!["road".into(), "sky".into(), "car".into()]
    }

    #[test]
    fn test_results_format() {
        let text = format_results(&metrics(), &names(), None);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Eval result: mIoU/mAcc/allAcc 0.4167/0.8750/0.8000.");
        assert_eq!(lines[1], "Class_00 result: iou/accuracy 0.5000/0.7500, name: road.");
        assert_eq!(lines[2], "Class_01 result: iou/accuracy nan/nan, name: sky.");
        assert_eq!(lines[3], "Class_02 result: iou/accuracy 0.3333/1.0000, name: car.");
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_excluded_classes_omitted() {
        let excluded: BTreeSet<usize> = [1].into_iter().collect();
        let lines = class_lines(&metrics(), &names(), Some(&excluded));
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("Class_02"));
    }

    #[test]
    fn test_confusion_report_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = ConfusionAggregator::new(3, 255);
        agg.update(
            ndarray::array![[0u16, 2]].view(),
            ndarray::array![[0u32, 2]].view(),
        )
        .unwrap();
        let report = ConfusionReport::new("toy", &names(), None, &agg, agg.metrics(None));
        let path = report.write(dir.path()).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["dataset"], "toy");
        assert_eq!(value["counts"][2][2], 1);
        assert!(value["metrics"]["iou"][1].is_null());
        assert_eq!(value["missed"], serde_json::json!([0, 0, 0]));
    }
}
