// Accuracy evaluation over on-disk predictions and ground truth

use ndarray::Array2;
use semseg_common::image_io::save_label_map;
use semseg_common::prediction_path;
use semseg_evaluation::{
    AccuracyCalculator, EvaluationConfig, EvaluationError, MissingPredictionPolicy,
};
use semseg_taxonomy::{ScoreSpace, TaxonomyConfig, TaxonomyMapper, TaxonomyMode};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    /// Three 2x3 images; image `i` has ground truth `gt[i]` and prediction `pred[i]`
    fn new(gt: &[[u8; 6]; 3], pred: &[[u16; 6]; 3]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut list = String::new();
        for i in 0..3 {
            let image = format!("images/img{i}.jpg");
            let target = format!("labels/img{i}.png");
            list.push_str(&format!("{image} {target}\n"));

            let target_path = dir.path().join("data").join(&target);
            std::fs::create_dir_all(target_path.parent().unwrap()).unwrap();
            image::GrayImage::from_raw(3, 2, gt[i].to_vec())
                .unwrap()
                .save(&target_path)
                .unwrap();

            let labels = Array2::from_shape_vec((2, 3), pred[i].to_vec()).unwrap();
            let out = prediction_path(&dir.path().join("out"), &format!("img{i}"));
            save_label_map(&out, &labels, 256).unwrap();
        }
        std::fs::write(dir.path().join("val.txt"), list).unwrap();
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn config(&self, mode: TaxonomyMode) -> EvaluationConfig {
        let mut config = EvaluationConfig::new(self.path().join("val.txt"), self.path().join("out"));
        config.data_root = Some(self.path().join("data"));
        config.taxonomy_mode = mode;
        config.vis_freq = 1;
        config
    }
}

fn universal_mapper() -> Arc<TaxonomyMapper> {
    let taxonomy = TaxonomyConfig::universal_only(
        "toy",
        vec!["road".into(), "sky".into(), "car".into()],
    );
    Arc::new(TaxonomyMapper::new(TaxonomyMode::Universal, ScoreSpace::Probabilities, &taxonomy).unwrap())
}

const GT: [[u8; 6]; 3] = [[0, 0, 1, 1, 2, 2], [0, 1, 1, 255, 255, 2], [2, 2, 2, 0, 0, 0]];
const PRED: [[u16; 6]; 3] = [[0, 1, 1, 1, 2, 0], [0, 1, 0, 2, 2, 2], [2, 2, 1, 0, 0, 0]];

#[test]
fn test_universal_results_file() {
    let fixture = Fixture::new(&GT, &PRED);
    let calculator =
        AccuracyCalculator::new(fixture.config(TaxonomyMode::Universal), universal_mapper(), "toy")
            .unwrap();
    let summary = calculator.execute().unwrap();

    assert_eq!(summary.evaluated, 3);
    assert!(summary.skipped.is_empty());
    // 16 labelled pixels, 12 correct
    assert!((summary.metrics.all_acc - 0.75).abs() < 1e-12);

    let text = std::fs::read_to_string(&summary.results_path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("Eval result: mIoU/mAcc/allAcc "));
    assert!(lines[0].ends_with("/0.7500."));
    assert!(lines[1].starts_with("Class_00 result: iou/accuracy "));
    assert!(lines[3].ends_with("name: car."));
    assert!(summary.confusion_path.exists());
}

#[test]
fn test_parallel_matches_sequential() {
    let fixture = Fixture::new(&GT, &PRED);
    let sequential =
        AccuracyCalculator::new(fixture.config(TaxonomyMode::Universal), universal_mapper(), "toy")
            .unwrap()
            .evaluate_predictions()
            .unwrap();

    let mut config = fixture.config(TaxonomyMode::Universal);
    config.parallel = true;
    let parallel = AccuracyCalculator::new(config, universal_mapper(), "toy")
        .unwrap()
        .evaluate_predictions()
        .unwrap();

    assert_eq!(sequential.aggregator, parallel.aggregator);
    assert_eq!(parallel.evaluated, 3);
}

#[test]
fn test_missing_prediction_policies() {
    let fixture = Fixture::new(&GT, &PRED);
    std::fs::remove_file(prediction_path(&fixture.path().join("out"), "img1")).unwrap();

    let abort =
        AccuracyCalculator::new(fixture.config(TaxonomyMode::Universal), universal_mapper(), "toy")
            .unwrap();
    assert!(matches!(
        abort.execute(),
        Err(EvaluationError::MissingPrediction(_))
    ));

    let mut config = fixture.config(TaxonomyMode::Universal);
    config.missing_prediction = MissingPredictionPolicy::SkipAndWarn;
    let summary = AccuracyCalculator::new(config, universal_mapper(), "toy")
        .unwrap()
        .execute()
        .unwrap();
    assert_eq!(summary.evaluated, 2);
    assert_eq!(summary.skipped.len(), 1);
    // images 0 and 2: 12 pixels, 9 correct
    assert!((summary.metrics.all_acc - 0.75).abs() < 1e-12);
}

#[test]
fn test_wrongly_sized_prediction_follows_policy() {
    let fixture = Fixture::new(&GT, &PRED);
    let out = prediction_path(&fixture.path().join("out"), "img1");
    save_label_map(&out, &Array2::zeros((5, 5)), 256).unwrap();

    let abort =
        AccuracyCalculator::new(fixture.config(TaxonomyMode::Universal), universal_mapper(), "toy")
            .unwrap();
    assert!(matches!(
        abort.execute(),
        Err(EvaluationError::ShapeMismatch(_))
    ));

    let mut config = fixture.config(TaxonomyMode::Universal);
    config.missing_prediction = MissingPredictionPolicy::SkipAndWarn;
    let summary = AccuracyCalculator::new(config, universal_mapper(), "toy")
        .unwrap()
        .execute()
        .unwrap();
    assert_eq!(summary.evaluated, 2);
    assert_eq!(summary.skipped, vec![out]);
    assert!((summary.metrics.all_acc - 0.75).abs() < 1e-12);
}

#[test]
fn test_pass_through_excludes_unmapped_universal_classes() {
    // native ids 0 and 1 map to universal 0 and 2; universal 1 is never used
    let mut taxonomy = TaxonomyConfig::universal_only(
        "toy",
        vec!["road".into(), "sky".into(), "car".into()],
    );
    taxonomy.label_lookup = BTreeMap::from([(0, 0), (1, 2)]);
    let mapper = Arc::new(
        TaxonomyMapper::new(
            TaxonomyMode::PassThroughWithExternalRemap,
            ScoreSpace::Probabilities,
            &taxonomy,
        )
        .unwrap(),
    );

    let gt = [[0, 0, 1, 1, 2, 2], [0, 0, 0, 1, 1, 1], [1, 1, 1, 0, 0, 0]];
    let pred = [[0, 0, 2, 2, 1, 1], [0, 0, 0, 2, 2, 1], [2, 2, 2, 0, 0, 0]];
    let fixture = Fixture::new(&gt, &pred);

    let calculator = AccuracyCalculator::new(
        fixture.config(TaxonomyMode::PassThroughWithExternalRemap),
        mapper,
        "toy",
    )
    .unwrap();
    assert_eq!(calculator.exclusion_set().map(|s| s.len()), Some(1));

    let summary = calculator.execute().unwrap();
    let text = std::fs::read_to_string(&summary.results_path).unwrap();
    assert!(text.contains("Class_00 "));
    assert!(!text.contains("Class_01 "));
    assert!(text.contains("Class_02 "));

    // native 2 has no lookup entry and is ignored; universal 1 is excluded
    assert_eq!(summary.metrics.iou[0], Some(1.0));
    assert!((summary.metrics.miou - (1.0 + 7.0 / 8.0) / 2.0).abs() < 1e-12);
}

#[test]
fn test_mode_mismatch_rejected() {
    let fixture = Fixture::new(&GT, &PRED);
    let result = AccuracyCalculator::new(
        fixture.config(TaxonomyMode::RemapToDataset),
        universal_mapper(),
        "toy",
    );
    assert!(matches!(result, Err(EvaluationError::InvalidConfig(_))));
}
