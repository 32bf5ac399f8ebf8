// End-to-end tiled inference with a deterministic stub backbone

use ndarray::{Array4, ArrayView4};
use semseg_common::image_io::load_label_map;
use semseg_inference::resize::{resize_by_scaled_short_side, resize_hwc, Sampling};
use semseg_inference::{
    InferenceConfig, InferenceError, InferenceTask, NetworkBackbone, TilingSettings,
};
use semseg_taxonomy::{ScoreSpace, TaxonomyConfig, TaxonomyMapper, TaxonomyMode};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Four universal classes: bright pixels favor class 3, dark ones class 0
struct BrightnessBackbone;

impl NetworkBackbone for BrightnessBackbone {
    fn name(&self) -> &str {
        "brightness"
    }

    fn num_classes(&self) -> usize {
        4
    }

    fn forward(&self, batch: ArrayView4<f32>) -> Result<Array4<f32>, InferenceError> {
        let (n, _, h, w) = batch.dim();
        Ok(Array4::from_shape_fn((n, 4, h, w), |(b, c, y, x)| {
            let v = batch[[b, 0, y, x]];
            match c {
                0 => -4.0 * v,
                3 => 4.0 * v,
                _ => 0.0,
            }
        }))
    }
}

fn taxonomy() -> TaxonomyConfig {
    TaxonomyConfig {
        dataset: "toy".to_string(),
        universal_classes: vec!["sky".into(), "road".into(), "car".into(), "building".into()],
        dataset_classes: vec!["background".into(), "structure".into()],
        dataset_to_universal: vec![vec![0, 1], vec![2, 3]],
        label_lookup: BTreeMap::new(),
        ignore_index: 255,
    }
}

fn write_split_image(path: &Path, width: u32, height: u32) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    image::RgbImage::from_fn(width, height, |x, _| {
        if x < width / 2 {
            image::Rgb([0, 0, 0])
        } else {
            image::Rgb([255, 255, 255])
        }
    })
    .save(path)
    .unwrap();
}

fn task(mode: TaxonomyMode, save_folder: &Path, img_name_unique: bool) -> InferenceTask {
    let mapper = TaxonomyMapper::new(mode, ScoreSpace::Probabilities, &taxonomy()).unwrap();
    let config = InferenceConfig {
        tiling: TilingSettings {
            base_size: 16,
            crop_h: 12,
            crop_w: 12,
            ..TilingSettings::default()
        },
        scales: vec![0.5, 1.0, 1.25],
        img_name_unique,
        save_folder: save_folder.to_path_buf(),
        ..InferenceConfig::default()
    };
    InferenceTask::new(config, Arc::new(BrightnessBackbone), Arc::new(mapper)).unwrap()
}

#[test]
fn test_remap_to_dataset_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("images").join("scene.png");
    write_split_image(&image_path, 24, 16);

    let out = dir.path().join("out");
    let task = task(TaxonomyMode::RemapToDataset, &out, true);
    let summary = task.execute(&image_path).unwrap();
    assert_eq!(summary.processed, 1);

    let labels = load_label_map(out.join("gray").join("scene.png")).unwrap();
    assert_eq!(labels.dim(), (16, 24));
    for y in 0..16 {
        for x in 0..8 {
            assert_eq!(labels[[y, x]], 0, "pixel ({y}, {x})");
        }
        for x in 16..24 {
            assert_eq!(labels[[y, x]], 1, "pixel ({y}, {x})");
        }
    }
}

#[test]
fn test_universal_mode_keeps_model_classes() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("scene.png");
    write_split_image(&image_path, 20, 14);

    let task = task(TaxonomyMode::Universal, &dir.path().join("out"), true);
    let image = semseg_common::image_io::load_rgb_f32(&image_path).unwrap();
    let labels = task.execute_on_image(image.view()).unwrap();
    assert_eq!(labels[[7, 1]], 0);
    assert_eq!(labels[[7, 18]], 3);
}

#[test]
fn test_list_input_with_unique_keys() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("data");
    write_split_image(&root.join("scene0001/color/left/0001.jpg"), 18, 12);
    write_split_image(&root.join("scene0002/color/left/0001.jpg"), 18, 12);

    let list = dir.path().join("list.txt");
    std::fs::write(
        &list,
        "scene0001/color/left/0001.jpg\nscene0002/color/left/0001.jpg\n",
    )
    .unwrap();

    let out = dir.path().join("out");
    let mut task_config = task(TaxonomyMode::Universal, &out, false).config().clone();
    task_config.data_root = Some(root);
    let mapper =
        TaxonomyMapper::new(TaxonomyMode::Universal, ScoreSpace::Probabilities, &taxonomy())
            .unwrap();
    let task = InferenceTask::new(task_config, Arc::new(BrightnessBackbone), Arc::new(mapper))
        .unwrap();

    let summary = task.execute(&list).unwrap();
    assert_eq!(summary.processed, 2);
    assert!(out.join("gray/scene0001_color_left_0001.png").exists());
    assert!(out.join("gray/scene0002_color_left_0001.png").exists());
}

#[test]
fn test_resize_round_trip_restores_shape() {
    let image = ndarray::Array3::from_shape_fn((37, 53, 3), |(y, x, c)| (y + x + c) as f32);
    for scale in [0.5f32, 0.75, 1.0, 1.5, 1.75] {
        let scaled = resize_by_scaled_short_side(image.view(), 30, scale);
        let (h, w, _) = scaled.dim();
        assert_eq!(h, (30.0 * scale).round() as usize);
        let restored = resize_hwc(scaled.view(), 37, 53, Sampling::HalfPixel);
        assert_eq!(restored.dim(), (37, 53, 3));
        assert!(w >= h);
    }
}
