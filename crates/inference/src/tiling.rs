//! Sliding-window inference over one rescaled copy of an image
//!
//! The rescaled image is padded up to the crop size with the per-channel
//! mean, covered by a grid of fixed-size crops, and each crop's class
//! probabilities are summed into a full-size buffer together with a coverage
//! count. Dividing by the count gives the overlap-averaged score map, which
//! is unpadded and resized back to the original resolution.
//!
//! Every pixel of the padded image lies in at least one tile: the last tile
//! of each row/column is clamped to the image bound and shifted back so it
//! keeps the full crop size.

use crate::resize::{
    flip_chw, pad_to_crop_size, resize_by_scaled_short_side, resize_chw, resize_hwc, Sampling,
};
use crate::{InferenceError, NetworkBackbone};
use ndarray::{s, Array2, Array3, Array4, ArrayView3, Axis};
use rayon::prelude::*;
use semseg_common::ScoreMap;
use semseg_taxonomy::TaxonomyMapper;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Default sliding-window step as a fraction of the crop size
pub const DEFAULT_STRIDE_RATE: f64 = 2.0 / 3.0;

/// ImageNet channel means in raw pixel range (RGB)
pub const IMAGENET_MEAN: [f32; 3] = [0.485 * 255.0, 0.456 * 255.0, 0.406 * 255.0];

/// ImageNet channel standard deviations in raw pixel range (RGB)
pub const IMAGENET_STD: [f32; 3] = [0.229 * 255.0, 0.224 * 255.0, 0.225 * 255.0];

/// A crop-sized window `[start_h, end_h) × [start_w, end_w)` in the padded image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub start_h: usize,
    pub end_h: usize,
    pub start_w: usize,
    pub end_w: usize,
}

impl Tile {
    #[must_use]
    pub fn height(&self) -> usize {
        self.end_h - self.start_h
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.end_w - self.start_w
    }
}

/// Row-major grid of crops covering a padded image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGrid {
    pub padded_h: usize,
    pub padded_w: usize,
    pub crop_h: usize,
    pub crop_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub grid_h: usize,
    pub grid_w: usize,
}

impl TileGrid {
    /// Lay out tiles with `stride = ceil(crop * stride_rate)` and
    /// `ceil((padded - crop) / stride) + 1` tiles per axis
    ///
    /// # Errors
    /// The padded image must be at least crop-sized, and `stride_rate` must
    /// be in `(0, 1]`.
    pub fn new(
        padded_h: usize,
        padded_w: usize,
        crop_h: usize,
        crop_w: usize,
        stride_rate: f64,
    ) -> Result<Self, InferenceError> {
        validate_crop(crop_h, crop_w, stride_rate)?;
        if padded_h < crop_h || padded_w < crop_w {
            return Err(InferenceError::InvalidConfig(format!(
                "padded image {padded_h}x{padded_w} is smaller than crop {crop_h}x{crop_w}"
            )));
        }

        let stride_h = ((crop_h as f64 * stride_rate).ceil() as usize).max(1);
        let stride_w = ((crop_w as f64 * stride_rate).ceil() as usize).max(1);
        let grid_h = (padded_h - crop_h).div_ceil(stride_h) + 1;
        let grid_w = (padded_w - crop_w).div_ceil(stride_w) + 1;

        Ok(Self {
            padded_h,
            padded_w,
            crop_h,
            crop_w,
            stride_h,
            stride_w,
            grid_h,
            grid_w,
        })
    }

    /// Total number of tiles
    #[must_use]
    pub fn len(&self) -> usize {
        self.grid_h * self.grid_w
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tile at grid position (`index_h`, `index_w`), clamped to the image
    #[must_use]
    pub fn tile(&self, index_h: usize, index_w: usize) -> Tile {
        let end_h = (index_h * self.stride_h + self.crop_h).min(self.padded_h);
        let end_w = (index_w * self.stride_w + self.crop_w).min(self.padded_w);
        Tile {
            start_h: end_h - self.crop_h,
            end_h,
            start_w: end_w - self.crop_w,
            end_w,
        }
    }

    /// Tiles in row-major order
    pub fn iter(&self) -> impl Iterator<Item = Tile> + '_ {
        (0..self.grid_h).flat_map(move |h| (0..self.grid_w).map(move |w| self.tile(h, w)))
    }

    /// Number of tiles covering each pixel of the padded image
    #[must_use]
    pub fn coverage(&self) -> Array2<u32> {
        let mut count = Array2::zeros((self.padded_h, self.padded_w));
        for tile in self.iter() {
            count
                .slice_mut(s![tile.start_h..tile.end_h, tile.start_w..tile.end_w])
                .mapv_inplace(|c| c + 1);
        }
        count
    }
}

fn validate_crop(crop_h: usize, crop_w: usize, stride_rate: f64) -> Result<(), InferenceError> {
    if crop_h == 0 || crop_w == 0 {
        return Err(InferenceError::InvalidConfig(format!(
            "crop size must be positive, got {crop_h}x{crop_w}"
        )));
    }
    if !(stride_rate > 0.0 && stride_rate <= 1.0) {
        return Err(InferenceError::InvalidConfig(format!(
            "stride_rate must be in (0, 1], got {stride_rate}"
        )));
    }
    Ok(())
}

/// Per-pixel class-score sum and coverage count for one (image, scale) pair
#[derive(Debug, Clone)]
pub struct PredictionAccumulator {
    sum: Array3<f32>,
    count: Array2<f32>,
}

impl PredictionAccumulator {
    #[must_use]
    pub fn new(num_classes: usize, height: usize, width: usize) -> Self {
        Self {
            sum: Array3::zeros((num_classes, height, width)),
            count: Array2::zeros((height, width)),
        }
    }

    /// Add a C×crop_h×crop_w score tensor at `tile`
    pub fn add(&mut self, tile: &Tile, scores: ArrayView3<f32>) -> Result<(), InferenceError> {
        let expected = (self.sum.len_of(Axis(0)), tile.height(), tile.width());
        if scores.dim() != expected {
            return Err(InferenceError::Stitching(format!(
                "crop scores {:?} do not match tile {:?}",
                scores.dim(),
                expected
            )));
        }

        let mut region = self
            .sum
            .slice_mut(s![.., tile.start_h..tile.end_h, tile.start_w..tile.end_w]);
        region += &scores;
        self.count
            .slice_mut(s![tile.start_h..tile.end_h, tile.start_w..tile.end_w])
            .mapv_inplace(|c| c + 1.0);
        Ok(())
    }

    /// Coverage count per pixel
    #[must_use]
    pub fn coverage(&self) -> &Array2<f32> {
        &self.count
    }

    /// Divide the score sum by coverage
    ///
    /// # Errors
    /// Fails if any pixel was never covered.
    pub fn into_average(self) -> Result<Array3<f32>, InferenceError> {
        if let Some(((y, x), _)) = self.count.indexed_iter().find(|(_, c)| **c <= 0.0) {
            return Err(InferenceError::Stitching(format!(
                "pixel ({y}, {x}) is not covered by any tile"
            )));
        }

        let Self { mut sum, count } = self;
        for mut plane in sum.outer_iter_mut() {
            plane /= &count;
        }
        Ok(sum)
    }
}

/// Settings of the sliding-window processor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingSettings {
    /// Length of the shorter image side at scale 1.0
    pub base_size: usize,
    pub crop_h: usize,
    pub crop_w: usize,
    pub stride_rate: f64,
    /// Average each crop with its horizontal mirror
    pub flip: bool,
    /// Per-channel mean in raw pixel range; also the padding value
    pub mean: [f32; 3],
    /// Per-channel standard deviation in raw pixel range
    pub std: [f32; 3],
    /// Run crops of one image on the rayon pool
    pub parallel_tiles: bool,
}

impl Default for TilingSettings {
    fn default() -> Self {
        Self {
            base_size: 720,
            crop_h: 473,
            crop_w: 473,
            stride_rate: DEFAULT_STRIDE_RATE,
            flip: true,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            parallel_tiles: false,
        }
    }
}

/// Sliding-window, flip-averaged inference producing full-resolution scores
pub struct TiledScaleProcessor {
    backbone: Arc<dyn NetworkBackbone>,
    mapper: Arc<TaxonomyMapper>,
    settings: TilingSettings,
}

impl TiledScaleProcessor {
    /// Validate settings against the backbone and taxonomy
    ///
    /// # Errors
    /// Configuration errors (crop larger than the backbone accepts, class
    /// count mismatch, non-positive sizes) are reported here, before any
    /// tiling happens.
    pub fn new(
        backbone: Arc<dyn NetworkBackbone>,
        mapper: Arc<TaxonomyMapper>,
        settings: TilingSettings,
    ) -> Result<Self, InferenceError> {
        validate_crop(settings.crop_h, settings.crop_w, settings.stride_rate)?;
        if settings.base_size == 0 {
            return Err(InferenceError::InvalidConfig(
                "base_size must be positive".to_string(),
            ));
        }
        if settings.std.iter().any(|&s| s == 0.0) {
            return Err(InferenceError::InvalidConfig(
                "std must be non-zero in every channel".to_string(),
            ));
        }
        if let Some((max_h, max_w)) = backbone.max_input_size() {
            if settings.crop_h > max_h || settings.crop_w > max_w {
                return Err(InferenceError::InvalidConfig(format!(
                    "crop {}x{} exceeds the maximum input {}x{} of backbone {}",
                    settings.crop_h,
                    settings.crop_w,
                    max_h,
                    max_w,
                    backbone.name()
                )));
            }
        }
        if backbone.num_classes() != mapper.num_model_classes() {
            return Err(InferenceError::InvalidConfig(format!(
                "backbone {} emits {} classes but the taxonomy has {} universal classes",
                backbone.name(),
                backbone.num_classes(),
                mapper.num_model_classes()
            )));
        }

        Ok(Self {
            backbone,
            mapper,
            settings,
        })
    }

    #[must_use]
    pub fn settings(&self) -> &TilingSettings {
        &self.settings
    }

    /// Number of classes in the produced score maps
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.mapper.num_eval_classes()
    }

    /// Rescale `image` to `scale`, run tiled inference, and return an
    /// H×W×C score map at the original resolution
    pub fn process(&self, image: ArrayView3<f32>, scale: f32) -> Result<ScoreMap, InferenceError> {
        if !(scale > 0.0) {
            return Err(InferenceError::InvalidConfig(format!(
                "scale must be positive, got {scale}"
            )));
        }
        let (h, w, _) = image.dim();
        let scaled = resize_by_scaled_short_side(image, self.settings.base_size, scale);
        debug!(
            "Scale {}: {}x{} -> {}x{}",
            scale,
            h,
            w,
            scaled.dim().0,
            scaled.dim().1
        );
        self.process_resized(scaled.view(), h, w)
    }

    /// Tiled inference on an already rescaled image; the result is resized to
    /// `out_h`×`out_w`
    pub fn process_resized(
        &self,
        image: ArrayView3<f32>,
        out_h: usize,
        out_w: usize,
    ) -> Result<ScoreMap, InferenceError> {
        let TilingSettings {
            crop_h,
            crop_w,
            stride_rate,
            ..
        } = self.settings;

        let (ori_h, ori_w, _) = image.dim();
        let (padded, pad_h_half, pad_w_half) =
            pad_to_crop_size(image, crop_h, crop_w, &self.settings.mean);
        let (new_h, new_w, _) = padded.dim();
        let grid = TileGrid::new(new_h, new_w, crop_h, crop_w, stride_rate)?;
        let tiles: Vec<Tile> = grid.iter().collect();

        debug!(
            "Tiling {}x{} (padded from {}x{}) into {}x{} crops of {}x{}",
            new_h, new_w, ori_h, ori_w, grid.grid_h, grid.grid_w, crop_h, crop_w
        );

        let mut accumulator = PredictionAccumulator::new(self.num_classes(), new_h, new_w);
        let chunk_size = if self.settings.parallel_tiles {
            rayon::current_num_threads().max(1)
        } else {
            1
        };

        for chunk in tiles.chunks(chunk_size) {
            let crop_scores: Vec<Array3<f32>> = if self.settings.parallel_tiles {
                chunk
                    .par_iter()
                    .map(|tile| {
                        self.net_process(padded.slice(s![
                            tile.start_h..tile.end_h,
                            tile.start_w..tile.end_w,
                            ..
                        ]))
                    })
                    .collect::<Result<_, _>>()?
            } else {
                chunk
                    .iter()
                    .map(|tile| {
                        self.net_process(padded.slice(s![
                            tile.start_h..tile.end_h,
                            tile.start_w..tile.end_w,
                            ..
                        ]))
                    })
                    .collect::<Result<_, _>>()?
            };

            for (tile, scores) in chunk.iter().zip(&crop_scores) {
                accumulator.add(tile, scores.view())?;
            }
        }

        let averaged = accumulator.into_average()?;
        let unpadded = averaged.slice(s![
            ..,
            pad_h_half..pad_h_half + ori_h,
            pad_w_half..pad_w_half + ori_w
        ]);

        let hwc = unpadded.permuted_axes([1, 2, 0]);
        Ok(resize_hwc(hwc, out_h, out_w, Sampling::HalfPixel))
    }

    /// Run one crop (H×W×3, raw pixels) through the backbone and return
    /// C×H×W class probabilities in the evaluation taxonomy
    ///
    /// With flipping enabled the mirrored crop is run in the same batch and
    /// its re-mirrored probabilities are averaged with the direct ones.
    pub fn net_process(&self, crop: ArrayView3<f32>) -> Result<Array3<f32>, InferenceError> {
        let (h, w, _) = crop.dim();
        let normalized = self.normalize(crop);
        let batch_size = if self.settings.flip { 2 } else { 1 };

        let mut batch = Array4::zeros((batch_size, 3, h, w));
        batch.slice_mut(s![0, .., .., ..]).assign(&normalized);
        if self.settings.flip {
            batch
                .slice_mut(s![1, .., .., ..])
                .assign(&normalized.slice(s![.., .., ..;-1]));
        }

        let output = self.backbone.forward(batch.view())?;
        if output.len_of(Axis(0)) != batch_size {
            return Err(InferenceError::InvalidOutputShape(
                output.shape().iter().map(|&d| d as i64).collect(),
            ));
        }

        let mut probabilities = Vec::with_capacity(batch_size);
        for item in output.outer_iter() {
            let (_, out_h, out_w) = item.dim();
            let scores = if (out_h, out_w) == (h, w) {
                self.mapper.transform_scores(item)?
            } else {
                let upsampled = resize_chw(item, h, w, Sampling::AlignCorners);
                self.mapper.transform_scores(upsampled.view())?
            };
            probabilities.push(scores);
        }

        if self.settings.flip {
            let mirrored = flip_chw(probabilities[1].view());
            Ok((&probabilities[0] + &mirrored) / 2.0)
        } else {
            Ok(probabilities.swap_remove(0))
        }
    }

    /// HWC raw pixels to CHW `(x - mean) / std`
    fn normalize(&self, crop: ArrayView3<f32>) -> Array3<f32> {
        let (h, w, _) = crop.dim();
        let TilingSettings { mean, std, .. } = self.settings;
        Array3::from_shape_fn((3, h, w), |(c, y, x)| (crop[[y, x, c]] - mean[c]) / std[c])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use semseg_taxonomy::{ScoreSpace, TaxonomyConfig, TaxonomyMode};

    /// Class 0 logit = red channel, class 1 logit = x position
    struct GradientBackbone;

    impl NetworkBackbone for GradientBackbone {
        fn name(&self) -> &str {
            "gradient"
        }

        fn num_classes(&self) -> usize {
            2
        }

        fn max_input_size(&self) -> Option<(usize, usize)> {
            Some((16, 16))
        }

        fn forward(&self, batch: ndarray::ArrayView4<f32>) -> Result<Array4<f32>, InferenceError> {
            let (n, _, h, w) = batch.dim();
            Ok(Array4::from_shape_fn((n, 2, h, w), |(i, c, y, x)| {
                if c == 0 {
                    batch[[i, 0, y, x]]
                } else {
                    x as f32 * 0.1
                }
            }))
        }
    }

    fn mapper() -> Arc<TaxonomyMapper> {
        let config = TaxonomyConfig::universal_only("test", vec!["a".into(), "b".into()]);
        Arc::new(
            TaxonomyMapper::new(TaxonomyMode::Universal, ScoreSpace::Probabilities, &config)
                .unwrap(),
        )
    }

    fn settings(crop: usize, flip: bool) -> TilingSettings {
        TilingSettings {
            base_size: 8,
            crop_h: crop,
            crop_w: crop,
            stride_rate: 0.5,
            flip,
            mean: [0.0; 3],
            std: [1.0; 3],
            parallel_tiles: false,
        }
    }

    #[test]
    fn test_grid_for_8x8_crop_4_stride_half() {
        let grid = TileGrid::new(8, 8, 4, 4, 0.5).unwrap();
        assert_eq!((grid.stride_h, grid.stride_w), (2, 2));
        assert_eq!((grid.grid_h, grid.grid_w), (3, 3));
        assert_eq!(grid.len(), 9);

        let tiles: Vec<Tile> = grid.iter().collect();
        assert_eq!(
            tiles[0],
            Tile {
                start_h: 0,
                end_h: 4,
                start_w: 0,
                end_w: 4
            }
        );
        assert_eq!(
            tiles[8],
            Tile {
                start_h: 4,
                end_h: 8,
                start_w: 4,
                end_w: 8
            }
        );
        assert!(grid.coverage().iter().all(|&c| c >= 1));
    }

    #[test]
    fn test_last_tile_shifted_back_to_full_crop() {
        // 11 wide, crop 4, stride 3: nominal starts 0, 3, 6, 9 -> last is 7..11
        let grid = TileGrid::new(4, 11, 4, 4, 0.75).unwrap();
        assert_eq!(grid.grid_w, 4);
        let last = grid.tile(0, 3);
        assert_eq!((last.start_w, last.end_w), (7, 11));
        assert!(grid.iter().all(|t| t.height() == 4 && t.width() == 4));
    }

    #[test]
    fn test_default_stride_rate_matches_ceil() {
        let grid = TileGrid::new(1000, 473, 473, 473, DEFAULT_STRIDE_RATE).unwrap();
        assert_eq!(grid.stride_h, 316);
        assert_eq!(grid.grid_h, 3);
        assert_eq!(grid.grid_w, 1);
    }

    #[test]
    fn test_coverage_positive_for_many_shapes() {
        for padded_h in [4, 5, 7, 13, 31] {
            for padded_w in [4, 6, 9, 17] {
                for crop in [1, 2, 3, 4] {
                    for rate in [0.1, 0.5, DEFAULT_STRIDE_RATE, 1.0] {
                        let grid = TileGrid::new(padded_h, padded_w, crop, crop, rate).unwrap();
                        assert!(
                            grid.coverage().iter().all(|&c| c >= 1),
                            "uncovered pixel for {padded_h}x{padded_w} crop {crop} rate {rate}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_grid_rejects_bad_config() {
        assert!(TileGrid::new(3, 8, 4, 4, 0.5).is_err());
        assert!(TileGrid::new(8, 8, 4, 4, 0.0).is_err());
        assert!(TileGrid::new(8, 8, 4, 4, 1.5).is_err());
        assert!(TileGrid::new(8, 8, 0, 4, 0.5).is_err());
    }

    #[test]
    fn test_accumulator_rejects_uncovered_pixels() {
        let mut acc = PredictionAccumulator::new(1, 2, 2);
        let tile = Tile {
            start_h: 0,
            end_h: 1,
            start_w: 0,
            end_w: 1,
        };
        acc.add(&tile, Array3::from_elem((1, 1, 1), 1.0).view()).unwrap();
        assert!(matches!(
            acc.into_average(),
            Err(InferenceError::Stitching(_))
        ));
    }

    #[test]
    fn test_accumulator_averages_overlap() {
        let mut acc = PredictionAccumulator::new(1, 1, 3);
        let left = Tile {
            start_h: 0,
            end_h: 1,
            start_w: 0,
            end_w: 2,
        };
        let right = Tile {
            start_h: 0,
            end_h: 1,
            start_w: 1,
            end_w: 3,
        };
        acc.add(&left, Array3::from_elem((1, 1, 2), 2.0).view()).unwrap();
        acc.add(&right, Array3::from_elem((1, 1, 2), 4.0).view()).unwrap();
        assert_eq!(acc.coverage()[[0, 1]], 2.0);

        let avg = acc.into_average().unwrap();
        assert_eq!(avg.iter().copied().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_crop_larger_than_backbone_rejected() {
        let result = TiledScaleProcessor::new(Arc::new(GradientBackbone), mapper(), settings(32, true));
        assert!(matches!(result, Err(InferenceError::InvalidConfig(_))));
    }

    #[test]
    fn test_flip_symmetry() {
        let processor =
            TiledScaleProcessor::new(Arc::new(GradientBackbone), mapper(), settings(4, true))
                .unwrap();
        let crop = Array3::from_shape_fn((4, 4, 3), |(y, x, c)| (y * 4 + x + c) as f32 * 0.05);
        let mirrored = crate::resize::flip_hwc(crop.view());

        let direct = processor.net_process(crop.view()).unwrap();
        let from_mirror = processor.net_process(mirrored.view()).unwrap();
        assert_eq!(direct, flip_chw(from_mirror.view()));
    }

    #[test]
    fn test_net_process_outputs_probabilities() {
        let processor =
            TiledScaleProcessor::new(Arc::new(GradientBackbone), mapper(), settings(4, false))
                .unwrap();
        let crop = Array3::from_elem((4, 4, 3), 0.3f32);
        let probs = processor.net_process(crop.view()).unwrap();
        assert_eq!(probs.dim(), (2, 4, 4));
        for y in 0..4 {
            for x in 0..4 {
                assert!((probs[[0, y, x]] + probs[[1, y, x]] - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_process_returns_original_shape() {
        let processor =
            TiledScaleProcessor::new(Arc::new(GradientBackbone), mapper(), settings(4, true))
                .unwrap();
        let image = Array3::from_shape_fn((5, 11, 3), |(y, x, _)| (y + x) as f32);
        for scale in [0.5, 1.0, 1.75] {
            let scores = processor.process(image.view(), scale).unwrap();
            assert_eq!(scores.dim(), (5, 11, 2));
        }
    }

    #[test]
    fn test_parallel_tiles_match_sequential() {
        let image = Array3::from_shape_fn((9, 13, 3), |(y, x, c)| ((y * 7 + x * 3 + c) % 11) as f32);
        let sequential =
            TiledScaleProcessor::new(Arc::new(GradientBackbone), mapper(), settings(4, true))
                .unwrap();
        let mut parallel_settings = settings(4, true);
        parallel_settings.parallel_tiles = true;
        let parallel =
            TiledScaleProcessor::new(Arc::new(GradientBackbone), mapper(), parallel_settings)
                .unwrap();

        let a = sequential.process(image.view(), 1.0).unwrap();
        let b = parallel.process(image.view(), 1.0).unwrap();
        assert_eq!(a, b);
    }
}
