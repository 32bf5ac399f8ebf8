//! Inference over an image, a directory of images, or an image list

use crate::backbone::{build_backbone, NetworkBackbone};
use crate::fusion::MultiScaleFuser;
use crate::tiling::TiledScaleProcessor;
use crate::{InferenceConfig, InferenceError};
use ndarray::ArrayView3;
use semseg_common::data_list::IMAGE_EXTENSIONS;
use semseg_common::image_io::{load_rgb_f32, save_label_map};
use semseg_common::{image_key, list_images_in_dir, prediction_path, read_data_list, LabelMap};
use semseg_taxonomy::{TaxonomyConfig, TaxonomyMapper};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of [`InferenceTask::execute`]
#[derive(Debug, Clone, Default)]
pub struct InferenceSummary {
    pub processed: usize,
    pub outputs: Vec<PathBuf>,
}

/// Multi-scale tiled inference writing gray label maps to
/// `<save_folder>/gray/<key>.png`
pub struct InferenceTask {
    config: InferenceConfig,
    processor: TiledScaleProcessor,
    mapper: Arc<TaxonomyMapper>,
}

impl InferenceTask {
    pub fn new(
        config: InferenceConfig,
        backbone: Arc<dyn NetworkBackbone>,
        mapper: Arc<TaxonomyMapper>,
    ) -> Result<Self, InferenceError> {
        config.validate()?;
        let processor = TiledScaleProcessor::new(backbone, Arc::clone(&mapper), config.tiling.clone())?;
        Ok(Self {
            config,
            processor,
            mapper,
        })
    }

    /// Build the backbone and taxonomy mapper described by `config`
    ///
    /// # Errors
    /// A missing `backbone` section or checkpoint file is fatal here, before
    /// any image is read.
    pub fn from_config(
        config: InferenceConfig,
        taxonomy: &TaxonomyConfig,
    ) -> Result<Self, InferenceError> {
        let backbone_config = config.backbone.as_ref().ok_or_else(|| {
            InferenceError::InvalidConfig("no backbone configured".to_string())
        })?;
        let mapper = TaxonomyMapper::new(config.taxonomy_mode, config.score_space, taxonomy)?;
        let backbone: Arc<dyn NetworkBackbone> = Arc::from(build_backbone(backbone_config)?);
        Self::new(config, backbone, Arc::new(mapper))
    }

    #[must_use]
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    #[must_use]
    pub fn mapper(&self) -> &TaxonomyMapper {
        &self.mapper
    }

    /// Fused label map for one H×W×3 image in raw pixel range
    pub fn execute_on_image(&self, image: ArrayView3<f32>) -> Result<LabelMap, InferenceError> {
        let mut fuser = MultiScaleFuser::new();
        for &scale in &self.config.scales {
            let scores = self.processor.process(image, scale)?;
            fuser.add(scores.view())?;
        }
        fuser.finish()
    }

    /// Resolve `input` into the list of images to process
    ///
    /// Accepts a directory (jpg/jpeg/png, sorted), a `.txt` list whose first
    /// column holds image paths, or a single image file.
    pub fn collect_inputs(&self, input: &Path) -> Result<Vec<PathBuf>, InferenceError> {
        if input.is_dir() {
            return Ok(list_images_in_dir(input)?);
        }

        let extension = input
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if extension == "txt" {
            let items = read_data_list(input, self.config.data_root.as_deref())?;
            return Ok(items.into_iter().map(|item| item.image).collect());
        }
        if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            if !input.exists() {
                return Err(InferenceError::InvalidConfig(format!(
                    "input image {} does not exist",
                    input.display()
                )));
            }
            return Ok(vec![input.to_path_buf()]);
        }

        Err(InferenceError::InvalidConfig(format!(
            "unsupported input {}: expected an image, a directory, or a .txt list",
            input.display()
        )))
    }

    /// Run inference over every image in `input` and save label maps
    pub fn execute(&self, input: &Path) -> Result<InferenceSummary, InferenceError> {
        let images = self.collect_inputs(input)?;
        let total = images.len();

        info!(">>>>>>>>>>>>>>>> Start Evaluation >>>>>>>>>>>>>>>>");
        let settings = self.processor.settings();
        info!(
            "=> {} inference with crop {}x{} on {} images, scales {:?}, mode {}",
            self.config.scale_label(),
            settings.crop_h,
            settings.crop_w,
            total,
            self.config.scales,
            self.mapper.mode()
        );
        if total == 0 {
            warn!("No images found in {}", input.display());
            return Ok(InferenceSummary::default());
        }

        let mut summary = InferenceSummary::default();
        let start = Instant::now();
        let mut data_secs = 0.0f64;

        for (i, path) in images.iter().enumerate() {
            let load_start = Instant::now();
            let image = load_rgb_f32(path)?;
            data_secs += load_start.elapsed().as_secs_f64();

            let labels = self.execute_on_image(image.view())?;
            let key = image_key(path, self.config.img_name_unique);
            let output = prediction_path(&self.config.save_folder, &key);
            save_label_map(&output, &labels, self.mapper.num_eval_classes())?;
            debug!("{} -> {}", path.display(), output.display());

            summary.processed += 1;
            summary.outputs.push(output);

            let done = i + 1;
            if done % self.config.print_freq == 0 || done == total {
                let elapsed = start.elapsed().as_secs_f64();
                info!(
                    "Test: [{}/{}] Data {:.3} Batch {:.3} ({:.3} avg)",
                    done,
                    total,
                    data_secs / done as f64,
                    elapsed,
                    elapsed / done as f64
                );
            }
        }

        info!("<<<<<<<<<<<<<<<<< End Evaluation <<<<<<<<<<<<<<<<<");
        Ok(summary)
    }
}
