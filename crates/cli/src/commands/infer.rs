use super::{load_taxonomy, parse_mode, ScoreSpaceArg};
use anyhow::{Context as _, Result};
use clap::Args;
use semseg_inference::{BackboneConfig, InferenceConfig, InferenceTask};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

#[derive(Args)]
pub struct InferCommand {
    /// Image file, directory of images, or .txt image list
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Inference config (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Taxonomy description (YAML)
    #[arg(short, long)]
    taxonomy: PathBuf,

    /// ONNX model; replaces the config's backbone section
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Comma separated scale factors, e.g. 0.5,1.0,1.5
    #[arg(long, value_delimiter = ',')]
    scales: Option<Vec<f32>>,

    /// Taxonomy mode: universal, remap_to_dataset, pass_through
    #[arg(long)]
    mode: Option<String>,

    #[arg(long, value_enum)]
    score_space: Option<ScoreSpaceArg>,

    /// Shorter image side at scale 1.0
    #[arg(long)]
    base_size: Option<usize>,

    /// Square crop size
    #[arg(long)]
    crop_size: Option<usize>,

    #[arg(long)]
    save_folder: Option<PathBuf>,

    /// Prefix for relative paths in a .txt list
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Disable horizontal flip averaging
    #[arg(long, default_value = "false")]
    no_flip: bool,

    /// Run the crops of an image in parallel
    #[arg(long, default_value = "false")]
    parallel_tiles: bool,

    /// Key outputs by parent directories + stem instead of the bare stem
    #[arg(long, default_value = "false")]
    unique_keys: bool,

    /// Restrict the ONNX session to the CPU provider
    #[arg(long, default_value = "false")]
    cpu_only: bool,
}

impl InferCommand {
    fn build_config(&self, num_universal_classes: usize) -> Result<InferenceConfig> {
        let mut config = match &self.config {
            Some(path) => InferenceConfig::from_yaml(path)
                .with_context(|| format!("Failed to load inference config {}", path.display()))?,
            None => InferenceConfig::default(),
        };

        if let Some(scales) = &self.scales {
            config.scales = scales.clone();
        }
        if let Some(mode) = &self.mode {
            config.taxonomy_mode = parse_mode(mode)?;
        }
        if let Some(score_space) = self.score_space {
            config.score_space = score_space.into();
        }
        if let Some(base_size) = self.base_size {
            config.tiling.base_size = base_size;
        }
        if let Some(crop) = self.crop_size {
            config.tiling.crop_h = crop;
            config.tiling.crop_w = crop;
        }
        if let Some(save_folder) = &self.save_folder {
            config.save_folder = save_folder.clone();
        }
        if let Some(data_root) = &self.data_root {
            config.data_root = Some(data_root.clone());
        }
        if self.no_flip {
            config.tiling.flip = false;
        }
        if self.parallel_tiles {
            config.tiling.parallel_tiles = true;
        }
        if self.unique_keys {
            config.img_name_unique = false;
        }
        if let Some(model_path) = &self.model {
            config.backbone = Some(BackboneConfig::Onnx {
                model_path: model_path.clone(),
                num_classes: num_universal_classes,
                max_input_size: None,
                cpu_only: self.cpu_only,
            });
        } else if let Some(BackboneConfig::Onnx { cpu_only, .. }) = config.backbone.as_mut() {
            *cpu_only |= self.cpu_only;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn execute(self) -> Result<()> {
        let start = Instant::now();
        let taxonomy = load_taxonomy(&self.taxonomy)?;
        let config = self.build_config(taxonomy.universal_classes.len())?;

        let task = InferenceTask::from_config(config, &taxonomy)
            .context("Failed to set up inference")?;
        let summary = task
            .execute(&self.input)
            .with_context(|| format!("Inference failed on {}", self.input.display()))?;

        info!(
            "Wrote {} predictions to {} in {:.2}s",
            summary.processed,
            task.config().save_folder.join("gray").display(),
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }
}
