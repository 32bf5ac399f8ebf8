use super::{load_taxonomy, parse_mode};
use anyhow::{Context as _, Result};
use clap::Args;
use semseg_evaluation::{AccuracyCalculator, EvaluationConfig, MissingPredictionPolicy};
use semseg_taxonomy::{ScoreSpace, TaxonomyMapper};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args)]
pub struct EvaluateCommand {
    /// Evaluation config (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Taxonomy description (YAML)
    #[arg(short, long)]
    taxonomy: PathBuf,

    /// `<image> <target>` list; required without --config
    #[arg(long)]
    data_list: Option<PathBuf>,

    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Folder holding gray/ predictions
    #[arg(long)]
    save_folder: Option<PathBuf>,

    /// Taxonomy mode: universal, remap_to_dataset, pass_through
    #[arg(long)]
    mode: Option<String>,

    /// Warn and continue when a prediction is missing instead of aborting
    #[arg(long, default_value = "false")]
    skip_missing: bool,

    /// Evaluate images in parallel
    #[arg(long, default_value = "false")]
    parallel: bool,

    #[arg(long)]
    vis_freq: Option<usize>,

    /// Key predictions by parent directories + stem instead of the bare stem
    #[arg(long, default_value = "false")]
    unique_keys: bool,

    /// Model identifier echoed in the results log
    #[arg(long)]
    model_name: Option<String>,
}

impl EvaluateCommand {
    fn build_config(&self) -> Result<EvaluationConfig> {
        let mut config = match (&self.config, &self.data_list) {
            (Some(path), _) => EvaluationConfig::from_yaml(path)
                .with_context(|| format!("Failed to load evaluation config {}", path.display()))?,
            (None, Some(list)) => {
                EvaluationConfig::new(list.clone(), self.save_folder.clone().unwrap_or_else(|| "output".into()))
            }
            (None, None) => anyhow::bail!("Either --config or --data-list is required"),
        };

        if let Some(list) = &self.data_list {
            config.data_list = list.clone();
        }
        if let Some(root) = &self.data_root {
            config.data_root = Some(root.clone());
        }
        if let Some(save_folder) = &self.save_folder {
            config.save_folder = save_folder.clone();
        }
        if let Some(mode) = &self.mode {
            config.taxonomy_mode = parse_mode(mode)?;
        }
        if self.skip_missing {
            config.missing_prediction = MissingPredictionPolicy::SkipAndWarn;
        }
        if self.parallel {
            config.parallel = true;
        }
        if let Some(vis_freq) = self.vis_freq {
            config.vis_freq = vis_freq;
        }
        if self.unique_keys {
            config.img_name_unique = false;
        }
        if let Some(name) = &self.model_name {
            config.model_name = Some(name.clone());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn execute(self) -> Result<()> {
        let taxonomy = load_taxonomy(&self.taxonomy)?;
        let config = self.build_config()?;

        // Score space only matters for inference
        let mapper = TaxonomyMapper::new(config.taxonomy_mode, ScoreSpace::default(), &taxonomy)
            .context("Failed to build taxonomy mapper")?;
        let calculator = AccuracyCalculator::new(config, Arc::new(mapper), taxonomy.dataset.clone())?;
        let summary = calculator.execute().context("Evaluation failed")?;

        info!(
            "Evaluated {} images ({} skipped); results in {}",
            summary.evaluated,
            summary.skipped.len(),
            summary.results_path.display()
        );
        Ok(())
    }
}
