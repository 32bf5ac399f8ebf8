pub mod evaluate;
pub mod infer;
pub mod inspect;

use anyhow::{Context as _, Result};
use semseg_taxonomy::{ScoreSpace, TaxonomyConfig, TaxonomyMode};
use std::path::Path;

/// `--score-space` values
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum ScoreSpaceArg {
    Probabilities,
    Logits,
}

impl From<ScoreSpaceArg> for ScoreSpace {
    fn from(arg: ScoreSpaceArg) -> Self {
        match arg {
            ScoreSpaceArg::Probabilities => ScoreSpace::Probabilities,
            ScoreSpaceArg::Logits => ScoreSpace::Logits,
        }
    }
}

pub(crate) fn load_taxonomy(path: &Path) -> Result<TaxonomyConfig> {
    TaxonomyConfig::from_yaml(path)
        .with_context(|| format!("Failed to load taxonomy from {}", path.display()))
}

pub(crate) fn parse_mode(mode: &str) -> Result<TaxonomyMode> {
    mode.parse::<TaxonomyMode>()
        .with_context(|| format!("Invalid --mode {mode:?}"))
}
