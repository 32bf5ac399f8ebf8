//! semseg - tiled multi-scale semantic segmentation
//!
//! Runs sliding-window inference with an ONNX backbone, evaluates saved
//! predictions against ground truth, and inspects tile layouts.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use rayon::ThreadPoolBuilder;
use semseg_inference::onnx_utils::{configured_threads, THREADS_ENV};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;

use commands::evaluate::EvaluateCommand;
use commands::infer::InferCommand;
use commands::inspect::InspectTilesCommand;

#[derive(Parser)]
#[command(
    name = "semseg",
    version,
    about = "Tiled multi-scale semantic segmentation inference and evaluation",
    after_help = "EXAMPLES:\n  \
                  # Multi-scale inference over a directory\n  \
                  semseg infer --config infer.yaml --taxonomy mseg.yaml images/\n  \
                  semseg infer --config infer.yaml --taxonomy mseg.yaml --scales 0.5,1.0,1.5 val.txt\n\n  \
                  # Evaluate saved predictions\n  \
                  semseg evaluate --config eval.yaml --taxonomy mseg.yaml\n\n  \
                  # Show the tile grid for a 1080x1920 image\n  \
                  semseg inspect-tiles --height 1080 --width 1920 --scale 1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tiled inference and write gray label maps
    Infer(InferCommand),

    /// Compute IoU/accuracy of saved predictions
    Evaluate(EvaluateCommand),

    /// Print the sliding-window layout for an image size
    InspectTiles(InspectTilesCommand),
}

fn main() -> Result<()> {
    // Bound rayon by the same variable that sizes ort intra-op threads
    if std::env::var(THREADS_ENV).is_ok() {
        ThreadPoolBuilder::new()
            .num_threads(configured_threads())
            .build_global()
            .ok();
    }

    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Infer(cmd) => cmd.execute(),
        Commands::Evaluate(cmd) => cmd.execute(),
        Commands::InspectTiles(cmd) => cmd.execute(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_infer_overrides() {
        let cli = Cli::try_parse_from([
            "semseg",
            "infer",
            "--taxonomy",
            "tax.yaml",
            "--scales",
            "0.5,1.0,1.5",
            "--model",
            "seg.onnx",
            "images/",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Infer(_)));
    }

    #[test]
    fn test_parse_inspect_verbose() {
        let cli = Cli::try_parse_from([
            "semseg",
            "-v",
            "inspect-tiles",
            "--height",
            "480",
            "--width",
            "640",
        ])
        .unwrap();
        assert!(cli.verbose);
    }
}
