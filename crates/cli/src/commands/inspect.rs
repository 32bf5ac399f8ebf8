use anyhow::Result;
use clap::Args;
use semseg_inference::resize::scaled_short_side_size;
use semseg_inference::tiling::DEFAULT_STRIDE_RATE;
use semseg_inference::{Tile, TileGrid};
use serde_json::json;

#[derive(Args)]
pub struct InspectTilesCommand {
    /// Original image height
    #[arg(long)]
    height: usize,

    /// Original image width
    #[arg(long)]
    width: usize,

    #[arg(long, default_value = "720")]
    base_size: usize,

    #[arg(long, default_value = "1.0")]
    scale: f32,

    #[arg(long, default_value = "473")]
    crop_h: usize,

    #[arg(long, default_value = "473")]
    crop_w: usize,

    #[arg(long, default_value_t = DEFAULT_STRIDE_RATE)]
    stride_rate: f64,

    /// Print JSON instead of text
    #[arg(long, default_value = "false")]
    json: bool,
}

impl InspectTilesCommand {
    pub fn execute(self) -> Result<()> {
        let (scaled_h, scaled_w) =
            scaled_short_side_size(self.height, self.width, self.base_size, self.scale);
        let padded_h = scaled_h.max(self.crop_h);
        let padded_w = scaled_w.max(self.crop_w);
        let grid = TileGrid::new(padded_h, padded_w, self.crop_h, self.crop_w, self.stride_rate)?;
        let tiles: Vec<Tile> = grid.iter().collect();

        let coverage = grid.coverage();
        let min_cover = coverage.iter().copied().min().unwrap_or(0);
        let max_cover = coverage.iter().copied().max().unwrap_or(0);

        if self.json {
            let report = json!({
                "scaled": [scaled_h, scaled_w],
                "padded": [padded_h, padded_w],
                "grid": grid,
                "coverage": { "min": min_cover, "max": max_cover },
                "tiles": tiles,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!(
            "{}x{} at scale {} -> {}x{} (padded {}x{})",
            self.height, self.width, self.scale, scaled_h, scaled_w, padded_h, padded_w
        );
        println!(
            "crop {}x{}, stride {}x{}, grid {}x{} = {} tiles, coverage {}..{}",
            grid.crop_h,
            grid.crop_w,
            grid.stride_h,
            grid.stride_w,
            grid.grid_h,
            grid.grid_w,
            grid.len(),
            min_cover,
            max_cover
        );
        for (i, tile) in tiles.iter().enumerate() {
            println!(
                "  [{:3}] rows {:5}..{:5}  cols {:5}..{:5}",
                i, tile.start_h, tile.end_h, tile.start_w, tile.end_w
            );
        }
        Ok(())
    }
}
