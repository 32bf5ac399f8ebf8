//! Dataset list files and input discovery
//!
//! A data list has one item per line: `<image> [<target>]`, whitespace
//! separated. Relative paths are resolved against the data root. Blank lines
//! and lines starting with `#` are ignored.

use crate::{Result, SegmentationError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Image extensions picked up when the input is a directory
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// One entry of a data list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    pub image: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
}

/// Read a data list file, resolving relative paths against `data_root`
pub fn read_data_list(list_path: &Path, data_root: Option<&Path>) -> Result<Vec<DataItem>> {
    let contents = fs::read_to_string(list_path)?;
    let resolve = |p: &str| -> PathBuf {
        let path = PathBuf::from(p);
        match data_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        }
    };

    let mut items = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let columns: Vec<&str> = line.split_whitespace().collect();
        let item = match columns.as_slice() {
            [image] => DataItem {
                image: resolve(image),
                target: None,
            },
            [image, target] => DataItem {
                image: resolve(image),
                target: Some(resolve(target)),
            },
            _ => {
                return Err(SegmentationError::InvalidConfig(format!(
                    "{}:{}: expected `<image> [<target>]`, got {} columns",
                    list_path.display(),
                    line_no + 1,
                    columns.len()
                )))
            }
        };
        items.push(item);
    }

    debug!("Read {} items from {}", items.len(), list_path.display());
    Ok(items)
}

/// List image files in a directory (non-recursive), sorted by path
pub fn list_images_in_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .collect();
    images.sort();
    Ok(images)
}
