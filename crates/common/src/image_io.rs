//! Image and label map I/O
//!
//! RGB inputs are decoded into `f32` HWC arrays in raw pixel range. Label
//! maps are single-channel PNGs: 8-bit when the class count fits in a byte,
//! 16-bit otherwise.

use crate::{ImageF32, LabelMap, Result, SegmentationError, TargetMap};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, RgbImage};
use ndarray::{Array2, Array3};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Load an RGB image as an H×W×3 `f32` array
pub fn load_rgb_f32<P: AsRef<Path>>(path: P) -> Result<ImageF32> {
    let path = path.as_ref();
    let img = image::open(path).map_err(|e| {
        SegmentationError::ImageError(format!("Failed to load image {}: {e}", path.display()))
    })?;
    debug!(
        "Loaded {} ({}x{})",
        path.display(),
        img.width(),
        img.height()
    );
    Ok(rgb_to_array(&img.to_rgb8()))
}

/// Convert an 8-bit RGB image into an H×W×3 `f32` array
#[must_use]
pub fn rgb_to_array(image: &RgbImage) -> ImageF32 {
    let (width, height) = image.dimensions();
    let mut array = Array3::zeros((height as usize, width as usize, 3));

    for (x, y, pixel) in image.enumerate_pixels() {
        array[[y as usize, x as usize, 0]] = f32::from(pixel[0]);
        array[[y as usize, x as usize, 1]] = f32::from(pixel[1]);
        array[[y as usize, x as usize, 2]] = f32::from(pixel[2]);
    }

    array
}

/// Load a ground-truth label image (8 or 16-bit single channel)
pub fn load_target_map<P: AsRef<Path>>(path: P) -> Result<TargetMap> {
    let path = path.as_ref();
    let img = image::open(path).map_err(|e| {
        SegmentationError::ImageError(format!("Failed to load label {}: {e}", path.display()))
    })?;
    gray_to_array(img, path).map(|a| a.mapv(u32::from))
}

/// Load a saved prediction (8 or 16-bit single channel)
pub fn load_label_map<P: AsRef<Path>>(path: P) -> Result<LabelMap> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(SegmentationError::MissingPrediction(path.to_path_buf()));
    }
    let img = image::open(path).map_err(|e| {
        SegmentationError::ImageError(format!(
            "Failed to load prediction {}: {e}",
            path.display()
        ))
    })?;
    gray_to_array(img, path)
}

fn gray_to_array(img: DynamicImage, path: &Path) -> Result<Array2<u16>> {
    match img {
        DynamicImage::ImageLuma8(gray) => {
            let (width, height) = gray.dimensions();
            Ok(Array2::from_shape_fn(
                (height as usize, width as usize),
                |(y, x)| u16::from(gray.get_pixel(x as u32, y as u32)[0]),
            ))
        }
        DynamicImage::ImageLuma16(gray) => {
            let (width, height) = gray.dimensions();
            Ok(Array2::from_shape_fn(
                (height as usize, width as usize),
                |(y, x)| gray.get_pixel(x as u32, y as u32)[0],
            ))
        }
        other => Err(SegmentationError::ImageError(format!(
            "Expected a single-channel label image at {}, got {:?}",
            path.display(),
            other.color()
        ))),
    }
}

/// Save a label map as a gray PNG, creating parent directories
///
/// Uses 8-bit storage when `num_classes <= 256`.
pub fn save_label_map<P: AsRef<Path>>(path: P, labels: &LabelMap, num_classes: usize) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let (height, width) = labels.dim();
    if num_classes <= 256 {
        let mut gray = GrayImage::new(width as u32, height as u32);
        for ((y, x), &label) in labels.indexed_iter() {
            let value = u8::try_from(label).map_err(|_| {
                SegmentationError::Other(format!(
                    "Label {label} does not fit in an 8-bit image ({num_classes} classes)"
                ))
            })?;
            gray.put_pixel(x as u32, y as u32, Luma([value]));
        }
        gray.save(path)?;
    } else {
        let gray: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
                Luma([labels[[y as usize, x as usize]]])
            });
        gray.save(path)?;
    }

    debug!("Wrote label map {} ({}x{})", path.display(), width, height);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn test_rgb_to_array_layout() {
        let img: RgbImage = ImageBuffer::from_fn(3, 2, |x, y| Rgb([x as u8, y as u8, 7]));
        let array = rgb_to_array(&img);
        assert_eq!(array.dim(), (2, 3, 3));
        assert_eq!(array[[1, 2, 0]], 2.0);
        assert_eq!(array[[1, 2, 1]], 1.0);
        assert_eq!(array[[0, 0, 2]], 7.0);
    }

    #[test]
    fn test_save_and_load_label_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gray").join("img.png");
        let labels: LabelMap = array![[0, 1, 2], [3, 4, 5]];

        save_label_map(&path, &labels, 6).unwrap();
        assert_eq!(load_label_map(&path).unwrap(), labels);

        let targets = load_target_map(&path).unwrap();
        assert_eq!(targets[[1, 2]], 5);
    }

    #[test]
    fn test_save_wide_label_map_uses_16_bit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wide.png");
        let labels: LabelMap = array![[0, 300], [299, 1]];

        save_label_map(&path, &labels, 301).unwrap();
        assert_eq!(load_label_map(&path).unwrap(), labels);
    }

    #[test]
    fn test_missing_prediction() {
        let dir = tempdir().unwrap();
        let err = load_label_map(dir.path().join("nope.png")).unwrap_err();
        assert!(matches!(err, SegmentationError::MissingPrediction(_)));
    }

    #[test]
    fn test_rgb_label_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rgb.png");
        let img: RgbImage = ImageBuffer::from_pixel(2, 2, Rgb([1, 2, 3]));
        img.save(&path).unwrap();

        assert!(matches!(
            load_target_map(&path),
            Err(SegmentationError::ImageError(_))
        ));
    }
}
