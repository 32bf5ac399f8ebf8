//! Resizing, padding and mirroring of HWC images and CHW score tensors
//!
//! Two bilinear samplers are provided:
//! - half-pixel centers (`Sampling::HalfPixel`), used for image rescaling
//!   and for mapping stitched scores back to the original resolution
//! - corner-aligned (`Sampling::AlignCorners`), used to upsample backbone
//!   outputs whose stride makes them smaller than the crop

use ndarray::{s, Array3, ArrayView3};

/// Source-coordinate convention for bilinear interpolation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    HalfPixel,
    AlignCorners,
}

/// For each output index: (low source index, high source index, weight of high)
fn linear_taps(out_len: usize, in_len: usize, sampling: Sampling) -> Vec<(usize, usize, f32)> {
    let last = in_len - 1;
    (0..out_len)
        .map(|d| {
            let src = match sampling {
                Sampling::HalfPixel => {
                    let scale = in_len as f64 / out_len as f64;
                    ((d as f64 + 0.5) * scale - 0.5).max(0.0)
                }
                Sampling::AlignCorners => {
                    if out_len > 1 {
                        d as f64 * last as f64 / (out_len - 1) as f64
                    } else {
                        0.0
                    }
                }
            };
            let i0 = (src.floor() as usize).min(last);
            let i1 = (i0 + 1).min(last);
            let frac = if i0 == last { 0.0 } else { (src - i0 as f64) as f32 };
            (i0, i1, frac)
        })
        .collect()
}

/// Bilinear resize of an H×W×C array to `out_h`×`out_w`
#[must_use]
pub fn resize_hwc(src: ArrayView3<f32>, out_h: usize, out_w: usize, sampling: Sampling) -> Array3<f32> {
    let (in_h, in_w, channels) = src.dim();
    if (in_h, in_w) == (out_h, out_w) {
        return src.to_owned();
    }
    if in_h == 0 || in_w == 0 || out_h == 0 || out_w == 0 {
        return Array3::zeros((out_h, out_w, channels));
    }

    let rows = linear_taps(out_h, in_h, sampling);
    let cols = linear_taps(out_w, in_w, sampling);
    let mut out = Array3::zeros((out_h, out_w, channels));

    for (y, &(y0, y1, fy)) in rows.iter().enumerate() {
        for (x, &(x0, x1, fx)) in cols.iter().enumerate() {
            for c in 0..channels {
                let top = src[[y0, x0, c]] * (1.0 - fx) + src[[y0, x1, c]] * fx;
                let bottom = src[[y1, x0, c]] * (1.0 - fx) + src[[y1, x1, c]] * fx;
                out[[y, x, c]] = top * (1.0 - fy) + bottom * fy;
            }
        }
    }

    out
}

/// Bilinear resize of a C×H×W tensor to `out_h`×`out_w`
#[must_use]
pub fn resize_chw(src: ArrayView3<f32>, out_h: usize, out_w: usize, sampling: Sampling) -> Array3<f32> {
    let hwc = src.permuted_axes([1, 2, 0]);
    let resized = resize_hwc(hwc, out_h, out_w, sampling);
    resized
        .permuted_axes([2, 0, 1])
        .as_standard_layout()
        .into_owned()
}

/// Target size whose shorter side is `round(scale * base_size)`, keeping the
/// aspect ratio
#[must_use]
pub fn scaled_short_side_size(h: usize, w: usize, base_size: usize, scale: f32) -> (usize, usize) {
    let short = ((f64::from(scale) * base_size as f64).round() as usize).max(1);
    if h > w {
        let long = (short as f64 / w as f64 * h as f64).round() as usize;
        (long.max(1), short)
    } else {
        let long = (short as f64 / h as f64 * w as f64).round() as usize;
        (short, long.max(1))
    }
}

/// Resize an HWC image so its shorter side equals `round(scale * base_size)`
#[must_use]
pub fn resize_by_scaled_short_side(image: ArrayView3<f32>, base_size: usize, scale: f32) -> Array3<f32> {
    let (h, w, _) = image.dim();
    let (new_h, new_w) = scaled_short_side_size(h, w, base_size, scale);
    resize_hwc(image, new_h, new_w, Sampling::HalfPixel)
}

/// Pad an HWC image with a constant per-channel value until both sides are at
/// least the crop size. Returns the padded image and the leading (top, left)
/// pad amounts.
#[must_use]
pub fn pad_to_crop_size(
    image: ArrayView3<f32>,
    crop_h: usize,
    crop_w: usize,
    fill: &[f32],
) -> (Array3<f32>, usize, usize) {
    let (h, w, channels) = image.dim();
    let pad_h = crop_h.saturating_sub(h);
    let pad_w = crop_w.saturating_sub(w);
    let pad_h_half = pad_h / 2;
    let pad_w_half = pad_w / 2;

    if pad_h == 0 && pad_w == 0 {
        return (image.to_owned(), 0, 0);
    }

    let mut padded = Array3::from_shape_fn((h + pad_h, w + pad_w, channels), |(_, _, c)| {
        fill.get(c).copied().unwrap_or(0.0)
    });
    padded
        .slice_mut(s![pad_h_half..pad_h_half + h, pad_w_half..pad_w_half + w, ..])
        .assign(&image);

    (padded, pad_h_half, pad_w_half)
}

/// Mirror an HWC image along the width axis
#[must_use]
pub fn flip_hwc(image: ArrayView3<f32>) -> Array3<f32> {
    image.slice(s![.., ..;-1, ..]).to_owned()
}

/// Mirror a CHW tensor along the width axis
#[must_use]
pub fn flip_chw(scores: ArrayView3<f32>) -> Array3<f32> {
    scores.slice(s![.., .., ..;-1]).to_owned()
}
