//! Image and mask preprocessing for the CLIP vision backbone.
//!
//! CLIP expects:
//! - Input size: `image_size × image_size` pixels
//! - Normalization: `(pixel/255 - mean) / std` with the OpenAI CLIP statistics
//! - Channel order: RGB
//! - Tensor layout: NCHW [batch, channels, height, width]
//!
//! Masks are resized with nearest-neighbour sampling so they stay binary.

use std::path::Path;

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::{Array2, Array4};

use crate::error::DataError;

/// Number of color channels (RGB).
const CHANNELS: usize = 3;

/// CLIP normalization mean (per-channel).
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];

/// CLIP normalization std (per-channel).
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Mask values above this are anomalous.
pub const MASK_THRESHOLD: f32 = 0.5;

/// Decode an image file.
pub fn load_image(path: &Path) -> Result<DynamicImage, DataError> {
    image::open(path).map_err(|e| DataError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Preprocess an image for the vision backbone: `(1, 3, size, size)`.
pub fn preprocess_image(image: &DynamicImage, image_size: u32) -> Array4<f32> {
    let resized = image.resize_exact(image_size, image_size, FilterType::CatmullRom);
    let rgb = resized.to_rgb8();

    let size = image_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, CHANNELS, size, size));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..CHANNELS {
            let value = pixel.0[c] as f32 / 255.0;
            tensor[[0, c, y as usize, x as usize]] = (value - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    tensor
}

/// Preprocess a ground-truth mask: grayscale, nearest-resized, scaled to
/// [0, 1] and binarized at [`MASK_THRESHOLD`].
pub fn preprocess_mask(mask: &DynamicImage, image_size: u32) -> Array2<f32> {
    let resized = mask.resize_exact(image_size, image_size, FilterType::Nearest);
    let gray = resized.to_luma8();

    let size = image_size as usize;
    let mut out = Array2::<f32>::zeros((size, size));
    for (x, y, pixel) in gray.enumerate_pixels() {
        let value = pixel.0[0] as f32 / 255.0;
        out[[y as usize, x as usize]] = if value > MASK_THRESHOLD { 1.0 } else { 0.0 };
    }
    out
}
