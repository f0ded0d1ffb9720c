use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};
use ndarray::{Array2, ArrayView2};
use serde::{Serialize, Serializer};
use std::io::Cursor;
use thiserror::Error;

pub const MASK_FORMAT: &str = "png";

const MASK_PIXEL: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BACKGROUND_PIXEL: Rgba<u8> = Rgba([255, 255, 255, 0]);

#[derive(Error, Debug)]
pub enum MaskError {
    #[error("Mask is empty ({0}x{1})")]
    Empty(usize, usize),
    #[error("Failed to encode mask: {0}")]
    Encode(#[from] image::ImageError),
}

/// How the caller wants the PNG handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskEncoding {
    /// Base64 text, embeddable in JSON.
    Base64,
    /// Raw PNG bytes for multipart streaming.
    Binary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MaskData {
    Base64(String),
    Png(Bytes),
}

impl MaskData {
    pub fn png_bytes(&self) -> Option<&Bytes> {
        match self {
            MaskData::Png(bytes) => Some(bytes),
            MaskData::Base64(_) => None,
        }
    }
}

impl Serialize for MaskData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MaskData::Base64(text) => serializer.serialize_str(text),
            MaskData::Png(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
        }
    }
}

pub fn binarize(raw: ArrayView2<f32>, threshold: f32) -> Array2<bool> {
    raw.mapv(|value| value > threshold)
}

/// Logistic transform of the mean raw logit.
///
/// A rough proxy for segmentation quality, not a calibrated probability.
/// Non-finite results fall back to zero.
pub fn confidence(raw: ArrayView2<f32>) -> f32 {
    if raw.is_empty() {
        return 0.0;
    }
    let mean = raw.iter().map(|v| *v as f64).sum::<f64>() / raw.len() as f64;
    let score = 1.0 / (1.0 + (-mean).exp());
    if score.is_finite() {
        score.clamp(0.0, 1.0) as f32
    } else {
        0.0
    }
}

/// Transparent RGBA overlay: white and opaque where the mask is set.
pub fn mask_png_bytes(mask: ArrayView2<bool>) -> Result<Vec<u8>, MaskError> {
    let (height, width) = mask.dim();
    if height == 0 || width == 0 {
        return Err(MaskError::Empty(width, height));
    }

    let image = RgbaImage::from_fn(width as u32, height as u32, |x, y| {
        if mask[[y as usize, x as usize]] {
            MASK_PIXEL
        } else {
            BACKGROUND_PIXEL
        }
    });

    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

pub fn encode(png: Vec<u8>, encoding: MaskEncoding) -> MaskData {
    match encoding {
        MaskEncoding::Base64 => MaskData::Base64(BASE64.encode(&png)),
        MaskEncoding::Binary => MaskData::Png(Bytes::from(png)),
    }
}

pub fn decode_png_mask(png: &[u8]) -> Result<Array2<bool>, MaskError> {
    let image = image::load_from_memory_with_format(png, ImageFormat::Png)?.to_rgba8();
    let (width, height) = image.dimensions();
    Ok(Array2::from_shape_fn(
        (height as usize, width as usize),
        |(y, x)| image.get_pixel(x as u32, y as u32)[3] > 0,
    ))
}
