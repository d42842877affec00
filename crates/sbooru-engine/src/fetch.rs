use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

pub const JPEG_QUALITY: u8 = 85;

/// Re-encoded JPEG ready for the host, raw and base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub base64: String,
}

impl EncodedImage {
    pub fn mime_type(&self) -> &'static str {
        "image/jpeg"
    }
}

/// Decodes any format the `image` crate knows, flattens transparency onto
/// white and re-encodes as JPEG.
pub fn normalize_image(raw: &[u8]) -> Result<EncodedImage> {
    let decoded = image::load_from_memory(raw).context("image processing failed")?;
    let rgba = decoded.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend =
            |channel: u8| -> u8 { (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8 };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY)
        .encode_image(&flattened)
        .context("image re-encode failed")?;
    let base64 = BASE64.encode(&bytes);
    Ok(EncodedImage { bytes, base64 })
}
