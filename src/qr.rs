//! QR round trip for `otpauth://` URIs.
//!
//! Encoding uses the `qrcode` crate for the matrix and `image` to write it out
//! as a PNG. Decoding locates and reads the symbol with `rqrr`, then hands the
//! payload to [`crate::uri::parse_uri`].

use std::io::Cursor;

use base64::Engine;
use image::{GrayImage, Luma};
use qrcode::QrCode;

use crate::uri::{self, OtpAuthUri, UriError};

/// Module size in pixels (each QR "module" becomes this many px wide).
const MODULE_PX: u32 = 8;
/// Quiet-zone border in modules.
const QUIET_ZONE: u32 = 4;

/// Upper bound on accepted image file size.
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
/// Upper bound on decoded width or height.
pub const MAX_DIMENSION: u32 = 8192;
/// Upper bound on decoded pixel count.
pub const MAX_PIXELS: u64 = 24_000_000;

#[derive(Debug, thiserror::Error)]
pub enum QrError {
    #[error("No QR code found in the image")]
    NoSymbolFound,
    #[error("A QR code was found but could not be read: {0}")]
    Unreadable(String),
    #[error("The image could not be read: {0}")]
    InvalidImage(String),
    #[error("The image is too large: {0}")]
    TooLarge(String),
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error("QR encode error: {0}")]
    Encode(String),
}

impl QrError {
    /// Decode failures are the user's cue to try another photo or crop;
    /// only encoding failures are server-side faults.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Encode(_))
    }
}

// Encode

/// Renders `text` as a greyscale PNG.
pub fn text_to_png(text: &str) -> Result<Vec<u8>, QrError> {
    let code = QrCode::new(text.as_bytes()).map_err(|e| QrError::Encode(e.to_string()))?;

    let matrix = code.to_colors();
    let width = code.width() as u32;
    let img_size = (width + QUIET_ZONE * 2) * MODULE_PX;

    let mut img = GrayImage::from_pixel(img_size, img_size, Luma([255u8]));

    for y in 0..width {
        for x in 0..width {
            if matrix[(y * width + x) as usize] != qrcode::Color::Dark {
                continue;
            }
            let px_x = (x + QUIET_ZONE) * MODULE_PX;
            let px_y = (y + QUIET_ZONE) * MODULE_PX;
            for dy in 0..MODULE_PX {
                for dx in 0..MODULE_PX {
                    img.put_pixel(px_x + dx, px_y + dy, Luma([0u8]));
                }
            }
        }
    }

    let mut buf = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut buf);
    image::ImageEncoder::write_image(
        encoder,
        img.as_raw(),
        img_size,
        img_size,
        image::ExtendedColorType::L8,
    )
    .map_err(|e| QrError::Encode(format!("PNG encode error: {e}")))?;

    Ok(buf)
}

/// PNG of the QR code carrying `entry`'s otpauth URI.
pub fn encode_png(entry: &OtpAuthUri) -> Result<Vec<u8>, QrError> {
    text_to_png(&uri::build_uri(entry))
}

/// Same as [`encode_png`], wrapped as a `data:image/png;base64,...` URI.
pub fn encode_data_uri(entry: &OtpAuthUri) -> Result<String, QrError> {
    let png = encode_png(entry)?;
    let b64 = base64::engine::general_purpose::STANDARD.encode(png);

    Ok(format!("data:image/png;base64,{b64}"))
}

// Decode

/// Decodes an encoded image file (PNG or JPEG).
pub fn decode_image(bytes: &[u8], max_bytes: usize) -> Result<OtpAuthUri, QrError> {
    if bytes.len() > max_bytes {
        return Err(QrError::TooLarge(format!(
            "{} bytes exceeds the {max_bytes} byte limit",
            bytes.len()
        )));
    }
    if bytes.is_empty() {
        return Err(QrError::InvalidImage("empty upload".into()));
    }

    // Header only: reject oversized images before any pixel buffer exists.
    let (width, height) = image_reader(bytes)?
        .into_dimensions()
        .map_err(image_error)?;
    check_dimensions(width, height)?;

    let mut reader = image_reader(bytes)?;
    let mut limits = image::Limits::default();
    limits.max_image_width = Some(MAX_DIMENSION);
    limits.max_image_height = Some(MAX_DIMENSION);
    limits.max_alloc = Some(MAX_PIXELS * 4);
    reader.limits(limits);

    let img = reader.decode().map_err(image_error)?;

    let luma = img.to_luma8();
    decode_luma(luma.width(), luma.height(), luma.as_raw())
}

fn image_reader(bytes: &[u8]) -> Result<image::ImageReader<Cursor<&[u8]>>, QrError> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| QrError::InvalidImage(e.to_string()))
}

fn image_error(err: image::ImageError) -> QrError {
    match err {
        image::ImageError::Limits(l) => QrError::TooLarge(l.to_string()),
        other => QrError::InvalidImage(other.to_string()),
    }
}

/// Decodes an RGBA pixel buffer, as read back from a browser canvas.
pub fn decode_rgba(width: u32, height: u32, pixels: &[u8]) -> Result<OtpAuthUri, QrError> {
    check_buffer(width, height, pixels.len(), 4)?;

    let luma: Vec<u8> = pixels
        .chunks_exact(4)
        .map(|p| {
            let weighted = 299 * p[0] as u32 + 587 * p[1] as u32 + 114 * p[2] as u32;
            (weighted / 1000) as u8
        })
        .collect();

    decode_luma(width, height, &luma)
}

/// Decodes a greyscale buffer, one byte per pixel in row-major order.
pub fn decode_luma(width: u32, height: u32, pixels: &[u8]) -> Result<OtpAuthUri, QrError> {
    check_buffer(width, height, pixels.len(), 1)?;

    let w = width as usize;
    let mut prepared =
        rqrr::PreparedImage::prepare_from_greyscale(w, height as usize, |x, y| pixels[y * w + x]);

    let grids = prepared.detect_grids();
    if grids.is_empty() {
        return Err(QrError::NoSymbolFound);
    }

    let mut last_error = None;
    for grid in &grids {
        match grid.decode() {
            Ok((_, content)) => return Ok(uri::parse_uri(&content)?),
            Err(e) => last_error = Some(format!("{e:?}")),
        }
    }

    Err(QrError::Unreadable(last_error.unwrap_or_default()))
}

fn check_dimensions(width: u32, height: u32) -> Result<(), QrError> {
    let pixels = width as u64 * height as u64;
    if pixels == 0 {
        return Err(QrError::InvalidImage("image has no pixels".into()));
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION || pixels > MAX_PIXELS {
        return Err(QrError::TooLarge(format!("{width}x{height} pixels")));
    }

    Ok(())
}

fn check_buffer(width: u32, height: u32, len: usize, channels: usize) -> Result<(), QrError> {
    check_dimensions(width, height)?;

    let pixels = width as u64 * height as u64;
    if len as u64 != pixels * channels as u64 {
        return Err(QrError::InvalidImage(format!(
            "expected {} bytes for {width}x{height}, got {len}",
            pixels * channels as u64
        )));
    }

    Ok(())
}
