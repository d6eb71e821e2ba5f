use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageOutputFormat};
use tracing::debug;

use super::ExtractionError;

/// Smallest byte count a real PNG/JPEG can have.
const MIN_IMAGE_BYTES: usize = 67;

/// Images whose longest edge is below this are upscaled before OCR.
const MIN_OCR_EDGE_PX: u32 = 1000;
const MAX_UPSCALE: f32 = 3.0;
const MAX_OCR_EDGE_PX: u32 = 4096;

/// RMS contrast below which the histogram is stretched.
const LOW_CONTRAST: f32 = 40.0;

/// Decode, orient, grayscale and resize an uploaded image, returning PNG
/// bytes ready for the OCR engine. Decode failure means a corrupt upload.
pub fn prepare_for_ocr(bytes: &[u8]) -> Result<Vec<u8>, ExtractionError> {
    validate_image_bytes(bytes)?;

    let decoded = image::load_from_memory(bytes)
        .map_err(|e| ExtractionError::CorruptImage(e.to_string()))?;
    let oriented = apply_orientation(decoded, read_exif_orientation(bytes));

    let mut gray = oriented.to_luma8();
    if gray.width() == 0 || gray.height() == 0 {
        return Err(ExtractionError::CorruptImage("image has no pixels".into()));
    }

    let (w, h) = ocr_dimensions(gray.width(), gray.height());
    if (w, h) != gray.dimensions() {
        debug!(from_w = gray.width(), from_h = gray.height(), to_w = w, to_h = h, "Resizing for OCR");
        gray = imageops::resize(&gray, w, h, FilterType::CatmullRom);
    }

    let contrast = compute_contrast_score(&gray);
    if contrast < LOW_CONTRAST {
        stretch_contrast(&mut gray);
    }

    encode_png(&DynamicImage::ImageLuma8(gray))
}

pub fn validate_image_bytes(bytes: &[u8]) -> Result<(), ExtractionError> {
    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(ExtractionError::CorruptImage(
            "image data too small to be valid".into(),
        ));
    }
    Ok(())
}

/// Target size: small scans are enlarged (at most 3×), huge ones shrunk,
/// aspect ratio kept.
pub fn ocr_dimensions(width: u32, height: u32) -> (u32, u32) {
    let longest = width.max(height).max(1) as f32;
    let scale = if longest < MIN_OCR_EDGE_PX as f32 {
        (MIN_OCR_EDGE_PX as f32 / longest).min(MAX_UPSCALE)
    } else if longest > MAX_OCR_EDGE_PX as f32 {
        MAX_OCR_EDGE_PX as f32 / longest
    } else {
        1.0
    };
    let fit = |v: u32| ((v as f32 * scale).round() as u32).clamp(1, MAX_OCR_EDGE_PX);
    (fit(width), fit(height))
}

/// EXIF orientation tag, 1 (normal) when absent.
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(exif) => exif
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|f| f.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    }
}

pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// RMS contrast (standard deviation of intensities), 0 for empty images.
pub fn compute_contrast_score(img: &GrayImage) -> f32 {
    let n = (img.width() as u64) * (img.height() as u64);
    if n == 0 {
        return 0.0;
    }
    let (sum, sum_sq) = img.pixels().fold((0f64, 0f64), |(s, sq), p| {
        let v = p.0[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n as f64;
    ((sum_sq / n as f64) - mean * mean).max(0.0).sqrt() as f32
}

/// Linear stretch of the intensity range to 0..=255. Flat images are left alone.
fn stretch_contrast(img: &mut GrayImage) {
    let (min, max) = img
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    if max <= min {
        return;
    }
    let range = (max - min) as f32;
    for p in img.pixels_mut() {
        p.0[0] = (((p.0[0] - min) as f32 / range) * 255.0).round() as u8;
    }
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, ExtractionError> {
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}
