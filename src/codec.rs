//! Codec Adapter: the pixel-level library treated as a pure function,
//! `(bytes, options) -> (bytes, metadata) | error` (spec §1, §9 "PIL Image
//! as intermediate" redesign — no decoded-pixel hand-off crosses this
//! module's boundary).

use crate::error::{AppError, AppResult};
use crate::options::{ProcessingOptions, RotationAngle, TargetFormat};
use serde::Serialize;
use std::io::Cursor;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ImageMetadata {
    pub original_format: String,
    pub produced_format: String,
    pub width: u32,
    pub height: u32,
    pub byte_size: usize,
}

/// Decode `input`, run the fixed transform pipeline described by `options`,
/// re-encode, and return the produced bytes plus metadata. This is the
/// `producer` spec §4.1/§9 refers to; it never touches the Cache or
/// Registry itself.
pub fn convert(input: &[u8], options: &ProcessingOptions) -> AppResult<(Vec<u8>, ImageMetadata)> {
    options
        .validate()
        .map_err(|msg| AppError::new(crate::error::ErrorKind::InputInvalid, msg))?;

    let original_format = image::guess_format(input)
        .map_err(|e| AppError::codec_failed(format!("unrecognized image data: {e}")))?;

    let mut img = image::load_from_memory_with_format(input, original_format)
        .map_err(|e| AppError::codec_failed(format!("decode failed: {e}")))?;

    if let (Some(w), Some(h)) = (options.resize_width, options.resize_height) {
        let filter = image::imageops::FilterType::Lanczos3;
        img = if options.maintain_aspect_ratio {
            img.resize(w, h, filter)
        } else {
            img.resize_exact(w, h, filter)
        };
    } else if let Some(w) = options.resize_width {
        let h = ((img.height() as f64) * (w as f64) / (img.width().max(1) as f64)).round() as u32;
        img = img.resize(w, h.max(1), image::imageops::FilterType::Lanczos3);
    } else if let Some(h) = options.resize_height {
        let w = ((img.width() as f64) * (h as f64) / (img.height().max(1) as f64)).round() as u32;
        img = img.resize(w.max(1), h, image::imageops::FilterType::Lanczos3);
    }

    img = match options.rotation_angle {
        RotationAngle::Deg0 => img,
        RotationAngle::Deg90 => img.rotate90(),
        RotationAngle::Deg180 => img.rotate180(),
        RotationAngle::Deg270 => img.rotate270(),
    };

    if options.flip_horizontal {
        img = img.fliph();
    }
    if options.flip_vertical {
        img = img.flipv();
    }

    let produced_format = options
        .target_format
        .map(TargetFormat::as_image_format)
        .unwrap_or(original_format);

    let mut out = Vec::new();
    encode(&img, produced_format, options.quality, &mut out)?;

    let metadata = ImageMetadata {
        original_format: format_name(original_format).to_string(),
        produced_format: format_name(produced_format).to_string(),
        width: img.width(),
        height: img.height(),
        byte_size: out.len(),
    };

    Ok((out, metadata))
}

fn encode(
    img: &image::DynamicImage,
    format: image::ImageFormat,
    quality: u8,
    out: &mut Vec<u8>,
) -> AppResult<()> {
    let result = match format {
        image::ImageFormat::Jpeg => {
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(out, quality);
            encoder.encode_image(img)
        }
        _ => img.write_to(&mut Cursor::new(out), format),
    };
    result.map_err(|e| AppError::codec_failed(format!("encode failed: {e}")))
}

fn format_name(format: image::ImageFormat) -> &'static str {
    match format {
        image::ImageFormat::Png => "png",
        image::ImageFormat::Jpeg => "jpeg",
        image::ImageFormat::WebP => "webp",
        image::ImageFormat::Gif => "gif",
        image::ImageFormat::Bmp => "bmp",
        image::ImageFormat::Tiff => "tiff",
        image::ImageFormat::Ico => "ico",
        _ => "unknown",
    }
}

/// Decode just enough to validate & describe a Base64-decoded image,
/// without running the transform pipeline. Backs `/api/validate-base64`.
pub fn probe(input: &[u8]) -> AppResult<ImageMetadata> {
    let original_format = image::guess_format(input)
        .map_err(|e| AppError::codec_failed(format!("unrecognized image data: {e}")))?;
    let img = image::load_from_memory_with_format(input, original_format)
        .map_err(|e| AppError::codec_failed(format!("decode failed: {e}")))?;
    Ok(ImageMetadata {
        original_format: format_name(original_format).to_string(),
        produced_format: format_name(original_format).to_string(),
        width: img.width(),
        height: img.height(),
        byte_size: input.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png() -> Vec<u8> {
        let img = image::DynamicImage::new_rgb8(4, 4);
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn round_trip_png_is_lossless_in_dimensions() {
        let input = tiny_png();
        let options = ProcessingOptions::default();
        let (bytes, meta) = convert(&input, &options).unwrap();
        assert_eq!(meta.width, 4);
        assert_eq!(meta.height, 4);
        assert!(!bytes.is_empty());
    }

    #[test]
    fn resize_changes_reported_dimensions() {
        let input = tiny_png();
        let mut options = ProcessingOptions::default();
        options.resize_width = Some(8);
        options.resize_height = Some(8);
        options.maintain_aspect_ratio = false;
        let (_, meta) = convert(&input, &options).unwrap();
        assert_eq!((meta.width, meta.height), (8, 8));
    }

    #[test]
    fn corrupt_bytes_yield_codec_failed() {
        let err = convert(b"not an image", &ProcessingOptions::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CodecFailed);
    }

    #[test]
    fn format_conversion_changes_produced_format() {
        let input = tiny_png();
        let mut options = ProcessingOptions::default();
        options.target_format = Some(TargetFormat::Bmp);
        let (_, meta) = convert(&input, &options).unwrap();
        assert_eq!(meta.produced_format, "bmp");
        assert_eq!(meta.original_format, "png");
    }
}
