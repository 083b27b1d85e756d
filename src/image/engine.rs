//! The variant conversion engine.
//!
//! Produces a bounded set of (size, format) derivatives from one source
//! image. Conversion is an explicit ordered strategy chain — the resolved
//! format first, then each cheaper format, then the original bytes as-is —
//! and never errors to the caller: the last step always succeeds, with
//! `fallback` carried as data.

use std::io::Cursor;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat as CodecFormat};
use metrics::counter;
use thiserror::Error;
use tracing::debug;

use crate::util::bytes::format_bytes;

use super::{OutputFormat, Variant};

/// Payloads shorter than this cannot be an image.
const MIN_BASE64_LEN: usize = 10;
/// Prefix length of the truncated placeholder stand-in.
const PLACEHOLDER_BASE64_LEN: usize = 200;
/// 1×1 transparent pixel served when a placeholder has no source at all.
const PLACEHOLDER_FALLBACK_PIXEL: &str =
    "data:image/gif;base64,R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7";
/// Content type forced when the cascade bottoms out at original bytes.
const SAFE_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Error)]
pub enum ImageIngestError {
    #[error("image payload is empty or too short to be an image")]
    InvalidPayload,
    #[error("image payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A decoded upstream payload, ready for variant processing.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub bytes: Bytes,
    pub content_type: String,
}

/// One derived rendition. `delivered` may sit lower in the cascade than
/// `requested`; when it does, `fallback` is set and `fallback_depth` records
/// how far the chain ran.
#[derive(Debug, Clone)]
pub struct VariantImage {
    pub bytes: Bytes,
    pub content_type: String,
    pub variant: Variant,
    pub requested: OutputFormat,
    pub delivered: OutputFormat,
    pub fallback: bool,
    pub fallback_depth: u8,
    pub original_size: usize,
    pub optimized_size: usize,
    pub compression_ratio: f64,
}

#[derive(Debug, Default)]
pub struct ImageVariantEngine;

impl ImageVariantEngine {
    pub fn new() -> Self {
        Self
    }

    /// Validate and decode an upstream base64 payload, sniffing the content
    /// type from the filename extension (jpeg by default).
    pub fn decode_base64_image(
        &self,
        base64_data: &str,
        filename: &str,
    ) -> Result<SourceImage, ImageIngestError> {
        if base64_data.len() < MIN_BASE64_LEN {
            return Err(ImageIngestError::InvalidPayload);
        }

        let compact: String = base64_data
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let bytes = BASE64.decode(compact.as_bytes())?;

        match imagesize::blob_size(&bytes) {
            Ok(dimensions) => debug!(
                target: "vetrina::image",
                filename,
                width = dimensions.width,
                height = dimensions.height,
                size = %format_bytes(bytes.len() as u64),
                "decoded source image"
            ),
            Err(err) => debug!(
                target: "vetrina::image",
                filename,
                error = %err,
                "source dimensions could not be probed"
            ),
        }

        let content_type = mime_guess::from_path(filename)
            .first()
            .filter(|mime| mime.type_() == mime_guess::mime::IMAGE)
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| SAFE_CONTENT_TYPE.to_string());

        Ok(SourceImage {
            bytes: Bytes::from(bytes),
            content_type,
        })
    }

    /// Produce the requested rendition. Never fails: the cascade ends at
    /// original-bytes-as-is with the content type forced to a safe default.
    pub fn process(&self, source: &[u8], variant: Variant, requested: OutputFormat) -> VariantImage {
        if variant == Variant::Placeholder {
            return self.placeholder_variant(source, requested);
        }

        let original_size = source.len();
        let prepared = match image::load_from_memory(source) {
            Ok(decoded) => Some(prepare(decoded, variant)),
            Err(err) => {
                debug!(
                    target: "vetrina::image",
                    error = %err,
                    "source failed to decode; serving original bytes"
                );
                None
            }
        };

        if let Some(img) = &prepared {
            for (depth, format) in requested.cascade().iter().enumerate() {
                match encode(img, *format, variant.quality()) {
                    Ok(encoded) => {
                        let fallback = depth > 0;
                        if fallback {
                            counter!("vetrina_image_fallback_total").increment(1);
                        }
                        return finish(
                            Bytes::from(encoded),
                            format.content_type().to_string(),
                            variant,
                            requested,
                            *format,
                            fallback,
                            depth as u8,
                            original_size,
                        );
                    }
                    Err(reason) => {
                        debug!(
                            target: "vetrina::image",
                            format = %format,
                            reason = %reason,
                            "conversion step failed; cascading"
                        );
                    }
                }
            }
        }

        counter!("vetrina_image_fallback_total").increment(1);
        let depth = requested.cascade().len() as u8;
        finish(
            Bytes::copy_from_slice(source),
            SAFE_CONTENT_TYPE.to_string(),
            variant,
            requested,
            OutputFormat::Jpeg,
            true,
            depth,
            original_size,
        )
    }

    /// Truncated low-byte-count stand-in served as a data URI. Not a real
    /// blur: the first bytes of the source, or a 1×1 pixel when there is no
    /// source.
    pub fn placeholder(&self, base64_data: &str) -> String {
        if base64_data.is_empty() {
            return PLACEHOLDER_FALLBACK_PIXEL.to_string();
        }
        let prefix: String = base64_data.chars().take(PLACEHOLDER_BASE64_LEN).collect();
        format!("data:image/jpeg;base64,{prefix}")
    }

    fn placeholder_variant(&self, source: &[u8], requested: OutputFormat) -> VariantImage {
        let encoded = if source.is_empty() {
            String::new()
        } else {
            BASE64.encode(source)
        };
        let data_uri = self.placeholder(&encoded);
        let original_size = source.len();
        finish(
            Bytes::from(data_uri),
            // Served as a data-URI string, not image bytes.
            "text/plain".to_string(),
            Variant::Placeholder,
            requested,
            requested,
            false,
            0,
            original_size,
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn finish(
    bytes: Bytes,
    content_type: String,
    variant: Variant,
    requested: OutputFormat,
    delivered: OutputFormat,
    fallback: bool,
    fallback_depth: u8,
    original_size: usize,
) -> VariantImage {
    let optimized_size = bytes.len();
    let compression_ratio = if original_size > 0 {
        optimized_size as f64 / original_size as f64
    } else {
        1.0
    };
    VariantImage {
        bytes,
        content_type,
        variant,
        requested,
        delivered,
        fallback,
        fallback_depth,
        original_size,
        optimized_size,
        compression_ratio,
    }
}

/// Resize for the variant's bounding box, preserving aspect ratio.
fn prepare(img: DynamicImage, variant: Variant) -> DynamicImage {
    match variant.bounds() {
        Some((width, height)) => {
            match target_dimensions(img.width(), img.height(), Some(width), Some(height)) {
                Some((tw, th)) => img.resize_exact(tw, th, FilterType::Lanczos3),
                None => img,
            }
        }
        None => img,
    }
}

/// Compute target dimensions: a single bound derives the other side from the
/// source aspect ratio; two bounds fit the image fully inside the box.
fn target_dimensions(
    source_width: u32,
    source_height: u32,
    width: Option<u32>,
    height: Option<u32>,
) -> Option<(u32, u32)> {
    if source_width == 0 || source_height == 0 {
        return None;
    }
    let aspect = source_width as f64 / source_height as f64;

    let (tw, th) = match (width, height) {
        (Some(w), Some(h)) => {
            let requested = w as f64 / h as f64;
            if requested > aspect {
                // Box is wider than the image; height binds.
                (h as f64 * aspect, h as f64)
            } else {
                (w as f64, w as f64 / aspect)
            }
        }
        (Some(w), None) => (w as f64, w as f64 / aspect),
        (None, Some(h)) => (h as f64 * aspect, h as f64),
        (None, None) => return None,
    };

    Some(((tw.round() as u32).max(1), (th.round() as u32).max(1)))
}

fn encode(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>, String> {
    match format {
        OutputFormat::Avif => {
            // The AVIF encoder is not compiled into this build; the cascade
            // absorbs the miss.
            Err("avif encoder not available".to_string())
        }
        OutputFormat::Webp => {
            let mut cursor = Cursor::new(Vec::new());
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut cursor, CodecFormat::WebP)
                .map_err(|err| err.to_string())?;
            Ok(cursor.into_inner())
        }
        OutputFormat::Jpeg => {
            let mut cursor = Cursor::new(Vec::new());
            let mut encoder = JpegEncoder::new_with_quality(&mut cursor, quality);
            encoder
                .encode_image(&img.to_rgb8())
                .map_err(|err| err.to_string())?;
            Ok(cursor.into_inner())
        }
    }
}
