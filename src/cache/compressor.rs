//! Compression pipeline for persisted payloads.
//!
//! Decodable images are re-encoded as JPEG at the configured quality (and
//! optionally downscaled). Anything else is treated as opaque bytes and run
//! through zstd. Whichever representation is smaller than the input wins;
//! otherwise the payload is kept as received.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::ImageReader;
use thiserror::Error;

use crate::cache::entry::{EntryMetadata, NaturalSize, StoredFormat};
use crate::config::CompressionConfig;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[source] std::io::Error),

    #[error("Image format probe failed: {0}")]
    FormatProbe(#[source] std::io::Error),

    #[error("Image re-encode failed: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("Payload is empty")]
    NoData,
}

/// Output of [`Compressor::compress`].
#[derive(Debug, Clone)]
pub struct Compressed {
    pub bytes: Vec<u8>,
    pub metadata: EntryMetadata,
}

/// Stateless re-encoder; safe to share without synchronization.
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Encode `raw` for the persistent tier at `quality` in (0, 1].
    pub fn compress(&self, raw: &[u8], quality: f32) -> Result<Compressed, CompressionError> {
        if raw.is_empty() {
            return Err(CompressionError::NoData);
        }

        let reader = ImageReader::new(Cursor::new(raw))
            .with_guessed_format()
            .map_err(CompressionError::FormatProbe)?;
        match reader.format() {
            Some(format) => {
                let source_format = format.extensions_str().first().map(|s| s.to_string());
                let image = reader.decode()?;
                self.reencode_image(raw, image, quality, source_format)
            }
            None => self.compress_opaque(raw),
        }
    }

    /// Express a raw payload as stored, without any re-encoding.
    ///
    /// Used when [`compress`](Self::compress) fails.
    pub fn passthrough(&self, raw: &[u8]) -> Compressed {
        Compressed {
            bytes: raw.to_vec(),
            metadata: EntryMetadata {
                dimensions: probe_dimensions(raw),
                original_size_bytes: raw.len() as u64,
                format: StoredFormat::Passthrough,
                source_format: None,
                quality: 1.0,
            },
        }
    }

    /// Undo the storage encoding. JPEG and passthrough payloads are returned as is.
    pub fn decode_stored(
        &self,
        data: &[u8],
        format: StoredFormat,
    ) -> Result<Vec<u8>, CompressionError> {
        match format {
            StoredFormat::Zstd => zstd::decode_all(data).map_err(CompressionError::ZstdError),
            StoredFormat::Jpeg | StoredFormat::Passthrough => Ok(data.to_vec()),
        }
    }

    fn reencode_image(
        &self,
        raw: &[u8],
        image: image::DynamicImage,
        quality: f32,
        source_format: Option<String>,
    ) -> Result<Compressed, CompressionError> {
        let (image, resized) = match self.config.max_dimension {
            Some(max) if image.width().max(image.height()) > max => {
                (image.resize(max, max, FilterType::Triangle), true)
            }
            _ => (image, false),
        };

        // JPEG carries no alpha channel.
        let rgb = image.to_rgb8();
        let dimensions = NaturalSize {
            width: rgb.width(),
            height: rgb.height(),
        };

        let mut encoded = Vec::new();
        JpegEncoder::new_with_quality(&mut encoded, jpeg_quality(quality)).encode_image(&rgb)?;

        if !resized && encoded.len() >= raw.len() {
            return Ok(Compressed {
                bytes: raw.to_vec(),
                metadata: EntryMetadata {
                    dimensions: Some(dimensions),
                    original_size_bytes: raw.len() as u64,
                    format: StoredFormat::Passthrough,
                    source_format,
                    quality: 1.0,
                },
            });
        }

        Ok(Compressed {
            bytes: encoded,
            metadata: EntryMetadata {
                dimensions: Some(dimensions),
                original_size_bytes: raw.len() as u64,
                format: StoredFormat::Jpeg,
                source_format,
                quality,
            },
        })
    }

    fn compress_opaque(&self, raw: &[u8]) -> Result<Compressed, CompressionError> {
        let compressed =
            zstd::encode_all(raw, self.config.zstd_level).map_err(CompressionError::ZstdError)?;
        if compressed.len() >= raw.len() {
            return Ok(self.passthrough(raw));
        }
        Ok(Compressed {
            bytes: compressed,
            metadata: EntryMetadata {
                dimensions: None,
                original_size_bytes: raw.len() as u64,
                format: StoredFormat::Zstd,
                source_format: None,
                quality: 1.0,
            },
        })
    }
}

/// Read image dimensions from the payload header without a full decode.
pub fn probe_dimensions(raw: &[u8]) -> Option<NaturalSize> {
    let (width, height) = ImageReader::new(Cursor::new(raw))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()?;
    Some(NaturalSize { width, height })
}

/// Map a quality in (0, 1] onto the JPEG 1..=100 scale.
pub fn jpeg_quality(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}
