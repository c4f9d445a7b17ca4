//! Raw binary blob format written by the point renderer.
//!
//! Layout (little-endian): `u32 width, u32 height, u32 channels,
//! u32 bytes_per_channel, u32 0`, followed by `height * width * channels`
//! interleaved samples.

use crate::error::{DataError, Result};
use crate::types::ImageArray;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use half::f16;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, error};

pub const BLOB_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub bytes_per_channel: u32,
}

impl BlobHeader {
    /// Parses and validates the five header words.
    pub fn parse(bytes: &[u8], path: &Path) -> Result<Self> {
        if bytes.len() < BLOB_HEADER_LEN {
            return Err(DataError::BlobHeader {
                path: path.to_path_buf(),
                reason: format!("file is {} bytes, header needs {}", bytes.len(), BLOB_HEADER_LEN),
            });
        }
        let mut cursor = Cursor::new(bytes);
        let mut words = [0u32; 5];
        for word in words.iter_mut() {
            *word = cursor
                .read_u32::<LittleEndian>()
                .map_err(|e| DataError::io(path, e))?;
        }
        let [width, height, channels, bytes_per_channel, delimiter] = words;

        let reason = if width == 0 {
            Some("width is zero")
        } else if height == 0 {
            Some("height is zero")
        } else if channels == 0 {
            Some("channel count is zero")
        } else if bytes_per_channel == 0 {
            Some("bytes_per_channel is zero")
        } else if delimiter != 0 {
            Some("header delimiter is not zero")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(DataError::BlobHeader {
                path: path.to_path_buf(),
                reason: reason.to_string(),
            });
        }

        Ok(Self {
            width,
            height,
            channels,
            bytes_per_channel,
        })
    }

    pub fn sample_count(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

/// Reads a blob file into an `[H, W, C]` array.
#[tracing::instrument(skip_all, fields(path = %path.display()))]
pub fn read_blob(path: &Path) -> Result<ImageArray> {
    let bytes = std::fs::read(path).map_err(|e| DataError::io(path, e))?;
    decode_blob(&bytes, path)
}

/// Decodes blob bytes. `path` is only used for diagnostics.
///
/// 8-bit payloads are rescaled to `[0, 1]`; half and single precision
/// payloads are returned as stored. A payload whose length disagrees with the
/// header is logged and zero-padded or truncated to the header's size.
pub fn decode_blob(bytes: &[u8], path: &Path) -> Result<ImageArray> {
    let header = BlobHeader::parse(bytes, path)?;
    let payload = &bytes[BLOB_HEADER_LEN..];
    let bpc = header.bytes_per_channel as usize;

    let mut samples: Vec<f32> = match header.bytes_per_channel {
        1 => payload.iter().map(|&v| v as f32 / 255.0).collect(),
        2 => {
            let mut raw = vec![0u16; payload.len() / bpc];
            LittleEndian::read_u16_into(&payload[..raw.len() * bpc], &mut raw);
            raw.into_iter()
                .map(|bits| f16::from_bits(bits).to_f32())
                .collect()
        }
        4 => {
            let mut raw = vec![0f32; payload.len() / bpc];
            LittleEndian::read_f32_into(&payload[..raw.len() * bpc], &mut raw);
            raw
        }
        other => {
            return Err(DataError::BlobPrecision {
                path: path.to_path_buf(),
                bytes_per_channel: other,
            });
        }
    };

    let expected = header.sample_count();
    if samples.len() != expected {
        error!(
            "Blob payload of {} holds {} samples, header declares {}x{}x{} = {}",
            path.display(),
            samples.len(),
            header.height,
            header.width,
            header.channels,
            expected
        );
        samples.resize(expected, 0.0);
    }

    debug!(
        "Decoded blob {}x{}x{} ({} bytes per channel)",
        header.width, header.height, header.channels, header.bytes_per_channel
    );
    ImageArray::new(
        header.height as usize,
        header.width as usize,
        header.channels as usize,
        samples,
    )
}

/// Encodes an array into blob bytes with the given sample precision.
pub fn encode_blob(array: &ImageArray, bytes_per_channel: u32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(BLOB_HEADER_LEN + array.data().len() * bytes_per_channel as usize);
    let header = [
        array.width() as u32,
        array.height() as u32,
        array.channels() as u32,
        bytes_per_channel,
        0,
    ];
    for word in header {
        out.write_u32::<LittleEndian>(word)
            .map_err(|e| DataError::io("<memory>", e))?;
    }

    match bytes_per_channel {
        1 => out.extend(
            array
                .data()
                .iter()
                .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8),
        ),
        2 => {
            for v in array.data() {
                out.write_u16::<LittleEndian>(f16::from_f32(*v).to_bits())
                    .map_err(|e| DataError::io("<memory>", e))?;
            }
        }
        4 => {
            for v in array.data() {
                out.write_f32::<LittleEndian>(*v)
                    .map_err(|e| DataError::io("<memory>", e))?;
            }
        }
        other => {
            return Err(DataError::BlobPrecision {
                path: "<memory>".into(),
                bytes_per_channel: other,
            });
        }
    }
    Ok(out)
}

pub fn write_blob(path: &Path, array: &ImageArray, bytes_per_channel: u32) -> Result<()> {
    let bytes = encode_blob(array, bytes_per_channel)?;
    std::fs::write(path, bytes).map_err(|e| DataError::io(path, e))
}
