use crate::backup::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::str::FromStr;
use tracing::debug;

/// Codec applied to the container payload, recorded in `compressionMethod`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    #[default]
    Zstd,
    None,
}

impl CompressionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMethod::Zstd => "zstd",
            CompressionMethod::None => "none",
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionMethod {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zstd" => Ok(CompressionMethod::Zstd),
            "none" | "raw" => Ok(CompressionMethod::None),
            other => Err(BackupError::UnsupportedCompression {
                method: other.to_string(),
            }),
        }
    }
}

/// zstd level used unless configured otherwise.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;
/// Upper bound on a decoded payload.
pub const DEFAULT_MAX_DECOMPRESSED_BYTES: u64 = 512 * 1024 * 1024;

/// Compression engine for backup payloads
pub struct CompressionEngine {
    compression_level: i32,
    max_decompressed_bytes: u64,
}

impl CompressionEngine {
    /// Level 3 keeps exports fast on the point-of-sale hardware
    pub fn new() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
        }
    }

    pub fn with_level(level: i32) -> Self {
        Self {
            compression_level: level.clamp(1, 22), // zstd supports levels 1-22
            ..Self::new()
        }
    }

    pub fn with_max_decompressed_bytes(mut self, limit: u64) -> Self {
        self.max_decompressed_bytes = limit;
        self
    }

    pub fn level(&self) -> i32 {
        self.compression_level
    }

    pub fn max_decompressed_bytes(&self) -> u64 {
        self.max_decompressed_bytes
    }

    /// Encode `text` with `method`
    pub fn compress(&self, text: &str, method: CompressionMethod) -> Result<Vec<u8>> {
        let compressed = match method {
            CompressionMethod::None => text.as_bytes().to_vec(),
            CompressionMethod::Zstd => {
                zstd::encode_all(std::io::Cursor::new(text.as_bytes()), self.compression_level)
                    .map_err(|e| BackupError::Compression {
                        message: format!("zstd compression failed: {e}"),
                    })?
            }
        };

        debug!(
            "Compressed payload with {}: original={}B, compressed={}B",
            method,
            text.len(),
            compressed.len()
        );

        Ok(compressed)
    }

    /// Decode bytes produced by [`CompressionEngine::compress`] with the same `method`
    /// Output beyond `max_decompressed_bytes` is refused rather than buffered.
    pub fn decompress(&self, data: &[u8], method: CompressionMethod) -> Result<String> {
        let limit = self.max_decompressed_bytes;
        let decompressed = match method {
            CompressionMethod::None => data.to_vec(),
            CompressionMethod::Zstd => {
                let zstd_error = |e: std::io::Error| BackupError::Compression {
                    message: format!("zstd decompression failed: {e}"),
                };
                let decoder = zstd::stream::read::Decoder::new(data).map_err(zstd_error)?;
                let mut out = Vec::new();
                decoder
                    .take(limit.saturating_add(1))
                    .read_to_end(&mut out)
                    .map_err(zstd_error)?;
                out
            }
        };

        if decompressed.len() as u64 > limit {
            return Err(BackupError::Compression {
                message: format!("decompressed payload exceeds the {limit}-byte limit"),
            });
        }

        String::from_utf8(decompressed).map_err(|e| BackupError::Compression {
            message: format!("decompressed payload is not valid UTF-8: {e}"),
        })
    }
}

impl Default for CompressionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zstd_roundtrip() {
        let engine = CompressionEngine::new();
        let text = r#"{"posDB":{"products":[{"id":1,"name":"Çay"}]}}"#.repeat(50);

        let compressed = engine.compress(&text, CompressionMethod::Zstd).unwrap();
        assert!(compressed.len() < text.len());

        let decompressed = engine
            .decompress(&compressed, CompressionMethod::Zstd)
            .unwrap();
        assert_eq!(decompressed, text);
    }

    #[test]
    fn test_empty_and_unicode_roundtrip() {
        let engine = CompressionEngine::new();
        for text in ["", "ğüşöç ĞÜŞİÖÇ", "emoji 🧾💳", "\u{0000}\u{FFFF}"] {
            for method in [CompressionMethod::Zstd, CompressionMethod::None] {
                let compressed = engine.compress(text, method).unwrap();
                assert_eq!(engine.decompress(&compressed, method).unwrap(), text);
            }
        }
    }

    #[test]
    fn test_garbage_input_is_an_error() {
        let engine = CompressionEngine::new();
        let result = engine.decompress(&[0xde, 0xad, 0xbe, 0xef], CompressionMethod::Zstd);
        assert!(matches!(result, Err(BackupError::Compression { .. })));

        let result = engine.decompress(&[0xff, 0xfe], CompressionMethod::None);
        assert!(result.is_err());
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("zstd".parse::<CompressionMethod>().unwrap(), CompressionMethod::Zstd);
        assert_eq!("NONE".parse::<CompressionMethod>().unwrap(), CompressionMethod::None);
        assert!(matches!(
            "lz-string".parse::<CompressionMethod>(),
            Err(BackupError::UnsupportedCompression { .. })
        ));
    }

    #[test]
    fn test_decompression_is_bounded() {
        let text = "0".repeat(64 * 1024);
        let engine = CompressionEngine::new();
        let compressed = engine.compress(&text, CompressionMethod::Zstd).unwrap();

        let bounded = CompressionEngine::new().with_max_decompressed_bytes(4096);
        let result = bounded.decompress(&compressed, CompressionMethod::Zstd);
        assert!(matches!(result, Err(BackupError::Compression { message }) if message.contains("4096-byte limit")));
        assert!(bounded
            .decompress(text.as_bytes(), CompressionMethod::None)
            .is_err());

        let exact = CompressionEngine::new().with_max_decompressed_bytes(text.len() as u64);
        assert_eq!(exact.decompress(&compressed, CompressionMethod::Zstd).unwrap(), text);
    }

    #[test]
    fn test_level_is_clamped() {
        assert_eq!(CompressionEngine::with_level(0).level(), 1);
        assert_eq!(CompressionEngine::with_level(40).level(), 22);
    }
}
