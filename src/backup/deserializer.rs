use super::serializer::HEADER_LENGTH_BYTES;
use super::{BackupError, BackupMetadata, Result, Snapshot, SUPPORTED_MAJOR_VERSION};
use crate::checksum;
use crate::compression::{CompressionEngine, CompressionMethod};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

/// Outcome of reading a container. Never an error: failures are reported
/// through `is_valid` and `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeserializedBackup {
    /// Present whenever the header could be decoded.
    pub metadata: Option<BackupMetadata>,
    pub data: Option<Snapshot>,
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct BackupDeserializer {
    compression: CompressionEngine,
}

impl BackupDeserializer {
    pub fn new() -> Self {
        Self {
            compression: CompressionEngine::new(),
        }
    }

    /// Refuse payloads that decode to more than `limit` bytes.
    pub fn with_max_payload_bytes(mut self, limit: u64) -> Self {
        self.compression = self.compression.with_max_decompressed_bytes(limit);
        self
    }

    /// Parse and validate a container.
    pub fn deserialize(&self, bytes: &[u8]) -> DeserializedBackup {
        let (metadata, payload) = match split_container(bytes) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Rejected backup container: {}", e);
                return DeserializedBackup {
                    metadata: None,
                    data: None,
                    is_valid: false,
                    error: Some(e.to_string()),
                };
            }
        };

        match self.decode_payload::<Snapshot>(&metadata, payload) {
            Ok(data) => DeserializedBackup {
                metadata: Some(metadata),
                data: Some(data),
                is_valid: true,
                error: None,
            },
            Err(e) => {
                warn!("Rejected backup payload: {}", e);
                DeserializedBackup {
                    metadata: Some(metadata),
                    data: None,
                    is_valid: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Strict variant returning typed errors and any deserializable payload.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<(BackupMetadata, T)> {
        let (metadata, payload) = split_container(bytes)?;
        let data = self.decode_payload(&metadata, payload)?;
        Ok((metadata, data))
    }

    /// Decode the header only; the payload is not checked.
    pub fn read_metadata(&self, bytes: &[u8]) -> Result<BackupMetadata> {
        split_container(bytes).map(|(metadata, _)| metadata)
    }

    fn decode_payload<T: DeserializeOwned>(
        &self,
        metadata: &BackupMetadata,
        payload: &[u8],
    ) -> Result<T> {
        check_version(&metadata.version)?;

        if let Some(expected) = metadata.checksum.as_deref() {
            let actual = checksum::calculate(payload);
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(BackupError::IntegrityMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
            debug!("Payload checksum verified");
        } else {
            debug!("Backup carries no checksum; skipping integrity verification");
        }

        let method: CompressionMethod = metadata.compression_method.parse()?;
        let json = self.compression.decompress(payload, method)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl Default for BackupDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a container into its decoded header and the raw payload.
pub fn split_container(bytes: &[u8]) -> Result<(BackupMetadata, &[u8])> {
    if bytes.len() < HEADER_LENGTH_BYTES {
        return Err(BackupError::FormatCorruption {
            message: format!(
                "container is {} bytes, shorter than its {}-byte length prefix",
                bytes.len(),
                HEADER_LENGTH_BYTES
            ),
        });
    }

    let mut prefix = [0u8; HEADER_LENGTH_BYTES];
    prefix.copy_from_slice(&bytes[..HEADER_LENGTH_BYTES]);
    let declared = u32::from_le_bytes(prefix) as usize;

    let header_end = HEADER_LENGTH_BYTES
        .checked_add(declared)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| BackupError::FormatCorruption {
            message: format!(
                "declared metadata length {} exceeds the {} bytes available",
                declared,
                bytes.len() - HEADER_LENGTH_BYTES
            ),
        })?;

    let header = std::str::from_utf8(&bytes[HEADER_LENGTH_BYTES..header_end]).map_err(|e| {
        BackupError::FormatCorruption {
            message: format!("metadata header is not valid UTF-8: {e}"),
        }
    })?;

    let metadata: BackupMetadata =
        serde_json::from_str(header).map_err(|e| BackupError::FormatCorruption {
            message: format!("metadata header is not valid JSON: {e}"),
        })?;

    Ok((metadata, &bytes[header_end..]))
}

fn check_version(version: &str) -> Result<()> {
    let major = version
        .split('.')
        .next()
        .and_then(|major| major.trim().parse::<u32>().ok());

    match major {
        Some(SUPPORTED_MAJOR_VERSION) => Ok(()),
        _ => Err(BackupError::UnsupportedVersion {
            version: version.to_string(),
        }),
    }
}
