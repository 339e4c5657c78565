use super::{
    BackupError, BackupMetadata, DataFormat, MetadataOverrides, Result, DEFAULT_DESCRIPTION,
    FORMAT_VERSION,
};
use crate::checksum;
use crate::compression::{CompressionEngine, CompressionMethod};
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

/// Size of the little-endian metadata length prefix.
pub const HEADER_LENGTH_BYTES: usize = 4;

/// Builds `.roxoe` containers:
///
/// ```text
/// | metadata length: u32 LE | metadata JSON | compressed payload |
/// ```
pub struct BackupSerializer {
    compression: CompressionEngine,
    app_version: String,
}

impl BackupSerializer {
    pub fn new(app_version: impl Into<String>) -> Self {
        Self {
            compression: CompressionEngine::new(),
            app_version: app_version.into(),
        }
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression = CompressionEngine::with_level(level);
        self
    }

    /// Serialize `data` into container bytes.
    pub fn serialize<T: Serialize + ?Sized>(
        &self,
        data: &T,
        overrides: MetadataOverrides,
    ) -> Result<Vec<u8>> {
        self.serialize_with_metadata(data, overrides)
            .map(|(_, bytes)| bytes)
    }

    /// Like [`BackupSerializer::serialize`], also returning the metadata
    /// written into the header.
    pub fn serialize_with_metadata<T: Serialize + ?Sized>(
        &self,
        data: &T,
        overrides: MetadataOverrides,
    ) -> Result<(BackupMetadata, Vec<u8>)> {
        let json = serde_json::to_string(data)?;

        let method = resolve_method(&overrides)?;
        let payload = self.compression.compress(&json, method)?;
        let digest = checksum::calculate(&payload);

        let metadata = self.build_metadata(overrides, method, digest);
        let container = encode_container(&metadata, &payload)?;

        debug!(
            "Serialized backup: json={}B, payload={}B, container={}B",
            json.len(),
            payload.len(),
            container.len()
        );

        Ok((metadata, container))
    }

    fn build_metadata(
        &self,
        overrides: MetadataOverrides,
        method: CompressionMethod,
        checksum: String,
    ) -> BackupMetadata {
        let data_format = match method {
            CompressionMethod::None => DataFormat::Raw,
            CompressionMethod::Zstd => DataFormat::Compressed,
        };

        BackupMetadata {
            version: overrides
                .version
                .unwrap_or_else(|| FORMAT_VERSION.to_string()),
            app_version: overrides
                .app_version
                .unwrap_or_else(|| self.app_version.clone()),
            created_at: overrides.created_at.unwrap_or_else(Utc::now),
            description: overrides
                .description
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            databases: overrides.databases.unwrap_or_default(),
            record_counts: overrides.record_counts.unwrap_or_default(),
            backup_type: overrides.backup_type.unwrap_or_default(),
            data_format,
            compression_method: method.to_string(),
            checksum: Some(checksum),
        }
    }
}

/// Raw data format always means an uncompressed payload.
fn resolve_method(overrides: &MetadataOverrides) -> Result<CompressionMethod> {
    if overrides.data_format == Some(DataFormat::Raw) {
        return Ok(CompressionMethod::None);
    }
    match overrides.compression_method.as_deref() {
        Some(method) => method.parse(),
        None => Ok(CompressionMethod::default()),
    }
}

/// Prefix `payload` with the length-delimited metadata header.
pub fn encode_container(metadata: &BackupMetadata, payload: &[u8]) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(metadata)?;
    let header_len = u32::try_from(header.len()).map_err(|_| BackupError::FormatCorruption {
        message: format!("metadata header of {} bytes exceeds 4 GiB", header.len()),
    })?;

    let mut container = Vec::with_capacity(HEADER_LENGTH_BYTES + header.len() + payload.len());
    container.extend_from_slice(&header_len.to_le_bytes());
    container.extend_from_slice(&header);
    container.extend_from_slice(payload);
    Ok(container)
}
