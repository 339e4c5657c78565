use super::{split_container, BackupDeserializer, BackupMetadata, Snapshot};
use crate::checksum;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountMismatch {
    pub store: String,
    pub declared: u64,
    pub actual: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub verified_at: DateTime<Utc>,
    pub metadata: Option<BackupMetadata>,
    pub file_structure_valid: bool,
    /// `None` when the container carries no checksum.
    pub checksum_verified: Option<bool>,
    pub payload_decoded: bool,
    pub actual_counts: BTreeMap<String, u64>,
    pub count_mismatches: Vec<CountMismatch>,
    pub issues_found: Vec<String>,
}

impl VerificationReport {
    pub fn is_valid(&self) -> bool {
        self.file_structure_valid
            && self.checksum_verified != Some(false)
            && self.payload_decoded
            && self.count_mismatches.is_empty()
    }
}

/// Checks a container end to end without touching any database.
#[derive(Default)]
pub struct BackupVerifier {
    deserializer: BackupDeserializer,
}

impl BackupVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_payload_bytes(self, limit: u64) -> Self {
        Self {
            deserializer: self.deserializer.with_max_payload_bytes(limit),
        }
    }

    pub fn verify_bytes(&self, bytes: &[u8]) -> VerificationReport {
        let mut report = VerificationReport {
            verified_at: Utc::now(),
            metadata: None,
            file_structure_valid: false,
            checksum_verified: None,
            payload_decoded: false,
            actual_counts: BTreeMap::new(),
            count_mismatches: Vec::new(),
            issues_found: Vec::new(),
        };

        let (metadata, payload) = match split_container(bytes) {
            Ok(parts) => parts,
            Err(e) => {
                report.issues_found.push(e.to_string());
                return finish(report);
            }
        };
        report.file_structure_valid = true;

        if let Some(expected) = metadata.checksum.as_deref() {
            let verified = checksum::verify(payload, expected);
            if !verified {
                report
                    .issues_found
                    .push(format!("payload checksum does not match {expected}"));
            }
            report.checksum_verified = Some(verified);
        } else {
            report
                .issues_found
                .push("backup carries no checksum".to_string());
        }

        report.metadata = Some(metadata.clone());
        if report.checksum_verified == Some(false) {
            return finish(report);
        }

        let deserialized = self.deserializer.deserialize(bytes);
        let Some(data) = deserialized.data else {
            report
                .issues_found
                .push(deserialized.error.unwrap_or_else(|| "payload could not be decoded".to_string()));
            return finish(report);
        };
        report.payload_decoded = true;

        report.actual_counts = actual_counts(&data);
        report.count_mismatches = compare_counts(&metadata.record_counts, &report.actual_counts);
        for mismatch in &report.count_mismatches {
            report.issues_found.push(format!(
                "{} declares {} records but holds {}",
                mismatch.store, mismatch.declared, mismatch.actual
            ));
        }

        finish(report)
    }
}

fn finish(report: VerificationReport) -> VerificationReport {
    if report.is_valid() {
        info!(
            "Backup verification passed: {} stores checked",
            report.actual_counts.len()
        );
    } else {
        error!("Backup verification failed: {:?}", report.issues_found);
    }
    report
}

/// Record counts keyed `"<database>.<store>"`.
pub fn actual_counts(data: &Snapshot) -> BTreeMap<String, u64> {
    data.iter()
        .flat_map(|(database, stores)| {
            stores
                .iter()
                .map(move |(store, records)| (format!("{database}.{store}"), records.len() as u64))
        })
        .collect()
}

/// Declared counts may use a bare store name; those are matched against
/// every database's store of that name.
fn compare_counts(
    declared: &BTreeMap<String, u64>,
    actual: &BTreeMap<String, u64>,
) -> Vec<CountMismatch> {
    declared
        .iter()
        .filter_map(|(store, declared)| {
            let actual_count = if store.contains('.') {
                actual.get(store).copied().unwrap_or(0)
            } else {
                actual
                    .iter()
                    .filter(|(key, _)| key.rsplit('.').next() == Some(store.as_str()))
                    .map(|(_, count)| count)
                    .sum()
            };
            debug!("{}: declared {}, found {}", store, declared, actual_count);

            (actual_count != *declared).then(|| CountMismatch {
                store: store.clone(),
                declared: *declared,
                actual: actual_count,
            })
        })
        .collect()
}
