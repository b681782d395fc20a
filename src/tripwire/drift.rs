//! Drift detection: compare live provider reads to recorded attributes.

use crate::core::state::ResourceRecord;
use crate::core::types::{Address, Attributes};
use crate::tripwire::hasher;

/// A single drift finding.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftFinding {
    pub address: Address,
    /// Recorded attributes whose live value differs (empty when missing)
    pub attributes: Vec<String>,
    pub expected_hash: String,
    pub actual_hash: String,
    pub detail: String,
}

impl DriftFinding {
    pub fn is_missing(&self) -> bool {
        self.actual_hash == "MISSING"
    }
}

/// Compare one record against what the provider reports now.
///
/// Only attributes present in the record are compared; sensitive attributes
/// are skipped because the record holds a handle, never the value.
pub fn check_drift(
    address: &Address,
    record: &ResourceRecord,
    live: Option<&Attributes>,
) -> Option<DriftFinding> {
    let Some(live) = live else {
        return Some(DriftFinding {
            address: address.clone(),
            attributes: Vec::new(),
            expected_hash: record.checksum.clone(),
            actual_hash: "MISSING".to_string(),
            detail: format!("{} no longer exists", address),
        });
    };

    let changed: Vec<String> = record
        .attributes
        .iter()
        .filter(|(k, _)| !record.sensitive.contains(*k))
        .filter(|(k, v)| live.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();

    if changed.is_empty() {
        return None;
    }
    Some(DriftFinding {
        address: address.clone(),
        detail: format!("{} changed outside terrane: {}", address, changed.join(", ")),
        attributes: changed,
        expected_hash: record.checksum.clone(),
        actual_hash: hasher::hash_attributes(live),
    })
}

/// Merge a live read into a record for `refresh`.
///
/// Recorded secret handles are kept; everything else takes the live value.
pub fn refreshed_attributes(record: &ResourceRecord, live: &Attributes) -> Attributes {
    let mut merged = live.clone();
    for key in &record.sensitive {
        if let Some(handle) = record.attributes.get(key) {
            merged.insert(key.clone(), handle.clone());
        }
    }
    merged
}
