//! Text snapshot codec for the whole key → record mapping.
//!
//! The on-disk layout is a single JSON object keyed by license key:
//!
//! ```json
//! {
//!     "K2": {
//!         "expires_at": "2099-01-01T00:00:00",
//!         "is_used": true,
//!         "hwid": "HW-A"
//!     }
//! }
//! ```
//!
//! The key lives only in the object key, not inside the entry. A missing
//! `is_used` reads as `false` and a missing `hwid` as unbound. Expiries are
//! always written in the canonical `YYYY-MM-DDTHH:MM:SS[.f]` form, so the
//! first write rewrites date-only and offset timestamps of every record.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::types::{iso8601, LicenseRecord};

/// Full key → record mapping.
pub type Snapshot = BTreeMap<String, LicenseRecord>;

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    #[serde(with = "iso8601")]
    expires_at: NaiveDateTime,
    #[serde(default)]
    is_used: bool,
    #[serde(default)]
    hwid: Option<String>,
}

/// Encode a snapshot as pretty-printed JSON with four-space indentation.
pub fn encode(snapshot: &Snapshot) -> Result<String, StoreError> {
    let entries: BTreeMap<&str, SnapshotEntry> = snapshot
        .iter()
        .map(|(key, record)| {
            (
                key.as_str(),
                SnapshotEntry {
                    expires_at: record.expires_at,
                    is_used: record.is_used,
                    hwid: record.hwid.clone(),
                },
            )
        })
        .collect();

    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    entries.serialize(&mut ser)?;
    String::from_utf8(buf).map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// Decode and validate a snapshot. Blank input decodes to an empty mapping.
pub fn decode(text: &str) -> Result<Snapshot, StoreError> {
    if text.trim().is_empty() {
        return Ok(Snapshot::new());
    }

    let entries: BTreeMap<String, SnapshotEntry> =
        serde_json::from_str(text).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let mut snapshot = Snapshot::new();
    for (key, entry) in entries {
        let record = LicenseRecord {
            key: key.clone(),
            expires_at: entry.expires_at,
            is_used: entry.is_used,
            hwid: entry.hwid,
        };
        record.validate()?;
        snapshot.insert(key, record);
    }
    Ok(snapshot)
}

/// Validate every record and check each is filed under its own key.
pub fn validate(snapshot: &Snapshot) -> Result<(), StoreError> {
    for (key, record) in snapshot {
        if key != &record.key {
            return Err(StoreError::Corrupt(format!(
                "record {} filed under key {}",
                record.key, key
            )));
        }
        record.validate()?;
    }
    Ok(())
}
