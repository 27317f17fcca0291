//! Storage abstraction for license records.
//!
//! This module defines the `LicenseStore` trait and provides an in-memory
//! implementation for tests and embedding. Durable backends live in
//! [`json_store`](crate::json_store) and, behind the `sqlite` feature,
//! `sqlite_store`.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::errors::StoreError;
use crate::snapshot::{self, Snapshot};
use crate::types::LicenseRecord;

/// Result of a conditional bind attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindResult {
    /// The record was unbound and is now claimed; carries the committed record.
    Bound(LicenseRecord),
    /// Another writer claimed the record first. Re-read and re-evaluate.
    Conflict,
    /// No record exists for the key.
    Missing,
}

/// Durable key → record mapping with per-key atomic claim.
///
/// Only the verification engine mutates records, and only through
/// [`compare_and_bind`](LicenseStore::compare_and_bind).
#[async_trait]
pub trait LicenseStore: Send + Sync {
    /// Look up a record by key.
    async fn get(&self, key: &str) -> Result<Option<LicenseRecord>, StoreError>;

    /// Atomically claim an unbound record.
    ///
    /// Succeeds only if the record is still unused at the moment of the write.
    /// `hwid` is `None` when the license is marked used without a hardware
    /// binding. `Bound` is returned only after the change is durably
    /// committed.
    ///
    /// # Returns
    /// * `Ok(BindResult::Bound(record))` - the committed record
    /// * `Ok(BindResult::Conflict)` - the record was already claimed
    /// * `Ok(BindResult::Missing)` - no such key
    /// * `Err(StoreError)` - the write failed; nothing was committed
    async fn compare_and_bind(&self, key: &str, hwid: Option<&str>) -> Result<BindResult, StoreError>;

    /// Read the entire mapping.
    async fn load_all(&self) -> Result<Snapshot, StoreError>;

    /// Replace the entire mapping.
    async fn persist_all(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
}

/// In-memory store backed by a sharded concurrent map.
///
/// The shard lock held by `get_mut` makes compare-and-bind atomic per key.
/// Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, LicenseRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with the given records.
    pub fn with_records(records: impl IntoIterator<Item = LicenseRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.records.insert(record.key.clone(), record);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LicenseStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<LicenseRecord>, StoreError> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn compare_and_bind(&self, key: &str, hwid: Option<&str>) -> Result<BindResult, StoreError> {
        let Some(mut entry) = self.records.get_mut(key) else {
            return Ok(BindResult::Missing);
        };
        if entry.is_used {
            return Ok(BindResult::Conflict);
        }

        let claimed = entry.claimed(hwid);
        claimed.validate()?;
        *entry = claimed.clone();
        Ok(BindResult::Bound(claimed))
    }

    async fn load_all(&self) -> Result<Snapshot, StoreError> {
        Ok(self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn persist_all(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        snapshot::validate(snapshot)?;
        self.records.retain(|key, _| snapshot.contains_key(key));
        for (key, record) in snapshot {
            self.records.insert(key.clone(), record.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RecordError;
    use chrono::{NaiveDate, NaiveDateTime};

    fn far_future() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2099, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryStore::new();
        assert_eq!(store.get("nope").await.unwrap(), None);
        assert_eq!(store.compare_and_bind("nope", Some("HW-A")).await.unwrap(), BindResult::Missing);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_bind_once() {
        let store = MemoryStore::with_records([LicenseRecord::unbound("K", far_future())]);

        let first = store.compare_and_bind("K", Some("HW-A")).await.unwrap();
        let BindResult::Bound(record) = first else {
            panic!("expected bind, got {:?}", first);
        };
        assert!(record.is_bound_to("HW-A"));

        // Second writer loses, even with the same hwid
        assert_eq!(store.compare_and_bind("K", Some("HW-B")).await.unwrap(), BindResult::Conflict);
        assert_eq!(store.compare_and_bind("K", Some("HW-A")).await.unwrap(), BindResult::Conflict);

        let stored = store.get("K").await.unwrap().unwrap();
        assert_eq!(stored.hwid.as_deref(), Some("HW-A"));
    }

    #[tokio::test]
    async fn test_compare_and_bind_without_hwid() {
        let store = MemoryStore::with_records([LicenseRecord::unbound("K", far_future())]);
        let result = store.compare_and_bind("K", None).await.unwrap();
        assert_eq!(result, BindResult::Bound(LicenseRecord::unbound("K", far_future()).claimed(None)));
    }

    #[tokio::test]
    async fn test_compare_and_bind_rejects_empty_hwid() {
        let store = MemoryStore::with_records([LicenseRecord::unbound("K", far_future())]);
        let err = store.compare_and_bind("K", Some("")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(RecordError::EmptyHwid(_))));

        // Nothing committed
        assert!(!store.get("K").await.unwrap().unwrap().is_used);
    }

    #[tokio::test]
    async fn test_persist_all_replaces_mapping() {
        let store = MemoryStore::with_records([
            LicenseRecord::unbound("old", far_future()),
            LicenseRecord::unbound("kept", far_future()),
        ]);

        let mut snapshot = Snapshot::new();
        snapshot.insert("kept".to_string(), LicenseRecord::unbound("kept", far_future()).claimed(None));
        snapshot.insert("new".to_string(), LicenseRecord::unbound("new", far_future()));
        store.persist_all(&snapshot).await.unwrap();

        assert_eq!(store.load_all().await.unwrap(), snapshot);
        assert_eq!(store.get("old").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persist_all_rejects_invalid_snapshot() {
        let store = MemoryStore::with_records([LicenseRecord::unbound("K", far_future())]);

        let mut bad = LicenseRecord::unbound("X", far_future());
        bad.hwid = Some("HW-A".to_string());
        let mut snapshot = Snapshot::new();
        snapshot.insert("X".to_string(), bad);

        assert!(store.persist_all(&snapshot).await.is_err());
        assert_eq!(store.len(), 1);
        assert!(store.get("X").await.unwrap().is_none());
    }
}
