//! Whole-file JSON snapshot store.
//!
//! Reads are served from an in-memory table. Every mutation rewrites the full
//! snapshot: encode, write to a sibling temp file, fsync, rename over the
//! live file, fsync the directory, and only then update the in-memory table.
//! A failed write leaves both the file and the table untouched.
//!
//! The write and the in-memory commit run together on the blocking pool while
//! holding the writer lock, so dropping the caller's future cannot leave the
//! file and the table disagreeing. Readers never wait on disk I/O.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::errors::StoreError;
use crate::snapshot::{self, Snapshot};
use crate::store::{BindResult, LicenseStore};
use crate::types::LicenseRecord;

/// License store persisted as a single JSON document.
pub struct JsonFileStore {
    path: PathBuf,
    records: Arc<RwLock<Snapshot>>,
    writer: Arc<Mutex<()>>,
}

impl JsonFileStore {
    /// Open the snapshot at `path`, creating an empty one if it does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let records = match tokio::fs::read_to_string(&path).await {
            Ok(text) => snapshot::decode(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let empty = Snapshot::new();
                let contents = snapshot::encode(&empty)?;
                let target = path.clone();
                tokio::task::spawn_blocking(move || write_snapshot(&target, &contents))
                    .await
                    .map_err(|e| StoreError::TaskFailed(e.to_string()))??;
                info!("Created empty license snapshot at {}", path.display());
                empty
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        debug!("Opened {} with {} records", path.display(), records.len());

        Ok(Self {
            path,
            records: Arc::new(RwLock::new(records)),
            writer: Arc::new(Mutex::new(())),
        })
    }

    fn table(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Write `contents` to disk and then apply `update` to the table.
    ///
    /// Both steps run on the blocking pool with the writer guard moved in, so
    /// they finish even if the caller stops waiting.
    async fn commit<F>(
        &self,
        guard: OwnedMutexGuard<()>,
        contents: String,
        update: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Snapshot) + Send + 'static,
    {
        let path = self.path.clone();
        let records = self.records.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let _guard = guard;
            write_snapshot(&path, &contents)?;
            let mut table = records.write().unwrap_or_else(|e| e.into_inner());
            update(&mut *table);
            Ok(())
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

#[async_trait]
impl LicenseStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<LicenseRecord>, StoreError> {
        Ok(self.table().get(key).cloned())
    }

    async fn compare_and_bind(&self, key: &str, hwid: Option<&str>) -> Result<BindResult, StoreError> {
        // The table only changes while this guard is held
        let guard = self.writer.clone().lock_owned().await;

        let (claimed, encoded) = {
            let table = self.table();
            let Some(current) = table.get(key) else {
                return Ok(BindResult::Missing);
            };
            if current.is_used {
                return Ok(BindResult::Conflict);
            }

            let claimed = current.claimed(hwid);
            claimed.validate()?;

            let mut next = table.clone();
            next.insert(key.to_string(), claimed.clone());
            (claimed, snapshot::encode(&next)?)
        };

        let committed = claimed.clone();
        self.commit(guard, encoded, move |table| {
            table.insert(committed.key.clone(), committed);
        })
        .await?;

        Ok(BindResult::Bound(claimed))
    }

    async fn load_all(&self) -> Result<Snapshot, StoreError> {
        Ok(self.table().clone())
    }

    async fn persist_all(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        snapshot::validate(snapshot)?;
        let encoded = snapshot::encode(snapshot)?;

        let guard = self.writer.clone().lock_owned().await;
        let replacement = snapshot.clone();
        self.commit(guard, encoded, move |table| *table = replacement)
            .await?;

        info!("Persisted {} records to {}", snapshot.len(), self.path.display());
        Ok(())
    }
}

/// Atomically and durably replace the file at `path` with `contents`.
fn write_snapshot(path: &Path, contents: &str) -> Result<(), StoreError> {
    use std::io::Write;

    let file_name = path
        .file_name()
        .ok_or_else(|| StoreError::Corrupt(format!("not a file path: {}", path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, path)?;
    sync_parent_dir(path)?;
    Ok(())
}

/// Flush the directory entry so the rename itself survives a crash.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::File::open(parent)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}
