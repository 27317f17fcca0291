//! SQLite-backed license store.
//!
//! Compare-and-bind is a conditional `UPDATE ... WHERE is_used = 0` inside a
//! transaction, so the database itself arbitrates racing writers, including
//! writers in other processes. All blocking calls run on the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::errors::StoreError;
use crate::snapshot::{self, Snapshot};
use crate::store::{BindResult, LicenseStore};
use crate::types::{iso8601, LicenseRecord};

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

type Row = (String, String, bool, Option<String>);

const SELECT_ONE: &str = "SELECT key, expires_at, is_used, hwid FROM licenses WHERE key = ?1";
const SELECT_ALL: &str = "SELECT key, expires_at, is_used, hwid FROM licenses";

/// SQLite-based persistent store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = Connection::open(&path)?;
            // Enable WAL mode for better concurrent access
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
            Self::run_migrations(&conn)?;
            info!("Opened license database at {}", path.display());
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database for testing.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if current < SCHEMA_VERSION {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS licenses (
                    key TEXT PRIMARY KEY NOT NULL,
                    expires_at TEXT NOT NULL,
                    is_used INTEGER NOT NULL DEFAULT 0,
                    hwid TEXT,
                    CHECK (is_used = 1 OR hwid IS NULL)
                );
                INSERT INTO schema_version (version) VALUES (1);
                "#,
            )?;
        }

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_record((key, expires_at, is_used, hwid): Row) -> Result<LicenseRecord, StoreError> {
    let expires_at = iso8601::parse(&expires_at)
        .ok_or_else(|| StoreError::Corrupt(format!("license {key} has invalid expires_at {expires_at:?}")))?;
    let record = LicenseRecord {
        key,
        expires_at,
        is_used,
        hwid,
    };
    record.validate()?;
    Ok(record)
}

#[async_trait]
impl LicenseStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<LicenseRecord>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(SELECT_ONE, params![key], read_row)
                .optional()?
                .map(into_record)
                .transpose()
        })
        .await
    }

    async fn compare_and_bind(&self, key: &str, hwid: Option<&str>) -> Result<BindResult, StoreError> {
        let key = key.to_string();
        let hwid = hwid.map(str::to_owned);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE licenses SET is_used = 1, hwid = ?2 WHERE key = ?1 AND is_used = 0",
                params![key, hwid],
            )?;
            let current = tx
                .query_row(SELECT_ONE, params![key], read_row)
                .optional()?
                .map(into_record)
                .transpose()?;

            // Dropping the transaction without commit rolls it back
            match (changed, current) {
                (_, None) => Ok(BindResult::Missing),
                (0, Some(_)) => Ok(BindResult::Conflict),
                (_, Some(record)) => {
                    tx.commit()?;
                    Ok(BindResult::Bound(record))
                }
            }
        })
        .await
    }

    async fn load_all(&self) -> Result<Snapshot, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(SELECT_ALL)?;
            let rows = stmt.query_map([], read_row)?;

            let mut snapshot = Snapshot::new();
            for row in rows {
                let record = into_record(row?)?;
                snapshot.insert(record.key.clone(), record);
            }
            Ok(snapshot)
        })
        .await
    }

    async fn persist_all(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        snapshot::validate(snapshot)?;
        let records: Vec<LicenseRecord> = snapshot.values().cloned().collect();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM licenses", [])?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO licenses (key, expires_at, is_used, hwid) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for record in &records {
                    insert.execute(params![
                        record.key,
                        iso8601::format(&record.expires_at),
                        record.is_used,
                        record.hwid,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
