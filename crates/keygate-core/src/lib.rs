//! keygate core - license records, storage backends, and the verification
//! state machine.
//!
//! This crate implements:
//! - The license record model and its schema invariants
//! - The `LicenseStore` abstraction with atomic compare-and-bind
//! - In-memory, JSON snapshot, and (optionally) SQLite backends
//! - The verification engine for both hardware-bound and usage-only licenses

#![forbid(unsafe_code)]

// Core state machine
pub mod engine;

// Infrastructure
pub mod store;
pub mod json_store;
pub mod snapshot;
pub mod clock;

// Supporting modules
pub mod errors;
pub mod types;

// Optional storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::{EngineConfig, Outcome, VerificationEngine};
pub use errors::{EngineError, RecordError, StoreError};
pub use json_store::JsonFileStore;
pub use snapshot::Snapshot;
pub use store::{BindResult, LicenseStore, MemoryStore};
pub use types::LicenseRecord;

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteStore;
