//! keygate-server: HTTP license verification service
//!
//! Serves `POST /verify` over a keygate-core verification engine. Licenses
//! are claimed on first use and, when hardware binding is enabled, stay tied
//! to the machine that claimed them.

pub mod api;
pub mod config;
pub mod metrics;
pub mod rate_limit;
pub mod server;

pub use config::{ConfigError, ServerConfig, StoreBackend};
pub use server::LicenseServer;
