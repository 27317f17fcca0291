//! License verification state machine.
//!
//! ```text
//! UNBOUND  --(verify, not expired)-----------> BOUND(hwid)
//! UNBOUND  --(verify, not expired, no hwid)--> USED
//! BOUND(h) --(hwid == h, not expired)--------> BOUND(h)
//! BOUND(h) --(hwid != h)---------------------> BOUND(h)   rejected
//! any      --(now >= expires_at)-------------> Expired    no mutation
//! ```
//!
//! Evaluation order is existence, expiry, binding, then bind-on-first-use.
//! The only mutation is the first claim, made through
//! [`LicenseStore::compare_and_bind`]. A lost race re-reads the record and
//! evaluates again, so two concurrent first uses can never both succeed with
//! different hardware identifiers.

use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::errors::EngineError;
use crate::store::{BindResult, LicenseStore};
use crate::types::LicenseRecord;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bind each license to the first hardware id that verifies it.
    /// When false the license is only marked used and any holder of the key
    /// may verify it.
    pub binding_required: bool,
    /// Upper bound on read/claim rounds per verification.
    pub max_bind_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binding_required: true,
            max_bind_attempts: 3,
        }
    }
}

/// Result of verifying a license key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No record exists for the key.
    NotFound,
    /// The license expired; reported whatever its binding state.
    Expired { expires_at: NaiveDateTime },
    /// The license is bound to another machine. The holder is not revealed.
    Bound { expires_at: NaiveDateTime },
    /// The license is valid. `newly_bound` is set when this call claimed it.
    Valid {
        expires_at: NaiveDateTime,
        newly_bound: bool,
    },
}

impl Outcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, Outcome::Valid { .. })
    }

    /// Expiry of the matched record, absent when the key was not found.
    pub fn expires_at(&self) -> Option<NaiveDateTime> {
        match self {
            Outcome::NotFound => None,
            Outcome::Expired { expires_at }
            | Outcome::Bound { expires_at }
            | Outcome::Valid { expires_at, .. } => Some(*expires_at),
        }
    }

    /// Short stable name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::NotFound => "not_found",
            Outcome::Expired { .. } => "expired",
            Outcome::Bound { .. } => "bound",
            Outcome::Valid { .. } => "valid",
        }
    }
}

/// Applies the verification rules against an injected store.
pub struct VerificationEngine {
    store: Arc<dyn LicenseStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl VerificationEngine {
    pub fn new(store: Arc<dyn LicenseStore>, config: EngineConfig) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    pub fn with_clock(store: Arc<dyn LicenseStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self { store, clock, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Verify `key`, claiming it for `hwid` on first use.
    ///
    /// `hwid` is required when binding is enabled and ignored otherwise.
    ///
    /// # Errors
    /// * `EngineError::MissingHardwareId` - binding is enabled and no hwid was given
    /// * `EngineError::Store` - the store failed; nothing was claimed
    /// * `EngineError::Contention` - every claim attempt lost a race
    pub async fn verify(&self, key: &str, hwid: Option<&str>) -> Result<Outcome, EngineError> {
        let hwid = if self.config.binding_required {
            match hwid {
                Some(hwid) if !hwid.is_empty() => Some(hwid),
                _ => return Err(EngineError::MissingHardwareId(key.to_string())),
            }
        } else {
            None
        };

        let attempts = self.config.max_bind_attempts.max(1);
        for attempt in 1..=attempts {
            let Some(record) = self.store.get(key).await? else {
                debug!("Unknown license key {}", key);
                return Ok(Outcome::NotFound);
            };

            if let Some(outcome) = evaluate(&record, hwid, self.clock.now()) {
                if let Outcome::Bound { .. } = outcome {
                    warn!("License {} presented from an unbound machine", key);
                }
                return Ok(outcome);
            }

            match self.store.compare_and_bind(key, hwid).await? {
                BindResult::Bound(claimed) => {
                    if hwid.is_some() {
                        info!("License {} bound on first use", key);
                    } else {
                        info!("License {} marked used", key);
                    }
                    return Ok(Outcome::Valid {
                        expires_at: claimed.expires_at,
                        newly_bound: true,
                    });
                }
                BindResult::Conflict => {
                    debug!("Lost claim race for license {} (attempt {})", key, attempt);
                }
                BindResult::Missing => return Ok(Outcome::NotFound),
            }
        }

        Err(EngineError::Contention {
            key: key.to_string(),
            attempts,
        })
    }
}

/// Decide the outcome for a record without touching the store.
///
/// Returns `None` when the record is unused and unexpired, i.e. claimable.
/// `hwid` is `None` in the usage-only mode.
fn evaluate(record: &LicenseRecord, hwid: Option<&str>, now: NaiveDateTime) -> Option<Outcome> {
    let expires_at = record.expires_at;
    if record.is_expired_at(now) {
        return Some(Outcome::Expired { expires_at });
    }
    if !record.is_used {
        return None;
    }
    match hwid {
        Some(hwid) if !record.is_bound_to(hwid) => Some(Outcome::Bound { expires_at }),
        _ => Some(Outcome::Valid {
            expires_at,
            newly_bound: false,
        }),
    }
}
