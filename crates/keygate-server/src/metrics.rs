use prometheus::{
    register_counter_with_registry, register_gauge_with_registry, register_histogram_with_registry,
    Counter, Gauge, Histogram, Registry,
};
use std::sync::Arc;

use keygate_core::Outcome;

pub struct VerifyMetrics {
    pub licenses_loaded: Gauge,
    pub verify_valid: Counter,
    pub verify_expired: Counter,
    pub verify_bound: Counter,
    pub verify_not_found: Counter,
    pub licenses_bound: Counter,
    pub storage_errors: Counter,
    pub invalid_requests: Counter,
    pub rate_limit_hits: Counter,
    pub request_latency: Histogram,
    pub registry: Arc<Registry>,
}

impl VerifyMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let licenses_loaded = register_gauge_with_registry!(
            "keygate_licenses_loaded",
            "Number of license records loaded at startup",
            registry
        )?;

        let verify_valid = register_counter_with_registry!(
            "keygate_verify_valid_total",
            "Verifications that accepted the license",
            registry
        )?;

        let verify_expired = register_counter_with_registry!(
            "keygate_verify_expired_total",
            "Verifications refused because the license expired",
            registry
        )?;

        let verify_bound = register_counter_with_registry!(
            "keygate_verify_bound_total",
            "Verifications refused because the license is bound to another device",
            registry
        )?;

        let verify_not_found = register_counter_with_registry!(
            "keygate_verify_not_found_total",
            "Verifications for unknown license keys",
            registry
        )?;

        let licenses_bound = register_counter_with_registry!(
            "keygate_licenses_bound_total",
            "Licenses consumed or bound by a verification",
            registry
        )?;

        let storage_errors = register_counter_with_registry!(
            "keygate_storage_errors_total",
            "Verifications that failed on storage",
            registry
        )?;

        let invalid_requests = register_counter_with_registry!(
            "keygate_invalid_requests_total",
            "Requests rejected by validation",
            registry
        )?;

        let rate_limit_hits = register_counter_with_registry!(
            "keygate_rate_limit_hits_total",
            "Total number of rate limit hits",
            registry
        )?;

        let request_latency = register_histogram_with_registry!(
            "keygate_verify_latency_seconds",
            "Verify latency in seconds",
            registry
        )?;

        Ok(Self {
            licenses_loaded,
            verify_valid,
            verify_expired,
            verify_bound,
            verify_not_found,
            licenses_bound,
            storage_errors,
            invalid_requests,
            rate_limit_hits,
            request_latency,
            registry,
        })
    }

    pub fn record_outcome(&self, outcome: &Outcome) {
        match outcome {
            Outcome::Valid { newly_bound, .. } => {
                self.verify_valid.inc();
                if *newly_bound {
                    self.licenses_bound.inc();
                }
            }
            Outcome::Expired { .. } => self.verify_expired.inc(),
            Outcome::Bound { .. } => self.verify_bound.inc(),
            Outcome::NotFound => self.verify_not_found.inc(),
        }
    }

    pub fn export_prometheus(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
