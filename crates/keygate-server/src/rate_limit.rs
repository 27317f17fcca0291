//! Per-client token buckets for the verify endpoint.

use dashmap::DashMap;
use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct TokenBucket {
    tokens: u32,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn new(limit: u32, now: Instant) -> Self {
        Self {
            tokens: limit,
            last_refill: now,
            last_seen: now,
        }
    }

    fn check(&mut self, limit: u32, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_seen = now;

        if elapsed >= WINDOW {
            self.tokens = limit;
            self.last_refill = now;
        } else {
            // Proportional refill; the clock only advances when whole tokens are added
            let refill = (limit as f64 * elapsed.as_secs_f64() / WINDOW.as_secs_f64()) as u32;
            if refill > 0 {
                self.tokens = self.tokens.saturating_add(refill).min(limit);
                self.last_refill = now;
            }
        }

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    fn retry_after(&self, limit: u32, now: Instant) -> u64 {
        let per_token = WINDOW.as_secs_f64() / limit.max(1) as f64;
        let waited = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (per_token - waited).ceil().max(1.0) as u64
    }
}

/// Rate limiter keyed by client IP.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<IpAddr, TokenBucket>>,
    limit_per_minute: u32,
}

impl RateLimiter {
    /// A limit of 0 disables limiting.
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            limit_per_minute,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit_per_minute > 0
    }

    /// Take one token for `ip`. On refusal returns the seconds to wait.
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> Result<(), u64> {
        if !self.is_enabled() {
            return Ok(());
        }

        let limit = self.limit_per_minute;
        let mut bucket = self
            .buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(limit, now));

        if bucket.check(limit, now) {
            Ok(())
        } else {
            Err(bucket.retry_after(limit, now))
        }
    }

    /// Drop buckets that have not been touched for a full window.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    fn evict_idle_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < WINDOW);
        before - self.buckets.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}
