//! Sliding-window rate limiter for failed logins and protocol strikes.
//!
//! Per-key attempt timestamps that decay over a rolling window.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A rate limiter with configurable per-key limits and window duration.
#[derive(Debug)]
pub struct RateLimiter<K> {
    /// Maximum attempts allowed within the window.
    max_attempts: u32,
    /// Duration of the sliding window.
    window: Duration,
    /// Per-key tracking: key → list of attempt timestamps.
    entries: HashMap<K, Vec<Instant>>,
}

impl<K: Eq + Hash> RateLimiter<K> {
    /// Create a new rate limiter.
    ///
    /// * `max_attempts` - Maximum allowed attempts within the window.
    /// * `window` - Window duration.
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Check if an attempt is allowed for the given key, and record it if so.
    ///
    /// Returns `true` if allowed, `false` if rate-limited.
    pub fn check_and_record(&mut self, key: K) -> bool {
        let now = Instant::now();
        let window = self.window;
        let attempts = self.entries.entry(key).or_default();

        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }

        attempts.push(now);
        true
    }

    /// Check if an attempt would be allowed without recording it.
    pub fn check(&self, key: &K) -> bool {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(attempts) => {
                let active = attempts
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count();
                (active as u32) < self.max_attempts
            }
            None => true,
        }
    }

    /// Garbage-collect expired entries to prevent memory growth.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Pre-configured limiters for the gateway.
#[derive(Debug)]
pub struct ServerRateLimits {
    /// Failed token checks: max 5 per minute per IP address.
    pub auth: RateLimiter<IpAddr>,
}

impl Default for ServerRateLimits {
    fn default() -> Self {
        Self {
            auth: RateLimiter::new(5, Duration::from_secs(60)),
        }
    }
}

impl ServerRateLimits {
    /// Whether another auth attempt from `ip` may be evaluated.
    pub fn auth_allowed(&self, ip: &IpAddr) -> bool {
        self.auth.check(ip)
    }

    /// Record a failed auth attempt from `ip`.
    pub fn record_auth_failure(&mut self, ip: IpAddr) {
        self.auth.check_and_record(ip);
    }

    /// Run garbage collection on all limiters.
    pub fn gc(&mut self) {
        self.auth.gc();
    }
}

/// Counts protocol violations on a single connection.
///
/// Once the budget is exhausted the gateway forces a disconnect.
#[derive(Debug)]
pub struct StrikeCounter {
    limiter: RateLimiter<()>,
}

impl Default for StrikeCounter {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

impl StrikeCounter {
    pub fn new(max_strikes: u32, window: Duration) -> Self {
        Self {
            limiter: RateLimiter::new(max_strikes, window),
        }
    }

    /// Record one violation. Returns `false` once the budget is exceeded.
    pub fn strike(&mut self) -> bool {
        self.limiter.check_and_record(())
    }
}
