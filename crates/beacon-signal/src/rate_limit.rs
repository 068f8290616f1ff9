//! Per-address rate limiting with exponential-backoff blocking
//!
//! Two independent sliding windows share one block state per source
//! address: a raw request-rate window, and a failed-lookup window that
//! catches brute-force guessing of remote ids at volumes far below the
//! request threshold. Records are best-effort and garbage-collected;
//! losing one only relaxes enforcement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Maximum block duration reachable through backoff (1 hour)
const MAX_BLOCK_DURATION: Duration = Duration::from_secs(3600);

/// Rate limiter configuration
#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    /// Requests allowed per window before blocking
    pub max_requests: u32,
    /// Request-rate window length
    pub window: Duration,
    /// Block duration for a first violation; doubles per repeat
    pub base_block: Duration,
    /// Failed server lookups allowed per window before forcing a block
    pub max_failed_lookups: u32,
    /// Failed-lookup window length
    pub failed_lookup_window: Duration,
    /// How often idle records are purged
    pub cleanup_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
            base_block: Duration::from_secs(60),
            max_failed_lookups: 10,
            failed_lookup_window: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Request-rate state for one source address
#[derive(Debug)]
struct RequestRecord {
    count: u32,
    window_start: Instant,
    blocked: bool,
    block_expires: Option<Instant>,
    violations: u32,
    last_seen: Instant,
}

impl RequestRecord {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            blocked: false,
            block_expires: None,
            violations: 0,
            last_seen: now,
        }
    }

    fn is_blocked(&self, now: Instant) -> bool {
        self.blocked && self.block_expires.is_some_and(|t| now < t)
    }
}

/// Failed-lookup state for one source address
#[derive(Debug)]
struct LookupRecord {
    count: u32,
    window_start: Instant,
    last_seen: Instant,
}

impl LookupRecord {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            last_seen: now,
        }
    }
}

#[derive(Default)]
struct Records {
    requests: HashMap<String, RequestRecord>,
    lookups: HashMap<String, LookupRecord>,
}

/// Exponential backoff: `base * 2^(violations - 1)`, capped at one hour
fn block_duration(base: Duration, violations: u32) -> Duration {
    let shift = violations.saturating_sub(1).min(6);
    base.checked_mul(1u32 << shift)
        .unwrap_or(MAX_BLOCK_DURATION)
        .min(MAX_BLOCK_DURATION)
}

/// Sliding-window rate limiter keyed by source address string
pub struct RateLimiter {
    config: RateLimiterConfig,
    records: Mutex<Records>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            records: Mutex::new(Records::default()),
            cleanup: Mutex::new(None),
        }
    }

    /// Spawn the periodic cleanup task. The task holds only a weak
    /// reference, so dropping the limiter stops it.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(limiter) = weak.upgrade() else { break };
                limiter.cleanup();
            }
        });
        *self.cleanup.lock() = Some(handle);
    }

    /// Stop the cleanup task
    pub fn shutdown(&self) {
        if let Some(handle) = self.cleanup.lock().take() {
            handle.abort();
        }
    }

    /// Count one request from an address
    ///
    /// Returns `Err` with the remaining block duration if the address is
    /// blocked, including the call that tripped the threshold.
    pub fn check(&self, addr: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut records = self.records.lock();
        let entry = records
            .requests
            .entry(addr.to_string())
            .or_insert_with(|| RequestRecord::new(now));
        entry.last_seen = now;

        if entry.blocked {
            if let Some(expires) = entry.block_expires {
                if now < expires {
                    return Err(expires - now);
                }
            }
            // Block expired: fresh window, violations persist for backoff
            entry.blocked = false;
            entry.block_expires = None;
            entry.count = 0;
            entry.window_start = now;
        }

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.window_start = now;
            entry.count = 0;
            entry.violations = entry.violations.saturating_sub(1);
        }

        entry.count += 1;
        if entry.count > self.config.max_requests {
            entry.violations += 1;
            let duration = block_duration(self.config.base_block, entry.violations);
            entry.blocked = true;
            entry.block_expires = Some(now + duration);
            warn!(
                "blocked {} for {}s after exceeding {} requests (violation #{})",
                addr,
                duration.as_secs(),
                self.config.max_requests,
                entry.violations
            );
            return Err(duration);
        }

        Ok(())
    }

    /// Count one failed server-id lookup from an address
    ///
    /// Returns the block duration if the lookup threshold was reached and
    /// a block was forced onto the address's request record.
    pub fn record_failed_lookup(&self, addr: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut records = self.records.lock();
        let Records { requests, lookups } = &mut *records;

        let lookup = lookups
            .entry(addr.to_string())
            .or_insert_with(|| LookupRecord::new(now));
        lookup.last_seen = now;

        if now.duration_since(lookup.window_start) >= self.config.failed_lookup_window {
            lookup.window_start = now;
            lookup.count = 0;
        }

        lookup.count += 1;
        debug!(
            "failed lookup from {} ({}/{})",
            addr, lookup.count, self.config.max_failed_lookups
        );
        if lookup.count < self.config.max_failed_lookups {
            return None;
        }
        lookup.count = 0;

        // Brute-force signal: heavier penalty than a plain rate violation
        let entry = requests
            .entry(addr.to_string())
            .or_insert_with(|| RequestRecord::new(now));
        entry.last_seen = now;
        entry.violations += 2;
        let duration = block_duration(self.config.base_block, entry.violations);
        entry.blocked = true;
        entry.block_expires = Some(now + duration);
        warn!(
            "blocked {} for {}s after {} failed lookups",
            addr,
            duration.as_secs(),
            self.config.max_failed_lookups
        );
        Some(duration)
    }

    /// Purge records with no penalty state that have been idle beyond ten
    /// times the larger window
    pub fn cleanup(&self) {
        let now = Instant::now();
        let idle_cutoff = 10 * self.config.window.max(self.config.failed_lookup_window);
        let mut records = self.records.lock();

        records.requests.retain(|addr, entry| {
            if entry.blocked && !entry.is_blocked(now) {
                entry.blocked = false;
                entry.block_expires = None;
            }
            let keep = entry.blocked
                || entry.violations > 0
                || now.duration_since(entry.last_seen) < idle_cutoff;
            if !keep {
                debug!("dropped idle rate-limit record for {}", addr);
            }
            keep
        });
        records
            .lookups
            .retain(|_, entry| now.duration_since(entry.last_seen) < idle_cutoff);
    }

    /// Snapshot for observability
    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let records = self.records.lock();
        RateLimiterStats {
            tracked_addresses: records.requests.len(),
            blocked_addresses: records
                .requests
                .values()
                .filter(|e| e.is_blocked(now))
                .count(),
            failed_lookup_addresses: records.lookups.len(),
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub tracked_addresses: usize,
    pub blocked_addresses: usize,
    pub failed_lookup_addresses: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn config(max_requests: u32, max_failed_lookups: u32) -> RateLimiterConfig {
        RateLimiterConfig {
            max_requests,
            max_failed_lookups,
            window: Duration::from_secs(60),
            base_block: Duration::from_secs(60),
            failed_lookup_window: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_block_duration_backoff() {
        let base = Duration::from_secs(60);
        assert_eq!(block_duration(base, 1), Duration::from_secs(60));
        assert_eq!(block_duration(base, 2), Duration::from_secs(120));
        assert_eq!(block_duration(base, 3), Duration::from_secs(240));
        // One-hour ceiling
        assert_eq!(block_duration(base, 7), Duration::from_secs(3600));
        assert_eq!(block_duration(base, 30), Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_request_over_threshold() {
        let limiter = RateLimiter::new(config(5, 10));

        for _ in 0..5 {
            assert!(limiter.check("1.2.3.4").is_ok());
        }
        // Sixth request within the window trips the block
        let retry = limiter.check("1.2.3.4").unwrap_err();
        assert_eq!(retry, Duration::from_secs(60));

        // Every subsequent check reports the remaining time
        advance(Duration::from_secs(10)).await;
        let retry = limiter.check("1.2.3.4").unwrap_err();
        assert_eq!(retry, Duration::from_secs(50));

        // Other addresses are unaffected
        assert!(limiter.check("5.6.7.8").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_per_violation() {
        let limiter = RateLimiter::new(config(2, 10));
        let addr = "1.2.3.4";

        for _ in 0..2 {
            limiter.check(addr).unwrap();
        }
        assert_eq!(limiter.check(addr).unwrap_err(), Duration::from_secs(60));

        // Wait out the block, then violate again: duration doubles
        advance(Duration::from_secs(61)).await;
        for _ in 0..2 {
            limiter.check(addr).unwrap();
        }
        assert_eq!(limiter.check(addr).unwrap_err(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_resets_count_and_decays_violations() {
        let limiter = RateLimiter::new(config(2, 10));
        let addr = "1.2.3.4";

        for _ in 0..2 {
            limiter.check(addr).unwrap();
        }
        limiter.check(addr).unwrap_err();

        // Block expires; one idle window later the violation has decayed,
        // so the next block is back at the base duration
        advance(Duration::from_secs(61)).await;
        limiter.check(addr).unwrap();
        advance(Duration::from_secs(60)).await;
        limiter.check(addr).unwrap();
        limiter.check(addr).unwrap();
        assert_eq!(limiter.check(addr).unwrap_err(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_lookups_force_block() {
        let limiter = RateLimiter::new(config(100, 3));
        let addr = "9.9.9.9";

        assert!(limiter.record_failed_lookup(addr).is_none());
        assert!(limiter.record_failed_lookup(addr).is_none());

        // Threshold reached: forced block with the heavier +2 penalty,
        // so the first block already sits at 2x base
        let duration = limiter.record_failed_lookup(addr).unwrap();
        assert_eq!(duration, Duration::from_secs(120));
        assert!(limiter.check(addr).is_err());

        // Lookup counter was reset to zero
        advance(Duration::from_secs(121)).await;
        assert!(limiter.record_failed_lookup(addr).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_window_expiry_resets_counter() {
        let limiter = RateLimiter::new(config(100, 3));
        let addr = "9.9.9.9";

        limiter.record_failed_lookup(addr);
        limiter.record_failed_lookup(addr);
        advance(Duration::from_secs(60)).await;

        // Window rolled over, the two earlier failures no longer count
        assert!(limiter.record_failed_lookup(addr).is_none());
        assert!(limiter.record_failed_lookup(addr).is_none());
        assert!(limiter.record_failed_lookup(addr).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_drops_only_idle_unpunished_records() {
        let limiter = RateLimiter::new(config(2, 10));

        limiter.check("idle").unwrap();
        for _ in 0..3 {
            let _ = limiter.check("violator");
        }
        assert_eq!(limiter.stats().tracked_addresses, 2);

        advance(10 * Duration::from_secs(60) + Duration::from_secs(1)).await;
        limiter.cleanup();

        // Idle record purged, penalty state retained
        let stats = limiter.stats();
        assert_eq!(stats.tracked_addresses, 1);
        assert_eq!(stats.blocked_addresses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats() {
        let limiter = RateLimiter::new(config(1, 10));
        limiter.check("a").unwrap();
        let _ = limiter.check("a");
        limiter.check("b").unwrap();
        limiter.record_failed_lookup("c");

        let stats = limiter.stats();
        assert_eq!(stats.tracked_addresses, 2);
        assert_eq!(stats.blocked_addresses, 1);
        assert_eq!(stats.failed_lookup_addresses, 1);
    }
}
