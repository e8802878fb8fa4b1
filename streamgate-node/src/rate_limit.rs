//! # Rate Limiter
//!
//! Per-identifier token buckets. An identifier is whatever the endpoint's
//! configuration keys admission by (client IP, API key, or wallet). Buckets
//! are created lazily at full capacity, refill continuously at the
//! configured rate, and are evicted after sitting idle to bound memory.
//! Denial is a normal result, not an error: the caller gets a retry-after
//! hint alongside the decision.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub admitted: bool,
    /// Zero when admitted; otherwise how long until one token accrues.
    pub retry_after: Duration,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

pub struct RateLimiter {
    capacity: u32,
    refill_per_sec: f64,
    idle_eviction: Duration,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64, idle_eviction: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            idle_eviction,
            buckets: DashMap::new(),
        }
    }

    /// Check and consume one token for `identifier`.
    pub fn allow(&self, identifier: &str) -> Decision {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(identifier.to_string())
            .or_insert_with(|| Bucket {
                tokens: self.capacity as f64,
                last_refill: now,
                last_seen: now,
            });

        // A clock regression counts as zero elapsed time: no tokens accrue
        // from the future.
        let elapsed = now
            .checked_duration_since(bucket.last_refill)
            .unwrap_or(Duration::ZERO);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity as f64);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Decision {
                admitted: true,
                retry_after: Duration::ZERO,
            }
        } else {
            let deficit = 1.0 - bucket.tokens;
            Decision {
                admitted: false,
                retry_after: Duration::from_secs_f64(deficit / self.refill_per_sec),
            }
        }
    }

    /// Drop buckets idle beyond the eviction window. Called by the kernel's
    /// maintenance task.
    pub fn evict_idle(&self) {
        let cutoff = self.idle_eviction;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.last_seen.elapsed() <= cutoff);
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.buckets.len(), "idle rate buckets evicted");
        }
    }

    pub fn tracked_identifiers(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill: f64) -> RateLimiter {
        RateLimiter::new(capacity, refill, Duration::from_secs(600))
    }

    #[test]
    fn fresh_identifier_starts_at_full_capacity() {
        let rl = limiter(3, 1.0);
        for _ in 0..3 {
            assert!(rl.allow("1.2.3.4").admitted);
        }
        let denied = rl.allow("1.2.3.4");
        assert!(!denied.admitted);
        assert!(denied.retry_after > Duration::ZERO);
        assert!(denied.retry_after <= Duration::from_secs(1));
    }

    #[test]
    fn identifiers_are_independent() {
        let rl = limiter(1, 1.0);
        assert!(rl.allow("a").admitted);
        assert!(rl.allow("b").admitted);
        assert!(!rl.allow("a").admitted);
    }

    #[test]
    fn refill_restores_tokens() {
        let rl = limiter(1, 1000.0);
        assert!(rl.allow("x").admitted);
        assert!(!rl.allow("x").admitted);
        std::thread::sleep(Duration::from_millis(5));
        assert!(rl.allow("x").admitted);
    }

    #[test]
    fn admitted_count_respects_capacity_bound() {
        // Invariant: over any burst, admissions cannot exceed
        // capacity + refill * elapsed.
        let rl = limiter(5, 100.0);
        let started = Instant::now();
        let mut admitted = 0u32;
        for _ in 0..1000 {
            if rl.allow("burst").admitted {
                admitted += 1;
            }
        }
        let ceiling = 5.0 + 100.0 * started.elapsed().as_secs_f64();
        assert!((admitted as f64) <= ceiling + 1.0, "{admitted} > {ceiling}");
    }

    #[test]
    fn retry_after_reflects_deficit() {
        let rl = limiter(1, 2.0);
        assert!(rl.allow("y").admitted);
        let denied = rl.allow("y");
        // One token at 2/sec is at most half a second away.
        assert!(denied.retry_after <= Duration::from_millis(501));
    }

    #[test]
    fn idle_buckets_are_evicted() {
        let rl = RateLimiter::new(1, 1.0, Duration::ZERO);
        rl.allow("gone");
        std::thread::sleep(Duration::from_millis(2));
        rl.evict_idle();
        assert_eq!(rl.tracked_identifiers(), 0);
    }
}
