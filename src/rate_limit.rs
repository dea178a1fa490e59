//! Token bucket admission control for outbound connection attempts
//!
//! Buckets refill lazily on each acquisition, so no background timer is
//! needed. One bucket is shared per upstream host.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitSettings;

/// Outcome of a token request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    /// Point from which the next token accrues
    last_refill: Instant,
}

/// Token bucket with `capacity` tokens and one token per `refill_interval`
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_interval: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self::new_at(capacity, refill_interval, Instant::now())
    }

    pub fn new_at(capacity: u32, refill_interval: Duration, now: Instant) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_interval: refill_interval.max(Duration::from_millis(1)),
            bucket: Mutex::new(Bucket {
                tokens: capacity.max(1),
                last_refill: now,
            }),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(
            settings.capacity,
            Duration::from_millis(settings.refill_interval_ms),
        )
    }

    /// Take a token if one is available
    pub fn try_acquire(&self) -> Admission {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Admission {
        let mut bucket = match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        self.refill(&mut bucket, now);
        if bucket.tokens == self.capacity {
            bucket.last_refill = now;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            Admission::Admitted
        } else {
            let accrued = now.saturating_duration_since(bucket.last_refill);
            let retry_after = self.refill_interval.saturating_sub(accrued);
            debug!(retry_after_ms = retry_after.as_millis() as u64, "Connection attempt denied");
            Admission::Denied { retry_after }
        }
    }

    /// Tokens currently available
    pub fn available_at(&self, now: Instant) -> u32 {
        let mut bucket = match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.refill(&mut bucket, now);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let earned = (elapsed.as_nanos() / self.refill_interval.as_nanos()) as u64;
        if earned == 0 {
            return;
        }

        let tokens = (bucket.tokens as u64 + earned).min(self.capacity as u64) as u32;
        bucket.tokens = tokens;
        if tokens == self.capacity {
            // A full bucket does not bank partial progress.
            bucket.last_refill = now;
        } else {
            bucket.last_refill += self.refill_interval * earned as u32;
        }
    }
}

/// Per-host buckets enforcing a global connection cap against each upstream
#[derive(Debug)]
pub struct RateLimiterRegistry {
    settings: RateLimitSettings,
    buckets: DashMap<String, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            buckets: DashMap::new(),
        }
    }

    /// Bucket shared by every connection to the host of `endpoint`
    pub fn for_endpoint(&self, endpoint: &str) -> Arc<RateLimiter> {
        let host = host_key(endpoint);
        self.buckets
            .entry(host)
            .or_insert_with(|| Arc::new(RateLimiter::from_settings(&self.settings)))
            .clone()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.buckets.iter().map(|entry| entry.key().clone()).collect()
    }
}

fn host_key(endpoint: &str) -> String {
    reqwest::Url::parse(endpoint)
        .ok()
        .and_then(|url| {
            url.host_str().map(|host| match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            })
        })
        .unwrap_or_else(|| endpoint.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_then_single_refill() {
        let start = Instant::now();
        let limiter = RateLimiter::new_at(5, Duration::from_secs(12), start);

        for _ in 0..5 {
            assert_eq!(limiter.try_acquire_at(start), Admission::Admitted);
        }
        assert_eq!(
            limiter.try_acquire_at(start),
            Admission::Denied {
                retry_after: Duration::from_secs(12)
            }
        );

        let later = start + Duration::from_secs(12);
        assert_eq!(limiter.try_acquire_at(later), Admission::Admitted);
        assert!(!limiter.try_acquire_at(later).is_admitted());
    }

    #[test]
    fn test_retry_after_counts_down() {
        let start = Instant::now();
        let limiter = RateLimiter::new_at(1, Duration::from_secs(10), start);
        assert!(limiter.try_acquire_at(start).is_admitted());

        match limiter.try_acquire_at(start + Duration::from_secs(4)) {
            Admission::Denied { retry_after } => assert_eq!(retry_after, Duration::from_secs(6)),
            Admission::Admitted => panic!("bucket should be empty"),
        }
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let start = Instant::now();
        let limiter = RateLimiter::new_at(3, Duration::from_secs(1), start);
        for _ in 0..3 {
            limiter.try_acquire_at(start);
        }
        assert_eq!(limiter.available_at(start + Duration::from_secs(3600)), 3);
    }

    #[test]
    fn test_partial_progress_is_kept() {
        let start = Instant::now();
        let limiter = RateLimiter::new_at(2, Duration::from_secs(10), start);
        limiter.try_acquire_at(start);
        limiter.try_acquire_at(start);

        // 15s: one token earned, 5s of progress toward the next
        assert!(limiter.try_acquire_at(start + Duration::from_secs(15)).is_admitted());
        assert!(limiter.try_acquire_at(start + Duration::from_secs(20)).is_admitted());
    }

    #[test]
    fn test_registry_shares_bucket_per_host() {
        let registry = RateLimiterRegistry::new(RateLimitSettings {
            capacity: 1,
            refill_interval_ms: 60_000,
        });
        let a = registry.for_endpoint("wss://stream.binance.com:9443/ws");
        let b = registry.for_endpoint("wss://stream.binance.com:9443/ws/btcusdt@trade");
        let other = registry.for_endpoint("wss://fstream.binance.com/ws");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
        assert!(a.try_acquire().is_admitted());
        assert!(!b.try_acquire().is_admitted());
        assert!(other.try_acquire().is_admitted());
        assert_eq!(registry.hosts().len(), 2);
    }
}
