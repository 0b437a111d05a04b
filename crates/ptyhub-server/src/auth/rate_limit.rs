//! Token-bucket rate limiter for connections and API requests.
//!
//! Each key (the client's IP address) gets a bucket of `capacity` tokens that
//! refills continuously at `refill_per_sec`. Buckets left untouched for longer
//! than the retention window are dropped by [`RateLimiter::gc`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Idle time after which a bucket is forgotten.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A per-key token bucket limiter.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    retention: Duration,
    buckets: HashMap<IpAddr, Bucket>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// * `capacity` - Burst size; a new key starts with a full bucket.
    /// * `refill_per_sec` - Tokens added back per second.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity.max(1)),
            refill_per_sec: refill_per_sec.max(0.0),
            retention: DEFAULT_RETENTION,
            buckets: HashMap::new(),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Take one token for `ip`. Returns `false` if the bucket is empty.
    pub fn check(&mut self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        let capacity = self.capacity;
        let refill = self.refill_per_sec;
        let bucket = self.buckets.entry(ip).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Garbage-collect idle buckets to prevent memory growth.
    pub fn gc(&mut self) -> usize {
        self.gc_at(Instant::now())
    }

    pub fn gc_at(&mut self, now: Instant) -> usize {
        let before = self.buckets.len();
        let retention = self.retention;
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last_refill) < retention);
        before - self.buckets.len()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[test]
    fn burst_then_exhausted() {
        let mut limiter = RateLimiter::new(3, 1.0);
        let now = Instant::now();
        assert!(limiter.check_at(A, now));
        assert!(limiter.check_at(A, now));
        assert!(limiter.check_at(A, now));
        assert!(!limiter.check_at(A, now));
        // separate bucket per address
        assert!(limiter.check_at(B, now));
    }

    #[test]
    fn refills_over_time() {
        let mut limiter = RateLimiter::new(2, 2.0);
        let start = Instant::now();
        assert!(limiter.check_at(A, start));
        assert!(limiter.check_at(A, start));
        assert!(!limiter.check_at(A, start));

        // 0.5 s at 2/s is one token
        let later = start + Duration::from_millis(500);
        assert!(limiter.check_at(A, later));
        assert!(!limiter.check_at(A, later));

        // never above capacity
        let much_later = start + Duration::from_secs(60);
        assert!(limiter.check_at(A, much_later));
        assert!(limiter.check_at(A, much_later));
        assert!(!limiter.check_at(A, much_later));
    }

    #[test]
    fn gc_purges_idle_buckets() {
        let mut limiter = RateLimiter::new(5, 1.0).with_retention(Duration::from_secs(600));
        let start = Instant::now();
        limiter.check_at(A, start);
        limiter.check_at(B, start + Duration::from_secs(500));
        assert_eq!(limiter.len(), 2);

        let removed = limiter.gc_at(start + Duration::from_secs(601));
        assert_eq!(removed, 1);
        assert_eq!(limiter.len(), 1);

        // a purged key starts again with a full bucket
        let t = start + Duration::from_secs(602);
        for _ in 0..5 {
            assert!(limiter.check_at(A, t));
        }
        assert!(!limiter.check_at(A, t));
    }
}
