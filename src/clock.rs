//! Monotonic clock source
//!
//! Provides wall-clock timestamps that never go backward, used for job
//! identifiers and lifecycle timestamps so that NTP adjustments cannot
//! produce out-of-order records.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// A clock source that guarantees monotonically non-decreasing timestamps.
#[derive(Debug)]
pub struct BoundedClock {
    /// High-water mark: the largest timestamp we've ever returned (millis)
    high_water_ms: AtomicI64,
}

impl BoundedClock {
    pub fn new() -> Self {
        Self {
            high_water_ms: AtomicI64::new(0),
        }
    }

    /// Returns a monotonically non-decreasing unix-millisecond timestamp.
    ///
    /// If the wall clock has gone backward (e.g. NTP adjustment),
    /// returns the previous high-water mark instead.
    pub fn unix_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        loop {
            let prev = self.high_water_ms.load(Ordering::Acquire);
            let ts = wall.max(prev);
            match self.high_water_ms.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue, // CAS failed, retry
            }
        }
    }

    /// Returns `chrono::DateTime<Utc>` from the monotonic clock.
    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.unix_millis()).unwrap_or_else(Utc::now)
    }
}

impl Default for BoundedClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_non_decreasing() {
        let clock = BoundedClock::default();
        let mut prev = 0i64;
        for _ in 0..1000 {
            let ts = clock.unix_millis();
            assert!(ts >= prev, "timestamps must never go backward");
            prev = ts;
        }
    }

    #[test]
    fn test_now_returns_valid_datetime() {
        let clock = BoundedClock::default();
        let dt = clock.now();
        // Should be a reasonable time (after 2020)
        assert!(dt.timestamp() > 1_577_836_800, "timestamp should be after 2020");
    }

    #[test]
    fn test_concurrent_monotonicity() {
        use std::sync::Arc;
        let clock = Arc::new(BoundedClock::default());
        let mut handles = vec![];

        for _ in 0..4 {
            let c = clock.clone();
            handles.push(std::thread::spawn(move || {
                let mut prev = 0i64;
                for _ in 0..1000 {
                    let ts = c.unix_millis();
                    assert!(ts >= prev);
                    prev = ts;
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
    }
}
