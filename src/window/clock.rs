//! Bucket clock: maps wall-clock timestamps onto fixed-duration buckets.
//!
//! Buckets are aligned to UTC midnight, so every replica sharing a roughly
//! synchronized clock derives the same identifier for the same instant.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Serialize, Serializer};

/// Source of "now". Injected so rollover and expiry can be driven in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Identifier of one bucket: calendar date plus the bucket's index within that day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId {
    pub date: NaiveDate,
    pub index: u32,
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&format!("{}_{}", self.date.format("%Y-%m-%d"), self.index))
    }
}

impl Serialize for BucketId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Pure mapping from timestamps to buckets of `bucket_hours` each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketClock {
    bucket_hours: u32,
}

impl BucketClock {
    /// `bucket_hours` must divide 24; the configuration layer enforces this.
    pub fn new(bucket_hours: u32) -> Self {
        debug_assert!(bucket_hours > 0 && 24 % bucket_hours == 0);
        Self { bucket_hours }
    }

    pub fn bucket_hours(&self) -> u32 {
        self.bucket_hours
    }

    pub fn bucket_duration(&self) -> Duration {
        Duration::hours(i64::from(self.bucket_hours))
    }

    /// Number of buckets in one calendar day.
    pub fn buckets_per_day(&self) -> u32 {
        24 / self.bucket_hours
    }

    pub fn bucket_id(&self, at: DateTime<Utc>) -> BucketId {
        BucketId {
            date: at.date_naive(),
            index: at.hour() / self.bucket_hours,
        }
    }

    pub fn previous_bucket_id(&self, at: DateTime<Utc>) -> BucketId {
        self.bucket_id(at - self.bucket_duration())
    }

    /// First instant belonging to the bucket containing `at`.
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let id = self.bucket_id(at);
        let midnight = id.date.and_time(NaiveTime::MIN).and_utc();
        midnight + Duration::hours(i64::from(id.index * self.bucket_hours))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_bucket_index_from_hour() {
        let clock = BucketClock::new(4);
        assert_eq!(clock.bucket_id(at(2024, 5, 1, 0, 0)).index, 0);
        assert_eq!(clock.bucket_id(at(2024, 5, 1, 3, 59)).index, 0);
        assert_eq!(clock.bucket_id(at(2024, 5, 1, 4, 0)).index, 1);
        assert_eq!(clock.bucket_id(at(2024, 5, 1, 23, 59)).index, 5);
        assert_eq!(clock.bucket_id(at(2024, 5, 1, 9, 30)).to_string(), "2024-05-01_2");
    }

    #[test]
    fn test_previous_bucket_crosses_midnight() {
        let clock = BucketClock::new(4);
        let prev = clock.previous_bucket_id(at(2024, 5, 1, 1, 15));
        assert_eq!(prev.to_string(), "2024-04-30_5");

        let prev = clock.previous_bucket_id(at(2024, 3, 1, 2, 0));
        assert_eq!(prev.to_string(), "2024-02-29_5");
    }

    #[test]
    fn test_bucket_start_is_aligned() {
        let clock = BucketClock::new(6);
        assert_eq!(clock.bucket_start(at(2024, 5, 1, 13, 42)), at(2024, 5, 1, 12, 0));
        assert_eq!(clock.buckets_per_day(), 4);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(at(2024, 5, 1, 0, 0));
        let other = clock.clone();
        clock.advance(Duration::hours(5));
        assert_eq!(other.now(), at(2024, 5, 1, 5, 0));
        other.set(at(2024, 6, 1, 0, 0));
        assert_eq!(clock.now(), at(2024, 6, 1, 0, 0));
    }
}
