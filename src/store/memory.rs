//! Process-local store. Suitable for a single replica and for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use crate::store::{CounterStore, HistoryStore, RateSample, StoreError, WindowState};
use crate::window::{Clock, SystemClock};

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl Counter {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<String, Counter>>,
    history: Mutex<HashMap<String, VecDeque<RateSample>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    /// Expiry is judged against `clock`, so a manual clock expires keys deterministically.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counters: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
        }
    }

    fn counters(&self) -> MutexGuard<'_, HashMap<String, Counter>> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn history(&self) -> MutexGuard<'_, HashMap<String, VecDeque<RateSample>>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live counter under `key`, purging it if it has expired.
    fn live(map: &mut HashMap<String, Counter>, key: &str, now: DateTime<Utc>) -> Option<Counter> {
        match map.get(key) {
            Some(c) if c.is_live(now) => Some(*c),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }
}

impl CounterStore for MemoryStore {
    fn window_state(&self, success_key: &str, failure_key: &str) -> Result<WindowState, StoreError> {
        let now = self.clock.now();
        let mut map = self.counters();
        let any = Self::live(&mut map, success_key, now).is_some()
            || Self::live(&mut map, failure_key, now).is_some();
        Ok(if any { WindowState::Active } else { WindowState::Fresh })
    }

    fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut map = self.counters();
        let mut counter = Self::live(&mut map, key, now).unwrap_or(Counter {
            value: 0,
            expires_at: None,
        });
        counter.value += 1;
        if counter.expires_at.is_none() {
            counter.expires_at = Some(now + ttl);
        }
        map.insert(key.to_string(), counter);
        Ok(counter.value)
    }

    fn get(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut map = self.counters();
        Ok(Self::live(&mut map, key, now).map_or(0, |c| c.value))
    }

    fn expires_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let now = self.clock.now();
        let mut map = self.counters();
        Ok(Self::live(&mut map, key, now).and_then(|c| c.expires_at))
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut map = self.counters();
        let before = map.len();
        map.retain(|_, c| c.is_live(now));
        Ok(before - map.len())
    }
}

impl HistoryStore for MemoryStore {
    fn push_capped(&self, key: &str, sample: &RateSample, cap: usize) -> Result<bool, StoreError> {
        let mut map = self.history();
        let series = map.entry(key.to_string()).or_default();
        if series.iter().any(|s| s.bucket_id == sample.bucket_id) {
            return Ok(false);
        }
        series.push_back(sample.clone());
        while series.len() > cap {
            series.pop_front();
        }
        Ok(true)
    }

    fn range(&self, key: &str) -> Result<Vec<RateSample>, StoreError> {
        Ok(self
            .history()
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.history().get(key).map_or(0, VecDeque::len))
    }

    fn clear(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.history().remove(key).map_or(0, |s| s.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::ManualClock;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn sample(bucket: usize, rate: f64) -> RateSample {
        RateSample {
            bucket_id: format!("b{bucket}"),
            rate_percent: rate,
            recorded_at: start(),
        }
    }

    #[test]
    fn test_incr_sets_expiry_once() {
        let clock = ManualClock::new(start());
        let store = MemoryStore::new(Arc::new(clock.clone()));

        assert_eq!(store.incr_with_expiry("k", Duration::hours(8)).unwrap(), 1);
        let first = store.expires_at("k").unwrap().unwrap();
        assert_eq!(first, start() + Duration::hours(8));

        clock.advance(Duration::hours(3));
        assert_eq!(store.incr_with_expiry("k", Duration::hours(8)).unwrap(), 2);
        assert_eq!(store.expires_at("k").unwrap(), Some(first));
    }

    #[test]
    fn test_expired_counter_reads_absent() {
        let clock = ManualClock::new(start());
        let store = MemoryStore::new(Arc::new(clock.clone()));

        store.incr_with_expiry("s", Duration::hours(8)).unwrap();
        assert_eq!(store.window_state("s", "f").unwrap(), WindowState::Active);

        clock.advance(Duration::hours(8));
        assert_eq!(store.get("s").unwrap(), 0);
        assert_eq!(store.window_state("s", "f").unwrap(), WindowState::Fresh);

        // A new life starts from one with a fresh expiry.
        assert_eq!(store.incr_with_expiry("s", Duration::hours(8)).unwrap(), 1);
        assert_eq!(
            store.expires_at("s").unwrap(),
            Some(start() + Duration::hours(16))
        );
    }

    #[test]
    fn test_window_state_needs_both_absent() {
        let store = MemoryStore::default();
        assert_eq!(store.window_state("s", "f").unwrap(), WindowState::Fresh);
        store.incr_with_expiry("f", Duration::hours(1)).unwrap();
        assert_eq!(store.window_state("s", "f").unwrap(), WindowState::Active);
    }

    #[test]
    fn test_purge_drops_only_expired() {
        let clock = ManualClock::new(start());
        let store = MemoryStore::new(Arc::new(clock.clone()));
        store.incr_with_expiry("old", Duration::hours(1)).unwrap();
        clock.advance(Duration::minutes(30));
        store.incr_with_expiry("new", Duration::hours(1)).unwrap();
        clock.advance(Duration::minutes(45));

        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.get("new").unwrap(), 1);
        assert_eq!(store.purge_expired().unwrap(), 0);
    }

    #[test]
    fn test_history_cap_keeps_newest() {
        let store = MemoryStore::default();
        for i in 0..185 {
            store.push_capped("h", &sample(i, i as f64), 180).unwrap();
        }
        let series = store.range("h").unwrap();
        assert_eq!(series.len(), 180);
        assert_eq!(series.first().unwrap().bucket_id, "b5");
        assert_eq!(series.last().unwrap().bucket_id, "b184");
    }

    #[test]
    fn test_history_ignores_duplicate_bucket() {
        let store = MemoryStore::default();
        assert!(store.push_capped("h", &sample(1, 90.0), 10).unwrap());
        assert!(!store.push_capped("h", &sample(1, 91.0), 10).unwrap());
        assert_eq!(store.len("h").unwrap(), 1);
        assert_eq!(store.range("h").unwrap()[0].rate_percent, 90.0);
        assert_eq!(store.clear("h").unwrap(), 1);
        assert_eq!(store.len("h").unwrap(), 0);
    }
}
