//! In-process bucketed metric store.
//!
//! Counters are keyed by `(dimension key, minute bucket)` and carry a TTL
//! refreshed on every write. Buckets are created lazily and vanish silently
//! once expired. Per-bucket increments are atomic under the lock; nothing
//! is guaranteed across buckets.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use parking_lot::RwLock;

use crate::dimensions::KeyPattern;

struct Bucket {
    count: u64,
    expires_at: i64,
}

pub struct MetricStore {
    ttl_seconds: i64,
    inner: RwLock<HashMap<String, BTreeMap<i64, Bucket>>>,
}

impl MetricStore {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            ttl_seconds,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Minute bucket for a unix-seconds timestamp.
    #[inline]
    pub fn minute_of(ts: i64) -> i64 {
        ts.div_euclid(60)
    }

    /// Increment a bucket, creating it lazily. Refreshes the bucket TTL.
    pub fn incr(&self, key: &str, minute: i64, delta: u64) {
        let now = Utc::now().timestamp();
        let mut inner = self.inner.write();
        let series = inner.entry(key.to_string()).or_default();
        let bucket = series.entry(minute).or_insert(Bucket {
            count: 0,
            expires_at: 0,
        });
        bucket.count = bucket.count.saturating_add(delta);
        bucket.expires_at = now + self.ttl_seconds;

        // Drop expired siblings while holding the entry; keeps hot keys lean
        // without waiting for the sweeper.
        series.retain(|_, b| b.expires_at > now);
    }

    /// Sum of counters for `key` over `[start_minute, end_minute)`.
    pub fn range_sum(&self, key: &str, start_minute: i64, end_minute: i64) -> u64 {
        let now = Utc::now().timestamp();
        let inner = self.inner.read();
        let Some(series) = inner.get(key) else {
            return 0;
        };
        series
            .range(start_minute..end_minute)
            .filter(|(_, b)| b.expires_at > now)
            .map(|(_, b)| b.count)
            .sum()
    }

    /// Per-minute counter values for `[start_minute, end_minute)`, in order.
    /// Minutes with no bucket read as zero.
    pub fn minute_sums(&self, key: &str, start_minute: i64, end_minute: i64) -> Vec<u64> {
        let now = Utc::now().timestamp();
        let len = (end_minute - start_minute).max(0) as usize;
        let mut out = vec![0u64; len];
        let inner = self.inner.read();
        if let Some(series) = inner.get(key) {
            for (minute, bucket) in series.range(start_minute..end_minute) {
                if bucket.expires_at > now {
                    out[(minute - start_minute) as usize] = bucket.count;
                }
            }
        }
        out
    }

    /// Sum over every key matching `pattern` in `[start_minute, end_minute)`.
    pub fn pattern_sum(&self, pattern: &KeyPattern, start_minute: i64, end_minute: i64) -> u64 {
        if let Some(key) = pattern.exact_key() {
            return self.range_sum(&key, start_minute, end_minute);
        }
        let now = Utc::now().timestamp();
        let inner = self.inner.read();
        inner
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .flat_map(|(_, series)| series.range(start_minute..end_minute))
            .filter(|(_, b)| b.expires_at > now)
            .map(|(_, b)| b.count)
            .sum()
    }

    /// Per-minute sums across every key matching `pattern`.
    pub fn pattern_minute_sums(
        &self,
        pattern: &KeyPattern,
        start_minute: i64,
        end_minute: i64,
    ) -> Vec<u64> {
        if let Some(key) = pattern.exact_key() {
            return self.minute_sums(&key, start_minute, end_minute);
        }
        let now = Utc::now().timestamp();
        let len = (end_minute - start_minute).max(0) as usize;
        let mut out = vec![0u64; len];
        let inner = self.inner.read();
        for (key, series) in inner.iter() {
            if !pattern.matches(key) {
                continue;
            }
            for (minute, bucket) in series.range(start_minute..end_minute) {
                if bucket.expires_at > now {
                    let idx = (minute - start_minute) as usize;
                    out[idx] = out[idx].saturating_add(bucket.count);
                }
            }
        }
        out
    }

    /// Window sum per matching key. Feeds the response-code breakdown.
    pub fn pattern_sums_by_key(
        &self,
        pattern: &KeyPattern,
        start_minute: i64,
        end_minute: i64,
    ) -> Vec<(String, u64)> {
        let now = Utc::now().timestamp();
        let inner = self.inner.read();
        let mut out = Vec::new();
        for (key, series) in inner.iter() {
            if !pattern.matches(key) {
                continue;
            }
            let sum: u64 = series
                .range(start_minute..end_minute)
                .filter(|(_, b)| b.expires_at > now)
                .map(|(_, b)| b.count)
                .sum();
            if sum > 0 {
                out.push((key.clone(), sum));
            }
        }
        out
    }

    /// Replace this store's contents wholesale. Used by detectors running
    /// outside the ingest process, which rebuild counters from the event
    /// log ahead of each tick.
    pub fn adopt(&self, other: MetricStore) {
        let mut inner = self.inner.write();
        *inner = other.inner.into_inner();
    }

    /// Remove expired buckets and empty series. Returns buckets removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now().timestamp();
        let mut removed = 0usize;
        let mut inner = self.inner.write();
        inner.retain(|_, series| {
            let before = series.len();
            series.retain(|_, b| b.expires_at > now);
            removed += before - series.len();
            !series.is_empty()
        });
        removed
    }

    pub fn bucket_count(&self) -> usize {
        self.inner.read().values().map(|s| s.len()).sum()
    }
}
