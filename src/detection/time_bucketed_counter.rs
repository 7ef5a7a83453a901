use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Duration, Utc};
use log::trace;
use parking_lot::Mutex;

/// Maps timestamps onto bucket indices.
///
/// One clock is shared (by copy) by every counter of a detector so that all nodes
/// agree on where bucket boundaries fall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketClock {
    epoch: DateTime<Utc>,
    resolution_ms: i64,
    window_len: u64,
}

impl BucketClock {
    pub fn new(epoch: DateTime<Utc>, resolution: Duration, window_len: u64) -> Self {
        Self {
            epoch,
            resolution_ms: resolution.num_milliseconds().max(1),
            window_len: window_len.max(1),
        }
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    pub fn window_len(&self) -> u64 {
        self.window_len
    }

    /// Bucket index of `at`. Timestamps before the epoch land in bucket 0.
    pub fn index_at(&self, at: DateTime<Utc>) -> u64 {
        let elapsed_ms = (at - self.epoch).num_milliseconds();
        if elapsed_ms <= 0 {
            return 0;
        }
        (elapsed_ms / self.resolution_ms) as u64
    }

    /// Inclusive range of bucket indices making up the trailing window ending at `at`.
    pub fn window_at(&self, at: DateTime<Utc>) -> RangeInclusive<u64> {
        let end = self.index_at(at);
        self.oldest_in_window(end)..=end
    }

    fn oldest_in_window(&self, newest: u64) -> u64 {
        newest.saturating_sub(self.window_len - 1)
    }
}

/// One time slice of a series.
#[derive(Debug)]
struct TimeBucket {
    index: u64,
    count: AtomicU64,
}

impl TimeBucket {
    fn new(index: u64) -> Self {
        Self {
            index,
            count: AtomicU64::new(1),
        }
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// A rolling histogram of buckets plus a lock-free handle on the newest one.
///
/// Buckets are kept in insertion order, which is not strictly chronological: writers
/// racing across a bucket boundary may append an older index after a newer one.
struct BucketSeries {
    recent: ArcSwapOption<TimeBucket>,
    buckets: Mutex<Vec<Arc<TimeBucket>>>,
}

impl BucketSeries {
    fn new() -> Self {
        Self {
            recent: ArcSwapOption::empty(),
            buckets: Mutex::new(Vec::with_capacity(2)),
        }
    }

    fn add(&self, clock: &BucketClock, current: u64) {
        // Almost every call lands in the newest bucket.
        let recent = self.recent.load();
        if let Some(bucket) = &*recent {
            if bucket.index == current {
                bucket.increment();
                return;
            }
        }
        drop(recent);

        self.add_slow(clock, current);
    }

    fn add_slow(&self, clock: &BucketClock, current: u64) {
        let mut buckets = self.buckets.lock();

        // Another writer may have rolled the series forward while we waited on the lock.
        let recent = self.recent.load_full();
        let recent_index = recent.as_ref().map(|bucket| bucket.index);

        if recent_index == Some(current) {
            if let Some(bucket) = recent {
                bucket.increment();
            }
        } else {
            let is_newest = recent_index.map_or(true, |index| current > index);
            match buckets.iter().rposition(|bucket| bucket.index == current) {
                Some(position) => {
                    let bucket = &buckets[position];
                    bucket.increment();
                    if is_newest {
                        self.recent.store(Some(Arc::clone(bucket)));
                    }
                }
                None => {
                    let bucket = Arc::new(TimeBucket::new(current));
                    if is_newest {
                        self.recent.store(Some(Arc::clone(&bucket)));
                    }
                    buckets.push(bucket);
                    trace!("Opened bucket {} ({} retained)", current, buckets.len());
                }
            }
        }

        let oldest = clock.oldest_in_window(current);
        buckets.retain(|bucket| bucket.index >= oldest);
    }

    fn total(&self, window: RangeInclusive<u64>) -> u64 {
        let (start, end) = (*window.start(), *window.end());
        let mut buckets = self.buckets.lock();

        // Anything older than the window can never be counted again.
        buckets.retain(|bucket| bucket.index >= start);
        let recent_expired = self
            .recent
            .load_full()
            .map_or(false, |bucket| bucket.index < start);
        if recent_expired {
            self.recent.store(None);
        }

        buckets
            .iter()
            .filter(|bucket| bucket.index <= end)
            .map(|bucket| bucket.count())
            .sum()
    }

    fn retained(&self) -> usize {
        self.buckets.lock().len()
    }
}

/// Totals for both series over one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowTotals {
    pub all: u64,
    pub failed: u64,
}

impl WindowTotals {
    /// Failed share of all observations in whole percent, rounded down.
    pub fn failure_percent(&self) -> u64 {
        if self.all == 0 {
            return 0;
        }
        self.failed.saturating_mul(100) / self.all
    }
}

/// Counts all and failed observations over a trailing window of time buckets.
pub struct TimeBucketedCounter {
    clock: BucketClock,
    all: BucketSeries,
    failed: BucketSeries,
}

impl TimeBucketedCounter {
    pub fn new(clock: BucketClock) -> Self {
        Self {
            clock,
            all: BucketSeries::new(),
            failed: BucketSeries::new(),
        }
    }

    pub fn clock(&self) -> &BucketClock {
        &self.clock
    }

    /// Records one observation at `at`.
    pub fn add(&self, is_failure: bool, at: DateTime<Utc>) {
        let current = self.clock.index_at(at);
        self.all.add(&self.clock, current);
        if is_failure {
            self.failed.add(&self.clock, current);
        }
    }

    /// Observations in the window ending at `at`. Drops expired buckets as a side effect.
    pub fn all_total(&self, at: DateTime<Utc>) -> u64 {
        self.all.total(self.clock.window_at(at))
    }

    /// Failed observations in the window ending at `at`.
    pub fn failed_total(&self, at: DateTime<Utc>) -> u64 {
        self.failed.total(self.clock.window_at(at))
    }

    pub fn totals(&self, at: DateTime<Utc>) -> WindowTotals {
        let window = self.clock.window_at(at);
        WindowTotals {
            all: self.all.total(window.clone()),
            failed: self.failed.total(window),
        }
    }

    /// Number of buckets currently held by the (all, failed) series.
    pub fn retained_buckets(&self) -> (usize, usize) {
        (self.all.retained(), self.failed.retained())
    }
}
