use std::sync::Arc;
use std::thread;

use cardguard::detection::{BucketClock, TimeBucketedCounter};
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::common::clock::test_epoch;

const RESOLUTION_SECS: i64 = 600;
const WINDOW: i64 = 12;

fn counter() -> TimeBucketedCounter {
    TimeBucketedCounter::new(BucketClock::new(test_epoch(), Duration::minutes(10), 12))
}

fn at_secs(secs: i64) -> DateTime<Utc> {
    test_epoch() + Duration::seconds(secs)
}

/// Reference count: observations whose bucket falls in the window ending at `query`.
fn expected_in_window(observations: &[(i64, bool)], query: i64, failed_only: bool) -> u64 {
    let end = query / RESOLUTION_SECS;
    let start = (end - WINDOW + 1).max(0);
    observations
        .iter()
        .filter(|(secs, is_failure)| {
            let index = secs / RESOLUTION_SECS;
            index >= start && index <= end && (!failed_only || *is_failure)
        })
        .count() as u64
}

#[test]
fn totals_match_reference_window() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut observations: Vec<(i64, bool)> = (0..3_000)
        .map(|_| (rng.gen_range(0..400 * 60), rng.gen_bool(0.3)))
        .collect();
    observations.sort_by_key(|(secs, _)| *secs);

    // Shuffle small runs so writes near bucket boundaries arrive out of order.
    for chunk in observations.chunks_mut(8) {
        chunk.shuffle(&mut rng);
    }

    let counter = counter();
    for (secs, is_failure) in &observations {
        counter.add(*is_failure, at_secs(*secs));
    }

    let last = observations.iter().map(|(secs, _)| *secs).max().unwrap();
    for step in 0..15 {
        let query = last + step * RESOLUTION_SECS;
        let totals = counter.totals(at_secs(query));
        assert_eq!(
            totals.all,
            expected_in_window(&observations, query, false),
            "all total at step {}",
            step
        );
        assert_eq!(
            totals.failed,
            expected_in_window(&observations, query, true),
            "failed total at step {}",
            step
        );
    }

    assert_eq!(counter.retained_buckets(), (0, 0));
}

#[test]
fn retained_buckets_never_exceed_window() {
    let counter = counter();
    for minute in 0..24 * 60 {
        counter.add(minute % 3 == 0, test_epoch() + Duration::minutes(minute));
        let (all, failed) = counter.retained_buckets();
        assert!(all <= WINDOW as usize, "all series grew to {} at {}", all, minute);
        assert!(failed <= WINDOW as usize);
    }
}

#[test]
fn threads_sharing_a_bucket_lose_nothing() {
    let counter = Arc::new(counter());
    let threads = 16;
    let per_thread = 10_000;
    let now = at_secs(90);

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..per_thread {
                    counter.add(false, now);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(counter.all_total(now), (threads * per_thread) as u64);
    assert_eq!(counter.failed_total(now), 0);
    assert_eq!(counter.retained_buckets(), (1, 0));
}
