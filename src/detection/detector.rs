use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use parking_lot::Mutex;

use crate::common::config::{DetectorConfig, ROOT_KEY};
use crate::common::exception::DetectorError;
use crate::common::time::{SystemTimeSource, TimeSource};
use crate::detection::dimension_node::{DimensionNode, Dimensions};
use crate::detection::time_bucketed_counter::BucketClock;
use crate::detection::verdict::Verdict;

/// Point-in-time view of the tree, for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStats {
    /// Children under the root, per tracked dimension.
    pub children: BTreeMap<String, usize>,
    /// Root plus all descendants.
    pub node_count: usize,
    pub next_prune_at: DateTime<Utc>,
}

/// Card-testing detector for one protected operation.
///
/// Owns the aggregation tree and a fixed epoch shared by every counter in it. Idle
/// children are pruned from within [`Detector::add_data`] once the prune watermark
/// has passed, so no background thread is needed.
pub struct Detector {
    config: DetectorConfig,
    clock: BucketClock,
    root: DimensionNode,
    prune_interval: Duration,
    next_prune_at: Mutex<DateTime<Utc>>,
    // Mirror of `next_prune_at` for the unlocked check on every add.
    next_prune_at_ms: AtomicI64,
    time_source: Arc<dyn TimeSource>,
}

impl Detector {
    /// Creates a detector whose epoch is the current system time.
    pub fn new(config: DetectorConfig) -> Result<Self, DetectorError> {
        Self::with_time_source(config, Arc::new(SystemTimeSource))
    }

    /// Creates a detector reading "now" from `time_source`. The epoch is captured once here.
    pub fn with_time_source(
        config: DetectorConfig,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self, DetectorError> {
        config.validate()?;

        let epoch = time_source.now();
        let clock = BucketClock::new(epoch, config.bucket_resolution(), config.window_buckets);
        let root = DimensionNode::new_root(
            ROOT_KEY,
            &config.operation,
            &config.dimensions,
            config.depth_budget,
            clock,
        )?;
        let next_prune_at = epoch
            .checked_add_signed(config.first_prune_after())
            .ok_or_else(|| {
                DetectorError::InvalidConfig(format!(
                    "first prune {} minutes after {} is out of range",
                    config.first_prune_after_minutes, epoch
                ))
            })?;

        info!(
            "Detector for {}={} tracking {:?} (depth {}), epoch {}, first prune at {}",
            ROOT_KEY, config.operation, config.dimensions, config.depth_budget, epoch, next_prune_at
        );

        Ok(Self {
            prune_interval: config.prune_interval(),
            config,
            clock,
            root,
            next_prune_at: Mutex::new(next_prune_at),
            next_prune_at_ms: AtomicI64::new(next_prune_at.timestamp_millis()),
            time_source,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.clock.epoch()
    }

    pub fn root(&self) -> &DimensionNode {
        &self.root
    }

    pub fn next_prune_at(&self) -> DateTime<Utc> {
        *self.next_prune_at.lock()
    }

    /// Records the outcome of one request at the current time.
    pub fn add_data(&self, data: &Dimensions, is_bad_request: bool) {
        self.add_data_at(data, is_bad_request, self.time_source.now());
    }

    /// Records the outcome of one request at `at`.
    pub fn add_data_at(&self, data: &Dimensions, is_bad_request: bool, at: DateTime<Utc>) {
        self.root.add_data(data, is_bad_request, at);
        self.maybe_prune(at);
    }

    fn maybe_prune(&self, at: DateTime<Utc>) {
        if at.timestamp_millis() <= self.next_prune_at_ms.load(Ordering::Acquire) {
            return;
        }

        let mut next_prune_at = self.next_prune_at.lock();
        // Another thread may have pruned while we waited.
        if at <= *next_prune_at {
            return;
        }
        // Saturates so a huge interval stops further cycles instead of overflowing.
        *next_prune_at = next_prune_at
            .checked_add_signed(self.prune_interval)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.next_prune_at_ms
            .store(next_prune_at.timestamp_millis(), Ordering::Release);

        let removed = self.root.prune_tree(at);
        info!(
            "Prune cycle at {} removed {} idle children, next cycle at {}",
            at, removed, *next_prune_at
        );
    }

    /// Runs a prune cycle now, independent of the schedule. Returns the number of
    /// removed children.
    pub fn prune_at(&self, at: DateTime<Utc>) -> usize {
        let removed = self.root.prune_tree(at);
        debug!("Explicit prune at {} removed {} idle children", at, removed);
        removed
    }

    /// Dimensions currently flagged for `data`; empty when the request looks normal.
    pub fn is_card_testing<S: AsRef<str>>(&self, data: &Dimensions, flights: &[S]) -> BTreeSet<String> {
        self.is_card_testing_at(data, flights, self.time_source.now())
    }

    pub fn is_card_testing_at<S: AsRef<str>>(
        &self,
        data: &Dimensions,
        flights: &[S],
        at: DateTime<Utc>,
    ) -> BTreeSet<String> {
        self.evaluate_at(data, flights, at)
            .into_flagged()
            .unwrap_or_default()
    }

    /// Like [`Detector::is_card_testing`], but says why nothing was flagged.
    pub fn evaluate<S: AsRef<str>>(&self, data: &Dimensions, flights: &[S]) -> Verdict {
        self.evaluate_at(data, flights, self.time_source.now())
    }

    pub fn evaluate_at<S: AsRef<str>>(
        &self,
        data: &Dimensions,
        flights: &[S],
        at: DateTime<Utc>,
    ) -> Verdict {
        let verdict = self.root.evaluate(data, flights, at, &self.config.policy);
        debug!("Evaluated {:?}: {}", data, verdict);
        verdict
    }

    pub fn stats(&self) -> TreeStats {
        let children = self
            .root
            .tracked_dimensions()
            .map(|dimension| {
                let count = self.root.child_count(dimension).unwrap_or(0);
                (dimension.to_string(), count)
            })
            .collect();

        TreeStats {
            children,
            node_count: self.root.node_count(),
            next_prune_at: self.next_prune_at(),
        }
    }
}
