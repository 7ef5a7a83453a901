use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;

use crate::common::config::DetectionPolicy;
use crate::common::exception::DetectorError;
use crate::detection::time_bucketed_counter::{BucketClock, TimeBucketedCounter};
use crate::detection::verdict::Verdict;

/// Dimension name to observed value for one request, e.g. `IPAddress -> 10.1.2.3`.
pub type Dimensions = HashMap<String, String>;

/// Which detection rule a node applies. Fixed when the node is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Top of the tree: guards the whole protected operation with a traffic baseline.
    Root,
    /// Reached through one concrete dimension value: applies the per-value threshold.
    Dimension,
}

/// One slice of the aggregation tree.
///
/// A node counts every observation routed to it and, while it still has depth
/// budget, fans observations out to one child per observed value of each dimension
/// it tracks. Children are built on first sight of a value and owned by their
/// parent's map; a child tracks its parent's dimensions minus the one used to reach it.
pub struct DimensionNode {
    key: String,
    value: String,
    role: NodeRole,
    depth_budget: usize,
    counter: TimeBucketedCounter,
    children: BTreeMap<String, DashMap<String, DimensionNode>>,
}

impl DimensionNode {
    /// Builds the root of a tree.
    ///
    /// # Errors
    ///
    /// Fails when `value` is empty, a dimension name is empty, or a dimension is
    /// listed twice.
    pub fn new_root<S: AsRef<str>>(
        key: &str,
        value: &str,
        dimensions: &[S],
        depth_budget: usize,
        clock: BucketClock,
    ) -> Result<Self, DetectorError> {
        if value.is_empty() {
            return Err(DetectorError::EmptyKeyValue(key.to_string()));
        }

        let mut seen = HashSet::with_capacity(dimensions.len());
        for dimension in dimensions {
            let dimension = dimension.as_ref();
            if dimension.is_empty() {
                return Err(DetectorError::EmptyDimensionName);
            }
            if !seen.insert(dimension) {
                return Err(DetectorError::DuplicateDimension(dimension.to_string()));
            }
        }

        Ok(Self::build(
            key.to_string(),
            value.to_string(),
            NodeRole::Root,
            dimensions.iter().map(|d| d.as_ref().to_string()),
            depth_budget,
            clock,
        ))
    }

    fn build(
        key: String,
        value: String,
        role: NodeRole,
        dimensions: impl Iterator<Item = String>,
        depth_budget: usize,
        clock: BucketClock,
    ) -> Self {
        let children = if depth_budget > 0 {
            dimensions.map(|dimension| (dimension, DashMap::new())).collect()
        } else {
            BTreeMap::new()
        };

        Self {
            key,
            value,
            role,
            depth_budget,
            counter: TimeBucketedCounter::new(clock),
            children,
        }
    }

    fn spawn_child(&self, dimension: &str, value: &str) -> DimensionNode {
        debug!(
            "Creating child {}={} under {}={}",
            dimension, value, self.key, self.value
        );
        let remaining = self
            .children
            .keys()
            .filter(|tracked| tracked.as_str() != dimension)
            .cloned();
        Self::build(
            dimension.to_string(),
            value.to_string(),
            NodeRole::Dimension,
            remaining,
            self.depth_budget.saturating_sub(1),
            *self.counter.clock(),
        )
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn depth_budget(&self) -> usize {
        self.depth_budget
    }

    pub fn counter(&self) -> &TimeBucketedCounter {
        &self.counter
    }

    /// Dimensions this node builds children for, in name order.
    pub fn tracked_dimensions(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    /// Number of children under `dimension`, or `None` if the dimension is not tracked.
    pub fn child_count(&self, dimension: &str) -> Option<usize> {
        self.children.get(dimension).map(DashMap::len)
    }

    pub fn has_child(&self, dimension: &str, value: &str) -> bool {
        self.children
            .get(dimension)
            .map_or(false, |children| children.contains_key(value))
    }

    /// Runs `f` against the child for `dimension=value` if it exists.
    pub fn with_child<R>(
        &self,
        dimension: &str,
        value: &str,
        f: impl FnOnce(&DimensionNode) -> R,
    ) -> Option<R> {
        let children = self.children.get(dimension)?;
        let child = children.get(value)?;
        Some(f(child.value()))
    }

    /// This node plus every descendant.
    pub fn node_count(&self) -> usize {
        1 + self
            .children
            .values()
            .map(|children| children.iter().map(|child| child.node_count()).sum::<usize>())
            .sum::<usize>()
    }

    /// Records one observation here and in every matching descendant.
    ///
    /// Dimensions missing from `data` are skipped, so that branch of the tree is
    /// simply not updated.
    pub fn add_data(&self, data: &Dimensions, is_failure: bool, at: DateTime<Utc>) {
        self.counter.add(is_failure, at);

        for (dimension, children) in &self.children {
            let value = match data.get(dimension) {
                Some(value) => value,
                None => continue,
            };

            if let Some(child) = children.get(value) {
                child.add_data(data, is_failure, at);
                continue;
            }

            // Only the insert needs the shard's write lock; recurse under a read lock.
            let child = children
                .entry(value.clone())
                .or_insert_with(|| self.spawn_child(dimension, value))
                .downgrade();
            child.add_data(data, is_failure, at);
        }
    }

    /// Applies this node's detection rule to the window ending at `at`.
    pub fn evaluate<S: AsRef<str>>(
        &self,
        data: &Dimensions,
        flights: &[S],
        at: DateTime<Utc>,
        policy: &DetectionPolicy,
    ) -> Verdict {
        match self.role {
            NodeRole::Root => self.evaluate_root(data, flights, at, policy),
            NodeRole::Dimension => self.evaluate_dimension(at, policy),
        }
    }

    /// Dimension names flagged for `data`, or `None` when nothing is flagged.
    pub fn is_card_testing<S: AsRef<str>>(
        &self,
        data: &Dimensions,
        flights: &[S],
        at: DateTime<Utc>,
        policy: &DetectionPolicy,
    ) -> Option<BTreeSet<String>> {
        self.evaluate(data, flights, at, policy).into_flagged()
    }

    fn evaluate_root<S: AsRef<str>>(
        &self,
        data: &Dimensions,
        flights: &[S],
        at: DateTime<Utc>,
        policy: &DetectionPolicy,
    ) -> Verdict {
        let all = self.counter.all_total(at);
        if all == 0 || all < policy.root_min_observations {
            return Verdict::InsufficientTraffic {
                observed: all,
                required: policy.root_min_observations,
            };
        }

        if !policy.baseline_check_disabled(flights) {
            let failure_percent = self.counter.failed_total(at).saturating_mul(100) / all;
            if failure_percent > policy.root_max_failure_percent {
                debug!(
                    "{}={} failing at {}% overall, skipping per-dimension checks",
                    self.key, self.value, failure_percent
                );
                return Verdict::SystemicFailure { failure_percent };
            }
        }

        let mut flagged = BTreeSet::new();
        for (dimension, children) in &self.children {
            let value = match data.get(dimension) {
                Some(value) => value,
                None => continue,
            };
            if let Some(child) = children.get(value) {
                if let Verdict::Flagged(dimensions) = child.evaluate(data, flights, at, policy) {
                    flagged.extend(dimensions);
                }
            }
        }

        if flagged.is_empty() {
            Verdict::Clear
        } else {
            Verdict::Flagged(flagged)
        }
    }

    fn evaluate_dimension(&self, at: DateTime<Utc>, policy: &DetectionPolicy) -> Verdict {
        let all = self.counter.all_total(at);
        if all == 0 || all < policy.leaf_min_observations {
            return Verdict::InsufficientTraffic {
                observed: all,
                required: policy.leaf_min_observations,
            };
        }

        let failure_percent = self.counter.failed_total(at).saturating_mul(100) / all;
        if failure_percent >= policy.leaf_failure_percent {
            debug!(
                "{}={} flagged: {}% of {} requests failed",
                self.key, self.value, failure_percent, all
            );
            Verdict::Flagged(BTreeSet::from([self.key.clone()]))
        } else {
            Verdict::Clear
        }
    }

    /// Removes direct children with no observations in the window ending at `at`.
    ///
    /// Only direct children are inspected: an idle grandchild under an active child
    /// stays until its parent goes idle too. Returns the number of removed children.
    pub fn prune_tree(&self, at: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for (dimension, children) in &self.children {
            children.retain(|_, child| {
                let keep = child.counter.all_total(at) > 0;
                if !keep {
                    removed += 1;
                }
                keep
            });
            debug!(
                "Pruned {} under {}={}: {} children left",
                dimension,
                self.key,
                self.value,
                children.len()
            );
        }
        removed
    }
}
