use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::Duration;
use log::info;
use serde::{Deserialize, Serialize};

use crate::common::exception::DetectorError;

/** Width of one time bucket. */
pub const BUCKET_RESOLUTION_MINUTES: i64 = 10;

/** Number of buckets in the trailing window (12 x 10 minutes = 2 hours). */
pub const WINDOW_BUCKETS: u64 = 12;

/** The first prune cycle runs this long after the epoch. */
pub const FIRST_PRUNE_AFTER_MINUTES: i64 = 70;

/** Prune cycles are spaced by this interval. */
pub const PRUNE_INTERVAL_MINUTES: i64 = 60;

/** Depth of the tree below the root: one level of per-dimension children. */
pub const DEFAULT_DEPTH_BUDGET: usize = 1;

/** Root needs at least this many observations before anything can be flagged. */
pub const ROOT_MIN_OBSERVATIONS: u64 = 100;

/** Above this global failure percentage the failures are treated as a systemic outage. */
pub const ROOT_MAX_FAILURE_PERCENT: u64 = 70;

/** A single dimension value needs at least this many observations to be judged. */
pub const LEAF_MIN_OBSERVATIONS: u64 = 6;

/** A dimension value at or above this failure percentage is flagged. */
pub const LEAF_FAILURE_PERCENT: u64 = 85;

pub const ROOT_KEY: &str = "Operation";
pub const DEFAULT_OPERATION: &str = "AddCreditCard";
pub const IP_ADDRESS_DIMENSION: &str = "IPAddress";
pub const ACCOUNT_ID_DIMENSION: &str = "AccountId";

/** Flight that turns off the root's systemic-failure suppression. */
pub const DISABLE_BASELINE_CHECK_FLIGHT: &str = "PXRateLimitDisableBaselineCheck";

/// Thresholds applied by [`crate::detection::dimension_node::DimensionNode::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionPolicy {
    pub root_min_observations: u64,
    pub root_max_failure_percent: u64,
    pub leaf_min_observations: u64,
    pub leaf_failure_percent: u64,
    pub disable_baseline_flight: String,
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self {
            root_min_observations: ROOT_MIN_OBSERVATIONS,
            root_max_failure_percent: ROOT_MAX_FAILURE_PERCENT,
            leaf_min_observations: LEAF_MIN_OBSERVATIONS,
            leaf_failure_percent: LEAF_FAILURE_PERCENT,
            disable_baseline_flight: DISABLE_BASELINE_CHECK_FLIGHT.to_string(),
        }
    }
}

impl DetectionPolicy {
    /// True when `flights` carries the toggle that disables the baseline check.
    /// Flight names compare ASCII case-insensitively.
    pub fn baseline_check_disabled<S: AsRef<str>>(&self, flights: &[S]) -> bool {
        flights
            .iter()
            .any(|flight| flight.as_ref().eq_ignore_ascii_case(&self.disable_baseline_flight))
    }
}

/// Configuration options for a [`crate::detection::detector::Detector`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Name of the protected operation; becomes the root node's value.
    pub operation: String,
    /// Dimensions aggregated below the root, e.g. `["IPAddress", "AccountId"]`.
    pub dimensions: Vec<String>,
    pub depth_budget: usize,
    pub bucket_resolution_minutes: i64,
    pub window_buckets: u64,
    pub first_prune_after_minutes: i64,
    pub prune_interval_minutes: i64,
    pub policy: DetectionPolicy,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            operation: DEFAULT_OPERATION.to_string(),
            dimensions: vec![
                IP_ADDRESS_DIMENSION.to_string(),
                ACCOUNT_ID_DIMENSION.to_string(),
            ],
            depth_budget: DEFAULT_DEPTH_BUDGET,
            bucket_resolution_minutes: BUCKET_RESOLUTION_MINUTES,
            window_buckets: WINDOW_BUCKETS,
            first_prune_after_minutes: FIRST_PRUNE_AFTER_MINUTES,
            prune_interval_minutes: PRUNE_INTERVAL_MINUTES,
            policy: DetectionPolicy::default(),
        }
    }
}

impl DetectorConfig {
    /// Reads a TOML file. Missing keys fall back to the defaults above.
    pub fn load(path: &Path) -> Result<Self, DetectorError> {
        let contents = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        info!("Loaded detector config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, DetectorError> {
        let config: DetectorConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.operation.is_empty() {
            return Err(DetectorError::EmptyKeyValue(ROOT_KEY.to_string()));
        }
        check_minutes("bucket_resolution_minutes", self.bucket_resolution_minutes, 1)?;
        check_minutes("first_prune_after_minutes", self.first_prune_after_minutes, 0)?;
        check_minutes("prune_interval_minutes", self.prune_interval_minutes, 1)?;
        if self.window_buckets == 0 {
            return Err(DetectorError::InvalidConfig(
                "window_buckets must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.dimensions.len());
        for dimension in &self.dimensions {
            if dimension.is_empty() {
                return Err(DetectorError::EmptyDimensionName);
            }
            if !seen.insert(dimension.as_str()) {
                return Err(DetectorError::DuplicateDimension(dimension.clone()));
            }
        }
        Ok(())
    }

    // The accessors below assume `validate` has passed.

    pub fn bucket_resolution(&self) -> Duration {
        Duration::minutes(self.bucket_resolution_minutes)
    }

    pub fn first_prune_after(&self) -> Duration {
        Duration::minutes(self.first_prune_after_minutes)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::minutes(self.prune_interval_minutes)
    }
}

/// Rejects minute values below `min` or too large for a `Duration`.
fn check_minutes(name: &str, minutes: i64, min: i64) -> Result<(), DetectorError> {
    if minutes < min {
        return Err(DetectorError::InvalidConfig(format!(
            "{} must be at least {}, got {}",
            name, min, minutes
        )));
    }
    if Duration::try_minutes(minutes).is_none() {
        return Err(DetectorError::InvalidConfig(format!(
            "{} is out of range, got {}",
            name, minutes
        )));
    }
    Ok(())
}
