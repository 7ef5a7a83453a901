use std::collections::BTreeSet;
use std::fmt;

/// Outcome of evaluating one node (or the whole tree) for card testing.
///
/// Only [`Verdict::Flagged`] should make a caller reject traffic; every other
/// variant fails open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Not enough observations in the window to judge.
    InsufficientTraffic { observed: u64, required: u64 },
    /// Failures are widespread across all traffic, which points at an outage rather
    /// than targeted probing.
    SystemicFailure { failure_percent: u64 },
    /// Enough traffic and nothing above threshold.
    Clear,
    /// Dimensions whose current values exceed the failure threshold.
    Flagged(BTreeSet<String>),
}

impl Verdict {
    pub fn is_flagged(&self) -> bool {
        matches!(self, Verdict::Flagged(_))
    }

    pub fn flagged_dimensions(&self) -> Option<&BTreeSet<String>> {
        match self {
            Verdict::Flagged(dimensions) => Some(dimensions),
            _ => None,
        }
    }

    pub fn into_flagged(self) -> Option<BTreeSet<String>> {
        match self {
            Verdict::Flagged(dimensions) => Some(dimensions),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::InsufficientTraffic { observed, required } => {
                write!(f, "insufficient traffic ({} of {} observations)", observed, required)
            }
            Verdict::SystemicFailure { failure_percent } => {
                write!(f, "systemic failure ({}% of all requests failed)", failure_percent)
            }
            Verdict::Clear => write!(f, "clear"),
            Verdict::Flagged(dimensions) => {
                let names: Vec<&str> = dimensions.iter().map(String::as_str).collect();
                write!(f, "flagged on {}", names.join(", "))
            }
        }
    }
}
