pub mod detector;
pub mod dimension_node;
pub mod time_bucketed_counter;
pub mod verdict;

pub use detector::{Detector, TreeStats};
pub use dimension_node::{DimensionNode, Dimensions, NodeRole};
pub use time_bucketed_counter::{BucketClock, TimeBucketedCounter, WindowTotals};
pub use verdict::Verdict;
