//! `cardguard`: in-process card-testing detection for a payment gateway.
//!
//! Every completed request is recorded against the dimension values it carried
//! (source address, account id, ...). A query asks whether any of those values is
//! currently failing far more often than the rest of the traffic.
//!
//! - [`detection::time_bucketed_counter`]: windowed all/failed counters with an
//!   atomic fast path.
//! - [`detection::dimension_node`]: the lazily built aggregation tree and the
//!   root/per-dimension detection rules.
//! - [`detection::detector`]: the owned facade with scheduled pruning.
pub mod common;
pub mod detection;
