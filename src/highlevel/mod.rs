//! Aggregation semantics: relay working state, reference averages, the
//! feedback controller, and the per-round orchestration.

pub mod averages;
pub mod containers;
pub mod ingest;
pub mod pid;
pub mod round;

pub use containers::{Node, NodeClass};

/// The guard measurement period is based on the client turnover rate for
/// guard nodes.
pub const GUARD_SAMPLE_RATE: u64 = 2 * 7 * 24 * 60 * 60; // 2wks

/// Keep most measurements in consideration; the newest one wins anyway.
/// The cutoff only stops us from re-reading files forever. It cannot drop
/// much below the guard measurement interval.
pub const MAX_AGE: f64 = (2 * GUARD_SAMPLE_RATE) as f64;

/// If the resultant scan file is older than 1.5 days, something is wrong.
pub const MAX_SCAN_AGE: f64 = 60.0 * 60.0 * 24.0 * 1.5;

/// No relay may claim more than this fraction of the measured network total.
pub const NODE_CAP: f64 = 0.05;

/// Percent of the network we must measure before reporting.
pub const MIN_REPORT: f64 = 60.0;
