//! Bandwidth authority aggregator: fuses per-relay scanner measurements into
//! a single bandwidth opinion per relay, steered by a discrete PID controller
//! whose parameters arrive through the live network consensus.

pub mod control;
pub mod highlevel;
pub mod parser;
pub mod writer;
