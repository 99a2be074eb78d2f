//! Parsers for the textual formats the aggregator consumes.

// other local modules
mod error;
pub use error::ParseError;

mod id;
pub use id::RelayId;

pub mod kv;

pub mod consensus;
pub mod measurement;
pub mod vote;
