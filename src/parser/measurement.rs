//! Scanner measurement files ("done" files).
//!
//! Each file starts with two header lines (a slice identifier and a unix
//! timestamp), followed by one `key=value` record per measured relay.

use derive_builder::Builder;

use super::kv::parse_kv_line;
use super::{ParseError, RelayId};

/// One relay measurement as reported by a scanner. Bandwidths are bytes/s.
#[derive(Debug, Clone, Builder)]
pub struct Measurement {
    pub node_id: RelayId,
    pub nick: String,
    pub strm_bw: u64,
    pub filt_bw: u64,
    pub ns_bw: u64,
    pub desc_bw: u64,
    #[builder(default)]
    pub circ_fail_rate: f64,
    #[builder(default)]
    pub strm_fail_rate: f64,
}

/// The two header lines of a scanner done-file.
#[derive(Debug, Clone)]
pub struct ScanHeader {
    pub slice: String,
    pub timestamp: f64,
}

impl ScanHeader {
    pub fn parse(text: &str) -> Result<ScanHeader, ParseError> {
        let mut lines = text.lines();
        let slice = lines.next().ok_or(ParseError::TruncatedScanFile)?;
        let ts = lines.next().ok_or(ParseError::TruncatedScanFile)?;
        let timestamp = ts
            .trim()
            .parse::<f64>()
            .map_err(|_| ParseError::InvalidTimestamp)?;
        Ok(ScanHeader {
            slice: slice.trim().to_string(),
            timestamp,
        })
    }
}

pub fn parse_measurement(line: &str) -> Result<Measurement, ParseError> {
    let mut relay = MeasurementBuilder::default();
    for (key, value) in parse_kv_line(line)? {
        match key {
            "node_id" => {
                relay.node_id(RelayId::from_wire(value));
            }
            "nick" => {
                relay.nick(value.to_string());
            }
            "strm_bw" => {
                relay.strm_bw(value.parse()?);
            }
            "filt_bw" => {
                relay.filt_bw(value.parse()?);
            }
            "ns_bw" => {
                relay.ns_bw(value.parse()?);
            }
            "desc_bw" => {
                relay.desc_bw(value.parse()?);
            }
            "circ_fail_rate" => {
                relay.circ_fail_rate(value.parse()?);
            }
            "strm_fail_rate" => {
                relay.strm_fail_rate(value.parse()?);
            }
            _ => {}
        }
    }
    Ok(relay.build()?)
}
