//! The previous round's vote file, read back for PID state.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use super::kv::parse_kv_line;
use super::{ParseError, RelayId};

/// One relay's entry from the previous vote. `bw` is the published integer in
/// kilobytes; `pid_bw` is the raw controller output before rounding.
#[derive(Debug, Clone)]
pub struct Vote {
    pub id: RelayId,
    pub nick: String,
    pub bw: u64,
    pub measured_at: f64,
    pub updated_at: f64,
    pub pid_error: f64,
    pub pid_error_sum: f64,
    pub pid_delta: f64,
    pub pid_bw: f64,
}

pub fn parse_vote(line: &str) -> Result<Vote, ParseError> {
    let mut id = None;
    let mut nick = None;
    let mut bw = None;
    let mut measured_at = None;
    let mut updated_at = None;
    let mut pid_error = None;
    let mut pid_error_sum = None;
    let mut pid_delta = None;
    let mut pid_bw = None;
    let mut pid_w = None;

    for (key, value) in parse_kv_line(line)? {
        match key {
            "node_id" => id = Some(RelayId::from_wire(value)),
            "nick" => nick = Some(value.to_string()),
            "bw" => bw = Some(value.parse::<u64>()?),
            "measured_at" => measured_at = Some(value.parse::<i64>()? as f64),
            // PID state is optional: a vote written before feedback was
            // enabled simply has none, and a half-present or unparseable
            // group counts as absent.
            "updated_at" => updated_at = value.parse::<i64>().ok().map(|v| v as f64),
            "pid_error" => pid_error = value.parse::<f64>().ok(),
            "pid_error_sum" => pid_error_sum = value.parse::<f64>().ok(),
            "pid_delta" => pid_delta = value.parse::<f64>().ok(),
            // our own output carries the controller bandwidth truncated to an
            // integer under the pid_w key
            "pid_bw" => pid_bw = value.parse::<f64>().ok(),
            "pid_w" => pid_w = value.parse::<f64>().ok(),
            _ => {}
        }
    }
    let pid_bw = pid_bw.or(pid_w);

    let id = id.ok_or(ParseError::FieldMissing { field: "node_id" })?;
    let nick = nick.ok_or(ParseError::FieldMissing { field: "nick" })?;
    let bw = bw.ok_or(ParseError::FieldMissing { field: "bw" })?;
    let measured_at = measured_at.ok_or(ParseError::FieldMissing {
        field: "measured_at",
    })?;

    let (pid_error, pid_error_sum, pid_delta, pid_bw) =
        match (pid_error, pid_error_sum, pid_delta, pid_bw) {
            (Some(e), Some(s), Some(d), Some(b)) => (e, s, d, b),
            _ => {
                info!("No previous PID data for {}={}", nick, id);
                (0.0, 0.0, 0.0, bw as f64)
            }
        };

    let updated_at = updated_at.unwrap_or_else(|| {
        debug!("No updated_at field for {}={}", nick, id);
        measured_at
    });

    Ok(Vote {
        id,
        nick,
        bw,
        measured_at,
        updated_at,
        pid_error,
        pid_error_sum,
        pid_delta,
        pid_bw,
    })
}

/// The previous vote, indexed by relay identity.
#[derive(Debug, Default)]
pub struct VoteSet {
    votes: HashMap<RelayId, Vote>,
}

impl VoteSet {
    /// Read the previous vote file. A missing or unreadable file is the
    /// first-ever round (or corruption recovery) and yields an empty set.
    pub fn load(path: &Path) -> VoteSet {
        match fs::read_to_string(path) {
            Ok(text) => VoteSet::parse(&text),
            Err(_) => {
                info!("No previous vote data.");
                VoteSet::default()
            }
        }
    }

    /// Parse vote file content. The first line is the scan age and is
    /// skipped; lines that do not parse are dropped.
    pub fn parse(text: &str) -> VoteSet {
        let mut votes = HashMap::new();
        for line in text.lines().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            match parse_vote(line) {
                Ok(vote) => {
                    votes.insert(vote.id.clone(), vote);
                }
                Err(e) => {
                    warn!("Skipping unreadable vote line ({}): {}", e, line);
                }
            }
        }
        VoteSet { votes }
    }

    pub fn get(&self, id: &RelayId) -> Option<&Vote> {
        self.votes.get(id)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_vote_line() {
        let v = parse_vote(
            "node_id=$DB8C6D8E0D51A42BDDA81A9B8A735B41B2CF95D1 bw=231 nick=rainbowwarrior \
             measured_at=1319822504 updated_at=1319822604 pid_error=0.25 \
             pid_error_sum=-1.5 pid_w=230999 pid_delta=0.125",
        )
        .unwrap();
        assert_eq!(v.bw, 231);
        assert_eq!(v.measured_at, 1319822504.0);
        assert_eq!(v.updated_at, 1319822604.0);
        assert_eq!(v.pid_error, 0.25);
        assert_eq!(v.pid_error_sum, -1.5);
        assert_eq!(v.pid_delta, 0.125);
        assert_eq!(v.pid_bw, 230999.0);
    }

    #[test]
    fn test_explicit_pid_bw_wins_over_pid_w() {
        let v = parse_vote(
            "node_id=$AB bw=231 nick=n measured_at=1 pid_error=0.1 \
             pid_error_sum=0.2 pid_w=230999 pid_delta=0.3 pid_bw=231456.75",
        )
        .unwrap();
        assert_eq!(v.pid_bw, 231456.75);
    }

    #[test]
    fn test_missing_pid_state_initialized() {
        let v = parse_vote("node_id=$AB bw=500 nick=old measured_at=1000").unwrap();
        assert_eq!(v.pid_bw, 500.0);
        assert_eq!(v.pid_error, 0.0);
        assert_eq!(v.pid_error_sum, 0.0);
        assert_eq!(v.pid_delta, 0.0);
    }

    #[test]
    fn test_partial_pid_state_counts_as_absent() {
        let v = parse_vote("node_id=$AB bw=500 nick=old measured_at=1000 pid_error=0.5")
            .unwrap();
        assert_eq!(v.pid_error, 0.0);
        assert_eq!(v.pid_bw, 500.0);
    }

    #[test]
    fn test_missing_updated_at_defaults_to_measured_at() {
        let v = parse_vote("node_id=$AB bw=1 nick=n measured_at=42").unwrap();
        assert_eq!(v.updated_at, 42.0);
    }

    #[test]
    fn test_vote_set_skips_header_and_bad_lines() {
        let text = "1319822504\n\
                    node_id=$AA bw=100 nick=a measured_at=10\n\
                    complete garbage here\n\
                    node_id=$BB bw=200 nick=b measured_at=20\n";
        let set = VoteSet::parse(text);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(&RelayId::from_wire("$AA")).unwrap().bw, 100);
        assert_eq!(set.get(&RelayId::from_wire("BB")).unwrap().bw, 200);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let set = VoteSet::load(Path::new("/nonexistent/bwauth-vote-file"));
        assert!(set.is_empty());
    }
}
