//! Per-relay working state for one aggregation round.

use std::fmt;

use crate::parser::consensus::Flag;
use crate::parser::measurement::Measurement;
use crate::parser::vote::Vote;
use crate::parser::RelayId;

/// The four flag-classes relays are grouped into for reference averages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeClass {
    GuardExit,
    Guard,
    Exit,
    Middle,
}

impl NodeClass {
    pub const ALL: [NodeClass; 4] = [
        NodeClass::GuardExit,
        NodeClass::Guard,
        NodeClass::Exit,
        NodeClass::Middle,
    ];

    pub fn index(self) -> usize {
        match self {
            NodeClass::GuardExit => 0,
            NodeClass::Guard => 1,
            NodeClass::Exit => 2,
            NodeClass::Middle => 3,
        }
    }

    pub fn from_flags(flags: &[Flag]) -> NodeClass {
        let guard = flags.contains(&Flag::Guard);
        let exit = flags.contains(&Flag::Exit);
        match (guard, exit) {
            (true, true) => NodeClass::GuardExit,
            (true, false) => NodeClass::Guard,
            (false, true) => NodeClass::Exit,
            (false, false) => NodeClass::Middle,
        }
    }
}

impl fmt::Display for NodeClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            NodeClass::GuardExit => "Guard+Exit",
            NodeClass::Guard => "Guard",
            NodeClass::Exit => "Exit",
            NodeClass::Middle => "Middle",
        })
    }
}

/// A relay's working record during a round: its newest measurement, its
/// consensus flags, and the controller inputs and outputs.
#[derive(Debug)]
pub struct Node {
    pub id: RelayId,
    pub nick: String,
    pub flags: Vec<Flag>,

    // newest measurement
    pub measured_at: f64,
    pub updated_at: f64,
    pub strm_bw: u64,
    pub filt_bw: u64,
    pub ns_bw: u64,
    pub desc_bw: u64,
    pub circ_fail_rate: f64,
    pub strm_fail_rate: f64,
    pub scanner: String,

    // controller state
    pub sbw_ratio: f64,
    pub fbw_ratio: f64,
    pub use_bw: f64,
    pub pid_error: f64,
    pub pid_error_sum: f64,
    pub pid_delta: f64,
    pub pid_bw: f64,
    pub new_bw: f64,
    pub change: f64,
    pub ignore: bool,
}

impl Node {
    pub fn new(id: RelayId) -> Node {
        Node {
            id,
            nick: String::new(),
            flags: Vec::new(),
            measured_at: 0.0,
            updated_at: 0.0,
            strm_bw: 0,
            filt_bw: 0,
            ns_bw: 0,
            desc_bw: 0,
            circ_fail_rate: 0.0,
            strm_fail_rate: 0.0,
            scanner: String::new(),
            sbw_ratio: 0.0,
            fbw_ratio: 0.0,
            use_bw: 0.0,
            pid_error: 0.0,
            pid_error_sum: 0.0,
            pid_delta: 0.0,
            pid_bw: 0.0,
            new_bw: 0.0,
            change: 0.0,
            ignore: false,
        }
    }

    /// Take over a measurement if it is newer than what we have. Ties keep
    /// the first record seen.
    pub fn absorb(&mut self, m: &Measurement, measured_at: f64, scanner: &str) {
        self.nick = m.nick.clone();
        if measured_at > self.measured_at {
            self.measured_at = measured_at;
            self.updated_at = measured_at;
            self.strm_bw = m.strm_bw;
            self.filt_bw = m.filt_bw;
            self.ns_bw = m.ns_bw;
            self.desc_bw = m.desc_bw;
            self.circ_fail_rate = m.circ_fail_rate;
            self.strm_fail_rate = m.strm_fail_rate;
            self.scanner = scanner.to_string();
        }
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn node_class(&self) -> NodeClass {
        NodeClass::from_flags(&self.flags)
    }

    /// Adopt the previous vote's bandwidth and accumulators.
    pub fn copy_vote(&mut self, vote: &Vote) {
        self.new_bw = vote.bw as f64 * 1000.0;
        self.pid_bw = vote.pid_bw;
        self.pid_error_sum = vote.pid_error_sum;
        self.pid_delta = vote.pid_delta;
    }

    /// Re-publish the previous vote unchanged: no new sample this round.
    pub fn revert_to_vote(&mut self, vote: &Vote) {
        self.copy_vote(vote);
        self.pid_error = vote.pid_error;
        self.measured_at = vote.measured_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::measurement::parse_measurement;

    fn measurement(strm: u64) -> Measurement {
        parse_measurement(&format!(
            "node_id=$AA nick=n strm_bw={} filt_bw=2 ns_bw=3 desc_bw=4",
            strm
        ))
        .unwrap()
    }

    #[test]
    fn test_classes_from_flags() {
        assert_eq!(
            NodeClass::from_flags(&[Flag::Guard, Flag::Exit, Flag::Fast]),
            NodeClass::GuardExit
        );
        assert_eq!(NodeClass::from_flags(&[Flag::Guard]), NodeClass::Guard);
        assert_eq!(NodeClass::from_flags(&[Flag::Exit]), NodeClass::Exit);
        assert_eq!(NodeClass::from_flags(&[Flag::Fast]), NodeClass::Middle);
        assert_eq!(NodeClass::from_flags(&[]), NodeClass::Middle);
    }

    #[test]
    fn test_absorb_keeps_newest() {
        let mut node = Node::new(RelayId::from_wire("$AA"));
        node.absorb(&measurement(100), 1000.0, "scanner.1/a");
        node.absorb(&measurement(200), 500.0, "scanner.2/b");
        assert_eq!(node.strm_bw, 100);
        assert_eq!(node.measured_at, 1000.0);
        assert_eq!(node.scanner, "scanner.1/a");

        node.absorb(&measurement(300), 2000.0, "scanner.3/c");
        assert_eq!(node.strm_bw, 300);
        assert_eq!(node.updated_at, 2000.0);
    }

    #[test]
    fn test_absorb_tie_keeps_first() {
        let mut node = Node::new(RelayId::from_wire("$AA"));
        node.absorb(&measurement(100), 1000.0, "scanner.1/a");
        node.absorb(&measurement(200), 1000.0, "scanner.2/b");
        assert_eq!(node.strm_bw, 100);
        assert_eq!(node.scanner, "scanner.1/a");
    }

    #[test]
    fn test_revert_to_vote() {
        let vote = Vote {
            id: RelayId::from_wire("$AA"),
            nick: "n".to_string(),
            bw: 231,
            measured_at: 900.0,
            updated_at: 900.0,
            pid_error: 0.5,
            pid_error_sum: 1.5,
            pid_delta: -0.25,
            pid_bw: 231456.0,
        };
        let mut node = Node::new(RelayId::from_wire("$AA"));
        node.absorb(&measurement(100), 800.0, "scanner.1/a");
        node.revert_to_vote(&vote);
        assert_eq!(node.new_bw, 231000.0);
        assert_eq!(node.pid_bw, 231456.0);
        assert_eq!(node.pid_error, 0.5);
        assert_eq!(node.pid_error_sum, 1.5);
        assert_eq!(node.pid_delta, -0.25);
        assert_eq!(node.measured_at, 900.0);
        // the stale measurement's timestamp stays in updated_at
        assert_eq!(node.updated_at, 800.0);
    }
}
