//! One aggregation round: join measurements with the consensus, run the
//! controller over every relay, enforce the output invariants, and order the
//! result for emission.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::offset::TimeZone;
use chrono::{LocalResult, Utc};
use itertools::Itertools;
use thiserror;
use tracing::{debug, info, trace, warn};

use super::averages::Averages;
use super::containers::{Node, NodeClass};
use super::ingest::ScanData;
use super::pid;
use super::{MAX_SCAN_AGE, MIN_REPORT, NODE_CAP};
use crate::parser::consensus::{ConsensusDoc, Flag};
use crate::parser::vote::VoteSet;
use crate::parser::RelayId;

#[derive(thiserror::Error, Debug)]
pub enum RoundError {
    #[error("No scan results yet")]
    NoScanResults,
    #[error("Measured only {measured_pct}% of the network, need {min}%")]
    InsufficientCoverage { measured_pct: f64, min: f64 },
    #[error("The consensus does not provide relay bandwidths")]
    MissingConsensusBandwidths,
}

/// The finished round, ready for emission.
#[derive(Debug)]
pub struct RoundSummary {
    /// Newest scanner timestamp, the vote file's first line.
    pub scan_age: i64,
    /// All measured relays, ordered by descending `pid_error`.
    pub nodes: Vec<Node>,
    pub measured_pct: f64,
    pub measured_bw_pct: f64,
}

/// All inputs of one aggregation round, threaded through as a single value.
pub struct Round {
    nodes: HashMap<RelayId, Node>,
    scanner_timestamps: BTreeMap<String, f64>,
    consensus: ConsensusDoc,
    votes: VoteSet,
    ignore_guards: bool,
    now: f64,
}

impl Round {
    pub fn new(
        scan: ScanData,
        consensus: ConsensusDoc,
        votes: VoteSet,
        ignore_guards: bool,
        now: f64,
    ) -> Round {
        Round {
            nodes: scan.nodes,
            scanner_timestamps: scan.scanner_timestamps,
            consensus,
            votes,
            ignore_guards,
            now,
        }
    }

    /// Run the controller over every measured relay. `descriptor_bw` is
    /// consulted for unmeasured relays to decide whether they are alive and
    /// what bandwidth to charge against the coverage metrics.
    pub fn run(
        self,
        mut descriptor_bw: impl FnMut(&RelayId) -> Option<u64>,
    ) -> Result<RoundSummary, RoundError> {
        let Round {
            mut nodes,
            scanner_timestamps,
            mut consensus,
            votes,
            ignore_guards,
            now,
        } = self;

        if nodes.is_empty() {
            info!("No scan results yet.");
            return Err(RoundError::NoScanResults);
        }

        // measured relays take their flags from the current consensus
        for node in nodes.values_mut() {
            if let Some(entry) = consensus.relays.get(&node.id) {
                node.flags = entry.flags.clone();
            }
        }

        let params = consensus.params.clone();
        if params.pid_control {
            debug!("PID control enabled");
        } else {
            debug!("PID control disabled");
        }
        debug!(
            "Got K_p={} K_i={} K_d={} K_i_decay={}",
            params.k_p, params.k_i, params.k_d, params.k_i_decay
        );

        let avgs = Averages::compute(&nodes, &params);
        if params.pid_control {
            log_measure_intervals(&nodes, &votes, &consensus);
        }

        // the controller pass
        let wgd = consensus.weights.wgd();
        let mut tot_net_bw = 0.0f64;
        for node in nodes.values_mut() {
            let class_avgs = avgs.class(node.node_class());
            node.fbw_ratio = node.filt_bw as f64 / class_avgs.filt;
            node.sbw_ratio = node.strm_bw as f64 / class_avgs.strm;

            if params.pid_control {
                pid::feedback(node, &params, wgd, class_avgs, votes.get(&node.id));
            } else {
                pid::ratio_feedback(node);
            }
            node.change = node.new_bw - node.desc_bw as f64;

            match consensus.relays.get_mut(&node.id) {
                Some(entry) => {
                    if entry.bandwidth.is_some() {
                        entry.measured = true;
                        tot_net_bw += node.new_bw;
                    }
                    if ignore_guards
                        && entry.has_flag(Flag::Guard)
                        && !entry.has_flag(Flag::Exit)
                    {
                        debug!("Skipping voting for guard {}", node.nick);
                        node.ignore = true;
                    } else if entry.has_flag(Flag::Authority) {
                        trace!("Skipping voting for authority {}", node.nick);
                        node.ignore = true;
                    }
                }
                None => {
                    // a relay no longer in the consensus cannot be voted on
                    debug!("Skipping voting for unlisted relay {}", node.nick);
                    node.ignore = true;
                }
            }
        }

        // enforce the output bounds
        for node in nodes.values_mut() {
            if node.new_bw >= i32::MAX as f64 {
                warn!(
                    "Bandwidth of {} node {}={} exceeded maxint32: {}",
                    node.node_class(),
                    node.nick,
                    node.id,
                    node.new_bw
                );
                node.new_bw = i32::MAX as f64;
            }
            if node.new_bw <= 0.0 {
                debug!(
                    "{} node {}={} has bandwidth <= 0: {}",
                    node.node_class(),
                    node.nick,
                    node.id,
                    node.new_bw
                );
                node.new_bw = 1.0;
            }
            if node.new_bw > tot_net_bw * NODE_CAP {
                debug!(
                    "Clipping extremely fast {} node {}={} at {}% of network capacity \
                     ({}->{}) pid_error={} pid_error_sum={}",
                    node.node_class(),
                    node.id,
                    node.nick,
                    100.0 * NODE_CAP,
                    node.new_bw,
                    (tot_net_bw * NODE_CAP) as i64,
                    node.pid_error,
                    node.pid_error_sum
                );
                node.new_bw = (tot_net_bw * NODE_CAP).floor();
                // don't let unused error accumulate
                node.pid_error_sum = 0.0;
            }
            if params.t_i > 0.0 && params.t_i_decay > 0.0 {
                let excursion = 2.0 * params.t_i * node.pid_error / params.t_i_decay;
                if node.pid_error_sum.abs() > excursion.abs() {
                    info!(
                        "Large pid_error_sum for node {}={}: {} vs {}",
                        node.id, node.nick, node.pid_error_sum, node.pid_error
                    );
                }
            }
        }

        let oldest_measured = nodes
            .values()
            .filter(|n| consensus.relays.contains_key(&n.id))
            .map(|n| n.measured_at)
            .fold(f64::INFINITY, f64::min);
        if oldest_measured.is_finite() {
            debug!("Oldest measured node: {}", fmt_time(oldest_measured));
        }
        let oldest_updated = nodes
            .values()
            .filter(|n| consensus.relays.contains_key(&n.id))
            .map(|n| n.updated_at)
            .fold(f64::INFINITY, f64::min);
        if oldest_updated.is_finite() {
            debug!("Oldest updated node: {}", fmt_time(oldest_updated));
        }

        // coverage: how much of the network, by count and by bandwidth,
        // did the scanners reach
        let mut missed_nodes = 0u64;
        let mut missed_bw = 0u64;
        let mut tot_bw = 0u64;
        for entry in consensus.relays.values() {
            if let Some(bw) = entry.bandwidth {
                tot_bw += bw;
            }
            if entry.measured
                || !entry.has_flag(Flag::Fast)
                || !entry.has_flag(Flag::Running)
            {
                continue;
            }
            // a relay with a live descriptor should have been measured;
            // others are likely hibernating or gone
            if let Some(desc_bw) = descriptor_bw(&entry.id) {
                if desc_bw > 0 {
                    missed_nodes += 1;
                    missed_bw += entry.bandwidth.unwrap_or(desc_bw);
                    trace!(
                        "Didn't measure {}={} bw={:?}",
                        entry.id,
                        entry.nick,
                        entry.bandwidth
                    );
                }
            }
        }

        let measured_cnt = nodes.len() as f64;
        let measured_pct = round1(100.0 * measured_cnt / (measured_cnt + missed_nodes as f64));
        let measured_bw_pct = if tot_bw > 0 {
            100.0 - round1(100.0 * missed_bw as f64 / tot_bw as f64)
        } else {
            100.0
        };
        if measured_pct < MIN_REPORT {
            info!(
                "Did not measure {}% of nodes yet ({}%)",
                MIN_REPORT, measured_pct
            );
            return Err(RoundError::InsufficientCoverage {
                measured_pct,
                min: MIN_REPORT,
            });
        }
        if measured_bw_pct < 75.0 {
            warn!(
                "Only measured {}% of the previous consensus bandwidth despite \
                 measuring {}% of the nodes",
                measured_bw_pct, measured_pct
            );
        } else if measured_bw_pct < 95.0 {
            info!(
                "Only measured {}% of the previous consensus bandwidth despite \
                 measuring {}% of the nodes",
                measured_bw_pct, measured_pct
            );
        }

        log_error_averages(&nodes);
        info!(
            "Measured {}% of all tor nodes ({}% of previous consensus bw).",
            measured_pct, measured_bw_pct
        );

        let mut scan_age = 0i64;
        for (scanner, timestamp) in &scanner_timestamps {
            let this_scan_age = timestamp.round() as i64;
            scan_age = scan_age.max(this_scan_age);
            if (this_scan_age as f64) < now - MAX_SCAN_AGE {
                warn!(
                    "Bandwidth scanner {} is stale. Possible dead scanner process. \
                     Timestamp: {}",
                    scanner,
                    fmt_time(*timestamp)
                );
            }
        }

        let nodes: Vec<Node> = nodes
            .into_values()
            .sorted_by(|a, b| b.pid_error.total_cmp(&a.pid_error))
            .collect();

        Ok(RoundSummary {
            scan_age,
            nodes,
            measured_pct,
            measured_bw_pct,
        })
    }
}

/// How often relays get fresh samples, for operators tuning the time
/// constants. Guards are tracked by measurement timestamp since their votes
/// deliberately lag behind.
fn log_measure_intervals(
    nodes: &HashMap<RelayId, Node>,
    votes: &VoteSet,
    consensus: &ConsensusDoc,
) {
    let mut guard_cnt = 0u64;
    let mut node_cnt = 0u64;
    let mut guard_measure_time = 0.0f64;
    let mut node_measure_time = 0.0f64;
    for node in nodes.values() {
        if let (Some(vote), Some(entry)) = (votes.get(&node.id), consensus.relays.get(&node.id))
        {
            if entry.has_flag(Flag::Guard) && !entry.has_flag(Flag::Exit) {
                if node.measured_at != vote.measured_at {
                    guard_cnt += 1;
                    guard_measure_time += node.measured_at - vote.measured_at;
                }
            } else if node.updated_at != vote.updated_at {
                node_cnt += 1;
                node_measure_time += node.updated_at - vote.updated_at;
            }
        }
    }
    if node_cnt > 0 {
        debug!(
            "Avg of {} node update intervals: {:.2} hours",
            node_cnt,
            node_measure_time / node_cnt as f64 / 3600.0
        );
    }
    if guard_cnt > 0 {
        debug!(
            "Avg of {} guard measurement intervals: {:.2} hours",
            guard_cnt,
            guard_measure_time / guard_cnt as f64 / 3600.0
        );
    }
}

fn log_error_averages(nodes: &HashMap<RelayId, Node>) {
    for class in NodeClass::ALL {
        let members = || nodes.values().filter(move |n| n.node_class() == class);
        if let Some(avg) = avg_error(members(), |e| e) {
            debug!("Avg {}  pid_error={}", class, avg);
        }
        if let Some(avg) = avg_error(members(), f64::abs) {
            debug!("Avg {} |pid_error|={}", class, avg);
        }
        if let Some(avg) = avg_error(members().filter(|n| n.pid_error > 0.0), |e| e) {
            debug!("Avg {} +pid_error=+{}", class, avg);
        }
        if let Some(avg) = avg_error(members().filter(|n| n.pid_error < 0.0), |e| e) {
            debug!("Avg {} -pid_error={}", class, avg);
        }
    }

    if let Some(avg) = avg_error(nodes.values(), |e| e) {
        debug!("Avg. Network  pid_error={}", avg);
    }
    if let Some(avg) = avg_error(nodes.values(), f64::abs) {
        debug!("Avg. Network |pid_error|={}", avg);
    }
    if let Some(avg) = avg_error(nodes.values().filter(|n| n.pid_error > 0.0), |e| e) {
        debug!("Avg. Network +pid_error=+{}", avg);
    }
    if let Some(avg) = avg_error(nodes.values().filter(|n| n.pid_error < 0.0), |e| e) {
        debug!("Avg. Network -pid_error={}", avg);
    }
}

fn avg_error<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    map: impl Fn(f64) -> f64,
) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for node in nodes {
        sum += map(node.pid_error);
        count += 1;
    }
    if count > 0 {
        Some(sum / count as f64)
    } else {
        None
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn fmt_time(timestamp: f64) -> String {
    match Utc.timestamp_opt(timestamp as i64, 0) {
        LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => format!("{}", timestamp),
    }
}
