//! Reference averages per node class, including the iteratively refined
//! feedback target.

use std::collections::HashMap;

use tracing::debug;

use super::containers::{Node, NodeClass};
use crate::parser::consensus::ConsensusParams;
use crate::parser::RelayId;

/// The reference averages one node class is judged against.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassAvgs {
    /// Mean filtered bandwidth.
    pub filt: f64,
    /// Mean stream bandwidth.
    pub strm: f64,
    /// Mean circuit success rate (1 - circ_fail_rate).
    pub circ: f64,
    /// Mean filtered bandwidth over relays whose descriptor bandwidth
    /// reaches the target itself (fixed point, see [`iterative_target`]).
    pub pid_tgt: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Averages {
    by_class: [ClassAvgs; 4],
}

impl Averages {
    pub fn class(&self, class: NodeClass) -> &ClassAvgs {
        &self.by_class[class.index()]
    }

    pub fn compute(nodes: &HashMap<RelayId, Node>, params: &ConsensusParams) -> Averages {
        if params.pid_control {
            Averages::compute_for_feedback(nodes, params.group_by_class)
        } else {
            Averages::compute_for_ratios(nodes)
        }
    }

    fn compute_for_feedback(nodes: &HashMap<RelayId, Node>, group_by_class: bool) -> Averages {
        let mut avgs = Averages::default();

        // Per-class values are computed (and logged) even when classes are
        // not grouped, so operators can compare the two modes from one run.
        for class in NodeClass::ALL {
            let members: Vec<&Node> = nodes
                .values()
                .filter(|n| n.node_class() == class)
                .collect();
            let entry = &mut avgs.by_class[class.index()];
            if !members.is_empty() {
                entry.filt = mean(&members, |n| n.filt_bw as f64);
                entry.strm = mean(&members, |n| n.strm_bw as f64);
                entry.circ = mean(&members, |n| 1.0 - n.circ_fail_rate);
            }
            entry.pid_tgt = iterative_target(&members, entry.filt);

            debug!("Network true_filt_avg[{}]: {}", class, entry.filt);
            debug!("Network pid_tgt_avg[{}]: {}", class, entry.pid_tgt);
            debug!("Network true_circ_avg[{}]: {}", class, entry.circ);
        }

        let all: Vec<&Node> = nodes.values().collect();
        let filt_avg = mean(&all, |n| n.filt_bw as f64);
        let strm_avg = mean(&all, |n| n.strm_bw as f64);
        let circ_avg = mean(&all, |n| 1.0 - n.circ_fail_rate);
        debug!("Network filt_avg: {:.3}", filt_avg);
        debug!("Network circ_avg: {:.3}", circ_avg);

        if !group_by_class {
            let pid_avg = iterative_target(&all, filt_avg);
            debug!("Network pid_avg: {}", pid_avg);
            for class in NodeClass::ALL {
                avgs.by_class[class.index()] = ClassAvgs {
                    filt: filt_avg,
                    strm: strm_avg,
                    circ: circ_avg,
                    pid_tgt: pid_avg,
                };
            }
        }
        avgs
    }

    /// Without feedback only the plain network-wide bandwidth means are
    /// needed, for the stream/filtered ratios.
    fn compute_for_ratios(nodes: &HashMap<RelayId, Node>) -> Averages {
        let all: Vec<&Node> = nodes.values().collect();
        let entry = ClassAvgs {
            filt: mean(&all, |n| n.filt_bw as f64),
            strm: mean(&all, |n| n.strm_bw as f64),
            circ: 0.0,
            pid_tgt: 0.0,
        };
        Averages {
            by_class: [entry; 4],
        }
    }
}

fn mean(nodes: &[&Node], value: impl Fn(&Node) -> f64) -> f64 {
    if nodes.is_empty() {
        return 0.0;
    }
    nodes.iter().map(|n| value(n)).sum::<f64>() / nodes.len() as f64
}

/// Refine a bandwidth target until it is the mean filtered bandwidth of
/// exactly those relays whose descriptor bandwidth reaches it. The target
/// only ever decreases, so this converges in at most `|nodes|` steps.
fn iterative_target(nodes: &[&Node], start: f64) -> f64 {
    let mut tgt = start;
    let mut prev = 2.0 * tgt;
    while prev > tgt {
        prev = tgt;
        let eligible: Vec<&&Node> = nodes.iter().filter(|n| n.desc_bw as f64 >= tgt).collect();
        tgt = if eligible.is_empty() {
            0.0
        } else {
            eligible.iter().map(|n| n.filt_bw as f64).sum::<f64>() / eligible.len() as f64
        };
    }
    tgt
}
