//! The per-relay feedback step.
//!
//! One call per measured relay and round. The awkward part is guard
//! handling: pure guards are sampled on a slow cadence, so a fresh
//! measurement does not necessarily advance their integrator. The decision
//! tree below keys on four questions - is there a prior vote, is the
//! measurement newer than it, is the relay a pure guard, is it a guard+exit -
//! and nothing else.

use tracing::{debug, trace};

use super::containers::Node;
use crate::parser::consensus::{ConsensusParams, Flag};
use crate::parser::vote::Vote;

use super::averages::ClassAvgs;

#[derive(Debug, Clone, Copy)]
struct Gains {
    k_p: f64,
    k_i: f64,
    k_d: f64,
    k_i_decay: f64,
}

impl Gains {
    fn of(params: &ConsensusParams) -> Gains {
        Gains {
            k_p: params.k_p,
            k_i: params.k_i,
            k_d: params.k_d,
            k_i_decay: params.k_i_decay,
        }
    }

    /// Dampen all three gains; the integral decay is a time constant, not a
    /// gain, and stays untouched.
    fn dampened(self, weight: f64) -> Gains {
        Gains {
            k_p: self.k_p * weight,
            k_i: self.k_i * weight,
            k_d: self.k_d * weight,
            k_i_decay: self.k_i_decay,
        }
    }
}

/// Compute a relay's new bandwidth with the controller enabled.
///
/// `error_sum` is threaded as a working value: it starts from the prior
/// vote's integral, the clamp and mercy rules adjust it, and the feedback
/// application both consumes it and refreshes the node's stored sum from it.
pub fn feedback(
    node: &mut Node,
    params: &ConsensusParams,
    wgd: f64,
    avgs: &ClassAvgs,
    prev_vote: Option<&Vote>,
) {
    // baseline to scale the correction from
    node.use_bw = if params.use_desc_bw {
        node.desc_bw as f64
    } else {
        node.ns_bw as f64
    };

    let mut error_sum = prev_vote.map(|v| v.pid_error_sum).unwrap_or(0.0);

    // error signal
    if params.use_pid_tgt {
        node.pid_error = (node.strm_bw as f64 - avgs.pid_tgt) / avgs.pid_tgt;
        // use filt_bw instead of strm_bw for relays already being demoted
        if params.use_mercy {
            let relent = if params.use_desc_bw {
                error_sum < 0.0 && node.pid_error < 0.0
            } else {
                node.desc_bw > node.ns_bw && node.pid_error < 0.0
            };
            if relent {
                node.pid_error = (node.filt_bw as f64 - avgs.pid_tgt) / avgs.pid_tgt;
            }
        }
    } else if params.use_best_ratio && node.sbw_ratio > node.fbw_ratio {
        node.pid_error = (node.strm_bw as f64 - avgs.strm) / avgs.strm;
    } else {
        node.pid_error = (node.filt_bw as f64 - avgs.filt) / avgs.filt;
    }

    // Circuit failure indicates CPU pressure; count it against the relay if
    // it is both below the class average and worse than the current error.
    if params.use_circ_fails && (1.0 - node.circ_fail_rate) < avgs.circ {
        let circ_error = -node.circ_fail_rate;
        if circ_error < 0.0 && circ_error < node.pid_error {
            debug!(
                "CPU overload for {} node {}={} desc={} ns={} pid_error={} circ_error={}",
                node.node_class(),
                node.nick,
                node.id,
                node.desc_bw,
                node.ns_bw,
                node.pid_error,
                circ_error
            );
            node.pid_error = circ_error.min(node.pid_error);
        }
    }

    // Don't accumulate too much amplification for fast nodes.
    if params.use_desc_bw {
        if error_sum > params.pid_max && node.pid_error > 0.0 {
            debug!(
                "Capping feedback for {} node {}={} desc={} ns={} pid_error_sum={}",
                node.node_class(),
                node.nick,
                node.id,
                node.desc_bw,
                node.ns_bw,
                error_sum
            );
            error_sum = params.pid_max;
        }
    } else if node.desc_bw > 0 {
        let ns_bw_ratio = node.ns_bw as f64 / node.desc_bw as f64;
        if ns_bw_ratio > params.pid_max && node.pid_error > 0.0 {
            debug!(
                "Capping feedback for {} node {}={} desc={} ns={} pid_error={}",
                node.node_class(),
                node.nick,
                node.id,
                node.desc_bw,
                node.ns_bw,
                node.pid_error
            );
            node.pid_error = 0.0;
            error_sum = 0.0;
        }
    }

    // Don't punish gimpy nodes too hard.
    if params.use_mercy {
        if !params.use_desc_bw && node.desc_bw > node.ns_bw && node.pid_error < 0.0 {
            trace!(
                "Showing mercy for {} node {}={} desc={} ns={} pid_error={}",
                node.node_class(),
                node.nick,
                node.id,
                node.desc_bw,
                node.ns_bw,
                node.pid_error
            );
            node.use_bw = node.desc_bw as f64;
        }
        if error_sum < 0.0 && node.pid_error < 0.0 {
            trace!(
                "Showing mercy for {} node {}={} desc={} ns={} pid_error_sum={}",
                node.node_class(),
                node.nick,
                node.id,
                node.desc_bw,
                node.ns_bw,
                error_sum
            );
            error_sum = 0.0;
        }
    }

    let gains = Gains::of(params);
    match prev_vote {
        None => {
            // pure consensus feedback this round
            node.new_bw = node.use_bw * (1.0 + gains.k_p * node.pid_error);
            node.pid_error_sum = node.pid_error;
            node.pid_bw = node.new_bw;
            trace!("No prev vote for node {}: Consensus feedback", node.nick);
        }
        Some(vote) => {
            if node.measured_at > vote.measured_at {
                let guard = node.has_flag(Flag::Guard);
                let exit = node.has_flag(Flag::Exit);
                if guard && !exit {
                    guard_feedback(node, params, vote, error_sum, gains);
                } else if guard && exit {
                    // Guard+Exits respond on both timescales at once; dampen
                    // them by the fraction of their weight spent in the guard
                    // position. When an equivalence or mercy rule already
                    // pinned use_bw to the descriptor value, the dampening
                    // would fight it, so it is skipped.
                    let weight = if node.use_bw == node.desc_bw as f64 {
                        1.0
                    } else {
                        1.0 - wgd
                    };
                    apply_full(node, vote, error_sum, gains.dampened(weight));
                } else {
                    // everyone else responds almost instantly; full feedback
                    apply_full(node, vote, error_sum, gains);
                }
            } else {
                // no new sample this round; don't vote on this measurement
                node.revert_to_vote(vote);
            }
        }
    }
}

/// A pure guard with a fresh sample: integrate only once per sample period.
fn guard_feedback(
    node: &mut Node,
    params: &ConsensusParams,
    vote: &Vote,
    error_sum: f64,
    gains: Gains,
) {
    if node.measured_at - vote.measured_at > params.guard_sample_rate as f64 {
        apply_full(node, vote, error_sum, gains);
        return;
    }

    // Not due yet: keep the previous accumulators and predict from them
    // without integrating, then restore the vote's error and timestamp so
    // the sampling interval keeps counting from its original boundary.
    node.copy_vote(vote);
    if params.use_desc_bw {
        node.new_bw = predict(node, gains.k_p, gains.k_i, gains.k_d);
    } else {
        if params.use_mercy && node.desc_bw > node.ns_bw && node.pid_error < 0.0 {
            node.use_bw = node.desc_bw as f64;
        } else {
            node.use_bw = vote.pid_bw;
        }
        node.new_bw = predict(node, gains.k_p, 0.0, 0.0);
    }
    node.pid_error = vote.pid_error;
    node.measured_at = vote.measured_at;
}

/// One full controller step against the previous vote.
fn apply_full(node: &mut Node, vote: &Vote, error_sum: f64, gains: Gains) {
    let prev_error = vote.pid_error;
    let integral = if prev_error == 0.0 { 0.0 } else { error_sum };
    node.pid_delta = if prev_error == 0.0 {
        0.0
    } else {
        node.pid_error - prev_error
    };

    node.pid_bw = node.use_bw
        + gains.k_p * node.use_bw * node.pid_error
        + gains.k_i * node.use_bw * integral
        + gains.k_d * node.use_bw * node.pid_delta;
    node.new_bw = node.pid_bw;

    // The integral sum decays each round to keep it bounded.
    node.pid_error_sum = error_sum * gains.k_i_decay + node.pid_error;
}

/// Prediction form: reuse the stored accumulators without refreshing them.
fn predict(node: &Node, k_p: f64, k_i: f64, k_d: f64) -> f64 {
    node.use_bw
        + k_p * node.use_bw * node.pid_error
        + k_i * node.use_bw * node.pid_error_sum
        + k_d * node.use_bw * node.pid_delta
}

/// Fallback when the consensus disables the controller: scale the descriptor
/// bandwidth by the better of the two measurement ratios.
pub fn ratio_feedback(node: &mut Node) {
    let ratio = if node.sbw_ratio > node.fbw_ratio {
        node.sbw_ratio
    } else {
        node.fbw_ratio
    };
    node.pid_error = 0.0;
    node.pid_error_sum = 0.0;
    node.new_bw = node.desc_bw as f64 * ratio;
    // keep the raw value sane for a later transition back to feedback
    node.pid_bw = node.new_bw;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::RelayId;

    const DAY: f64 = 86_400.0;

    fn node(flags: &[Flag], bw: u64, measured_at: f64) -> Node {
        let mut n = Node::new(RelayId::from_wire("$AA"));
        n.nick = "test".to_string();
        n.flags = flags.to_vec();
        n.strm_bw = bw;
        n.filt_bw = bw;
        n.ns_bw = bw;
        n.desc_bw = bw;
        n.measured_at = measured_at;
        n.updated_at = measured_at;
        n
    }

    fn avgs(value: f64) -> ClassAvgs {
        ClassAvgs {
            filt: value,
            strm: value,
            circ: 1.0,
            pid_tgt: value,
        }
    }

    fn set_ratios(n: &mut Node, a: &ClassAvgs) {
        n.fbw_ratio = n.filt_bw as f64 / a.filt;
        n.sbw_ratio = n.strm_bw as f64 / a.strm;
    }

    fn vote(bw: u64, measured_at: f64, pid_error: f64, pid_error_sum: f64) -> Vote {
        Vote {
            id: RelayId::from_wire("$AA"),
            nick: "test".to_string(),
            bw,
            measured_at,
            updated_at: measured_at,
            pid_error,
            pid_error_sum,
            pid_delta: 0.0,
            pid_bw: bw as f64 * 1000.0,
        }
    }

    fn params_with(t_i: f64, t_i_decay: f64) -> ConsensusParams {
        let mut p = ConsensusParams {
            t_i,
            t_i_decay,
            ..ConsensusParams::default()
        };
        p.derive_gains();
        p
    }

    #[test]
    fn test_cold_start_zero_error() {
        let mut n = node(&[], 1_000_000, 1000.0);
        let a = avgs(1_000_000.0);
        set_ratios(&mut n, &a);
        feedback(&mut n, &ConsensusParams::default(), 0.0, &a, None);
        assert_eq!(n.pid_error, 0.0);
        assert_eq!(n.new_bw, 1_000_000.0);
        assert_eq!(n.pid_error_sum, 0.0);
        assert_eq!(n.pid_bw, 1_000_000.0);
    }

    #[test]
    fn test_cold_start_proportional_correction() {
        // class average 750000: one relay a third faster, one a third slower
        let a = avgs(750_000.0);

        let mut fast = node(&[], 1_000_000, 1000.0);
        set_ratios(&mut fast, &a);
        feedback(&mut fast, &ConsensusParams::default(), 0.0, &a, None);
        assert!((fast.pid_error - 1.0 / 3.0).abs() < 1e-9);
        assert!((fast.new_bw - 1_333_333.3).abs() < 0.4);

        let mut slow = node(&[], 500_000, 1000.0);
        set_ratios(&mut slow, &a);
        feedback(&mut slow, &ConsensusParams::default(), 0.0, &a, None);
        assert!((slow.pid_error + 1.0 / 3.0).abs() < 1e-9);
        assert!((slow.new_bw - 333_333.3).abs() < 0.4);

        // the integral seeds from the first error
        assert_eq!(fast.pid_error_sum, fast.pid_error);
    }

    #[test]
    fn test_stale_measurement_reverts_to_vote() {
        let a = avgs(750_000.0);
        let mut n = node(&[], 1_000_000, 1000.0);
        set_ratios(&mut n, &a);
        let v = vote(900, 1000.0, 0.125, 0.5);
        feedback(&mut n, &ConsensusParams::default(), 0.0, &a, Some(&v));
        assert_eq!(n.new_bw, 900_000.0);
        assert_eq!(n.pid_error, 0.125);
        assert_eq!(n.pid_error_sum, 0.5);
        assert_eq!(n.measured_at, 1000.0);
    }

    #[test]
    fn test_guard_not_due_keeps_integrator() {
        let params = params_with(5.0, 1.0);
        let a = avgs(750_000.0);
        let mut n = node(&[Flag::Guard], 1_000_000, 1000.0 + 3.0 * DAY);
        set_ratios(&mut n, &a);
        let v = vote(900, 1000.0, 0.125, 0.5);
        feedback(&mut n, &params, 0.0, &a, Some(&v));

        // accumulators come straight from the vote, not from integration
        assert_eq!(n.pid_error_sum, 0.5);
        assert_eq!(n.pid_delta, 0.0);
        // the vote's error and timestamp are restored
        assert_eq!(n.pid_error, 0.125);
        assert_eq!(n.measured_at, 1000.0);
        // prediction form: error computed from the fresh sample, state from
        // the vote
        let err = (1_000_000.0 - 750_000.0) / 750_000.0;
        let expected =
            1_000_000.0 * (1.0 + params.k_p * err + params.k_i * 0.5 + params.k_d * 0.0);
        assert!((n.new_bw - expected).abs() < 1e-6);
    }

    #[test]
    fn test_guard_due_integrates() {
        let params = params_with(5.0, 1.0);
        let a = avgs(750_000.0);
        let gap = params.guard_sample_rate as f64 + DAY;
        let mut n = node(&[Flag::Guard], 1_000_000, 1000.0 + gap);
        set_ratios(&mut n, &a);
        let v = vote(900, 1000.0, 0.125, 0.5);
        feedback(&mut n, &params, 0.0, &a, Some(&v));

        let err = (1_000_000.0 - 750_000.0) / 750_000.0;
        assert!((n.pid_error - err).abs() < 1e-12);
        // the integrator advances with decay
        assert!((n.pid_error_sum - (0.5 * params.k_i_decay + err)).abs() < 1e-12);
        assert!((n.pid_delta - (err - 0.125)).abs() < 1e-12);
        let expected = 1_000_000.0
            * (1.0 + params.k_p * err + params.k_i * 0.5 + params.k_d * n.pid_delta);
        assert!((n.new_bw - expected).abs() < 1e-6);
    }

    #[test]
    fn test_zero_prior_error_suppresses_integral_and_delta() {
        let params = params_with(5.0, 1.0);
        let a = avgs(750_000.0);
        let mut n = node(&[], 1_000_000, 2000.0);
        set_ratios(&mut n, &a);
        let v = vote(900, 1000.0, 0.0, 3.0);
        feedback(&mut n, &params, 0.0, &a, Some(&v));
        let err = (1_000_000.0 - 750_000.0) / 750_000.0;
        // a zero previous error means this is effectively a first sample
        assert_eq!(n.pid_delta, 0.0);
        let expected = 1_000_000.0 * (1.0 + params.k_p * err);
        assert!((n.new_bw - expected).abs() < 1e-6);
        // but the stored sum still decays forward
        assert!((n.pid_error_sum - (3.0 * params.k_i_decay + err)).abs() < 1e-12);
    }

    #[test]
    fn test_guard_exit_is_dampened() {
        let mut params = ConsensusParams::default();
        params.use_desc_bw = false; // baseline differs from desc_bw
        params.derive_gains();
        let a = avgs(750_000.0);
        let wgd = 0.25;

        let mut n = node(&[Flag::Guard, Flag::Exit], 1_000_000, 2000.0);
        n.ns_bw = 800_000;
        set_ratios(&mut n, &a);
        let v = vote(900, 1000.0, 0.125, 0.0);
        feedback(&mut n, &params, wgd, &a, Some(&v));

        let err = (1_000_000.0 - 750_000.0) / 750_000.0;
        let expected = 800_000.0 * (1.0 + (1.0 - wgd) * err);
        assert!((n.new_bw - expected).abs() < 1e-6);
    }

    #[test]
    fn test_guard_exit_with_desc_baseline_not_dampened() {
        let a = avgs(750_000.0);
        let mut n = node(&[Flag::Guard, Flag::Exit], 1_000_000, 2000.0);
        set_ratios(&mut n, &a);
        let v = vote(900, 1000.0, 0.125, 0.0);
        feedback(&mut n, &ConsensusParams::default(), 0.25, &a, Some(&v));

        let err = (1_000_000.0 - 750_000.0) / 750_000.0;
        let expected = 1_000_000.0 * (1.0 + err);
        assert!((n.new_bw - expected).abs() < 1e-6);
    }

    #[test]
    fn test_integrator_clamp_on_desc_baseline() {
        let params = params_with(5.0, 1.0);
        let a = avgs(750_000.0);
        let mut n = node(&[], 1_000_000, 2000.0);
        set_ratios(&mut n, &a);
        // absurdly accumulated integral from the prior vote
        let v = vote(900, 1000.0, 0.125, params.pid_max + 100.0);
        feedback(&mut n, &params, 0.0, &a, Some(&v));
        // the clamped sum is what decays forward
        let err = n.pid_error;
        assert!(
            (n.pid_error_sum - (params.pid_max * params.k_i_decay + err)).abs() < 1e-9
        );
    }

    #[test]
    fn test_mercy_zeroes_negative_integrator() {
        let mut params = params_with(5.0, 1.0);
        params.use_mercy = true;
        let a = avgs(750_000.0);
        let mut n = node(&[], 500_000, 2000.0);
        set_ratios(&mut n, &a);
        let v = vote(900, 1000.0, -0.125, -2.0);
        feedback(&mut n, &params, 0.0, &a, Some(&v));
        let err = n.pid_error;
        assert!(err < 0.0);
        // the negative sum was zeroed before decay and integration
        assert!((n.pid_error_sum - err).abs() < 1e-12);
        let expected = 500_000.0
            * (1.0 + params.k_p * err + params.k_i * 0.0 + params.k_d * (err - -0.125));
        assert!((n.new_bw - expected).abs() < 1e-6);
    }

    #[test]
    fn test_circuit_failure_penalty() {
        let mut params = ConsensusParams::default();
        params.use_circ_fails = true;
        let a = avgs(1_000_000.0);
        let mut n = node(&[], 1_000_000, 2000.0);
        n.circ_fail_rate = 0.5;
        set_ratios(&mut n, &a);
        feedback(&mut n, &params, 0.0, &a, None);
        // measurement error would be 0; the failure rate drags it negative
        assert_eq!(n.pid_error, -0.5);
        assert_eq!(n.new_bw, 500_000.0);
    }

    #[test]
    fn test_ratio_fallback() {
        let a = avgs(750_000.0);
        let mut n = node(&[], 1_000_000, 2000.0);
        n.strm_bw = 900_000;
        set_ratios(&mut n, &a);
        ratio_feedback(&mut n);
        // filtered ratio is the larger one here
        assert!((n.new_bw - 1_000_000.0 * (1_000_000.0 / 750_000.0)).abs() < 1e-6);
        assert_eq!(n.pid_error, 0.0);
        assert_eq!(n.pid_error_sum, 0.0);
    }
}
