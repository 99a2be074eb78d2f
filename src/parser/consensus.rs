//! The network consensus, as fetched over the control port.
//!
//! Only three things are consumed from it: the `params` line (feedback
//! parameters), the `bandwidth-weights` line, and the relay entries
//! (`r` / `s` / `w` items) that supply flags and consensus bandwidths.

use std::collections::{BTreeMap, HashMap};

use super::{ParseError, RelayId};

//
// External dependencies
//
use derive_builder::Builder;
use strum::{EnumString, IntoStaticStr};
use tracing::{debug, info, warn};

/// A relay flag in the consensus
#[derive(Debug, Clone, Copy, EnumString, IntoStaticStr, PartialEq, Eq)]
pub enum Flag {
    Authority,
    BadExit,
    Exit,
    Fast,
    Guard,
    HSDir,
    NoEdConsensus,
    Running,
    Stable,
    StaleDesc,
    Sybil,
    V2Dir,
    Valid,
}

/// A relay entry within the consensus, reduced to what the aggregator needs.
#[derive(Debug, Clone, Builder)]
pub struct StatusEntry {
    pub id: RelayId,
    pub nick: String,
    #[builder(default)]
    pub flags: Vec<Flag>,
    /// Consensus bandwidth in kilobytes/s, when the entry carries a `w` line.
    #[builder(default)]
    pub bandwidth: Option<u64>,
    /// Whether this round produced a measurement for the relay.
    #[builder(default, setter(skip))]
    pub measured: bool,
}

impl StatusEntry {
    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Feedback parameters delivered through the consensus `params` line,
/// together with the gains derived from them.
#[derive(Debug, Clone)]
pub struct ConsensusParams {
    pub pid_control: bool,
    /// Feedback baseline is the descriptor bandwidth; `bwauthnsbw=1` switches
    /// to the network-status bandwidth instead.
    pub use_desc_bw: bool,
    pub use_circ_fails: bool,
    pub use_best_ratio: bool,
    pub group_by_class: bool,
    pub use_pid_tgt: bool,
    pub use_mercy: bool,
    pub k_p: f64,
    pub t_i: f64,
    pub t_d: f64,
    pub t_i_decay: f64,
    pub pid_max: f64,
    pub guard_sample_rate: u64,
    // derived gains
    pub k_i: f64,
    pub k_i_decay: f64,
    pub k_d: f64,
}

impl Default for ConsensusParams {
    fn default() -> ConsensusParams {
        let mut params = ConsensusParams {
            pid_control: true,
            use_desc_bw: true,
            use_circ_fails: false,
            use_best_ratio: true,
            group_by_class: false,
            use_pid_tgt: false,
            use_mercy: false,
            k_p: 1.0,
            t_i: 0.0,
            t_d: 0.0,
            t_i_decay: 0.0,
            pid_max: 500.0,
            guard_sample_rate: crate::highlevel::GUARD_SAMPLE_RATE,
            k_i: 0.0,
            k_i_decay: 0.0,
            k_d: 0.0,
        };
        params.derive_gains();
        params
    }
}

impl ConsensusParams {
    /// Parse the `params` line. A missing line or any malformed pair
    /// disables feedback for this round; the ratio fallback applies.
    pub fn from_params_line(args: Option<&str>) -> ConsensusParams {
        let mut params = ConsensusParams::default();
        let applied = match args {
            Some(args) => params.apply(args),
            None => Err(ParseError::FieldMissing { field: "params" }),
        };
        if let Err(e) = applied {
            info!("Bw auth PID control disabled due to parse error: {}", e);
            params.pid_control = false;
        }
        params.derive_gains();
        params
    }

    fn apply(&mut self, args: &str) -> Result<(), ParseError> {
        for pair in args.split_whitespace() {
            let (name, value) = pair.split_once('=').ok_or_else(|| ParseError::InvalidParam {
                raw: pair.to_string(),
            })?;
            let value: i64 = value.parse().map_err(|_| ParseError::InvalidParam {
                raw: pair.to_string(),
            })?;
            match name {
                "bwauthpid" => {
                    self.pid_control = value != 0;
                }
                "bwauthnsbw" => {
                    if value == 1 {
                        self.use_desc_bw = false;
                        debug!("Using NS bandwidth directly for feedback");
                    }
                }
                "bwauthcircs" => {
                    if value == 1 {
                        self.use_circ_fails = true;
                        debug!("Counting circuit failures");
                    }
                }
                "bwauthbestratio" => {
                    if value == 0 {
                        self.use_best_ratio = false;
                        debug!("Choosing larger of sbw vs fbw");
                    }
                }
                "bwauthbyclass" => {
                    if value == 1 {
                        self.group_by_class = true;
                        debug!("Grouping nodes by flag-class");
                    }
                }
                "bwauthpidtgt" => {
                    if value == 1 {
                        self.use_pid_tgt = true;
                        debug!("Using filtered PID target");
                    }
                }
                "bwauthmercy" => {
                    if value == 1 {
                        self.use_mercy = true;
                        debug!("Showing mercy on gimpy nodes");
                    }
                }
                "bwauthkp" => {
                    self.k_p = value as f64 / 10000.0;
                    debug!("Got K_p={} from consensus.", self.k_p);
                }
                "bwauthti" => {
                    self.t_i = value as f64 / 10000.0;
                    debug!("Got T_i={} from consensus.", self.t_i);
                }
                "bwauthtd" => {
                    self.t_d = value as f64 / 10000.0;
                    debug!("Got T_d={} from consensus.", self.t_d);
                }
                "bwauthtidecay" => {
                    self.t_i_decay = value as f64 / 10000.0;
                    debug!("Got T_i_decay={} from consensus.", self.t_i_decay);
                }
                "bwauthpidmax" => {
                    self.pid_max = value as f64 / 10000.0;
                    debug!("Got pid_max={} from consensus.", self.pid_max);
                }
                "bwauthguardrate" => {
                    self.guard_sample_rate = value.max(0) as u64;
                    debug!(
                        "Got guard_sample_rate={} from consensus.",
                        self.guard_sample_rate
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Recompute `k_i`, `k_i_decay` and `k_d` from the time constants.
    pub fn derive_gains(&mut self) {
        if self.t_i == 0.0 {
            self.k_i = 0.0;
            self.k_i_decay = 0.0;
        } else {
            self.k_i = self.k_p / self.t_i;
            self.k_i_decay = 1.0 - self.t_i_decay / self.t_i;
        }
        self.k_d = self.k_p * self.t_d;
    }
}

/// Consensus bandwidth weights, exposed as fractions of the weight scale.
#[derive(Debug, Clone)]
pub struct BandwidthWeights(BTreeMap<String, f64>);

impl BandwidthWeights {
    /// Parse the `bandwidth-weights` line. An absent or malformed line falls
    /// back to Wgd=0, Wgg=1.
    pub fn parse(args: Option<&str>) -> BandwidthWeights {
        if let Some(args) = args {
            if let Ok(weights) = BandwidthWeights::parse_pairs(args) {
                return weights;
            }
        }
        warn!("No bandwidth weights in consensus!");
        let mut weights = BTreeMap::new();
        weights.insert("Wgd".to_string(), 0.0);
        weights.insert("Wgg".to_string(), 1.0);
        BandwidthWeights(weights)
    }

    fn parse_pairs(args: &str) -> Result<BandwidthWeights, ParseError> {
        let mut weights = BTreeMap::new();
        for pair in args.split_whitespace() {
            let (name, value) = pair
                .split_once('=')
                .ok_or(ParseError::InvalidBandwidthWeight)?;
            let value: i64 = value
                .parse()
                .map_err(|_| ParseError::InvalidBandwidthWeight)?;
            weights.insert(name.to_string(), value as f64 / 10000.0);
        }
        Ok(BandwidthWeights(weights))
    }

    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    pub fn wgd(&self) -> f64 {
        self.get("Wgd")
    }
}

/// A parsed consensus document.
#[derive(Debug)]
pub struct ConsensusDoc {
    pub params: ConsensusParams,
    pub weights: BandwidthWeights,
    pub relays: HashMap<RelayId, StatusEntry>,
}

impl ConsensusDoc {
    /// Parse a consensus document from raw text.
    pub fn parse(text: &str) -> Result<ConsensusDoc, ParseError> {
        let mut params_line: Option<&str> = None;
        let mut weights_line: Option<&str> = None;

        // the current relay we're constructing
        let mut relay: Option<StatusEntryBuilder> = None;

        // collected relays
        let mut relays: HashMap<RelayId, StatusEntry> = HashMap::new();

        fn finish(
            relay: Option<StatusEntryBuilder>,
            relays: &mut HashMap<RelayId, StatusEntry>,
        ) -> Result<(), ParseError> {
            if let Some(old) = relay {
                let entry = old.build()?;
                relays.insert(entry.id.clone(), entry);
            }
            Ok(())
        }

        for line in text.lines() {
            let (keyword, arguments) = match line.split_once(' ') {
                Some((k, a)) => (k, Some(a)),
                None => (line, None),
            };
            match keyword {
                "params" => {
                    params_line = arguments;
                }
                "bandwidth-weights" => {
                    weights_line = arguments;
                }
                "r" => {
                    // if another relay was in process, finish it
                    finish(relay.take(), &mut relays)?;

                    // start a new relay
                    let mut new = StatusEntryBuilder::default();
                    let splits: Vec<&str> =
                        arguments.unwrap_or("").split_whitespace().collect();
                    match splits[..] {
                        [nickname, identity, ..] => {
                            new.nick(nickname.to_string());
                            new.id(RelayId::from_b64(identity)?);
                        }
                        _ => {
                            return Err(ParseError::FieldMissing { field: "r" });
                        }
                    }
                    relay = Some(new);
                }
                "s" => {
                    // get builder
                    let relay = relay.as_mut().ok_or(ParseError::UnexpectedKeyword {
                        keyword: keyword.to_string(),
                    })?;

                    // parse flags; unknown ones are ignored so that newly
                    // introduced flags do not break the aggregator
                    let flags: Vec<Flag> = arguments
                        .unwrap_or("")
                        .split_whitespace()
                        .filter_map(|x| x.parse::<Flag>().ok())
                        .collect();
                    relay.flags(flags);
                }
                "w" => {
                    // get builder
                    let relay = relay.as_mut().ok_or(ParseError::UnexpectedKeyword {
                        keyword: keyword.to_string(),
                    })?;

                    // parse bandwidth weight
                    let arguments = arguments.unwrap_or("");
                    if !arguments.starts_with("Bandwidth=") {
                        return Err(ParseError::InvalidBandwidthWeight);
                    }
                    for arg in arguments.split_whitespace() {
                        let (k, v) = arg
                            .split_once('=')
                            .ok_or(ParseError::InvalidBandwidthWeight)?;
                        if k == "Bandwidth" {
                            relay.bandwidth(Some(
                                v.parse::<u64>()
                                    .map_err(|_| ParseError::InvalidBandwidthWeight)?,
                            ));
                        }
                    }
                }
                _ => {
                    // other items (version lines, protocols, exit policies,
                    // signatures) are of no interest here
                }
            }
        }
        finish(relay.take(), &mut relays)?;

        Ok(ConsensusDoc {
            params: ConsensusParams::from_params_line(params_line),
            weights: BandwidthWeights::parse(weights_line),
            relays,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 20 bytes of 0x41 resp. 0x42, unpadded
    const ID_A: &str = "QUFBQUFBQUFBQUFBQUFBQUFBQUE";
    const ID_B: &str = "QkJCQkJCQkJCQkJCQkJCQkJCQkI";

    fn sample_consensus() -> String {
        format!(
            "network-status-version 3\n\
             vote-status consensus\n\
             params CircuitPriorityHalflifeMsec=30000 bwauthkp=20000 bwauthti=50000 \
             bwauthtidecay=10000 bwauthbyclass=1 bwauthmercy=1 bwauthguardrate=604800\n\
             r moria1 {} dGVzdGRpZ2VzdA 2026-07-30 12:00:00 128.31.0.34 9101 9131\n\
             s Authority Fast Guard Running Stable V2Dir Valid\n\
             v Tor 0.4.8.1\n\
             w Bandwidth=20\n\
             r fast {} dGVzdGRpZ2VzdA 2026-07-30 12:00:00 10.0.0.1 9001 0\n\
             s Exit Fast Running Valid\n\
             w Bandwidth=9001 Unmeasured=1\n\
             directory-footer\n\
             bandwidth-weights Wbd=3333 Wgd=2500 Wgg=7500 Wmg=2500\n",
            ID_A, ID_B
        )
    }

    #[test]
    fn test_parse_relays() {
        let doc = ConsensusDoc::parse(&sample_consensus()).unwrap();
        assert_eq!(doc.relays.len(), 2);

        let a = &doc.relays[&RelayId::from_wire(&"41".repeat(20))];
        assert_eq!(a.nick, "moria1");
        assert!(a.has_flag(Flag::Authority));
        assert!(a.has_flag(Flag::Guard));
        assert!(!a.has_flag(Flag::Exit));
        assert_eq!(a.bandwidth, Some(20));
        assert!(!a.measured);

        let b = &doc.relays[&RelayId::from_wire(&"42".repeat(20))];
        assert!(b.has_flag(Flag::Exit));
        assert_eq!(b.bandwidth, Some(9001));
    }

    #[test]
    fn test_parse_params() {
        let doc = ConsensusDoc::parse(&sample_consensus()).unwrap();
        let p = &doc.params;
        assert!(p.pid_control);
        assert!(p.group_by_class);
        assert!(p.use_mercy);
        assert!(p.use_desc_bw);
        assert_eq!(p.k_p, 2.0);
        assert_eq!(p.t_i, 5.0);
        assert_eq!(p.t_i_decay, 1.0);
        assert_eq!(p.guard_sample_rate, 604800);
        // derived gains
        assert_eq!(p.k_i, 2.0 / 5.0);
        assert_eq!(p.k_i_decay, 1.0 - 1.0 / 5.0);
        assert_eq!(p.k_d, 0.0);
    }

    #[test]
    fn test_parse_weights() {
        let doc = ConsensusDoc::parse(&sample_consensus()).unwrap();
        assert_eq!(doc.weights.wgd(), 0.25);
        assert_eq!(doc.weights.get("Wgg"), 0.75);
        assert_eq!(doc.weights.get("Wnonexistent"), 0.0);
    }

    #[test]
    fn test_defaults_without_params_line() {
        let doc = ConsensusDoc::parse("network-status-version 3\n").unwrap();
        // a consensus without parameters cannot drive the controller
        assert!(!doc.params.pid_control);
        assert_eq!(doc.params.k_p, 1.0);
        assert_eq!(doc.params.pid_max, 500.0);
        assert_eq!(doc.params.guard_sample_rate, 1209600);
    }

    #[test]
    fn test_malformed_params_disable_feedback() {
        let doc = ConsensusDoc::parse("params bwauthkp=fast\n").unwrap();
        assert!(!doc.params.pid_control);

        let doc = ConsensusDoc::parse("params bwauthpid\n").unwrap();
        assert!(!doc.params.pid_control);
    }

    #[test]
    fn test_pid_disabled_explicitly() {
        let doc = ConsensusDoc::parse("params bwauthpid=0\n").unwrap();
        assert!(!doc.params.pid_control);
    }

    #[test]
    fn test_missing_weights_fall_back() {
        let doc = ConsensusDoc::parse("params bwauthpid=1\n").unwrap();
        assert_eq!(doc.weights.wgd(), 0.0);
        assert_eq!(doc.weights.get("Wgg"), 1.0);
    }

    #[test]
    fn test_unknown_flags_ignored() {
        let text = format!(
            "r n {} d 2026-07-30 12:00:00 1.2.3.4 9001 0\n\
             s Fast MadeUpFlag Running\n\
             w Bandwidth=5\n",
            ID_A
        );
        let doc = ConsensusDoc::parse(&text).unwrap();
        let entry = doc.relays.values().next().unwrap();
        assert_eq!(entry.flags, vec![Flag::Fast, Flag::Running]);
    }

    #[test]
    fn test_relay_without_w_line_has_no_bandwidth() {
        let text = format!(
            "r n {} d 2026-07-30 12:00:00 1.2.3.4 9001 0\n\
             s Fast Running\n",
            ID_A
        );
        let doc = ConsensusDoc::parse(&text).unwrap();
        assert_eq!(doc.relays.values().next().unwrap().bandwidth, None);
    }

    #[test]
    fn test_flags_before_relay_rejected() {
        assert!(matches!(
            ConsensusDoc::parse("s Fast Running\n"),
            Err(ParseError::UnexpectedKeyword { .. })
        ));
    }
}
