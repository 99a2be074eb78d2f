use std::path::PathBuf;
use std::process;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bwauthority::control::Controller;
use bwauthority::highlevel::ingest;
use bwauthority::highlevel::round::{Round, RoundError};
use bwauthority::parser::consensus::ConsensusDoc;
use bwauthority::parser::vote::VoteSet;
use bwauthority::writer;

/// Aggregate scanner measurements into a new bandwidth vote file.
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Control port host of the local Tor client.
    #[clap(long, default_value = "127.0.0.1")]
    control_host: String,
    /// Control port of the local Tor client.
    #[clap(long, default_value_t = 9051)]
    control_port: u16,
    /// Control authentication cookie. Defaults to tor.1/control_auth_cookie
    /// under the first data directory.
    #[clap(long, parse(from_os_str))]
    cookie_file: Option<PathBuf>,
    /// Do not vote on relays that are pure guards.
    #[clap(long)]
    ignore_guards: bool,
    /// Scanner data directories, followed by the vote file to update.
    #[clap(parse(from_os_str), required = true, min_values = 2)]
    paths: Vec<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        match e.downcast_ref::<RoundError>() {
            // a consensus without bandwidths is the host Tor's problem, not
            // ours; leave without alarming the supervisor
            Some(RoundError::MissingConsensusBandwidths) => process::exit(0),
            Some(_) => process::exit(1),
            None => {
                error!("Error during aggregate: {:#}", e);
                process::exit(1);
            }
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let (vote_file, data_dirs) = cli
        .paths
        .split_last()
        .context("need at least one data directory and a vote file")?;
    let now = Utc::now().timestamp() as f64;

    let mut controller = Controller::connect(&cli.control_host, cli.control_port)
        .context("connecting to the control port")?;
    let cookie_file = cli
        .cookie_file
        .clone()
        .unwrap_or_else(|| data_dirs[0].join("tor.1/control_auth_cookie"));
    controller
        .authenticate_cookie(&cookie_file)
        .context("authenticating to the control port")?;

    let consensus_text = controller
        .get_info("dir/status-vote/current/consensus")
        .context("fetching the current consensus")?;
    let consensus =
        ConsensusDoc::parse(&consensus_text).context("parsing the current consensus")?;

    for entry in consensus.relays.values() {
        if entry.bandwidth.is_none() {
            info!("Tor is not providing a consensus bandwidth for {}", entry.id);
        }
    }
    if !consensus.relays.values().any(|e| e.bandwidth.is_some()) {
        // sometimes the consensus lacks descriptors entirely
        error!("Tor is not providing consensus bandwidths!");
        return Err(RoundError::MissingConsensusBandwidths.into());
    }

    let scan = ingest::ingest(data_dirs, now);

    let previous_votes = if consensus.params.pid_control {
        VoteSet::load(vote_file)
    } else {
        VoteSet::default()
    };

    let round = Round::new(scan, consensus, previous_votes, cli.ignore_guards, now);
    let summary = round.run(|id| controller.descriptor_bw(id))?;

    writer::write_vote_file(vote_file, summary.scan_age, &summary.nodes)
        .with_context(|| format!("writing vote file {}", vote_file.display()))?;
    writer::write_file_list(
        &data_dirs[0],
        summary.nodes.iter().map(|n| n.filt_bw),
    )
    .context("writing the scanner file-size table")?;

    Ok(())
}
