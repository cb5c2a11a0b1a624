use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;

use agent_sync_core::config::SyncConfig;
use agent_sync_core::graph::GraphSet;
use agent_sync_core::metrics::{self, FailoverMetrics};
use agent_sync_core::replay::{self, ReplayHarness};
use agent_sync_core::telemetry::init_tracing;
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "agent-sync")]
#[command(about = "Agent state synchronisation and dual-region failover tooling")]
struct Cli {
    /// TOML config file (heartbeat timings, region names, graph state names)
    #[arg(long, global = true, env = "AGENT_SYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed a JSON-lines capture through the snapshot engine and failover sequencer
    Replay {
        /// Capture file, one snapshot or upstream envelope per line
        #[arg(short, long)]
        input: PathBuf,

        /// Print the prometheus text exposition when done
        #[arg(long)]
        metrics: bool,
    },
    /// Print the effective transition graphs
    Graphs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    }
    .with_env_overrides();
    init_tracing(&config.log_filter);

    match cli.command {
        Commands::Replay { input, metrics } => run_replay(&config, input, metrics),
        Commands::Graphs => print_graphs(&config),
    }
}

fn run_replay(config: &SyncConfig, input: PathBuf, with_metrics: bool) -> anyhow::Result<()> {
    let file = File::open(&input).with_context(|| format!("open {}", input.display()))?;
    let (harness, report) = ReplayHarness::new(config, FailoverMetrics::registered());
    if !report.is_clean() {
        warn!(failed = ?report.failed, "initial region setup incomplete");
    }

    let summary = replay::replay(BufReader::new(file), &harness)?;
    info!(
        lines = summary.lines,
        events = summary.events,
        active = %summary.active.as_deref().unwrap_or("none"),
        contacts = summary.contacts.len(),
        "replay finished"
    );

    let mut out = io::stdout().lock();
    writeln!(
        out,
        "{} lines, {} events, active={}, contacts=[{}]",
        summary.lines,
        summary.events,
        summary.active.as_deref().unwrap_or("none"),
        summary.contacts.join(",")
    )?;
    if with_metrics {
        out.write_all(&metrics::gather(&metrics::REGISTRY))?;
    }
    Ok(())
}

fn print_graphs(config: &SyncConfig) -> anyhow::Result<()> {
    let graphs = GraphSet::from_config(&config.graphs);
    let mut out = io::stdout().lock();
    writeln!(out, "# agent routing (state type)")?;
    for assoc in graphs.routing.associations() {
        writeln!(out, "{} -> {} => {}", assoc.from, assoc.to, assoc.event)?;
    }
    writeln!(out, "# agent named state (state name)")?;
    for assoc in graphs.named_state.associations() {
        writeln!(out, "{} -> {} => {}", assoc.from, assoc.to, assoc.event)?;
    }
    writeln!(out, "# contact (state type)")?;
    for assoc in graphs.contact.associations() {
        writeln!(out, "{} -> {} => {}", assoc.from, assoc.to, assoc.event)?;
    }
    Ok(())
}
