//! Graph runner entry point
//!
//! Loads a runtime configuration and a graph plan, launches the graph on
//! the actor runtime with the built-in kernels over the loopback transport
//! and prints a JSON report once every actor reached Terminal.

use anyhow::{Context, Result};
use clap::Parser;
use config::{init_logging, GraphPlan, RuntimeConfig};
use dataflow_actors::{ActorStats, ActorSystem, Collected, ControllerPolicy, KernelRegistry};
use network::{LoopbackConfig, LoopbackTransport, TransportStats};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Graph plan (TOML list of task descriptors)
    #[arg(short, long)]
    plan: PathBuf,

    /// Runtime configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured worker thread count
    #[arg(long)]
    workers: Option<usize>,

    /// Resubmit failed transfers up to this many times instead of aborting
    #[arg(long)]
    retry_transfers: Option<u32>,

    /// Override the configured shutdown timeout, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print collected sink payloads as hex alongside the report
    #[arg(long)]
    dump: bool,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    plan: String,
    elapsed_ms: u64,
    messages_sent: u64,
    cross_node_sends: u64,
    transfer_failures: u64,
    resubmitted: u64,
    pieces_collected: usize,
    transport: TransportStats,
    actors: BTreeMap<String, ActorStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    collected: Option<Vec<(u64, Vec<String>)>>,
}

/// Hex-encode collected payloads, keyed by piece
fn dump_payloads<B: AsRef<[u8]>>(
    pieces: impl IntoIterator<Item = (u64, Vec<B>)>,
) -> Vec<(u64, Vec<String>)> {
    pieces
        .into_iter()
        .map(|(piece, payloads)| (piece, payloads.iter().map(hex::encode).collect()))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = RuntimeConfig::load(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.shutdown_timeout_ms = timeout_ms;
    }
    config.validate()?;
    init_logging(&config.logging)?;

    info!("Starting graph runner");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let plan = GraphPlan::load(&args.plan)?;
    let plan_name = plan.name.clone().unwrap_or_else(|| "unnamed".to_string());

    let settings = &config.transport;
    let transport = Arc::new(LoopbackTransport::new(
        tokio::runtime::Handle::current(),
        LoopbackConfig {
            latency: settings.latency(),
            jitter: settings.jitter(),
            failure_rate: settings.failure_rate,
            seed: settings.seed,
        },
    ));

    let policy = match args.retry_transfers {
        Some(max_attempts) => ControllerPolicy::ResubmitTransfers { max_attempts },
        None => ControllerPolicy::AbortOnTransferError,
    };
    let collected = Collected::default();
    let handle = ActorSystem::new(config, transport)
        .with_kernels(KernelRegistry::with_builtins(collected.clone()))
        .with_policy(policy)
        .launch(&plan)
        .with_context(|| format!("Failed to launch graph '{plan_name}'"))?;

    let report = match handle.wait().await {
        Ok(report) => report,
        Err(failure) => {
            error!(plan = %plan_name, error = %failure, "Graph failed");
            return Err(failure).context("Graph did not complete");
        }
    };

    let summary = RunSummary {
        plan: plan_name,
        elapsed_ms: report.elapsed.as_millis() as u64,
        messages_sent: report.messages_sent,
        cross_node_sends: report.cross_node_sends,
        transfer_failures: report.transfer_failures,
        resubmitted: report.resubmitted,
        pieces_collected: collected.len(),
        transport: report.transport,
        actors: report
            .actors
            .into_iter()
            .map(|(id, stats)| (id.to_string(), stats))
            .collect(),
        collected: args.dump.then(|| {
            dump_payloads(
                collected
                    .snapshot()
                    .into_iter()
                    .map(|(piece, payloads)| (piece.get(), payloads)),
            )
        }),
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to encode report")?
    );
    info!(
        elapsed = ?Duration::from_millis(summary.elapsed_ms),
        pieces = summary.pieces_collected,
        "Graph runner finished"
    );
    Ok(())
}
