//! # Carnelia Node
//!
//! A Maelstrom cluster node. With no subcommand it serves one workload over
//! stdin/stdout: a replicated counter on top of `seq-kv`, or gossip
//! broadcast over the assigned topology. `echo`, `generate` and `topology`
//! are served either way.
//!
//! `simulate` instead builds a whole cluster in-process over a lossy
//! network and reports how it converged.

use anyhow::Context;
use carnelia_runtime::{Node, RuntimeConfig, RuntimeConfigBuilder, StdioTransport};
use carnelia_services::{install, ServiceConfig, ServiceConfigBuilder, Workload};
use clap::{Args, Parser, Subcommand, ValueEnum};
use simulate::SimulationOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub mod simulate;

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "carnelia-node")]
#[command(about = "Maelstrom node serving a replicated counter and gossip broadcast")]
#[command(version)]
struct Cli {
    /// Workload that owns the `read` message type: counter or broadcast
    #[arg(long, env = "CARNELIA_WORKLOAD", value_enum, default_value_t = WorkloadArg::Broadcast)]
    workload: WorkloadArg,

    /// How long a request to another node or service waits for its reply
    #[arg(long, env = "CARNELIA_RPC_TIMEOUT_MS", default_value_t = 1000)]
    rpc_timeout_ms: u64,

    /// Wait after losing a compare-and-swap race
    #[arg(long, env = "CARNELIA_CAS_BACKOFF_MS", default_value_t = 200)]
    cas_backoff_ms: u64,

    /// Interval between gossip rounds for one value
    #[arg(long, env = "CARNELIA_GOSSIP_INTERVAL_MS", default_value_t = 5000)]
    gossip_interval_ms: u64,

    /// KV key holding the counter
    #[arg(long, env = "CARNELIA_COUNTER_KEY", default_value = "value")]
    counter_key: String,

    /// KV service holding the counter
    #[arg(long, env = "CARNELIA_KV_SERVICE", default_value = "seq-kv")]
    kv_service: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Workload selection on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum WorkloadArg {
    Counter,
    Broadcast,
}

impl From<WorkloadArg> for Workload {
    fn from(arg: WorkloadArg) -> Self {
        match arg {
            WorkloadArg::Counter => Workload::Counter,
            WorkloadArg::Broadcast => Workload::Broadcast,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process cluster over a lossy network and print statistics
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct SimulateArgs {
    /// Nodes per workload
    #[arg(long, default_value_t = 5)]
    nodes: usize,

    /// Probability of losing a node-to-node message
    #[arg(long, default_value_t = 0.3)]
    loss: f64,

    /// Random values to broadcast
    #[arg(long, default_value_t = 50)]
    values: usize,

    /// Concurrent counter increments
    #[arg(long, default_value_t = 100)]
    increments: usize,

    /// Seed for message loss and value generation
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Gossip intervals to wait for convergence before giving up
    #[arg(long, default_value_t = 200)]
    max_rounds: u32,
}

impl Cli {
    fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfigBuilder::new()
            .rpc_timeout(self.rpc_timeout_ms)
            .build()
    }

    fn service_config(&self) -> ServiceConfig {
        ServiceConfigBuilder::new()
            .cas_backoff(self.cas_backoff_ms)
            .gossip_interval(self.gossip_interval_ms)
            .counter_key(self.counter_key.as_str())
            .kv_service(self.kv_service.as_str())
            .build()
    }
}

impl From<&SimulateArgs> for SimulationOptions {
    fn from(args: &SimulateArgs) -> Self {
        Self {
            nodes: args.nodes,
            loss_rate: args.loss,
            values: args.values,
            increments: args.increments,
            seed: args.seed,
            max_rounds: args.max_rounds,
        }
    }
}

// ─── Entry point ───────────────────────────────────────────────────────────

/// Logs go to stderr: stdout carries the protocol.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let runtime = cli.runtime_config();
    let services = cli.service_config();

    match &cli.command {
        None => serve(cli.workload.into(), runtime, services).await,
        Some(Commands::Simulate(args)) => {
            let stats = simulate::run(args.into(), runtime, services).await?;
            stats.print();
            Ok(())
        }
    }
}

async fn serve(
    workload: Workload,
    runtime: RuntimeConfig,
    services: ServiceConfig,
) -> anyhow::Result<()> {
    let node = Node::new(runtime);
    install(&node, workload, &services);
    info!(?workload, "serving on stdio");

    node.run(StdioTransport::stdio())
        .await
        .context("node runtime failed")?;
    info!("node stopped");
    Ok(())
}
