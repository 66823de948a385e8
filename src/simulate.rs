use anyhow::{bail, Context};
use async_stream::stream;
use carnelia_runtime::{
    Identity, MemoryKv, NetworkConfig, NetworkStats, Node, RuntimeConfig, SimNetwork,
};
use carnelia_services::{install, BroadcastPayload, ServiceConfig, Services, Workload};
use carnelia_wire::{Body, NodeId};
use colored::*;
use futures::stream::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Parameters of one in-process simulation run.
#[derive(Clone, Debug)]
pub struct SimulationOptions {
    pub nodes: usize,
    pub loss_rate: f64,
    pub values: usize,
    pub increments: usize,
    pub seed: u64,
    /// Give up on broadcast convergence after this many gossip intervals.
    pub max_rounds: u32,
}

/// Statistics collected during a simulation
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub nodes: usize,
    pub loss_rate: f64,
    pub distinct_values: usize,
    pub converged_nodes: usize,
    pub rounds: u32,
    pub open_obligations: usize,
    pub increments: usize,
    pub counter_total: i64,
    pub cas_conflicts: u64,
    pub network: NetworkStats,
    pub total_time: Duration,
}

impl SimulationStats {
    pub fn converged(&self) -> bool {
        self.converged_nodes == self.nodes && self.counter_total == self.increments as i64
    }

    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Simulation Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Nodes:                     {:>30} ║", self.nodes);
        println!("║  Loss Rate:                 {:>29}% ║", format!("{:.1}", self.loss_rate * 100.0));
        println!("║  Distinct Values:           {:>30} ║", self.distinct_values);
        println!("║  Converged Nodes:           {:>30} ║", format!("{}/{}", self.converged_nodes, self.nodes));
        println!("║  Gossip Rounds:             {:>30} ║", self.rounds);
        println!("║  Open Obligations:          {:>30} ║", self.open_obligations);
        println!("║  Counter Total:             {:>30} ║", format!("{}/{}", self.counter_total, self.increments));
        println!("║  CAS Conflicts:             {:>30} ║", self.cas_conflicts);
        println!("║  Messages Delivered:        {:>30} ║", self.network.delivered);
        println!("║  Messages Dropped:          {:>30} ║", self.network.dropped);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("╚════════════════════════════════════════════════════════════╝");

        if self.converged() {
            println!("\n{}", "✓ Cluster converged".green().bold());
        } else {
            println!("\n{}", "✗ Cluster did not converge".red().bold());
        }
    }
}

/// Yields `(target node, value)` pairs for the broadcast phase.
fn broadcast_generator(
    nodes: usize,
    values: usize,
    seed: u64,
) -> impl Stream<Item = (usize, i64)> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..values {
            let target = rng.gen_range(0..nodes);
            let value = rng.gen_range(0..(values as i64 * 100).max(1));
            yield (target, value);
        }
    }
}

fn cluster_ids(prefix: &str, count: usize) -> Vec<NodeId> {
    (0..count)
        .map(|i| NodeId::new(format!("{}{}", prefix, i)))
        .collect()
}

fn start_nodes(
    network: &SimNetwork,
    ids: &[NodeId],
    workload: Workload,
    runtime: &RuntimeConfig,
    services: &ServiceConfig,
) -> anyhow::Result<Vec<Services>> {
    ids.iter()
        .map(|id| -> anyhow::Result<Services> {
            let node = Node::with_identity(
                runtime.clone(),
                Identity::new(id.clone(), ids.to_vec()),
            );
            let installed = install(&node, workload, services);
            network.attach_lossy(&node)?;
            Ok(installed)
        })
        .collect()
}

/// Run a simulated cluster: gossip random values around a ring, then add to
/// the shared counter from every node at once.
pub async fn run(
    options: SimulationOptions,
    runtime: RuntimeConfig,
    services: ServiceConfig,
) -> anyhow::Result<SimulationStats> {
    if options.nodes == 0 {
        bail!("a simulation needs at least one node");
    }

    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Cluster Simulation                                  ║");
    println!(
        "║  Nodes: {} | Loss: {:.0}% | Values: {} | Increments: {} ║",
        options.nodes,
        options.loss_rate * 100.0,
        options.values,
        options.increments
    );
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let network = SimNetwork::new(NetworkConfig::lossy(options.loss_rate).with_seed(options.seed));

    let kv_node = Node::with_identity(runtime.clone(), Identity::new(services.kv_service.as_str(), vec![]));
    let kv = Arc::new(MemoryKv::new());
    kv.serve(&kv_node);
    network.attach(&kv_node)?;

    // Clients outlive the counter's retries.
    let client_config = RuntimeConfig {
        rpc_timeout_ms: runtime.rpc_timeout_ms.max(60_000),
        ..runtime.clone()
    };
    let client = Node::with_identity(client_config, Identity::new("c0", vec![]));
    network.attach(&client)?;

    println!("\n[Phase 1/2] Gossiping values around the ring...");
    let gossip_ids = cluster_ids("n", options.nodes);
    let gossip_nodes = start_nodes(&network, &gossip_ids, Workload::Broadcast, &runtime, &services)?;
    assign_ring(&client, &gossip_ids).await?;

    let mut expected = BTreeSet::new();
    let mut values = Box::pin(broadcast_generator(options.nodes, options.values, options.seed));
    while let Some((target, value)) = values.next().await {
        expected.insert(value);
        client
            .call(&gossip_ids[target], Body::new("broadcast").with_field("message", value))
            .await
            .with_context(|| format!("broadcast of {} to {}", value, gossip_ids[target]))?;
    }

    let mut rounds = 0;
    let mut converged_nodes = count_converged(&client, &gossip_ids, &expected).await?;
    while converged_nodes < options.nodes && rounds < options.max_rounds {
        tokio::time::sleep(services.gossip_interval()).await;
        rounds += 1;
        converged_nodes = count_converged(&client, &gossip_ids, &expected).await?;
        debug!(rounds, converged_nodes, "convergence check");
    }
    let open_obligations = gossip_nodes
        .iter()
        .filter_map(|s| s.broadcast.as_ref())
        .map(|d| d.active_obligations())
        .sum();
    println!("[Phase 1/2] ✓ Completed");

    println!("[Phase 2/2] Incrementing the shared counter...");
    let counter_ids = cluster_ids("k", options.nodes);
    let counter_nodes = start_nodes(&network, &counter_ids, Workload::Counter, &runtime, &services)?;

    let adds: Vec<_> = (0..options.increments)
        .map(|i| {
            let client = client.clone();
            let target = counter_ids[i % counter_ids.len()].clone();
            tokio::spawn(async move {
                client
                    .call(&target, Body::new("add").with_field("delta", 1))
                    .await
            })
        })
        .collect();
    for add in adds {
        add.await?.context("counter increment")?;
    }

    let reply = client.call(&counter_ids[0], Body::new("read")).await?;
    let counter_total = reply
        .body
        .fields
        .get("value")
        .and_then(|v| v.as_i64())
        .unwrap_or_default();
    let cas_conflicts = counter_nodes
        .iter()
        .filter_map(|s| s.counter.as_ref())
        .map(|c| c.conflicts())
        .sum();
    println!("[Phase 2/2] ✓ Completed");

    let stats = SimulationStats {
        nodes: options.nodes,
        loss_rate: network.config().loss_rate,
        distinct_values: expected.len(),
        converged_nodes,
        rounds,
        open_obligations,
        increments: options.increments,
        counter_total,
        cas_conflicts,
        network: network.stats(),
        total_time: start.elapsed(),
    };
    info!(
        converged = stats.converged(),
        rounds,
        dropped = stats.network.dropped,
        "simulation finished"
    );
    Ok(stats)
}

async fn assign_ring(client: &Node, ids: &[NodeId]) -> anyhow::Result<()> {
    let n = ids.len();
    for (i, id) in ids.iter().enumerate() {
        let neighbors = vec![ids[(i + n - 1) % n].clone(), ids[(i + 1) % n].clone()];
        client
            .call(
                id,
                Body::new("topology").with_field("topology", json!({ id.as_str(): neighbors })),
            )
            .await
            .with_context(|| format!("topology for {}", id))?;
    }
    Ok(())
}

async fn count_converged(
    client: &Node,
    ids: &[NodeId],
    expected: &BTreeSet<i64>,
) -> anyhow::Result<usize> {
    let mut converged = 0;
    for id in ids {
        let reply = client.call(id, Body::new("read")).await?;
        let seen: BTreeSet<i64> = match reply.body.decode()? {
            BroadcastPayload::ReadOk { messages } => messages.into_iter().collect(),
            _ => bail!("{} answered read with {}", id, reply.kind()),
        };
        if seen.is_superset(expected) {
            converged += 1;
        }
    }
    Ok(converged)
}
