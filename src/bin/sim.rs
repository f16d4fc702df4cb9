//! Replication simulator: drives the quorum layer against in-process replicas
//! with injected latency, failures, conflicts, drops and duplicates.

use clap::{Parser, Subcommand};
use kvquorum::common::{parse_duration, ReplicationConfig};
use kvquorum::replication::{
    spawn_timeout_ticker, ChannelTransport, OpKind, Outbound, ReplicaId,
    ReplicaResponse, ReplicationService, ResponseCode,
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kvquorum-sim")]
#[command(about = "Simulate quorum replication against faulty replicas")]
#[command(version)]
struct Cli {
    /// TOML config file (KVQUORUM__* env vars override it)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload
    Run {
        /// Storage nodes in the simulated cluster
        #[arg(long, default_value = "5")]
        nodes: usize,

        /// Replicas per key
        #[arg(long, default_value = "3")]
        replicas: usize,

        /// Operations to issue
        #[arg(long, default_value = "1000")]
        ops: usize,

        /// Probability a replica reports failure
        #[arg(long, default_value = "0.05")]
        fail_rate: f64,

        /// Probability a replica reports a version conflict
        #[arg(long, default_value = "0.01")]
        conflict_rate: f64,

        /// Probability a request or its response is lost
        #[arg(long, default_value = "0.05")]
        drop_rate: f64,

        /// Probability a response is delivered twice
        #[arg(long, default_value = "0.02")]
        duplicate_rate: f64,

        /// Probability the client cancels an operation
        #[arg(long, default_value = "0.0")]
        cancel_rate: f64,

        /// Maximum replica latency (e.g. 50ms)
        #[arg(long, default_value = "50ms")]
        max_latency: String,

        /// Print metrics in Prometheus format
        #[arg(long)]
        metrics: bool,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy)]
struct Faults {
    fail_rate: f64,
    conflict_rate: f64,
    drop_rate: f64,
    duplicate_rate: f64,
    max_latency: Duration,
}

#[derive(Serialize)]
struct Summary {
    ops: usize,
    elapsed_ms: u128,
    results: BTreeMap<String, usize>,
    retries_sent: u64,
    replica_timeouts: u64,
    duplicate_responses: u64,
    late_responses: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ReplicationConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Run {
            nodes,
            replicas,
            ops,
            fail_rate,
            conflict_rate,
            drop_rate,
            duplicate_rate,
            cancel_rate,
            max_latency,
            metrics,
            json,
        } => {
            if replicas == 0 || replicas > nodes {
                anyhow::bail!("--replicas must be in [1, {}]", nodes);
            }
            let faults = Faults {
                fail_rate,
                conflict_rate,
                drop_rate,
                duplicate_rate,
                max_latency: parse_duration(&max_latency)?,
            };

            let (summary, prometheus) = run(config, nodes, replicas, ops, cancel_rate, faults).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Finished {} ops in {}ms", summary.ops, summary.elapsed_ms);
                for (result, count) in &summary.results {
                    println!("  {:<16} {}", result, count);
                }
                println!("  retries sent     {}", summary.retries_sent);
                println!("  replica timeouts {}", summary.replica_timeouts);
                println!("  duplicates       {}", summary.duplicate_responses);
                println!("  late responses   {}", summary.late_responses);
            }
            if metrics {
                print!("{}", prometheus);
            }
        }
    }

    Ok(())
}

async fn run(
    config: ReplicationConfig,
    nodes: usize,
    replicas: usize,
    ops: usize,
    cancel_rate: f64,
    faults: Faults,
) -> anyhow::Result<(Summary, String)> {
    let (transport, rx) = ChannelTransport::new();
    let tick = config.tick_interval();
    let service = Arc::new(ReplicationService::new(config, Arc::new(transport))?);
    let ticker = spawn_timeout_ticker(service.clone(), tick);
    let network = tokio::spawn(simulate_replicas(service.clone(), rx, faults));

    let cluster: Vec<ReplicaId> = (1..=nodes)
        .map(|i| ReplicaId::new(format!("node-{}", i)))
        .collect();
    let kinds = [OpKind::Put, OpKind::Get, OpKind::Invalidate];

    let start = Instant::now();
    let mut handles = Vec::with_capacity(ops);
    for i in 0..ops {
        let (set, kind, cancel) = {
            let mut rng = rand::thread_rng();
            let set: Vec<ReplicaId> = cluster.choose_multiple(&mut rng, replicas).cloned().collect();
            let kind = kinds[rng.gen_range(0..kinds.len())];
            (set, kind, rng.gen_bool(cancel_rate.clamp(0.0, 1.0)))
        };
        let payload = (kind == OpKind::Put).then(|| bytes::Bytes::from(format!("value-{}", i)));
        let op = service.prepare(format!("key-{}", i), kind, set, payload);
        let id = op.id;
        let handle = service.admit(op)?;
        if cancel {
            service.cancel(&id);
        }
        handles.push(handle);
    }

    let mut results: BTreeMap<String, usize> = BTreeMap::new();
    for handle in handles {
        let result = handle.result().await;
        *results.entry(result.to_string()).or_default() += 1;
    }
    let elapsed = start.elapsed();

    ticker.abort();
    network.abort();

    let m = service.metrics();
    debug_assert_eq!(
        results.values().sum::<usize>() as u64,
        m.finalized_total()
    );
    let summary = Summary {
        ops,
        elapsed_ms: elapsed.as_millis(),
        results,
        retries_sent: m.retries_sent.get(),
        replica_timeouts: m.replica_timeouts.get(),
        duplicate_responses: m.duplicate_responses.get(),
        late_responses: m.late_responses.get(),
    };
    Ok((summary, m.to_prometheus()))
}

/// Each outbound request becomes a task that answers (or not) after a
/// random delay.
async fn simulate_replicas(
    service: Arc<ReplicationService>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    faults: Faults,
) {
    while let Some(outbound) = rx.recv().await {
        let service = service.clone();
        tokio::spawn(async move {
            let (delay, code, dropped, duplicated) = {
                let mut rng = rand::thread_rng();
                let max = faults.max_latency.as_millis().max(1) as u64;
                let delay = Duration::from_millis(rng.gen_range(0..=max));
                let roll: f64 = rng.gen();
                let code = if roll < faults.conflict_rate {
                    ResponseCode::VersionConflict
                } else if roll < faults.conflict_rate + faults.fail_rate {
                    ResponseCode::Failed
                } else {
                    ResponseCode::Ok
                };
                (
                    delay,
                    code,
                    rng.gen_bool(faults.drop_rate.clamp(0.0, 1.0)),
                    rng.gen_bool(faults.duplicate_rate.clamp(0.0, 1.0)),
                )
            };
            if dropped {
                return;
            }
            tokio::time::sleep(delay).await;

            let mut response =
                ReplicaResponse::new(outbound.request.operation_id, outbound.replica, code);
            if code == ResponseCode::VersionConflict {
                response = response.with_version(outbound.request.attempt as u64 + 1);
            }
            if duplicated {
                service.on_response(response.clone());
            }
            service.on_response(response);
        });
    }
}
