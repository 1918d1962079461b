use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use rustingest::{
    BatchClient, BatchConfig, BatchMode, ClusterStatus, InMemoryGateway, ObjectInput,
    ReferenceInput,
};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rustingest")]
#[command(about = "Adaptive batch ingestion against a simulated object store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest generated objects and references into an in-memory store
    Simulate {
        #[arg(long, default_value_t = 1_000)]
        objects: usize,
        /// References added from every object to the previous one
        #[arg(long, default_value_t = 0)]
        references_per_object: usize,
        #[arg(long, value_enum, default_value_t = ModeArg::Dynamic)]
        mode: ModeArg,
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
        #[arg(long, default_value_t = 2)]
        concurrency: usize,
        #[arg(long, default_value_t = 6_000)]
        requests_per_minute: usize,
        /// Simulated latency of every gateway call
        #[arg(long, default_value_t = 5)]
        latency_ms: u64,
        /// Fail this many gateway calls at the start with a transport error
        #[arg(long, default_value_t = 0)]
        transport_failures: usize,
        /// Reject every n-th object with an application error
        #[arg(long)]
        reject_every: Option<usize>,
        /// Report this server queue length to the congestion monitor
        #[arg(long)]
        server_queue: Option<u64>,
        #[arg(long, default_value_t = 500.0)]
        server_rate: f64,
        /// JSON batch configuration; overrides the mode flags
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as JSON
    DefaultConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Dynamic,
    Fixed,
    RateLimit,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            objects,
            references_per_object,
            mode,
            batch_size,
            concurrency,
            requests_per_minute,
            latency_ms,
            transport_failures,
            reject_every,
            server_queue,
            server_rate,
            config,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => {
                    let mode = match mode {
                        ModeArg::Dynamic => BatchMode::Dynamic,
                        ModeArg::Fixed => BatchMode::FixedSize {
                            batch_size,
                            concurrent_requests: concurrency,
                        },
                        ModeArg::RateLimit => BatchMode::RateLimit {
                            requests_per_minute,
                        },
                    };
                    BatchConfig::dynamic()
                        .mode(mode)
                        .concurrent_requests(concurrency)
                }
            };

            let gateway = InMemoryGateway::new().with_latency(Duration::from_millis(latency_ms));
            if transport_failures > 0 {
                gateway.fail_next_sends(transport_failures, "simulated connection reset");
            }
            if let Some(every) = reject_every {
                if every == 0 {
                    bail!("--reject-every must be at least 1");
                }
                gateway.reject_objects_where(move |object| {
                    let n = object.properties.get("n").and_then(|n| n.as_u64())?;
                    (n % every as u64 == 0).then(|| "simulated schema violation".to_string())
                });
            }
            if let Some(queue_length) = server_queue {
                gateway.set_cluster_status(Some(ClusterStatus {
                    queue_length,
                    rate_per_second: server_rate,
                    worker_count: 1,
                }));
            }

            simulate(gateway, config, objects, references_per_object).await
        }
        Command::DefaultConfig => {
            let json = serde_json::to_string_pretty(&BatchConfig::default())
                .context("Failed to serialize default configuration")?;
            println!("{}", json);
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rustingest=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &Path) -> Result<BatchConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config '{}'", path.display()))?;
    BatchConfig::from_json(&raw).with_context(|| format!("Invalid config '{}'", path.display()))
}

async fn simulate(
    gateway: InMemoryGateway,
    config: BatchConfig,
    objects: usize,
    references_per_object: usize,
) -> Result<()> {
    let client = BatchClient::new(gateway.clone(), config).context("Invalid batch configuration")?;
    let batch = client.batch().await?;

    let mut previous = None;
    for n in 0..objects {
        let uuid = batch
            .add_object(
                ObjectInput::new("Article")
                    .properties(json!({ "n": n, "title": format!("article {}", n) })),
            )
            .await?;
        if let Some(previous) = previous {
            for _ in 0..references_per_object {
                batch
                    .add_reference(ReferenceInput::new("Article", uuid, "cites", previous))
                    .await?;
            }
        }
        previous = Some(uuid);
    }

    batch.flush().await?;
    let stats = batch.stats();
    let results = batch.finish().await?;

    println!("{}", results);
    println!("{}", stats);
    println!(
        "Store: {} objects, {} references, object calls {:?}",
        gateway.object_count(),
        gateway.reference_count(),
        gateway.object_batch_sizes()
    );
    for failure in client.failed_objects().iter().take(5) {
        println!("  failed object {}: {}", failure.operation.uuid, failure.message);
    }
    Ok(())
}
