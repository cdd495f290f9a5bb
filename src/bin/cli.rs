//! CLI for table operations

use anyhow::Context;
use clap::{Parser, Subcommand};
use minikv_client::common::parse_duration;
use minikv_client::{Client, ClientConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minikv-client")]
#[command(about = "minikv table client")]
#[command(version)]
struct Cli {
    /// Meta server addresses (comma-separated); overrides config and environment
    #[arg(long, value_delimiter = ',')]
    meta: Vec<String>,

    /// Config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Deadline for each command, e.g. 500ms, 5s
    #[arg(long, default_value = "5s")]
    timeout: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a table and print its partition map
    Open {
        table: String,
    },

    /// Read a value
    Get {
        table: String,
        hash_key: String,
        sort_key: String,
    },

    /// Write a value
    Set {
        table: String,
        hash_key: String,
        sort_key: String,
        value: String,
    },

    /// Delete a value
    Del {
        table: String,
        hash_key: String,
        sort_key: String,
    },

    /// Write then read back keys concurrently and report throughput
    Bench {
        table: String,

        /// Total number of keys
        #[arg(long, default_value = "1000")]
        ops: usize,

        /// Concurrent workers
        #[arg(long, default_value = "16")]
        concurrency: usize,

        /// Value size in bytes
        #[arg(long, default_value = "64")]
        value_size: usize,
    },
}

/// Config file, then `MINIKV_CLIENT_*` environment, then `--meta`.
fn load_config(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = &cli.config {
        builder = builder.add_source(config::File::from(path.as_path()));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("MINIKV_CLIENT")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("meta_servers"),
    );
    if !cli.meta.is_empty() {
        builder = builder.set_override("meta_servers", cli.meta.clone())?;
    }

    let config: ClientConfig = builder
        .build()?
        .try_deserialize()
        .context("no usable client configuration (pass --meta or MINIKV_CLIENT_META_SERVERS)")?;
    config.validate()?;
    Ok(config)
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
    let config = load_config(&cli)?;
    let timeout = parse_duration(&cli.timeout)?;
    let client = Arc::new(Client::new(config)?);

    let result = run(&client, cli.command, timeout).await;
    client.close();
    result
}

async fn run(client: &Arc<Client>, command: Commands, timeout: Duration) -> anyhow::Result<()> {
    match command {
        Commands::Open { table } => {
            let connector = client.open_table(&table, timeout).await?;
            let map = connector.partition_map();
            println!("Table {} (app id {}):", map.table(), map.app_id());
            for p in map.partitions() {
                println!(
                    "  {:>4}  ballot {:>4}  primary {}  secondaries {}",
                    p.index,
                    p.ballot,
                    p.primary.as_deref().unwrap_or("-"),
                    p.secondaries.join(",")
                );
            }
        }

        Commands::Get {
            table,
            hash_key,
            sort_key,
        } => {
            let value = client
                .get(&table, hash_key.as_bytes(), sort_key.as_bytes(), timeout)
                .await?;
            println!("{}", String::from_utf8_lossy(&value));
        }

        Commands::Set {
            table,
            hash_key,
            sort_key,
            value,
        } => {
            client
                .set(
                    &table,
                    hash_key.as_bytes(),
                    sort_key.as_bytes(),
                    value.as_bytes(),
                    timeout,
                )
                .await?;
            println!("OK");
        }

        Commands::Del {
            table,
            hash_key,
            sort_key,
        } => {
            client
                .del(&table, hash_key.as_bytes(), sort_key.as_bytes(), timeout)
                .await?;
            println!("OK");
        }

        Commands::Bench {
            table,
            ops,
            concurrency,
            value_size,
        } => bench(client, &table, ops, concurrency.max(1), value_size, timeout).await?,
    }
    Ok(())
}

async fn bench(
    client: &Arc<Client>,
    table: &str,
    ops: usize,
    concurrency: usize,
    value_size: usize,
    timeout: Duration,
) -> anyhow::Result<()> {
    client.open_table(table, timeout).await?;
    let value = Arc::new(vec![b'x'; value_size]);
    let started = Instant::now();

    let mut workers = tokio::task::JoinSet::new();
    for worker in 0..concurrency {
        let client = client.clone();
        let table = table.to_string();
        let value = value.clone();
        workers.spawn(async move {
            let mut failures = 0usize;
            for i in (worker..ops).step_by(concurrency) {
                let hash_key = format!("bench-{}", i);
                let written = client
                    .set(&table, hash_key.as_bytes(), b"s", value.as_slice(), timeout)
                    .await;
                let ok = match written {
                    Ok(()) => client
                        .get(&table, hash_key.as_bytes(), b"s", timeout)
                        .await
                        .map(|got| got == *value)
                        .unwrap_or(false),
                    Err(e) => {
                        tracing::warn!("set {} failed: {}", hash_key, e);
                        false
                    }
                };
                if !ok {
                    failures += 1;
                }
            }
            failures
        });
    }

    let mut failures = 0;
    while let Some(joined) = workers.join_next().await {
        failures += joined?;
    }

    let elapsed = started.elapsed();
    let metrics = client.metrics();
    println!("Bench report:");
    println!("  Keys: {}", ops);
    println!("  Failures: {}", failures);
    println!("  Elapsed: {:.2?}", elapsed);
    println!(
        "  Throughput: {:.0} ops/s",
        metrics.ops_total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("  Connections opened: {}", metrics.connections_opened);
    println!("  Partition refreshes: {}", metrics.table_refreshes);
    Ok(())
}
