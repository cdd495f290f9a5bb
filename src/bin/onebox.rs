//! Single-process mock cluster for local experiments

use anyhow::Context;
use clap::Parser;
use minikv_client::testkit::MockCluster;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minikv-onebox")]
#[command(about = "Run meta and replica servers on localhost until Ctrl-C")]
struct Cli {
    /// Number of meta servers
    #[arg(long, default_value = "3")]
    metas: usize,

    /// Number of replica servers
    #[arg(long, default_value = "3")]
    replicas: usize,

    /// Tables as name:partitions (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "temp:8")]
    tables: Vec<String>,
}

fn parse_table(entry: &str) -> anyhow::Result<(String, u32)> {
    let (name, count) = entry
        .split_once(':')
        .with_context(|| format!("table {:?} is not name:partitions", entry))?;
    let count = count
        .parse()
        .with_context(|| format!("bad partition count in {:?}", entry))?;
    Ok((name.to_string(), count))
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
    let mut builder = MockCluster::builder().metas(cli.metas).replicas(cli.replicas);
    for entry in &cli.tables {
        let (name, count) = parse_table(entry)?;
        builder = builder.table(&name, count);
    }
    let cluster = builder.start().await?;

    tracing::info!("Onebox ready");
    println!("meta servers: {}", cluster.meta_addrs().join(","));
    println!("replicas:     {}", cluster.replica_addrs().join(","));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down ({} keys stored)", cluster.key_count());
    cluster.shutdown();
    Ok(())
}
