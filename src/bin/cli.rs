use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use raftlink::{GatewayClient, NodeAddress};

#[derive(Parser)]
#[command(name = "raftlink-cli")]
#[command(about = "Talk to the client gateways of a raftlink cluster")]
#[command(version)]
struct Cli {
    /// Gateway addresses, comma separated
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_value = "http://127.0.0.1:8181,http://127.0.0.1:8182"
    )]
    gateways: Vec<NodeAddress>,

    /// Offset between a node's packet port and its gateway port
    #[arg(long, default_value_t = 100)]
    port_offset: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a key through the current leader
    Set { key: String, value: String },
    /// Read a key from the first gateway that answers
    Get {
        key: String,
        /// Read from this gateway only
        #[arg(long)]
        from: Option<NodeAddress>,
    },
    /// Show role, term and leader of every gateway
    Status,
    /// Issue `count` SETs of i -> i, then read them back
    Load {
        #[arg(default_value_t = 1000)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .compact()
        .init();

    let cli = Cli::parse();
    let mut client = GatewayClient::new(cli.gateways)?.with_port_offset(cli.port_offset);

    match cli.command {
        Command::Set { key, value } => {
            let ack = client.set(key.clone(), value).await?;
            println!(
                "✅ {} stored ({} delivered, {} failed, {:?})",
                key, ack.delivered, ack.failed, ack.policy
            );
        }
        Command::Get { key, from } => {
            let value = match from {
                Some(gateway) => client.get_from(&gateway, key.clone()).await?,
                None => client.get(key.clone()).await?,
            };
            match value {
                Some(value) => println!("{} = {}", key, value),
                None => println!("{} is not set", key),
            }
        }
        Command::Status => {
            for gateway in client.gateways().to_vec() {
                match client.status(&gateway).await {
                    Ok(status) => println!(
                        "{} -> {} {} term={} leader={}",
                        gateway,
                        status.address,
                        status.role,
                        status.term,
                        status
                            .leader
                            .map(|l| l.to_string())
                            .unwrap_or_else(|| "none".to_string())
                    ),
                    Err(e) => println!("{} -> unreachable: {}", gateway, e),
                }
            }
        }
        Command::Load { count } => run_load(&mut client, count).await?,
    }

    Ok(())
}

async fn run_load(client: &mut GatewayClient, count: usize) -> Result<()> {
    client
        .wait_for_leader(Duration::from_secs(30))
        .await
        .context("No leader elected")?;

    let started = Instant::now();
    let mut failed_sets = 0;
    for i in 0..count {
        if let Err(e) = client.set(i.to_string(), i.to_string()).await {
            tracing::warn!("SET {} failed: {}", i, e);
            failed_sets += 1;
        }
    }
    let set_elapsed = started.elapsed();

    let started = Instant::now();
    let mut missing = 0;
    for i in 0..count {
        match client.get(i.to_string()).await {
            Ok(Some(value)) if value == i.to_string() => {}
            Ok(_) => missing += 1,
            Err(e) => {
                tracing::warn!("GET {} failed: {}", i, e);
                missing += 1;
            }
        }
    }
    let get_elapsed = started.elapsed();

    println!(
        "📈 {} SETs in {:?} ({} failed), {} GETs in {:?} ({} stale or missing)",
        count, set_elapsed, failed_sets, count, get_elapsed, missing
    );
    Ok(())
}
