use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use rosgraph::Master;

#[derive(Parser, Debug)]
#[command(name = "rosgraph-master")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the directory endpoint binds to.
    #[arg(short, long, default_value = "0.0.0.0:11311")]
    bind: SocketAddr,

    /// Seconds between directory snapshot log lines. 0 disables them.
    #[arg(short, long, default_value = "300")]
    snapshot_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let master = Master::bind(&args.bind.to_string()).await?;
    info!("Master directory listening on {}", master.uri());

    let snapshot_interval = args.snapshot_interval.max(1);
    let mut interval = time::interval(Duration::from_secs(snapshot_interval));
    interval.tick().await; // Skip initial tick

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                if args.snapshot_interval == 0 {
                    continue;
                }
                let state = master.registry().system_state();
                info!(
                    published_topics = state.publishers.len(),
                    subscribed_topics = state.subscribers.len(),
                    services = state.services.len(),
                    "directory snapshot"
                );
            }
        }
    }

    master.shutdown();
    Ok(())
}
