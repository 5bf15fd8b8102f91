//! Handshake server: answers Stage-A requests on the well-known port until
//! no request has arrived for the idle period.

use std::error::Error;
use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use stagewire::{Config, Server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Four-stage handshake server.
#[derive(Parser)]
#[command(name = "stagewire-server", author, version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Well-known Stage-A port
    #[arg(short, long)]
    port: Option<u16>,

    /// Byte alignment boundary
    #[arg(long)]
    align: Option<usize>,

    /// Seed for reproducible session parameters
    #[arg(long)]
    seed: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    if let Some(port) = cli.port {
        config.server.listen_port = port;
    }
    if let Some(align) = cli.align {
        config.protocol.byte_align = align;
    }
    if cli.seed.is_some() {
        config.server.seed = cli.seed;
    }

    let server = Server::bind(config).await?;
    info!("Listening for clients on {}", server.local_addr()?);

    server
        .run_with(|peer, outcome| match outcome {
            Ok(summary) => info!(
                "Client {} finished, final secret {:?}",
                peer,
                summary.final_secret()
            ),
            Err(e) => warn!("Client {} aborted: {}", peer, e),
        })
        .await?;

    info!("Server shut down");
    Ok(())
}
