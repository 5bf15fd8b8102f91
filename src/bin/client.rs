//! Handshake client: runs Stages A to D once and prints each secret.

use std::error::Error;
use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use stagewire::{Client, Config};
use tracing_subscriber::EnvFilter;

/// Four-stage handshake client.
#[derive(Parser)]
#[command(name = "stagewire-client", author, version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server address
    #[arg(short, long)]
    server: Option<IpAddr>,

    /// Server's well-known Stage-A port
    #[arg(short, long)]
    port: Option<u16>,

    /// Byte alignment boundary
    #[arg(long)]
    align: Option<usize>,

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
    if let Some(server) = cli.server {
        config.client.server_addr = server;
    }
    if let Some(port) = cli.port {
        config.client.server_port = port;
    }
    if let Some(align) = cli.align {
        config.protocol.byte_align = align;
    }

    let mut client = Client::new(config)?;
    match client.run().await {
        Ok(report) => {
            println!("Stage A secret: {}", report.stage_a);
            println!("Stage B secret: {}", report.stage_b);
            println!("Stage C secret: {}", report.stage_c);
            println!("Stage D secret: {}", report.stage_d);
        }
        Err(e) => println!("Handshake aborted: {e}"),
    }
    Ok(())
}
