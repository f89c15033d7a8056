//! cmdlink-cli - Command-line client for cmdlink servers
//!
//! Drives the built-in echo commands of a `cmdlink` server.

mod commands;

use clap::{Parser, Subcommand};
use cmdlink_net::{NetService, ServiceConfig};
use colored::Colorize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cmdlink-cli")]
#[command(about = "Command-line client for cmdlink servers")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7411", env = "CMDLINK_SERVER")]
    server: SocketAddr,

    /// Request timeout in milliseconds
    #[arg(short, long, default_value = "5000")]
    timeout_ms: u64,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Round-trip an empty echo request
    Ping {
        /// Number of pings
        #[arg(short, long, default_value = "1")]
        count: u32,
    },

    /// Echo a message
    Echo {
        /// Message to send
        message: String,

        /// Ask the server to hold the response for this long
        #[arg(short, long)]
        delay_ms: Option<u64>,
    },

    /// Send many requests as fast as admission allows
    Flood {
        /// Total requests
        #[arg(short = 'n', long, default_value = "10000")]
        count: u64,

        /// Maximum requests in flight
        #[arg(short, long, default_value = "64")]
        concurrency: i64,

        /// Payload size in bytes
        #[arg(long, default_value = "64")]
        size: usize,

        /// Server-side delay per request
        #[arg(short, long, default_value = "0")]
        delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ServiceConfig::default()
        .with_request_timeout(Duration::from_millis(cli.timeout_ms))
        .with_read_timeout(None);
    if let Commands::Flood { concurrency, .. } = &cli.command {
        config = config.with_max_processing_requests(*concurrency);
    }

    let service = Arc::new(
        NetService::builder(config)
            .commands(cmdlink_net::echo::commands())
            .build(),
    );
    service.start()?;

    let connection = service.connect(cli.server).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    let result = commands::execute(&service, &connection, cli.command, cli.json).await;
    connection.close();
    service.shutdown();

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
