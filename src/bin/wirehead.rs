//! Standalone server binary.

use clap::{ArgAction, Parser};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wirehead::cdp::NullDispatcherFactory;
use wirehead::config::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MEMORY_LIMIT};
use wirehead::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "wirehead", version, about = "Headless-browser remote-debugging server")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:9222")]
    listen: SocketAddr,

    /// Inactivity timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    /// Per-session memory limit in bytes.
    #[arg(long, default_value_t = DEFAULT_MEMORY_LIMIT)]
    memory_limit: usize,

    /// Increase verbosity (-v, -vv).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> io::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wirehead={default_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig {
        listen: cli.listen,
        timeout: Duration::from_secs(cli.timeout),
        max_message_size: cli.max_message_size,
        memory_limit: cli.memory_limit,
    };

    let server = Server::bind(config, Arc::new(NullDispatcherFactory))?;
    server.run()
}
