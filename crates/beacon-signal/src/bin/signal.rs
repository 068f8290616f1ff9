//! Beacon Signal Server
//!
//! WebRTC signaling broker between registered server endpoints and the
//! clients that want to reach them.
//!
//! # Usage
//!
//! ```bash
//! beacon-signal --port 8080
//!
//! # Tighter abuse limits
//! beacon-signal --max-requests 50 --max-failed-lookups 5
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use beacon_signal::{RateLimiterConfig, ServerConfig, SignalServer, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "beacon-signal")]
#[command(about = "WebRTC signaling broker for remote endpoints")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Requests allowed per address per window
    #[arg(long, default_value_t = 100)]
    max_requests: u32,

    /// Rate-limit window in seconds
    #[arg(long, default_value_t = 60)]
    window_secs: u64,

    /// First-violation block duration in seconds
    #[arg(long, default_value_t = 60)]
    block_secs: u64,

    /// Failed server lookups allowed per address per window
    #[arg(long, default_value_t = 10)]
    max_failed_lookups: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    info!("starting beacon signal server");

    let config = ServerConfig {
        rate_limiter: RateLimiterConfig {
            max_requests: args.max_requests,
            window: Duration::from_secs(args.window_secs),
            base_block: Duration::from_secs(args.block_secs),
            max_failed_lookups: args.max_failed_lookups,
            ..RateLimiterConfig::default()
        },
        ..ServerConfig::default()
    };

    let server = SignalServer::new(config);
    server.serve(addr).await?;

    Ok(())
}
