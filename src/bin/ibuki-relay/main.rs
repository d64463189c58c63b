//! Ibuki Relay Binary
//!
//! Session relay server: producers broadcast live breath data, listeners
//! join with a 6-digit code. The relay holds no detector state - it only
//! forwards events between connections.
//!
//! ## Usage
//!
//! ```bash
//! # Run the relay
//! ibuki-relay
//!
//! # With a custom bind address
//! IBUKI_BIND=0.0.0.0:9000 ibuki-relay
//!
//! # With verbose logging
//! RUST_LOG=ibuki=debug ibuki-relay
//! ```

use anyhow::Result;
use std::net::SocketAddr;
use tokio::time::{interval, Duration};
use tracing::info;

use ibuki::relay::Registry;
use ibuki::web;

/// Relay configuration from environment
struct Config {
    /// Address to serve HTTP/WebSocket on
    bind: SocketAddr,
    /// Stats log cadence in seconds (0 disables)
    stats_interval_secs: u64,
}

impl Config {
    fn from_env() -> Result<Self> {
        let bind = std::env::var("IBUKI_BIND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 7890)));

        let stats_interval_secs: u64 = std::env::var("IBUKI_STATS_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            bind,
            stats_interval_secs,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ibuki=info".parse().unwrap()),
        )
        .init();

    let config = Config::from_env()?;

    info!("Ibuki Relay starting");
    info!("  Bind: {}", config.bind);

    let registry = Registry::new();

    // Spawn stats logging task
    if config.stats_interval_secs > 0 {
        let stats_registry = registry.clone();
        let period = Duration::from_secs(config.stats_interval_secs);
        tokio::spawn(async move {
            let mut stats_interval = interval(period);
            loop {
                stats_interval.tick().await;
                let stats = stats_registry.stats().await;
                info!(
                    "Stats: {} connections, {} active sessions, {} created, {} events forwarded ({} dropped)",
                    stats.connections,
                    stats.sessions_active,
                    stats.sessions_created,
                    stats.events_forwarded,
                    stats.events_dropped,
                );
            }
        });
    }

    web::serve(registry, config.bind).await
}
