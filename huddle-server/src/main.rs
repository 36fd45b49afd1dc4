//! Huddle presence server.
//!
//! Serves the presence WebSocket for the team dashboard. Every flag can also
//! be set through its `HUDDLE_*` environment variable; log verbosity follows
//! `RUST_LOG` (default `info`).

use clap::Parser;
use log::info;
use std::time::Duration;

use huddle_presence::{PresenceHub, PresenceServer, ServerConfig};

/// Real-time presence and broadcast server for team dashboards
#[derive(Parser, Debug)]
#[command(name = "huddle-server")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "HUDDLE_BIND_ADDR", default_value = "127.0.0.1:3000")]
    bind_addr: String,

    /// Seconds of silence before a connection is evicted
    #[arg(long, env = "HUDDLE_LIVENESS_TIMEOUT_SECS", default_value_t = 65)]
    liveness_timeout_secs: u64,

    /// Seconds between stale-connection sweeps
    #[arg(long, env = "HUDDLE_SWEEP_INTERVAL_SECS", default_value_t = 5)]
    sweep_interval_secs: u64,

    /// Frames buffered per connection before fan-out drops
    #[arg(long, env = "HUDDLE_OUTBOX_CAPACITY", default_value_t = 256)]
    outbox_capacity: usize,

    /// Seconds between stats log lines (0 disables)
    #[arg(long, env = "HUDDLE_STATS_INTERVAL_SECS", default_value_t = 60)]
    stats_interval_secs: u64,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr.clone(),
            outbox_capacity: self.outbox_capacity.max(1),
            liveness_timeout: Duration::from_secs(self.liveness_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}

async fn report_stats(hub: std::sync::Arc<PresenceHub>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let stats = hub.stats().await;
        info!(
            "{} connected ({} not in a team) across {} team(s); sent {} / dropped {} frames; {} connections total",
            stats.total_connected,
            stats.unjoined,
            stats.active_teams,
            stats.messages_sent,
            stats.messages_dropped,
            stats.total_connections
        );
        for (team_id, count) in &stats.connections_by_team {
            log::debug!("  team {team_id}: {count} connected");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let server = PresenceServer::new(cli.server_config());
    info!("Starting Huddle presence server on {}...", server.bind_addr());

    if cli.stats_interval_secs > 0 {
        tokio::spawn(report_stats(
            server.hub(),
            Duration::from_secs(cli.stats_interval_secs),
        ));
    }

    tokio::select! {
        result = server.run() => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down");
            Ok(())
        }
    }
}
