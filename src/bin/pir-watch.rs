//! Motion watcher for a PIR broadcast server.
//!
//! Usage:
//!   pir-watch                 # discover the server on the local /24
//!   pir-watch 192.168.1.40    # connect directly
//!
//! Logs each debounced motion edge, then waits until no motion has been seen
//! for the configured quiet period. Reconnects when the server goes away.

use clap::Parser;
use log::{error, info, warn};
use pir_link::SensorLink;
use pir_link::config::{Config, LinkConfig};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How often the link is polled.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An edge this recent keeps the quiet timer from starting.
const RECENT_MOTION: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "pir-watch")]
#[command(about = "Watch a PIR broadcast server for motion")]
struct Cli {
    /// Server address (host or host:port). Discovered when omitted.
    address: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// Debounce window in milliseconds
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Seconds without motion before reporting idle
    #[arg(long)]
    idle_secs: Option<u64>,
}

impl Cli {
    fn apply(self, config: &mut LinkConfig) {
        if let Some(address) = self.address {
            config.server = Some(address);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ms) = self.debounce_ms {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = self.idle_secs {
            config.no_motion = Duration::from_secs(secs);
        }
    }
}

enum Phase {
    Waiting,
    /// Motion seen; `quiet_since` starts once no recent motion remains.
    Active { quiet_since: Option<Instant> },
}

/// Poll the link until it disconnects or `shutdown` fires.
async fn watch(link: &SensorLink, config: &LinkConfig, shutdown: &CancellationToken) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut phase = Phase::Waiting;

    while link.is_connected() {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        phase = match phase {
            Phase::Waiting if link.get_motion(config.debounce) => {
                info!("Motion detected by PIR sensor");
                Phase::Active { quiet_since: None }
            }
            Phase::Waiting => Phase::Waiting,
            Phase::Active { quiet_since } => {
                if link.motion_within(RECENT_MOTION) {
                    if quiet_since.is_some() {
                        info!("Motion active, reset timer");
                    }
                    link.clear_motion();
                    Phase::Active { quiet_since: None }
                } else {
                    let since = quiet_since.unwrap_or_else(Instant::now);
                    if since.elapsed() >= config.no_motion {
                        info!("No motion for {:?}", config.no_motion);
                        Phase::Waiting
                    } else {
                        Phase::Active {
                            quiet_since: Some(since),
                        }
                    }
                }
            }
        };
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    pir_link::config::load_dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = Config::from_env().link;
    Cli::parse().apply(&mut config);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    while !shutdown.is_cancelled() {
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            connected = SensorLink::connect_or_discover(&config) => connected,
        };
        let link = match connected {
            Ok(link) => link,
            Err(e) if e.is_recoverable() => {
                warn!("{}; retrying in {:?}", e, config.reconnect_delay);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.reconnect_delay) => continue,
                }
            }
            Err(e) => {
                error!("Failed to connect to PIR server: {}", e);
                return ExitCode::FAILURE;
            }
        };

        watch(&link, &config, &shutdown).await;
        link.close();
        if shutdown.is_cancelled() {
            break;
        }

        warn!(
            "Lost connection to {}, reconnecting in {:?}",
            link.peer_addr(),
            config.reconnect_delay
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }

    info!("Watcher stopped");
    ExitCode::SUCCESS
}
