//! PIR broadcast server daemon.
//!
//! Usage:
//!   pir-server
//!   pir-server --sensor simulated --port 6000

use clap::Parser;
use log::{error, info};
use pir_link::BroadcastServer;
use pir_link::config::{Config, SensorKind};
use pir_link::discovery::local_ipv4;
use pir_link::sensors;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pir-server")]
#[command(about = "Broadcast a PIR motion sensor to TCP clients")]
struct Cli {
    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// TCP port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Broadcast interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// GPIO pin number reported to clients
    #[arg(long)]
    pin: Option<u8>,

    /// Sensor source: gpio or simulated
    #[arg(long)]
    sensor: Option<SensorKind>,

    /// Path of the sysfs GPIO value file
    #[arg(long)]
    gpio_path: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.server.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(tick) = self.tick_ms.filter(|&ms| ms > 0) {
            config.server.tick_interval = Duration::from_millis(tick);
        }
        if let Some(pin) = self.pin {
            config.server.pin = pin;
        }
        if let Some(kind) = self.sensor {
            config.sensor.kind = kind;
        }
        if let Some(path) = self.gpio_path {
            config.sensor.gpio_value_path = path;
        }
    }
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    pir_link::config::load_dotenv();
    init_logger();

    let mut config = Config::from_env();
    Cli::parse().apply(&mut config);

    info!("Starting PIR broadcast server");
    let ip = match local_ipv4().await {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            info!("{}", e);
            "127.0.0.1".to_string()
        }
    };
    info!("  Host: {}", gethostname::gethostname().to_string_lossy());
    info!("  IP Address: {}", ip);
    info!("  Port: {}", config.server.port);
    info!("  Sensor: {} (GPIO {})", config.sensor.kind, config.server.pin);
    info!("  Send interval: {:?}", config.server.tick_interval);
    info!("  Clients should connect to: {}:{}", ip, config.server.port);

    let sensor = sensors::from_config(&config.sensor);
    let server = match BroadcastServer::start(&config.server, sensor).await {
        Ok(server) => server,
        Err(e) => {
            error!("Unable to start server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    server.shutdown().await;
    info!("Server stopped cleanly");
    ExitCode::SUCCESS
}
