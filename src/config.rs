use crate::decoder::DEFAULT_MAX_FRAME_LEN;
use crate::protocol::{DEFAULT_PORT, DEFAULT_TICK_INTERVAL};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumString};

/// Load environment variables from a `.env` file in the working directory.
/// Values may contain spaces without quotes; variables already set win.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    let Ok(content) = fs::read_to_string(env_path) else {
        return;
    };

    for (key, value) in parse_dotenv(&content) {
        if std::env::var(key).is_err() {
            // SAFETY: called at startup before the runtime spawns any threads
            unsafe { std::env::set_var(key, value) };
        }
    }
}

fn parse_dotenv(content: &str) -> Vec<(&str, &str)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                &value[1..value.len() - 1]
            } else {
                value
            };
            Some((key.trim(), value))
        })
        .collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub sensor: SensorConfig,
    pub link: LinkConfig,
}

/// Producer side: where to listen and how often to broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub tick_interval: Duration,
    /// GPIO pin number reported in every state record.
    pub pin: u8,
    /// Upper bound for a single client write before the client is dropped.
    pub write_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SensorKind {
    Gpio,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub kind: SensorKind,
    pub gpio_value_path: String,
    pub simulated_idle: Duration,
    pub simulated_burst: Duration,
}

/// Consumer side: connection, decoding and debounce settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Server address; `None` means discover it on the local /24.
    pub server: Option<String>,
    pub port: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub debounce: Duration,
    pub probe_timeout: Duration,
    pub max_frame_len: usize,
    pub reconnect_delay: Duration,
    /// Quiet period after which the watcher reports "no motion".
    pub no_motion: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            pin: 24,
            write_timeout: Duration::from_secs(1),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: SensorKind::Gpio,
            gpio_value_path: "/sys/class/gpio/gpio24/value".to_string(),
            simulated_idle: Duration::from_secs(10),
            simulated_burst: Duration::from_secs(3),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(1),
            debounce: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(50),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            reconnect_delay: Duration::from_secs(5),
            no_motion: Duration::from_secs(8),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build a configuration from defaults overridden by `PIR_*` variables.
    /// Unparseable values are ignored.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str| parsed(key).map(Duration::from_millis);

        // Server
        if let Some(addr) = lookup("PIR_BIND_ADDRESS") {
            config.server.bind_address = addr;
        }
        if let Some(port) = parse_var(&lookup, "PIR_PORT") {
            config.server.port = port;
            config.link.port = port;
        }
        if let Some(tick) = millis("PIR_TICK_MS")
            && !tick.is_zero()
        {
            config.server.tick_interval = tick;
        }
        if let Some(pin) = parse_var(&lookup, "PIR_PIN") {
            config.server.pin = pin;
        }
        if let Some(timeout) = millis("PIR_WRITE_TIMEOUT_MS") {
            config.server.write_timeout = timeout;
        }

        // Sensor
        if let Some(kind) = parse_var(&lookup, "PIR_SENSOR") {
            config.sensor.kind = kind;
        }
        if let Some(path) = lookup("PIR_GPIO_VALUE_PATH") {
            config.sensor.gpio_value_path = path;
        }
        if let Some(secs) = parsed("PIR_SIM_IDLE_SECS") {
            config.sensor.simulated_idle = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed("PIR_SIM_BURST_SECS") {
            config.sensor.simulated_burst = Duration::from_secs(secs);
        }

        // Link
        if let Some(server) = lookup("PIR_SERVER")
            && !server.trim().is_empty()
        {
            config.link.server = Some(server.trim().to_string());
        }
        if let Some(timeout) = millis("PIR_CONNECT_TIMEOUT_MS") {
            config.link.connect_timeout = timeout;
        }
        if let Some(timeout) = millis("PIR_READ_TIMEOUT_MS") {
            config.link.read_timeout = timeout;
        }
        if let Some(debounce) = millis("PIR_DEBOUNCE_MS") {
            config.link.debounce = debounce;
        }
        if let Some(timeout) = millis("PIR_PROBE_TIMEOUT_MS") {
            config.link.probe_timeout = timeout;
        }
        if let Some(len) = parse_var(&lookup, "PIR_MAX_FRAME_LEN") {
            config.link.max_frame_len = len;
        }
        if let Some(delay) = millis("PIR_RECONNECT_DELAY_MS") {
            config.link.reconnect_delay = delay;
        }
        if let Some(secs) = parsed("PIR_NO_MOTION_SECS") {
            config.link.no_motion = Duration::from_secs(secs);
        }

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_with(&[]);
        assert_eq!(config.server.port, 5555);
        assert_eq!(config.server.tick_interval, Duration::from_millis(100));
        assert_eq!(config.server.pin, 24);
        assert_eq!(config.sensor.kind, SensorKind::Gpio);
        assert_eq!(config.link.debounce, Duration::from_millis(200));
        assert!(config.link.server.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config_with(&[
            ("PIR_PORT", "6000"),
            ("PIR_TICK_MS", "250"),
            ("PIR_SENSOR", "Simulated"),
            ("PIR_SERVER", "192.168.1.40"),
            ("PIR_DEBOUNCE_MS", "0"),
        ]);
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.link.port, 6000);
        assert_eq!(config.server.tick_interval, Duration::from_millis(250));
        assert_eq!(config.sensor.kind, SensorKind::Simulated);
        assert_eq!(config.link.server.as_deref(), Some("192.168.1.40"));
        assert_eq!(config.link.debounce, Duration::ZERO);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_with(&[
            ("PIR_PORT", "not-a-port"),
            ("PIR_TICK_MS", "0"),
            ("PIR_SENSOR", "camera"),
            ("PIR_SERVER", "  "),
        ]);
        assert_eq!(config.server.port, 5555);
        assert_eq!(config.server.tick_interval, Duration::from_millis(100));
        assert_eq!(config.sensor.kind, SensorKind::Gpio);
        assert!(config.link.server.is_none());
    }

    #[test]
    fn test_parse_dotenv() {
        let content = "# comment\nPIR_PORT=6000\n\nPIR_SERVER = \"10.0.0.7\"\nBROKEN\nPIR_GPIO_VALUE_PATH='/tmp/gpio value'\n";
        assert_eq!(
            parse_dotenv(content),
            vec![
                ("PIR_PORT", "6000"),
                ("PIR_SERVER", "10.0.0.7"),
                ("PIR_GPIO_VALUE_PATH", "/tmp/gpio value"),
            ]
        );
    }
}
