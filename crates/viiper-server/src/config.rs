//! Environment-driven configuration.
//!
//! Command-line parsing lives outside this crate; embedders either build a
//! [`ServerConfig`] directly or let `from_env` pick up `VIIPER_*` variables.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_USBIP_ADDR: &str = "0.0.0.0:3241";
pub const DEFAULT_CONTROL_ADDR: &str = "0.0.0.0:3242";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: {detail}")]
    Invalid { var: &'static str, detail: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// USB/IP listener address.
    pub usbip_listen_addr: SocketAddr,
    /// Control-plane listener address.
    pub control_listen_addr: SocketAddr,
    /// Enables the authenticated session when non-empty.
    pub password: Option<String>,
    /// When set, loopback peers must authenticate like everyone else.
    pub require_localhost_auth: bool,
    /// How long a USB/IP client may idle between accept and its first
    /// operation; cleared once the URB loop starts.
    pub connection_timeout: Duration,
    /// Idle-reap window for devices with no attached feeder.
    pub device_handler_connect_timeout: Duration,
    /// Grace period before an empty bus is reclaimed.
    pub bus_cleanup_timeout: Duration,
    /// URB response coalescing interval; zero flushes every write.
    pub write_batch_flush_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            usbip_listen_addr: DEFAULT_USBIP_ADDR.parse().expect("default addr"),
            control_listen_addr: DEFAULT_CONTROL_ADDR.parse().expect("default addr"),
            password: None,
            require_localhost_auth: false,
            connection_timeout: Duration::from_secs(10),
            device_handler_connect_timeout: Duration::from_secs(30),
            bus_cleanup_timeout: Duration::from_secs(30),
            write_batch_flush_interval: Duration::from_millis(1),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<ServerConfig, ConfigError> {
        let mut config = ServerConfig::default();

        if let Some(addr) = read_var("VIIPER_USBIP_LISTEN_ADDR") {
            config.usbip_listen_addr = parse_addr("VIIPER_USBIP_LISTEN_ADDR", &addr)?;
        }
        if let Some(addr) = read_var("VIIPER_CONTROL_LISTEN_ADDR") {
            config.control_listen_addr = parse_addr("VIIPER_CONTROL_LISTEN_ADDR", &addr)?;
        }
        if let Some(password) = read_var("VIIPER_PASSWORD") {
            if !password.is_empty() {
                config.password = Some(password);
            }
        }
        if let Some(flag) = read_var("VIIPER_REQUIRE_LOCALHOST_AUTH") {
            config.require_localhost_auth =
                parse_bool("VIIPER_REQUIRE_LOCALHOST_AUTH", &flag)?;
        }
        if let Some(ms) = read_var("VIIPER_CONNECTION_TIMEOUT_MS") {
            config.connection_timeout = parse_millis("VIIPER_CONNECTION_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = read_var("VIIPER_DEVICE_HANDLER_CONNECT_TIMEOUT_MS") {
            config.device_handler_connect_timeout =
                parse_millis("VIIPER_DEVICE_HANDLER_CONNECT_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = read_var("VIIPER_BUS_CLEANUP_TIMEOUT_MS") {
            config.bus_cleanup_timeout = parse_millis("VIIPER_BUS_CLEANUP_TIMEOUT_MS", &ms)?;
        }
        if let Some(us) = read_var("VIIPER_WRITE_BATCH_FLUSH_INTERVAL_US") {
            config.write_batch_flush_interval =
                parse_micros("VIIPER_WRITE_BATCH_FLUSH_INTERVAL_US", &us)?;
        }

        Ok(config)
    }
}

fn read_var(var: &'static str) -> Option<String> {
    std::env::var(var).ok()
}

fn parse_addr(var: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        var,
        detail: format!("{value:?} is not a socket address"),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(ConfigError::Invalid {
            var,
            detail: format!("{other:?} is not a boolean"),
        }),
    }
}

fn parse_millis(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::Invalid {
            var,
            detail: format!("{value:?} is not a millisecond count"),
        })
}

fn parse_micros(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_micros)
        .map_err(|_| ConfigError::Invalid {
            var,
            detail: format!("{value:?} is not a microsecond count"),
        })
}
