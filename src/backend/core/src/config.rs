//! Configuration management.
//!
//! Values come from an optional file overlaid by `PARLEY__`-prefixed
//! environment variables, e.g. `PARLEY__SERVER__PORT=9000`.

use serde::Deserialize;
use std::time::Duration;

use crate::error::{ParleyError, Result};
use crate::telemetry::TelemetryConfig;

const ENV_PREFIX: &str = "PARLEY";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub websocket: WebSocketConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. Without one the in-memory store is used.
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Apply embedded migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            run_migrations: default_run_migrations(),
        }
    }
}

/// Real-time connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Interval between server pings
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Close a connection after this long without any inbound frame
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// Capacity of each connection's outbound queue
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Largest inbound frame accepted
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Send the current presence of known users to new connections
    #[serde(default = "default_send_presence_snapshot")]
    pub send_presence_snapshot: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            connection_timeout_secs: default_connection_timeout_secs(),
            outbound_buffer: default_outbound_buffer(),
            max_frame_bytes: default_max_frame_bytes(),
            send_presence_snapshot: default_send_presence_snapshot(),
        }
    }
}

impl WebSocketConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_run_migrations() -> bool { true }
fn default_heartbeat_interval_secs() -> u64 { 30 }
fn default_connection_timeout_secs() -> u64 { 90 }
fn default_outbound_buffer() -> usize { 256 }
fn default_max_frame_bytes() -> usize { 1024 * 1024 }
fn default_send_presence_snapshot() -> bool { true }

impl Config {
    /// Load configuration from the environment only.
    pub fn load() -> Result<Self> {
        Self::build(None)
    }

    /// Load from a specific file path, overlaid by the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::build(Some(path))
    }

    fn build(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let ws = &self.websocket;
        if ws.outbound_buffer == 0 {
            return Err(ParleyError::configuration(
                "websocket.outbound_buffer must be greater than zero",
            ));
        }
        if ws.heartbeat_interval_secs == 0 {
            return Err(ParleyError::configuration(
                "websocket.heartbeat_interval_secs must be greater than zero",
            ));
        }
        if ws.connection_timeout_secs < ws.heartbeat_interval_secs {
            return Err(ParleyError::configuration(
                "websocket.connection_timeout_secs must not be shorter than the heartbeat interval",
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ParleyError::configuration(
                "database.min_connections exceeds database.max_connections",
            ));
        }
        Ok(())
    }

    /// Socket address string for the HTTP listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
