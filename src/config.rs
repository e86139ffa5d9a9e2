//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::websocket::{HubConfig, KeepaliveConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub hub: HubSettings,

    #[serde(default)]
    pub keepalive: KeepaliveSettings,

    #[serde(default)]
    pub bridge: BridgeSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8086
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Queue sizes for the hub
#[derive(Debug, Clone, Deserialize)]
pub struct HubSettings {
    #[serde(default = "default_send_queue")]
    pub send_queue_capacity: usize,

    #[serde(default = "default_control_queue")]
    pub register_queue_capacity: usize,

    #[serde(default = "default_control_queue")]
    pub unregister_queue_capacity: usize,

    #[serde(default = "default_dispatch_queue")]
    pub dispatch_queue_capacity: usize,
}

fn default_send_queue() -> usize {
    256
}

fn default_control_queue() -> usize {
    64
}

fn default_dispatch_queue() -> usize {
    256
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            send_queue_capacity: default_send_queue(),
            register_queue_capacity: default_control_queue(),
            unregister_queue_capacity: default_control_queue(),
            dispatch_queue_capacity: default_dispatch_queue(),
        }
    }
}

/// Socket keepalive timings
#[derive(Debug, Clone, Deserialize)]
pub struct KeepaliveSettings {
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn default_write_timeout() -> u64 {
    10
}

fn default_pong_timeout() -> u64 {
    60
}

fn default_ping_interval() -> u64 {
    54
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            write_timeout_secs: default_write_timeout(),
            pong_timeout_secs: default_pong_timeout(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

/// Message bus bridge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSettings {
    #[serde(default = "default_bridge_enabled")]
    pub enabled: bool,

    /// Only relay payloads whose field of this name is `true`
    pub required_flag: Option<String>,
}

fn default_bridge_enabled() -> bool {
    true
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            enabled: default_bridge_enabled(),
            required_flag: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("beacon").join("config.toml")),
            Some(PathBuf::from("/etc/beacon/config.toml")),
            Some(PathBuf::from("./beacon.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("BEACON_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("BEACON_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(capacity) = lookup("BEACON_SEND_QUEUE").and_then(|c| c.parse().ok()) {
            self.hub.send_queue_capacity = capacity;
        }
        if let Some(level) = lookup("BEACON_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("BEACON_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject settings the hub cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacities = [
            ("hub.send_queue_capacity", self.hub.send_queue_capacity),
            ("hub.register_queue_capacity", self.hub.register_queue_capacity),
            ("hub.unregister_queue_capacity", self.hub.unregister_queue_capacity),
            ("hub.dispatch_queue_capacity", self.hub.dispatch_queue_capacity),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }

        let keepalive = &self.keepalive;
        if keepalive.write_timeout_secs == 0 || keepalive.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "keepalive timings must be positive".to_string(),
            ));
        }
        if keepalive.ping_interval_secs >= keepalive.pong_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "keepalive.ping_interval_secs ({}) must be less than pong_timeout_secs ({})",
                keepalive.ping_interval_secs, keepalive.pong_timeout_secs
            )));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "logging.format must be \"pretty\" or \"json\", got {other:?}"
            ))),
        }
    }

    /// Hub settings in the form the hub consumes
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            send_queue_capacity: self.hub.send_queue_capacity,
            register_queue_capacity: self.hub.register_queue_capacity,
            unregister_queue_capacity: self.hub.unregister_queue_capacity,
            dispatch_queue_capacity: self.hub.dispatch_queue_capacity,
            keepalive: KeepaliveConfig {
                write_timeout: Duration::from_secs(self.keepalive.write_timeout_secs),
                pong_timeout: Duration::from_secs(self.keepalive.pong_timeout_secs),
                ping_interval: Duration::from_secs(self.keepalive.ping_interval_secs),
            },
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Beacon Configuration
#
# Environment variables override these settings:
# - BEACON_HOST
# - BEACON_PORT
# - BEACON_SEND_QUEUE
# - BEACON_LOG_LEVEL
# - BEACON_LOG_FORMAT

[server]
# HTTP/WebSocket listen address
host = "0.0.0.0"
port = 8086

[hub]
# Frames buffered per connection before it is dropped as a slow consumer
send_queue_capacity = 256

# Coordinator input queues
register_queue_capacity = 64
unregister_queue_capacity = 64
dispatch_queue_capacity = 256

[keepalive]
# Upper bound on a single socket write
write_timeout_secs = 10

# Disconnect when no pong arrives within this window
pong_timeout_secs = 60

# Ping interval; must be shorter than pong_timeout_secs
ping_interval_secs = 54

[bridge]
# Relay events from the message bus to pattern subscribers
enabled = true

# Only relay payloads with this field set to true
# required_flag = "important"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.addr(), "0.0.0.0:8086");
        assert_eq!(config.hub.send_queue_capacity, 256);
        assert_eq!(config.keepalive.ping_interval_secs, 54);
        assert!(config.bridge.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generated_config_parses_to_defaults() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.server.port, 8086);
        assert_eq!(config.hub.dispatch_queue_capacity, 256);
        assert_eq!(config.keepalive.pong_timeout_secs, 60);
        assert!(config.bridge.required_flag.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nport = 9000\n\n[hub]\nsend_queue_capacity = 8\n\n[bridge]\nrequired_flag = \"important\""
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.hub.send_queue_capacity, 8);
        assert_eq!(config.hub.register_queue_capacity, 64);
        assert_eq!(config.bridge.required_flag.as_deref(), Some("important"));
    }

    #[test]
    fn test_load_errors() {
        let missing = Config::load(Path::new("/nonexistent/beacon.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("BEACON_HOST", "127.0.0.1"),
            ("BEACON_PORT", "9100"),
            ("BEACON_SEND_QUEUE", "not-a-number"),
            ("BEACON_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.addr(), "127.0.0.1:9100");
        assert_eq!(config.hub.send_queue_capacity, 256);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.hub.send_queue_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.keepalive.ping_interval_secs = 60;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_hub_config_conversion() {
        let hub = Config::default().hub_config();
        assert_eq!(hub.send_queue_capacity, 256);
        assert_eq!(hub.keepalive.write_timeout, Duration::from_secs(10));
        assert_eq!(hub.keepalive.pong_timeout, Duration::from_secs(60));
        assert_eq!(hub.keepalive.ping_interval, Duration::from_secs(54));
    }
}
