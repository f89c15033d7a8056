//! Service configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CMDLINK_CONFIG)
//! 3. Environment variables

use crate::admission::AdmissionController;
use cmdlink_protocol::{DEFAULT_PORT, MAX_FRAME_LENGTH, REQUEST_HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Request engine configuration.
    pub engine: EngineConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self::default();

        // Load from file if specified
        if let Ok(path) = std::env::var("CMDLINK_CONFIG") {
            config = Self::from_file(&path)?;
        }

        // Apply environment variable overrides
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any `CMDLINK_*` key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.network.apply_overrides(&lookup);
        self.engine.apply_overrides(&lookup);
        self.metrics.apply_overrides(&lookup);
    }

    /// Checks values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.engine.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn parse_into<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(value) = lookup(key) {
        if let Ok(parsed) = value.trim().parse() {
            *target = parsed;
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut bool) {
    if let Some(value) = lookup(key) {
        *target = value == "1" || value.to_lowercase() == "true";
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Number of I/O worker threads.
    pub selectors: usize,
    /// Maximum concurrent inbound connections.
    pub max_connections: usize,
    /// Outbound connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Socket read buffer size in bytes.
    pub read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            selectors: 4,
            max_connections: 1000,
            connect_timeout_ms: 3000,
            read_buffer_size: 64 * 1024,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        parse_into(lookup, "CMDLINK_BIND", &mut self.bind_addr);
        parse_into(lookup, "CMDLINK_SELECTORS", &mut self.selectors);
        parse_into(lookup, "CMDLINK_MAX_CONNECTIONS", &mut self.max_connections);
        parse_into(lookup, "CMDLINK_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms);
        parse_into(lookup, "CMDLINK_READ_BUFFER_SIZE", &mut self.read_buffer_size);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.selectors == 0 {
            return Err(ConfigError::ValidationError(
                "network.selectors must be at least 1".to_string(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "network.read_buffer_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Request engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default deadline for a request in milliseconds.
    pub request_timeout_ms: u64,
    /// Close a connection after this long without reads (0 = disabled).
    pub channel_read_timeout_ms: u64,
    /// Send a heartbeat after this long without writes (0 = disabled).
    pub channel_write_timeout_ms: u64,
    /// Timeout sweeper period in milliseconds.
    pub request_timeout_detect_interval_ms: u64,
    /// Command type reserved for heartbeats.
    pub heartbeat_command_type: u32,
    /// Maximum unresolved outbound requests (0 or less = unlimited).
    pub max_processing_requests: i64,
    /// Largest accepted frame length in bytes.
    pub max_frame_length: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            channel_read_timeout_ms: 60_000,
            channel_write_timeout_ms: 20_000,
            request_timeout_detect_interval_ms: 1_000,
            heartbeat_command_type: 0,
            max_processing_requests: 0,
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }
}

impl EngineConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        parse_into(lookup, "CMDLINK_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
        parse_into(lookup, "CMDLINK_READ_TIMEOUT_MS", &mut self.channel_read_timeout_ms);
        parse_into(lookup, "CMDLINK_WRITE_TIMEOUT_MS", &mut self.channel_write_timeout_ms);
        parse_into(
            lookup,
            "CMDLINK_TIMEOUT_DETECT_INTERVAL_MS",
            &mut self.request_timeout_detect_interval_ms,
        );
        parse_into(lookup, "CMDLINK_HEARTBEAT_TYPE", &mut self.heartbeat_command_type);
        parse_into(
            lookup,
            "CMDLINK_MAX_PROCESSING_REQUESTS",
            &mut self.max_processing_requests,
        );
        parse_into(lookup, "CMDLINK_MAX_FRAME_LENGTH", &mut self.max_frame_length);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_length > MAX_FRAME_LENGTH {
            return Err(ConfigError::ValidationError(format!(
                "engine.max_frame_length {} exceeds the 3-byte limit {}",
                self.max_frame_length, MAX_FRAME_LENGTH
            )));
        }
        if (self.max_frame_length as usize) < REQUEST_HEADER_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "engine.max_frame_length {} is below the header size {}",
                self.max_frame_length, REQUEST_HEADER_SIZE
            )));
        }
        if self.request_timeout_detect_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "engine.request_timeout_detect_interval_ms must be positive".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "engine.request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.max_processing_requests > 0
            && self.max_processing_requests as u64 > AdmissionController::MAX_LIMIT as u64
        {
            return Err(ConfigError::ValidationError(format!(
                "engine.max_processing_requests {} exceeds the limit {}",
                self.max_processing_requests,
                AdmissionController::MAX_LIMIT
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Returns the read idle timeout, or `None` when disabled.
    pub fn channel_read_timeout(&self) -> Option<Duration> {
        (self.channel_read_timeout_ms > 0).then(|| Duration::from_millis(self.channel_read_timeout_ms))
    }

    /// Returns the write idle timeout, or `None` when disabled.
    pub fn channel_write_timeout(&self) -> Option<Duration> {
        (self.channel_write_timeout_ms > 0).then(|| Duration::from_millis(self.channel_write_timeout_ms))
    }

    pub fn request_timeout_detect_interval(&self) -> Duration {
        Duration::from_millis(self.request_timeout_detect_interval_ms)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9091)),
        }
    }
}

impl MetricsConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        parse_flag(lookup, "CMDLINK_METRICS_ENABLED", &mut self.enabled);
        parse_into(lookup, "CMDLINK_METRICS_BIND", &mut self.bind_addr);
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.engine.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.engine.channel_read_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.engine.channel_write_timeout(), Some(Duration::from_secs(20)));
        assert_eq!(config.engine.heartbeat_command_type, 0);
        assert_eq!(config.engine.max_processing_requests, 0);
        assert_eq!(config.engine.max_frame_length, MAX_FRAME_LENGTH);
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_disables_idle_timeouts() {
        let engine = EngineConfig {
            channel_read_timeout_ms: 0,
            channel_write_timeout_ms: 0,
            ..Default::default()
        };
        assert!(engine.channel_read_timeout().is_none());
        assert!(engine.channel_write_timeout().is_none());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.engine.request_timeout_ms, config.engine.request_timeout_ms);
    }

    #[test]
    fn test_partial_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmdlink.yaml");
        std::fs::write(
            &path,
            "network:\n  bind_addr: \"0.0.0.0:9000\"\nengine:\n  request_timeout_ms: 500\n  max_processing_requests: 64\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.network.bind_addr.port(), 9000);
        assert_eq!(config.network.selectors, 4);
        assert_eq!(config.engine.request_timeout_ms, 500);
        assert_eq!(config.engine.max_processing_requests, 64);
        assert_eq!(config.engine.channel_write_timeout_ms, 20_000);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.yaml");
        let mut config = Config::default();
        config.engine.heartbeat_command_type = 99;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.engine.heartbeat_command_type, 99);
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Config::from_file(dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(ConfigError::IoError(_, _))));

        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "engine: [not, a, map]").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_, _)));
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("CMDLINK_BIND", "127.0.0.1:8000"),
            ("CMDLINK_REQUEST_TIMEOUT_MS", "250"),
            ("CMDLINK_WRITE_TIMEOUT_MS", "0"),
            ("CMDLINK_MAX_PROCESSING_REQUESTS", "8"),
            ("CMDLINK_METRICS_ENABLED", "true"),
            ("CMDLINK_SELECTORS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.network.bind_addr.port(), 8000);
        assert_eq!(config.engine.request_timeout_ms, 250);
        assert!(config.engine.channel_write_timeout().is_none());
        assert_eq!(config.engine.max_processing_requests, 8);
        assert!(config.metrics.enabled);
        // Unparseable values keep the previous setting.
        assert_eq!(config.network.selectors, 4);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.engine.max_frame_length = MAX_FRAME_LENGTH + 1;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = Config::default();
        config.engine.max_frame_length = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.selectors = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.request_timeout_detect_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("detect_interval"));
    }

    #[test]
    fn test_admission_limit_bounded() {
        let mut config = Config::default();
        config.engine.max_processing_requests = i64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_processing_requests"));

        config.engine.max_processing_requests = AdmissionController::MAX_LIMIT as i64;
        assert!(config.validate().is_ok());
        config.engine.max_processing_requests = -5;
        assert!(config.validate().is_ok());
    }
}
