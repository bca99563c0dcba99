use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub streaming: StreamingConfig,
    pub rpc: RpcConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Settings for stream subscriptions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Address used for tokens that do not carry their own.
    /// Either a bare host ("127.0.0.1") or "host:port".
    pub fallback_address: String,
    /// Port assumed when a textual token address has none
    pub default_port: u16,
    pub connect_timeout_ms: u64,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Consecutive failed connection attempts before giving up (None = retry forever)
    pub max_reconnect_attempts: Option<usize>,
    pub max_frame_length: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            fallback_address: "127.0.0.1".to_string(),
            default_port: 2001,
            connect_timeout_ms: 5_000,
            reconnect_min_delay_ms: 1_000,
            reconnect_max_delay_ms: 10_000,
            max_reconnect_attempts: None,
            max_frame_length: 64 * 1024 * 1024,
        }
    }
}

impl StreamingConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn reconnect_min_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_delay_ms)
    }

    #[must_use]
    pub const fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

/// Settings for the RPC call dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub address: String,
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2000".to_string(),
            timeout_ms: 5_000,
        }
    }
}

impl RpcConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SIMLINK_RPC__TIMEOUT_MS, SIMLINK_STREAMING__FALLBACK_ADDRESS, ...
        builder = builder.add_source(
            Environment::with_prefix("SIMLINK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.streaming.fallback_address, "127.0.0.1");
        assert_eq!(config.streaming.default_port, 2001);
        assert_eq!(config.streaming.reconnect_min_delay(), Duration::from_secs(1));
        assert!(config.streaming.max_reconnect_attempts.is_none());
        assert_eq!(config.rpc.address, "127.0.0.1:2000");
        assert_eq!(config.rpc.timeout(), Duration::from_secs(5));
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[rpc]\naddress = \"10.0.0.5:2000\"\ntimeout_ms = 40000\n\n[streaming]\nfallback_address = \"10.0.0.5\"\nmax_reconnect_attempts = 3"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.rpc.address, "10.0.0.5:2000");
        assert_eq!(config.rpc.timeout(), Duration::from_secs(40));
        assert_eq!(config.streaming.fallback_address, "10.0.0.5");
        assert_eq!(config.streaming.max_reconnect_attempts, Some(3));
        // Untouched sections keep their defaults
        assert_eq!(config.streaming.default_port, 2001);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::from_file("/nonexistent/simlink.toml").unwrap();
        assert_eq!(config.streaming.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("SIMLINK_STREAMING__MAX_FRAME_LENGTH", "4096");
        let config = Config::from_env().unwrap();
        std::env::remove_var("SIMLINK_STREAMING__MAX_FRAME_LENGTH");

        assert_eq!(config.streaming.max_frame_length, 4096);
    }
}
