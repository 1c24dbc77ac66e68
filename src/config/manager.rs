//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const MIN_BUFFER_SIZE: usize = 1024;
const MAX_BUFFER_SIZE: usize = 1024 * 1024;
const MAX_CONNECTIONS_LIMIT: usize = 100_000;
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Environment variables over defaults, then the config file over both.
    /// Validation is left to the caller, after any CLI overrides.
    pub fn load(path: &Path) -> Result<Config> {
        Self::load_layered(path, |key| std::env::var(key).ok())
    }

    /// `load` with environment lookups going through `lookup`
    pub fn load_layered<F>(path: &Path, lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::load_from_vars(lookup)?;
        if !path.exists() {
            tracing::warn!(
                "Configuration file not found at {}, using environment and defaults",
                path.display()
            );
            return Ok(base);
        }

        let overlay = Self::read_table(path)?;
        let mut merged =
            toml::Value::try_from(&base).context("Failed to serialize base configuration")?;
        merge_toml(&mut merged, toml::Value::Table(overlay));

        merged
            .try_into()
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from file alone, falling back to defaults when it does not exist
    pub fn load_from_file(path: &Path) -> Result<Config> {
        Self::load_layered(path, |_| None)
    }

    fn read_table(path: &Path) -> Result<toml::Table> {
        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply `RELAY_*` overrides read through `lookup` on top of the defaults
    pub fn load_from_vars<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(addr) = lookup("RELAY_LISTEN_ADDR") {
            config.server.listen_addr = addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid RELAY_LISTEN_ADDR: {}", addr))?;
        }

        if let Some(addr) = lookup("RELAY_UPSTREAM_ADDR") {
            config.server.upstream_addr = addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid RELAY_UPSTREAM_ADDR: {}", addr))?;
        }

        if let Some(size) = lookup("RELAY_BUFFER_SIZE") {
            config.server.buffer_size = size
                .parse::<usize>()
                .with_context(|| format!("Invalid RELAY_BUFFER_SIZE: {}", size))?;
        }

        if let Some(timeout) = lookup("RELAY_CONNECT_TIMEOUT") {
            config.server.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid RELAY_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Some(max_conn) = lookup("RELAY_MAX_CONNECTIONS") {
            config.server.max_connections = max_conn
                .parse::<usize>()
                .with_context(|| format!("Invalid RELAY_MAX_CONNECTIONS: {}", max_conn))?;
        }

        if let Some(level) = lookup("RELAY_LOG_LEVEL") {
            config.monitoring.log_level = level;
        }

        Ok(config)
    }
}

/// Overlay `overlay` onto `base`, recursing into tables present in both
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        let server = &self.server;

        if server.listen_addr == server.upstream_addr {
            bail!(
                "listen_addr and upstream_addr must differ (both are {})",
                server.listen_addr
            );
        }

        if server.backlog == 0 {
            bail!("backlog must be greater than 0");
        }

        if server.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        if server.max_connections > MAX_CONNECTIONS_LIMIT {
            bail!("max_connections cannot exceed 100,000");
        }

        if server.buffer_size < MIN_BUFFER_SIZE {
            bail!("buffer_size must be at least {} bytes", MIN_BUFFER_SIZE);
        }

        if server.buffer_size > MAX_BUFFER_SIZE {
            bail!("buffer_size cannot exceed 1MB");
        }

        if server.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                VALID_LOG_LEVELS.join(", ")
            );
        }

        if let Some(metrics_addr) = self.monitoring.metrics_addr {
            if metrics_addr == self.server.listen_addr {
                bail!("monitoring.metrics_addr must differ from server.listen_addr");
            }
        }

        Ok(())
    }

    /// Merge with CLI arguments; invalid values are reported and ignored
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides) {
        if let Some(addr) = overrides.listen.as_deref() {
            match addr.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.server.listen_addr = addr;
                    tracing::info!("CLI override: listen address set to {}", addr);
                }
                Err(_) => tracing::warn!("Invalid listen address provided: {}", addr),
            }
        }

        if let Some(addr) = overrides.upstream.as_deref() {
            match addr.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.server.upstream_addr = addr;
                    tracing::info!("CLI override: upstream address set to {}", addr);
                }
                Err(_) => tracing::warn!("Invalid upstream address provided: {}", addr),
            }
        }

        if let Some(buffer_size) = overrides.buffer_size {
            self.server.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(max_conn) = overrides.max_connections {
            self.server.max_connections = max_conn;
            tracing::info!("CLI override: max connections set to {}", max_conn);
        }

        if let Some(timeout_secs) = overrides.connect_timeout {
            self.server.connect_timeout = Duration::from_secs(timeout_secs);
            tracing::info!("CLI override: connect timeout set to {}s", timeout_secs);
        }

        if let Some(addr) = overrides.metrics_addr.as_deref() {
            match addr.parse::<SocketAddr>() {
                Ok(addr) => {
                    self.monitoring.metrics_addr = Some(addr);
                    tracing::info!("CLI override: metrics address set to {}", addr);
                }
                Err(_) => tracing::warn!("Invalid metrics address provided: {}", addr),
            }
        }

        if let Some(level) = overrides.log_level.as_deref() {
            self.monitoring.log_level = level.to_string();
        }
    }
}

/// Values given on the command line that take precedence over file and environment
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub upstream: Option<String>,
    pub buffer_size: Option<usize>,
    pub max_connections: Option<usize>,
    pub connect_timeout: Option<u64>,
    pub metrics_addr: Option<String>,
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_same_listen_and_upstream() {
        let mut config = Config::default();
        config.server.upstream_addr = config.server.listen_addr;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_buffer() {
        let mut config = Config::default();
        config.server.buffer_size = 512;
        assert!(config.validate().is_err());

        config.server.buffer_size = 2 * 1024 * 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let mut config = Config::default();
        config.monitoring.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_partial_server_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
listen_addr = "127.0.0.1:7000"
upstream_addr = "10.0.0.5:6379"
connect_timeout = "3s"

[monitoring]
log_level = "debug"
"#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.server.upstream_addr, "10.0.0.5:6379".parse().unwrap());
        assert_eq!(config.server.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.server.buffer_size, 8192);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.monitoring.log_level, "debug");
    }

    #[test]
    fn test_load_from_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server = 12").unwrap();
        assert!(ConfigManager::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigManager::load_from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.listen_addr, Config::default().server.listen_addr);
    }

    #[test]
    fn test_load_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("RELAY_LISTEN_ADDR", "0.0.0.0:9000"),
            ("RELAY_UPSTREAM_ADDR", "127.0.0.1:9001"),
            ("RELAY_CONNECT_TIMEOUT", "750ms"),
            ("RELAY_BUFFER_SIZE", "16384"),
        ]
        .into_iter()
        .collect();

        let config =
            ConfigManager::load_from_vars(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.server.upstream_addr, "127.0.0.1:9001".parse().unwrap());
        assert_eq!(config.server.connect_timeout, Duration::from_millis(750));
        assert_eq!(config.server.buffer_size, 16384);
    }

    #[test]
    fn test_file_layers_over_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
listen_addr = "127.0.0.1:7000"
"#
        )
        .unwrap();

        let vars: HashMap<&str, &str> = [
            ("RELAY_LISTEN_ADDR", "0.0.0.0:9000"),
            ("RELAY_UPSTREAM_ADDR", "10.0.0.5:6379"),
            ("RELAY_CONNECT_TIMEOUT", "2s"),
            ("RELAY_LOG_LEVEL", "warn"),
        ]
        .into_iter()
        .collect();

        let config = ConfigManager::load_layered(file.path(), |key| {
            vars.get(key).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.server.listen_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.server.upstream_addr, "10.0.0.5:6379".parse().unwrap());
        assert_eq!(config.server.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.server.buffer_size, 8192);
        assert_eq!(config.monitoring.log_level, "warn");
        assert!(config.monitoring.metrics_addr.is_none());
    }

    #[test]
    fn test_missing_file_keeps_environment() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigManager::load_layered(&dir.path().join("absent.toml"), |key| {
            (key == "RELAY_MAX_CONNECTIONS").then(|| "16".to_string())
        })
        .unwrap();
        assert_eq!(config.server.max_connections, 16);
    }

    #[test]
    fn test_cli_override_repairs_invalid_layer() {
        let mut config = ConfigManager::load_from_vars(|key| {
            (key == "RELAY_BUFFER_SIZE").then(|| "100".to_string())
        })
        .unwrap();
        assert!(config.validate().is_err());

        config.merge_with_cli_args(&CliOverrides {
            buffer_size: Some(4096),
            ..Default::default()
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_vars_rejects_bad_addr() {
        let result = ConfigManager::load_from_vars(|key| {
            (key == "RELAY_UPSTREAM_ADDR").then(|| "not-an-addr".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_take_precedence() {
        let mut config = Config::default();
        config.merge_with_cli_args(&CliOverrides {
            listen: Some("127.0.0.1:1234".to_string()),
            upstream: Some("bogus".to_string()),
            connect_timeout: Some(2),
            ..Default::default()
        });

        assert_eq!(config.server.listen_addr, "127.0.0.1:1234".parse().unwrap());
        assert_eq!(config.server.upstream_addr, Config::default().server.upstream_addr);
        assert_eq!(config.server.connect_timeout, Duration::from_secs(2));
    }
}
