//! Configuration Manager

use super::ChatConfig;
use crate::Result;
use anyhow::{bail, Context};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Loads configuration from files and the environment
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from a TOML file, falling back to defaults when it is missing
    pub fn load_from_file(path: &Path) -> Result<ChatConfig> {
        if !path.exists() {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = ChatConfig::default();
            config.validate()?;
            return Ok(config);
        }

        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!("Configuration loaded and validated successfully");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<ChatConfig> {
        let config: ChatConfig = toml::from_str(content)?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn load_from_env() -> Result<ChatConfig> {
        let mut config = ChatConfig::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }
}

impl ChatConfig {
    /// Apply `RUSTCHAT_*` overrides using the given variable lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind_addr) = lookup("RUSTCHAT_BIND_ADDR") {
            self.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid RUSTCHAT_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(max_conn) = lookup("RUSTCHAT_MAX_CONNECTIONS") {
            self.server.max_connections = max_conn
                .parse::<usize>()
                .with_context(|| format!("Invalid RUSTCHAT_MAX_CONNECTIONS: {}", max_conn))?;
        }

        if let Some(timeout) = lookup("RUSTCHAT_IDLE_TIMEOUT") {
            self.server.idle_timeout = Some(
                humantime::parse_duration(&timeout)
                    .with_context(|| format!("Invalid RUSTCHAT_IDLE_TIMEOUT: {}", timeout))?,
            );
        }

        if let Some(chunk) = lookup("RUSTCHAT_READ_CHUNK_SIZE") {
            self.server.read_chunk_size = chunk
                .parse::<usize>()
                .with_context(|| format!("Invalid RUSTCHAT_READ_CHUNK_SIZE: {}", chunk))?;
        }

        if let Some(log_level) = lookup("RUSTCHAT_LOG_LEVEL") {
            self.logging.level = log_level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .context("Server configuration validation failed")?;

        self.validate_logging_config()
            .context("Logging configuration validation failed")?;

        if self.metrics.enabled && self.metrics.bind_addr == self.server.bind_addr {
            bail!("metrics.bind_addr must differ from server.bind_addr");
        }

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        if self.server.max_connections > 100_000 {
            bail!("max_connections cannot exceed 100,000");
        }

        if !(64..=65536).contains(&self.server.read_chunk_size) {
            bail!("read_chunk_size must be between 64 and 65536 bytes");
        }

        if let Some(idle) = self.server.idle_timeout {
            if idle.is_zero() {
                bail!("idle_timeout must be greater than 0 when set");
            }
        }

        if self.server.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than 0");
        }

        Ok(())
    }

    /// Checked on its own before the log level is handed to tracing
    pub fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        host: Option<IpAddr>,
        port: Option<u16>,
        max_connections: Option<usize>,
        idle_timeout: Option<Duration>,
    ) {
        if let Some(host) = host {
            self.server.bind_addr.set_ip(host);
            tracing::info!("CLI override: host set to {}", host);
        }

        if let Some(port) = port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(max_conn) = max_connections {
            self.server.max_connections = max_conn;
            tracing::info!("CLI override: max connections set to {}", max_conn);
        }

        if let Some(idle) = idle_timeout {
            self.server.idle_timeout = Some(idle);
            tracing::info!("CLI override: idle timeout set to {:?}", idle);
        }
    }
}
