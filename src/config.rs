//! # Configuration Management
//!
//! This module loads the relay's configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_LIMITS__MAX_FRAME_SIZE`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore because the field names
//! themselves contain single underscores.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main configuration for the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
}

/// Listener settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Pending-connection queue length passed to `listen(2)`.
    pub backlog: u32,
}

/// Resource limits for connections.
///
/// ## Fields:
/// - `handshake_buffer_size`: largest accepted upgrade request, in bytes
/// - `max_frame_size`: largest accepted frame payload, in bytes
/// - `max_connections`: connections handled at once; extra accepts are closed
/// - `write_timeout_ms`: per-peer deadline for one broadcast write
/// - `shutdown_grace_ms`: how long open connections get to close on shutdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub handshake_buffer_size: usize,
    pub max_frame_size: usize,
    pub max_connections: usize,
    pub write_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(), // Localhost only
                port: 8080,
                backlog: 5,
            },
            limits: LimitsConfig {
                handshake_buffer_size: 1024,
                max_frame_size: 16 * 1024 * 1024,
                max_connections: 1024,
                write_timeout_ms: 5000,
                shutdown_grace_ms: 2000,
            },
        }
    }
}

impl AppConfig {
    /// Defaults with a different listen address.
    pub fn with_address(host: impl Into<String>, port: u16) -> Self {
        let mut config = Self::default();
        config.server.host = host.into();
        config.server.port = port;
        config
    }

    /// Load configuration from defaults, config.toml and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_LIMITS__WRITE_TIMEOUT_MS=1000`: Override the broadcast write deadline
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values that would make the server unusable.
    ///
    /// Port 0 is refused here even though the OS would pick a free port: the
    /// configured port is what clients are told to connect to.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.backlog == 0 {
            return Err(anyhow::anyhow!("Listen backlog must be greater than 0"));
        }

        let limits = &self.limits;
        if limits.handshake_buffer_size == 0 {
            return Err(anyhow::anyhow!("Handshake buffer size must be greater than 0"));
        }

        if limits.max_frame_size == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        if limits.max_connections == 0 {
            return Err(anyhow::anyhow!("Max connections must be greater than 0"));
        }

        if limits.write_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Write timeout must be greater than 0"));
        }

        if limits.shutdown_grace_ms == 0 {
            return Err(anyhow::anyhow!("Shutdown grace period must be greater than 0"));
        }

        Ok(())
    }

    /// `host:port` string used for binding and logging.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
