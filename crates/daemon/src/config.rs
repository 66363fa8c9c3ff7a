//! Configuration management for the TermBridge server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termbridge/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{detect_shell, SessionMode, SpawnOptions, DEFAULT_MAX_SESSIONS};
use protocol::{DEFAULT_COLS, DEFAULT_ROWS};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("output_buffer must be between 1 and 65536 chunks, got {0}")]
    InvalidOutputBuffer(usize),

    #[error("terminal size must be non-zero, got {0}x{1}")]
    InvalidGeometry(u16, u16),

    #[error("bind_address must be an IP address, got {0}")]
    InvalidBindAddress(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3000;

/// Main configuration structure for the TermBridge server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General process configuration.
    pub daemon: DaemonConfig,

    /// HTTP listener configuration.
    pub server: ServerConfig,

    /// Session management configuration.
    pub session: SessionConfig,
}

/// General process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file; rotated daily.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_address: String,

    /// Port to listen on. 0 picks a free port.
    pub port: u16,

    /// Directory served for paths no route matches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,

    /// Allow cross-origin requests from anywhere.
    pub cors_permissive: bool,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// One process per connection, or one for everybody.
    pub mode: SessionMode,

    /// Shell to use for new sessions.
    pub default_shell: String,

    /// Initial terminal width.
    pub cols: u16,

    /// Initial terminal height.
    pub rows: u16,

    /// Working directory for new sessions. Defaults to the home directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Output chunks buffered per client before it is disconnected.
    pub output_buffer: usize,

    /// Extra environment variables for spawned shells.
    pub env: BTreeMap<String, String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            static_dir: None,
            cors_permissive: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::Dedicated,
            default_shell: detect_shell(None),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            working_dir: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
            output_buffer: crate::session::DEFAULT_SUBSCRIBER_CAPACITY,
            env: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    /// Spawn parameters derived from this section.
    pub fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            shell: Some(self.default_shell.clone()).filter(|s| !s.is_empty()),
            cols: self.cols,
            rows: self.rows,
            cwd: self.working_dir.clone(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            output_buffer: self.output_buffer,
        }
    }
}

impl ServerConfig {
    /// Socket address to listen on.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.bind_address.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termbridge")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PORT: Override the listen port
    /// - TERMBRIDGE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMBRIDGE_SESSION_MODE: Override session mode (dedicated, shared)
    /// - TERMBRIDGE_SHELL: Override the shell
    ///
    /// Nothing is logged here because this runs before logging is set up;
    /// the returned records say what was applied or ignored.
    pub fn apply_env_overrides(&mut self) -> Vec<EnvOverride> {
        let mut applied = Vec::new();

        if let Some(port) = non_empty_env("PORT") {
            let ok = match port.parse::<u16>() {
                Ok(parsed) => {
                    self.server.port = parsed;
                    true
                }
                Err(_) => false,
            };
            applied.push(EnvOverride::new("PORT", port, ok));
        }

        if let Some(level) = non_empty_env("TERMBRIDGE_LOG_LEVEL") {
            self.daemon.log_level = level.clone();
            applied.push(EnvOverride::new("TERMBRIDGE_LOG_LEVEL", level, true));
        }

        if let Some(mode) = non_empty_env("TERMBRIDGE_SESSION_MODE") {
            let ok = match mode.parse::<SessionMode>() {
                Ok(parsed) => {
                    self.session.mode = parsed;
                    true
                }
                Err(_) => false,
            };
            applied.push(EnvOverride::new("TERMBRIDGE_SESSION_MODE", mode, ok));
        }

        if let Some(shell) = non_empty_env("TERMBRIDGE_SHELL") {
            self.session.default_shell = shell.clone();
            applied.push(EnvOverride::new("TERMBRIDGE_SHELL", shell, true));
        }

        applied
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.output_buffer < 1 || self.session.output_buffer > 65536 {
            return Err(ConfigError::InvalidOutputBuffer(self.session.output_buffer));
        }

        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::InvalidGeometry(
                self.session.cols,
                self.session.rows,
            ));
        }

        self.server.listen_addr()?;

        // Absolute shells must exist; bare names are looked up in PATH.
        let shell = &self.session.default_shell;
        if !shell.is_empty() {
            let shell_path = Path::new(shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(shell.clone()));
            }
        }

        for dir in [&self.session.working_dir, &self.server.static_dir]
            .into_iter()
            .flatten()
        {
            if !dir.is_dir() {
                return Err(ConfigError::MissingDirectory(dir.clone()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// One environment variable seen by [`Config::apply_env_overrides`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOverride {
    /// Variable name.
    pub variable: &'static str,
    /// Raw value.
    pub value: String,
    /// `false` if the value was invalid and ignored.
    pub applied: bool,
}

impl EnvOverride {
    fn new(variable: &'static str, value: String, applied: bool) -> Self {
        Self {
            variable,
            value,
            applied,
        }
    }

    /// Logs the override; call once logging is initialized.
    pub fn log(&self) {
        if self.applied {
            tracing::info!("Overriding config from environment: {}={}", self.variable, self.value);
        } else {
            tracing::warn!("Ignoring invalid {} value: {}", self.variable, self.value);
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
