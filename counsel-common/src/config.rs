//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration comes from a TOML file. Settings sources, highest
//! priority first:
//!
//! 1. Command-line arguments (applied by the binary via [`ConfigOverrides`])
//! 2. Environment variables (`COUNSEL_ROOT_FOLDER`, `COUNSEL_UPSTREAM_API_KEY`)
//! 3. TOML configuration file
//! 4. Built-in defaults (code constants)
//!
//! A missing TOML file is not an error: a warning is logged and defaults are
//! used. A file that exists but does not parse is an error.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "COUNSEL_ROOT_FOLDER";

/// Environment variable carrying the upstream API key
pub const UPSTREAM_API_KEY_ENV: &str = "COUNSEL_UPSTREAM_API_KEY";

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "counsel.db";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    /// Root folder for the database (optional)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Explicit database path; defaults to `<root_folder>/counsel.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Root folder given on the command line; outranks the environment
    #[serde(skip)]
    pub cli_root_folder: Option<PathBuf>,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

/// Remote streaming API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the remote AI service
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,

    /// Path of the streaming endpoint, appended to `base_url`
    #[serde(default = "default_stream_path")]
    pub stream_path: String,

    /// Bearer token sent with every stream request (optional)
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            stream_path: default_stream_path(),
            api_key: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Full URL of the streaming endpoint
    pub fn stream_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.stream_path.trim_start_matches('/')
        )
    }
}

/// Relay timing and buffering
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Idle time before a heartbeat frame is written
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Hard ceiling on the total upstream stream duration
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,

    /// Capacity of the per-session relay channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How long a finished relay waits for its upstream worker to stop
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stream_timeout_secs: default_stream_timeout_secs(),
            channel_capacity: default_channel_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::Config(
                "relay.heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.stream_timeout() <= self.heartbeat_interval() {
            return Err(Error::Config(format!(
                "relay.stream_timeout_secs ({}s) must exceed the heartbeat interval ({}ms)",
                self.stream_timeout_secs, self.heartbeat_interval_ms
            )));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config(
                "relay.channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5780
}

fn default_upstream_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_stream_path() -> String {
    "/chat/stream".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_stream_timeout_secs() -> u64 {
    120
}

fn default_channel_capacity() -> usize {
    64
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// Load configuration, degrading to defaults when no file is present
    ///
    /// With `path == None` the platform config file
    /// (`<config_dir>/counsel/config.toml`) is tried.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };

        let Some(config_path) = candidate else {
            warn!("Could not determine config directory, using built-in defaults");
            return Ok(Self::default());
        };

        if !config_path.exists() {
            warn!(
                "Config file {} not found, using built-in defaults",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                config_path.display(),
                e
            ))
        })?;

        let config = Self::from_toml_str(&content)?;
        info!("Loaded TOML configuration from {}", config_path.display());
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("server.port must not be 0".to_string()));
        }
        if self.upstream.base_url.trim().is_empty() {
            return Err(Error::Config("upstream.base_url must not be empty".to_string()));
        }
        self.relay.validate()
    }

    /// Apply command-line and environment overrides
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(root) = overrides.root_folder {
            self.cli_root_folder = Some(root);
        }
        if let Some(db) = overrides.database_path {
            self.database_path = Some(db);
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(url) = overrides.upstream_base_url {
            self.upstream.base_url = url;
        }
        if let Some(key) = overrides.upstream_api_key {
            self.upstream.api_key = Some(key);
        }
    }

    /// Resolve the database path: explicit path, else `<root_folder>/counsel.db`
    pub fn resolve_database_path(&self) -> PathBuf {
        if let Some(path) = &self.database_path {
            return path.clone();
        }
        resolve_root_folder(
            self.cli_root_folder.as_deref(),
            ROOT_FOLDER_ENV,
            self.root_folder.as_deref(),
        )
            .join(DATABASE_FILE_NAME)
    }
}

/// Command-line configuration overrides
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub root_folder: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub upstream_base_url: Option<String>,
    pub upstream_api_key: Option<String>,
}

/// Root folder resolution in priority order:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. TOML config value
/// 4. OS-dependent compiled default
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_value: Option<&Path>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = toml_value {
        return path.to_path_buf();
    }

    get_default_root_folder()
}

/// Platform config file location
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("counsel").join("config.toml"))
}

/// Get OS-dependent default root folder path
pub fn get_default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/counsel (or /var/lib/counsel for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("counsel"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/counsel"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("counsel"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/counsel"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("counsel"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\counsel"))
    } else {
        PathBuf::from("./counsel_data")
    }
}
