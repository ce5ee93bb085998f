//! Server configuration: TOML file + CLI overrides.

use courier_core::{CourierError, CourierResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            max_line_bytes: default_max_line_bytes(),
            outbound_buffer: default_outbound_buffer(),
            handshake_timeout_secs: default_handshake_timeout(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

/// `[bus]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_bus_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            endpoint: default_bus_endpoint(),
            topic: default_topic(),
            poll_timeout_ms: default_poll_timeout(),
        }
    }
}

/// `[store]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_url")]
    pub url: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: default_store_url(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    14232
}
fn default_max_line_bytes() -> usize {
    courier_core::codec::DEFAULT_MAX_LINE
}
fn default_outbound_buffer() -> usize {
    64
}
fn default_handshake_timeout() -> u64 {
    30
}
fn default_write_timeout() -> u64 {
    10
}
fn default_bus_endpoint() -> String {
    "memory".to_string()
}
fn default_topic() -> String {
    "msgTopic".to_string()
}
fn default_poll_timeout() -> u64 {
    1000
}
fn default_store_url() -> String {
    "memory".to_string()
}

/// Which persistence backend to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Sqlite(PathBuf),
}

impl StoreKind {
    /// Parse a store url: `memory` or `sqlite:<path>`.
    pub fn parse(url: &str) -> CourierResult<Self> {
        if url == "memory" {
            return Ok(Self::Memory);
        }
        match url.strip_prefix("sqlite:") {
            Some(path) if !path.is_empty() => Ok(Self::Sqlite(expand_tilde_str(path))),
            _ => Err(CourierError::Other(format!("unsupported store url: {url}"))),
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen_addr: Option<String>,
    pub port: Option<u16>,
    pub store_url: Option<String>,
    pub bus_endpoint: Option<String>,
    pub topic: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub port: u16,
    pub max_line_bytes: usize,
    pub outbound_buffer: usize,
    pub handshake_timeout: Duration,
    /// Upper bound on a single record write to a client.
    pub write_timeout: Duration,
    pub bus_endpoint: String,
    pub topic: String,
    pub poll_timeout: Duration,
    pub store: StoreKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            max_line_bytes: default_max_line_bytes(),
            outbound_buffer: default_outbound_buffer(),
            handshake_timeout: Duration::from_secs(default_handshake_timeout()),
            write_timeout: Duration::from_secs(default_write_timeout()),
            bus_endpoint: default_bus_endpoint(),
            topic: default_topic(),
            poll_timeout: Duration::from_millis(default_poll_timeout()),
            store: StoreKind::Memory,
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: CliOverrides) -> CourierResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| CourierError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    fn resolve(file: ConfigFile, cli: CliOverrides) -> CourierResult<Self> {
        let store_url = cli.store_url.unwrap_or(file.store.url);
        if file.server.outbound_buffer == 0 {
            return Err(CourierError::Other("outbound_buffer must be at least 1".into()));
        }
        if file.server.max_line_bytes == 0 {
            return Err(CourierError::Other("max_line_bytes must be at least 1".into()));
        }
        if file.server.write_timeout_secs == 0 {
            return Err(CourierError::Other("write_timeout_secs must be at least 1".into()));
        }

        Ok(Self {
            listen_addr: cli.listen_addr.unwrap_or(file.server.listen_addr),
            port: cli.port.unwrap_or(file.server.port),
            max_line_bytes: file.server.max_line_bytes,
            outbound_buffer: file.server.outbound_buffer,
            handshake_timeout: Duration::from_secs(file.server.handshake_timeout_secs),
            write_timeout: Duration::from_secs(file.server.write_timeout_secs),
            bus_endpoint: cli.bus_endpoint.unwrap_or(file.bus.endpoint),
            topic: cli.topic.unwrap_or(file.bus.topic),
            poll_timeout: Duration::from_millis(file.bus.poll_timeout_ms),
            store: StoreKind::parse(&store_url)?,
        })
    }

    /// `host:port` the listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
