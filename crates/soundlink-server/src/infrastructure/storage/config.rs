//! TOML configuration for the server application.
//!
//! The file lives in the platform config directory:
//! - Windows:  `%APPDATA%\SoundLink\server.toml`
//! - Linux:    `$XDG_CONFIG_HOME/soundlink/server.toml` (or `~/.config/...`)
//! - macOS:    `~/Library/Application Support/SoundLink/server.toml`
//!
//! A missing file means "all defaults".  A file that only sets a few keys is
//! fine too: every field has a serde default, so
//!
//! ```toml
//! [server]
//! device_name = "Kitchen"
//!
//! [network]
//! control_port = 19876
//! ```
//!
//! is a complete configuration.
//!
//! The config is read once at startup; the server never writes it back
//! except through [`save_config`], which exists for first-run setup and
//! tests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use soundlink_core::protocol::{
    DEFAULT_CONTROL_PORT, DEFAULT_DISCOVERY_PORT, DEFAULT_TRANSFER_PORT,
};
use thiserror::Error;

use crate::infrastructure::network::control_server::DEFAULT_OUTBOUND_QUEUE_DEPTH;
use crate::infrastructure::network::transfer_server::DEFAULT_MAX_FILE_SIZE;

/// File name of the server configuration inside [`config_dir`].
pub const CONFIG_FILE_NAME: &str = "server.toml";

/// Errors from reading or writing `server.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither the platform variable nor a home directory is set.
    #[error("no platform config directory (HOME / APPDATA unset)")]
    NoPlatformConfigDir,

    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid server.toml: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot write server.toml: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// `bind_address` is not an IP address.
    #[error("invalid bind address {0:?}")]
    BindAddress(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub network: NetworkSection,
}

/// General server behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// Name announced to controllers during discovery.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory that holds uploaded audio files.  Defaults to `files/`
    /// inside the config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
    /// Largest upload accepted, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

/// Ports and bind address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// IP address all listeners bind to.  `"0.0.0.0"` binds every interface.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Frames a slow controller may have queued before it is disconnected.
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "SoundLink".to_string())
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}
fn default_transfer_port() -> u16 {
    DEFAULT_TRANSFER_PORT
}
fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_outbound_queue_depth() -> usize {
    DEFAULT_OUTBOUND_QUEUE_DEPTH
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            log_level: default_log_level(),
            storage_dir: None,
            max_file_size: default_max_file_size(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            control_port: default_control_port(),
            transfer_port: default_transfer_port(),
            discovery_port: default_discovery_port(),
            outbound_queue_depth: default_outbound_queue_depth(),
        }
    }
}

impl NetworkSection {
    fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.bind_address
            .trim()
            .parse()
            .map_err(|_| ConfigError::BindAddress(self.bind_address.clone()))
    }

    /// Socket address of the control listener.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BindAddress`] if `bind_address` is not an IP.
    pub fn control_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.control_port))
    }

    /// Socket address of the transfer listener.
    pub fn transfer_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.transfer_port))
    }

    /// Socket address of the discovery responder.
    pub fn discovery_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.discovery_port))
    }

    /// Where discovery broadcasts go.
    pub fn discovery_broadcast_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.discovery_port)
    }
}

impl ServerConfig {
    /// The storage directory, falling back to `<config_dir>/files`.
    pub fn storage_dir(&self, config_dir: &Path) -> PathBuf {
        self.server
            .storage_dir
            .clone()
            .unwrap_or_else(|| config_dir.join("files"))
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for config and settings.
///
/// # Errors
///
/// [`ConfigError::NoPlatformConfigDir`] when no base directory is known.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config from `path`, returning defaults if the file does not
/// exist yet.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("SoundLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("soundlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("SoundLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
