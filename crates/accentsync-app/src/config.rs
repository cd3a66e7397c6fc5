//! Settings parser for the accent-sync config file.
//!
//! The file lives at `<config dir>/accent-sync/config.toml` (overridable on
//! the command line). Every field has a default; a missing or unparsable
//! file falls back to the defaults with a warning rather than failing, so a
//! broken config never keeps the daemon from starting.

use accentsync_core::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = "accent-sync";

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level settings, mirroring the `[connection]` and `[sync]` sections.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// `[connection]`: how to reach the OpenRGB SDK server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Name announced to the server; shows up in its client list.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// `[sync]`: what the daemon does with the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Push the current accent color once at startup.
    #[serde(default = "default_true")]
    pub apply_on_start: bool,
    /// Switch devices out of animated modes before writing colors.
    #[serde(default = "default_true")]
    pub set_static_mode: bool,
    /// Retry with backoff when the hub connection drops.
    #[serde(default = "default_true")]
    pub reconnect: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6742
}

fn default_client_name() -> String {
    "accent-sync".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_name: default_client_name(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            apply_on_start: true,
            set_static_mode: true,
            reconnect: true,
        }
    }
}

impl ConnectionConfig {
    /// The server address as `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Settings {
    /// Apply a `host:port` override from the command line.
    pub fn set_server(&mut self, server: &str) -> Result<()> {
        let (host, port) = server
            .rsplit_once(':')
            .ok_or_else(|| Error::config(format!("Invalid server address '{server}': expected HOST:PORT")))?;
        if host.is_empty() {
            return Err(Error::config(format!(
                "Invalid server address '{server}': empty host"
            )));
        }
        let port: u16 = port.parse().map_err(|_| {
            Error::config(format!("Invalid server address '{server}': bad port '{port}'"))
        })?;

        self.connection.host = host.to_string();
        self.connection.port = port;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Default config file location, `<config dir>/accent-sync/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILENAME))
}

/// Load settings from `path`, or from the default location when `None`.
///
/// Returns default settings if the file doesn't exist or can't be parsed.
pub fn load(path: Option<&Path>) -> Settings {
    let config_path = match path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(p) => p,
        None => {
            debug!("No config directory on this host, using defaults");
            return Settings::default();
        }
    };

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Write a commented default config file at `path` if none exists.
///
/// Idempotent: an existing file is never touched. Uses an atomic write
/// (temp file + rename) so a crash can't leave a half-written config.
pub fn init_config_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }

    let parent = path
        .parent()
        .ok_or_else(|| Error::config(format!("Config path {:?} has no parent directory", path)))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| Error::config(format!("Failed to create config dir: {}", e)))?;

    let temp_path = parent.join(".config.toml.tmp");
    std::fs::write(&temp_path, default_config_content())
        .map_err(|e| Error::config(format!("Failed to write temp file: {}", e)))?;
    std::fs::rename(&temp_path, path)
        .map_err(|e| Error::config(format!("Failed to rename temp file: {}", e)))?;

    info!("Created default config at {:?}", path);
    Ok(())
}

fn default_config_content() -> String {
    r#"# accent-sync configuration
# Every value shown here is the default; delete what you don't change.

[connection]
host = "127.0.0.1"
port = 6742                   # OpenRGB SDK server port
client_name = "accent-sync"   # Name shown in OpenRGB's client list
request_timeout_ms = 5000

[sync]
apply_on_start = true         # Push the current accent color once at startup
set_static_mode = true        # Switch devices out of animated modes first
reconnect = true              # Retry with backoff when the hub connection drops
"#
    .to_string()
}
