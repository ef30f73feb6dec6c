//! Server configuration – reads/writes `~/.smartanom/config.toml`.

use serde::{Deserialize, Serialize};
use smartanom_hub::HubSettings;
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted configuration stored in `~/.smartanom/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the gateway binds to.
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP / WebSocket port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Queued outbound frames per connection before pushes are dropped.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Open connections accepted before new ones are refused.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_host() -> String {
    smartanom_gateway::DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    smartanom_gateway::DEFAULT_PORT
}
fn default_database_path() -> PathBuf {
    PathBuf::from("smartanom.db")
}
fn default_outbound_buffer() -> usize {
    HubSettings::default().outbound_buffer
}
fn default_max_connections() -> usize {
    HubSettings::default().max_connections
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_path: default_database_path(),
            outbound_buffer: default_outbound_buffer(),
            max_connections: default_max_connections(),
        }
    }
}

impl Config {
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            outbound_buffer: self.outbound_buffer,
            max_connections: self.max_connections,
        }
    }
}

/// Return the path to `~/.smartanom/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".smartanom").join("config.toml")
}

/// Load the config from `path`, falling back to defaults when the file does
/// not exist. Environment overrides are applied in both cases.
pub fn load_from(path: &Path) -> Result<Config, String> {
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Apply `SMARTANOM_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SMARTANOM_HOST` | `host` |
/// | `SMARTANOM_PORT` | `port` |
/// | `SMARTANOM_DATABASE` | `database_path` |
/// | `SMARTANOM_OUTBOUND_BUFFER` | `outbound_buffer` |
/// | `SMARTANOM_MAX_CONNECTIONS` | `max_connections` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SMARTANOM_HOST") {
        cfg.host = v;
    }
    if let Ok(v) = std::env::var("SMARTANOM_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.port = port;
    }
    if let Ok(v) = std::env::var("SMARTANOM_DATABASE") {
        cfg.database_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("SMARTANOM_OUTBOUND_BUFFER")
        && let Ok(n) = v.parse::<usize>()
        && n > 0
    {
        cfg.outbound_buffer = n;
    }
    if let Ok(v) = std::env::var("SMARTANOM_MAX_CONNECTIONS")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.max_connections = n;
    }
}

/// Save the config to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}
