//! procmond configuration loading and parsing

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

const DEFAULT_CONFIG_PATH: &str = "/etc/procmond/config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub groups: Vec<SeedGroup>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            sampler: SamplerConfig::default(),
            history: HistoryConfig::default(),
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_clients: default_max_clients(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_credentials_file")]
    pub credentials_file: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_entries")]
    pub max_entries: usize,
    #[serde(default = "default_history_tracked")]
    pub max_tracked: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_history_entries(),
            max_tracked: default_history_tracked(),
        }
    }
}

/// A process group created at startup, in file order.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedGroup {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub description: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_clients() -> usize {
    30
}

fn default_credentials_file() -> String {
    "/etc/procmond/users".to_string()
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_history_entries() -> usize {
    60
}

fn default_history_tracked() -> usize {
    100
}

/// Load configuration from `PROCMOND_CONFIG` or the default path.
///
/// A missing file yields built-in defaults; a file that exists but does not
/// parse is an error.
pub fn load_config() -> Result<Config> {
    let path = std::env::var("PROCMOND_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_config_from(Path::new(&path))
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}
