//! Server configuration: TOML file + CLI overrides.
//!
//! The file is read twice: once into the typed sections below, and once
//! into a raw JSON map that backs the `config.get` / `config.set` methods.

use crate::auth::rate_limit::RateLimitConfig;
use gw_core::{GwError, GwResult};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
}

/// Which interfaces the listener binds to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// 127.0.0.1 only.
    #[default]
    Loopback,
    /// All interfaces (0.0.0.0).
    Lan,
    /// An explicit host from `custom_bind_host`.
    Custom,
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default)]
    pub bind: BindMode,
    #[serde(default)]
    pub custom_bind_host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub control_ui: ControlUiSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: BindMode::default(),
            custom_bind_host: String::new(),
            port: default_port(),
            auth: AuthSection::default(),
            tls: TlsSection::default(),
            control_ui: ControlUiSection::default(),
            rate_limit: RateLimitSection::default(),
        }
    }
}

/// `[gateway.auth]` section. Empty values fall back to the environment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub password: String,
}

/// `[gateway.tls]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

/// `[gateway.control_ui]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlUiSection {
    /// Origins allowed to talk to the gateway. Empty = no origin check.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// `[gateway.rate_limit]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_max_failures")]
    pub max_failures: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_hosts")]
    pub max_hosts: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            window_secs: default_window_secs(),
            max_hosts: default_max_hosts(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_port() -> u16 {
    18789
}
fn default_max_failures() -> usize {
    5
}
fn default_window_secs() -> u64 {
    900
}
fn default_max_hosts() -> usize {
    10_000
}
fn default_sweep_interval_secs() -> u64 {
    60
}

/// TLS certificate and key locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub bind: Option<BindMode>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: BindMode,
    pub custom_bind_host: String,
    pub port: u16,
    pub auth: AuthSection,
    pub tls: Option<TlsPaths>,
    pub allowed_origins: Vec<String>,
    pub rate_limit: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), &CliOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// Returns the typed config plus the raw map used by `config.get`/`config.set`.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> GwResult<(Self, Value)> {
        let content = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    Some(std::fs::read_to_string(&expanded)?)
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    None
                }
            }
            None => None,
        };

        let (file_config, raw) = match content {
            Some(text) => Self::parse(&text)?,
            None => (ConfigFile::default(), Value::Object(Map::new())),
        };

        let config = Self::from_file(file_config, cli);
        let mut raw = raw;
        // Keep the raw view consistent with what the server actually uses.
        set_path(&mut raw, "gateway.port", Value::from(config.port))?;
        Ok((config, raw))
    }

    /// Parse TOML text into the typed sections and the raw JSON map.
    pub fn parse(text: &str) -> GwResult<(ConfigFile, Value)> {
        let file_config = toml::from_str::<ConfigFile>(text)
            .map_err(|e| GwError::Config(format!("config parse error: {e}")))?;
        let raw_toml = toml::from_str::<toml::Value>(text)
            .map_err(|e| GwError::Config(format!("config parse error: {e}")))?;
        let raw = serde_json::to_value(raw_toml)?;
        Ok((file_config, raw))
    }

    fn from_file(file: ConfigFile, cli: &CliOverrides) -> Self {
        let gw = file.gateway;

        let cert = cli.tls_cert.clone().unwrap_or(gw.tls.cert);
        let key = cli.tls_key.clone().unwrap_or(gw.tls.key);
        let tls_enabled = gw.tls.enabled || (cli.tls_cert.is_some() && cli.tls_key.is_some());
        let tls = tls_enabled.then(|| TlsPaths {
            cert: expand_tilde_str(&cert),
            key: expand_tilde_str(&key),
        });

        Self {
            bind: cli.bind.unwrap_or(gw.bind),
            custom_bind_host: gw.custom_bind_host,
            port: cli.port.unwrap_or(gw.port),
            auth: gw.auth,
            tls,
            allowed_origins: gw.control_ui.allowed_origins,
            rate_limit: RateLimitConfig {
                max_failures: gw.rate_limit.max_failures,
                window: Duration::from_secs(gw.rate_limit.window_secs),
                max_hosts: gw.rate_limit.max_hosts,
                sweep_interval: Duration::from_secs(gw.rate_limit.sweep_interval_secs),
            },
        }
    }

    /// The `host:port` string the listener binds to.
    pub fn listen_addr(&self) -> GwResult<String> {
        resolve_listen_addr(self.bind, &self.custom_bind_host, self.port)
    }
}

/// Turn a bind mode plus port into a bindable address.
pub fn resolve_listen_addr(mode: BindMode, custom_host: &str, port: u16) -> GwResult<String> {
    let host = match mode {
        BindMode::Loopback => "127.0.0.1",
        BindMode::Lan => "0.0.0.0",
        BindMode::Custom => {
            let host = custom_host.trim();
            if host.is_empty() {
                return Err(GwError::Config(
                    "bind mode 'custom' requires gateway.custom_bind_host".into(),
                ));
            }
            host
        }
    };
    if host.contains(':') && !host.starts_with('[') {
        Ok(format!("[{host}]:{port}"))
    } else {
        Ok(format!("{host}:{port}"))
    }
}

/// Look up a dotted path (`gateway.port`) in a raw config map.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(root, |node, segment| node.as_object()?.get(segment))
}

/// Write `value` at a dotted path, creating intermediate tables as needed.
///
/// Fails if an intermediate segment exists but is not a table.
pub fn set_path(root: &mut Value, path: &str, value: Value) -> GwResult<()> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(GwError::InvalidMessage(format!("invalid config path: {path:?}")));
    }
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| GwError::InvalidMessage("empty config path".into()))?;

    let mut node = root;
    for segment in parents {
        let table = node
            .as_object_mut()
            .ok_or_else(|| GwError::InvalidMessage(format!("{path}: parent is not a table")))?;
        node = table
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let table = node
        .as_object_mut()
        .ok_or_else(|| GwError::InvalidMessage(format!("{path}: parent is not a table")))?;
    table.insert(last.to_string(), value);
    Ok(())
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
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
