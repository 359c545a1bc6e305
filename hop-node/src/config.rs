//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hop_core::RelayConfig;
use serde::Deserialize;

/// Which transport backend the daemon runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// UDP multicast discovery + TCP streams.
    #[default]
    Socket,
    /// Owner/member group link.
    Group,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "socket" => Ok(Backend::Socket),
            "group" => Ok(Backend::Group),
            other => Err(format!("unknown backend {other}")),
        }
    }
}

/// Daemon configuration. File: ~/.config/hop/config.toml or /etc/hop/config.toml.
/// Env overrides: HOP_USERNAME, HOP_ADDRESS, HOP_BACKEND, HOP_DISCOVERY_PORT, HOP_TRANSPORT_PORT,
/// HOP_DIRECTORY_URL, HOP_PROBE_URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Local username; messages addressed to it are delivered here.
    pub username: String,
    /// Local hop identifier. Generated at random when absent.
    pub address: Option<String>,
    pub backend: Backend,
    /// Discovery UDP port (default 45680).
    pub discovery_port: u16,
    /// Transport TCP port (default 45681).
    pub transport_port: u16,
    pub discovery_window_secs: u64,
    /// Group owner endpoint `host:port`; absent means this node owns the group.
    pub group_owner: Option<String>,
    pub max_hops: u32,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub write_timeout_ms: u64,
    pub peer_queue_depth: usize,
    pub split_horizon: bool,
    pub auto_connect: bool,
    pub directory_url: Option<String>,
    pub directory_poll_secs: u64,
    pub probe_url: Option<String>,
    pub probe_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: "anonymous".to_string(),
            address: None,
            backend: Backend::Socket,
            discovery_port: 45680,
            transport_port: 45681,
            discovery_window_secs: 12,
            group_owner: None,
            max_hops: hop_core::DEFAULT_MAX_HOPS,
            ttl_secs: hop_core::DEFAULT_TTL_MS / 1000,
            sweep_interval_secs: 60,
            write_timeout_ms: 2000,
            peer_queue_depth: 64,
            split_horizon: false,
            auto_connect: true,
            directory_url: None,
            directory_poll_secs: 5,
            probe_url: None,
            probe_interval_secs: 10,
        }
    }
}

impl Config {
    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            max_hops: self.max_hops,
            ttl_ms: self.ttl_secs.saturating_mul(1000),
            split_horizon: self.split_horizon,
            record_outbound: true,
        }
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_secs(self.discovery_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn directory_poll(&self) -> Duration {
        Duration::from_secs(self.directory_poll_secs.max(1))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

/// Config file could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = match load_file() {
        Ok(Some(c)) => c,
        Ok(None) => Config::default(),
        Err(e) => {
            tracing::warn!("config: {e}; using defaults");
            Config::default()
        }
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

/// Load one explicit file, then env vars. Unlike `load`, a bad file is an error.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let mut c = parse_file(path)?;
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

/// Overlay HOP_* variables looked up through `var`. Unparsable values are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("HOP_USERNAME") {
        c.username = s;
    }
    if let Some(s) = var("HOP_ADDRESS") {
        c.address = Some(s);
    }
    if let Some(b) = var("HOP_BACKEND").and_then(|s| s.parse().ok()) {
        c.backend = b;
    }
    if let Some(p) = var("HOP_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("HOP_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
        c.transport_port = p;
    }
    if let Some(s) = var("HOP_DIRECTORY_URL") {
        c.directory_url = Some(s);
    }
    if let Some(s) = var("HOP_PROBE_URL") {
        c.probe_url = Some(s);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/hop/config.toml"));
    }
    out.push(PathBuf::from("/etc/hop/config.toml"));
    out
}

fn load_file() -> Result<Option<Config>, ConfigError> {
    match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => parse_file(&p).map(Some),
        None => Ok(None),
    }
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
