//! Configuration for the strata server, worker, and CLI.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "strata.toml";

/// Application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Base URL of the block source API.
    #[serde(default)]
    pub source_base_url: Option<String>,
    /// Workspace-level token for the block source.
    #[serde(default)]
    pub source_token: Option<String>,
    /// Request timeout in seconds for source fetches.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Retries for transient source failures during normalization.
    #[serde(default = "default_source_retries")]
    pub source_retries: u32,
    /// Base backoff between retries in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Worker count for the job pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Seconds before a running job is considered stale and reclaimable.
    #[serde(default = "default_job_visibility_secs")]
    pub job_visibility_secs: u64,
    /// Bind host for the HTTP server.
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Bind port for the HTTP server.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enable debug-level logging.
    #[serde(default)]
    pub debug: bool,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("strata.db")
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_source_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_workers() -> usize {
    4
}

fn default_job_visibility_secs() -> u64 {
    600
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    8350
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            source_base_url: None,
            source_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            source_retries: default_source_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            workers: default_workers(),
            job_visibility_secs: default_job_visibility_secs(),
            host: default_host(),
            port: default_port(),
            debug: false,
        }
    }
}

impl Settings {
    /// Load settings from an explicit path, from `strata.toml` in the
    /// working directory if present, or from defaults. Environment
    /// overrides apply last.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Some(database) = env_nonempty("STRATA_DATABASE") {
            self.database_path = PathBuf::from(database);
        }
        if let Some(base_url) = env_nonempty("SOURCE_BASE_URL") {
            self.source_base_url = Some(base_url);
        }
        if let Some(token) = env_nonempty("SOURCE_TOKEN") {
            self.source_token = Some(token);
        }
        if let Some(host) = env_nonempty("STRATA_HOST") {
            self.host = host
                .parse()
                .with_context(|| format!("invalid STRATA_HOST: {host}"))?;
        }
        if let Some(port) = env_nonempty("STRATA_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("invalid STRATA_PORT: {port}"))?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn job_visibility(&self) -> Duration {
        Duration::from_secs(self.job_visibility_secs)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}
