use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_scheme() -> Scheme {
    Scheme::Https
}

fn default_max_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_retry_max() -> u32 {
    4
}

fn default_retry_wait_min() -> u64 {
    1
}

fn default_retry_wait_max() -> u64 {
    30
}

fn default_shutdown_drain() -> u64 {
    10
}

/// Scheme assumed for origin-form request targets. The interception layer
/// hands us plain requests, so the original scheme is not recoverable from
/// the request line alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    pub cache_dir: PathBuf,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_scheme")]
    pub fallback_scheme: Scheme,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    #[serde(default = "default_retry_wait_min")]
    pub retry_wait_min: u64,
    #[serde(default = "default_retry_wait_max")]
    pub retry_wait_max: u64,
    #[serde(default = "default_shutdown_drain")]
    pub shutdown_drain: u64,
    /// Optional upstream proxy URL that all origin fetches are chained through.
    #[serde(default)]
    pub upstream_proxy: Option<String>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));

        builder = builder.add_source(
            Environment::with_prefix("PACKRAT")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn retry_wait_min(&self) -> Duration {
        Duration::from_secs(self.retry_wait_min)
    }

    pub fn retry_wait_max(&self) -> Duration {
        Duration::from_secs(self.retry_wait_max)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.cache_dir = absolutize(&self.cache_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_body_size > 0,
            "max_body_size must be greater than 0 (got {})",
            self.max_body_size
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        ensure!(
            self.retry_wait_min > 0,
            "retry_wait_min must be greater than 0 seconds (got {})",
            self.retry_wait_min
        );
        ensure!(
            self.retry_wait_min <= self.retry_wait_max,
            "retry_wait_min ({}) must not exceed retry_wait_max ({})",
            self.retry_wait_min,
            self.retry_wait_max
        );
        ensure!(
            self.shutdown_drain > 0,
            "shutdown_drain must be greater than 0 seconds (got {})",
            self.shutdown_drain
        );
        if let Some(proxy) = &self.upstream_proxy {
            ensure!(
                !proxy.trim().is_empty(),
                "upstream_proxy must not be an empty string"
            );
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/packrat/packrat.toml"),
        PathBuf::from("packrat.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
