//! Layered configuration for nimbus.
//!
//! Sources, lowest to highest precedence:
//! 1. Built-in defaults ([`Config::default`]).
//! 2. A TOML file: the path given on the command line, otherwise
//!    `config.toml` in the platform config directory (skipped if missing).
//! 3. Environment variables prefixed `NIMBUS_`, with `__` separating
//!    nested keys (`NIMBUS_CACHE__WORKERS=4`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "NIMBUS_";
const CONFIG_FILE: &str = "config.toml";
const CACHE_FILE: &str = "nodes.db";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "nimbus")
}

/// Where the config file is looked for when none is given explicitly.
pub fn default_config_file() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the provider credentials (`oauth_data`), the
    /// discovered endpoints and, unless overridden, the node cache.
    pub auth_path: PathBuf,
    pub cache: CacheConfig,
    pub remote: RemoteConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// SQLite file; `<auth_path>/nodes.db` when unset.
    pub path: Option<PathBuf>,
    /// Maximum number of database workers (and connections).
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub metadata_url: Option<String>,
    pub content_url: Option<String>,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Default for Config {
    fn default() -> Self {
        let auth_path = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".nimbus"));
        Self {
            auth_path,
            cache: CacheConfig::default(),
            remote: RemoteConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            workers: std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            metadata_url: None,
            content_url: None,
            timeout_secs: 120,
            connect_timeout_secs: 30,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Load, normalize and validate the configuration.
    ///
    /// An explicitly named file must exist; the default file may not.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config: Self = Self::figment(explicit)?.extract().or_raise(|| ErrorKind::Parse)?;
        config.normalize();
        config.validate()?;
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    /// The merged sources, before extraction.
    pub fn figment(explicit: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        match explicit {
            Some(path) => {
                if !path.is_file() {
                    exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
                }
                figment = figment.merge(Toml::file(path));
            },
            None => {
                if let Some(path) = default_config_file() {
                    figment = figment.merge(Toml::file(path));
                }
            },
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Endpoint overrides are joined with relative paths, so they must end
    /// in a slash.
    fn normalize(&mut self) {
        for url in [&mut self.remote.metadata_url, &mut self.remote.content_url].into_iter().flatten() {
            if !url.ends_with('/') {
                url.push('/');
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.workers == 0 {
            exn::bail!(ErrorKind::Invalid("cache.workers"));
        }
        if self.remote.timeout_secs == 0 {
            exn::bail!(ErrorKind::Invalid("remote.timeout_secs"));
        }
        if self.remote.connect_timeout_secs == 0 {
            exn::bail!(ErrorKind::Invalid("remote.connect_timeout_secs"));
        }
        let urls = [
            ("remote.metadata_url", &self.remote.metadata_url),
            ("remote.content_url", &self.remote.content_url),
        ];
        for (key, url) in urls {
            if let Some(url) = url
                && !(url.starts_with("https://") || url.starts_with("http://"))
            {
                exn::bail!(ErrorKind::Invalid(key));
            }
        }
        Ok(())
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache.path.clone().unwrap_or_else(|| self.auth_path.join(CACHE_FILE))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.remote.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.connect_timeout_secs)
    }
}
