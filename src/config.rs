use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const WORKSPACE_CONFIG_FILE: &str = "rapord.toml";
pub const ENV_API_BASE: &str = "RAPORD_API_BASE";

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    /// File holding a bearer token; re-read on every request.
    pub token_file: Option<PathBuf>,
    /// No timeout when unset.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "rapord=info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.to_string_lossy()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config {}", path.to_string_lossy()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Reads `rapord.toml` from a workspace; a missing file is not an error.
    pub fn load_workspace(workspace: &Path) -> anyhow::Result<Option<Self>> {
        let p = workspace.join(WORKSPACE_CONFIG_FILE);
        if !p.is_file() {
            return Ok(None);
        }
        Self::load(&p).map(Some)
    }

    /// Fields set in `other` win.
    pub fn merge(mut self, other: Config) -> Self {
        if other.remote.base_url.is_some() {
            self.remote.base_url = other.remote.base_url;
        }
        if other.remote.token_file.is_some() {
            self.remote.token_file = other.remote.token_file;
        }
        if other.remote.timeout_secs.is_some() {
            self.remote.timeout_secs = other.remote.timeout_secs;
        }
        if other.logging != LoggingConfig::default() {
            self.logging = other.logging;
        }
        self
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var(ENV_API_BASE) {
            if !v.trim().is_empty() {
                self.remote.base_url = Some(v.trim().to_string());
            }
        }
        self
    }
}
