use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::Config;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Startup config (argv file plus env); every workspace starts from it.
    pub base_config: Config,
    pub config: Config,
    /// Token supplied with `auth.setToken` and `persist: false`; never written to disk.
    pub session_token: Option<String>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            workspace: None,
            db: None,
            base_config: config.clone(),
            config,
            session_token: None,
        }
    }
}
