use crate::config::Config;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "remoteConfigured": state.config.remote.base_url.is_some(),
            "kkm": crate::calc::KKM
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let conn = match db::open_db(&path) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
    };

    let config_warning = apply_workspace_config(state, &path, &conn);
    if state.workspace.as_deref() != Some(path.as_path()) {
        state.session_token = None;
    }

    info!(workspace = %path.to_string_lossy(), "workspace opened");
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    ok(
        &req.id,
        json!({
            "workspacePath": path.to_string_lossy(),
            "configWarning": config_warning
        }),
    )
}

/// Rebuilds the live config for a workspace: the startup config, then its
/// `rapord.toml`, then env overrides, then settings saved by `remote.configure`.
/// Returns a warning when `rapord.toml` could not be used.
pub(crate) fn apply_workspace_config(
    state: &mut AppState,
    workspace: &Path,
    conn: &Connection,
) -> Option<String> {
    let mut config = state.base_config.clone();
    let mut warning = None;
    match Config::load_workspace(workspace) {
        Ok(Some(ws)) => config = config.merge(ws).with_env_overrides(),
        Ok(None) => {}
        Err(e) => {
            // A broken rapord.toml is reported but must not keep the workspace closed.
            warn!(error = %format!("{e:#}"), "ignoring workspace config");
            warning = Some(format!("{e:#}"));
        }
    }
    match db::settings_get_json(conn, db::REMOTE_SETTINGS_KEY) {
        Ok(Some(saved)) => {
            if let Some(base) = saved.get("baseUrl").and_then(|v| v.as_str()) {
                config.remote.base_url = Some(base.to_string());
            }
            config.remote.timeout_secs = saved.get("timeoutSecs").and_then(|v| v.as_u64());
        }
        Ok(None) => {}
        Err(e) => warn!(error = %format!("{e:#}"), "ignoring saved remote settings"),
    }
    state.config = config;
    warning
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
