use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_bool, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::remote::{ApiClient, CredentialChain, EnvToken, StaticToken, TokenFile, ENV_TOKEN};
use crate::sync::{self, SyncError};
use rusqlite::Connection;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

fn persisted_token(conn: &Connection) -> Option<String> {
    match db::settings_get_json(conn, db::AUTH_TOKEN_KEY) {
        Ok(v) => v.and_then(|v| v.as_str().map(|s| s.to_string())),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "failed to read persisted token");
            None
        }
    }
}

/// Session token, then the persisted token, then the token file, then the environment.
fn credential_chain(state: &AppState, conn: &Connection) -> CredentialChain {
    let mut chain = CredentialChain::new()
        .with(StaticToken::new(state.session_token.clone()))
        .with(StaticToken::new(persisted_token(conn)));
    if let Some(path) = state.config.remote.token_file.clone() {
        chain = chain.with(TokenFile::new(path));
    }
    chain.with(EnvToken::new(ENV_TOKEN))
}

fn handle_remote_configure(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let base_url = match required_str(req, "baseUrl") {
        Ok(v) => v.trim_end_matches('/').to_string(),
        Err(e) => return e,
    };
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return err(
            &req.id,
            "bad_params",
            "baseUrl must start with http:// or https://",
            Some(json!({ "baseUrl": base_url })),
        );
    }
    let timeout_secs = match req.params.get("timeoutSecs") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => match v.as_u64() {
            Some(n) if n > 0 => Some(n),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "timeoutSecs must be a positive integer",
                    None,
                )
            }
        },
    };

    let saved = json!({ "baseUrl": base_url, "timeoutSecs": timeout_secs });
    if let Err(e) = db::settings_set_json(conn, db::REMOTE_SETTINGS_KEY, &saved) {
        return err(
            &req.id,
            "db_update_failed",
            format!("{e:#}"),
            Some(json!({ "table": "settings" })),
        );
    }
    state.config.remote.base_url = Some(base_url.clone());
    state.config.remote.timeout_secs = timeout_secs;
    info!(base_url = %base_url, "remote configured");

    ok(
        &req.id,
        json!({ "baseUrl": base_url, "timeoutSecs": timeout_secs }),
    )
}

fn handle_auth_set_token(state: &mut AppState, req: &Request) -> serde_json::Value {
    let token = match required_str(req, "token") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let persist = match optional_bool(req, "persist", false) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if persist {
        let conn = match db_conn(state, req) {
            Ok(c) => c,
            Err(e) => return e,
        };
        if let Err(e) = db::settings_set_json(conn, db::AUTH_TOKEN_KEY, &json!(token)) {
            return err(
                &req.id,
                "db_update_failed",
                format!("{e:#}"),
                Some(json!({ "table": "settings" })),
            );
        }
        state.session_token = None;
    } else {
        state.session_token = Some(token);
    }
    ok(&req.id, json!({ "ok": true, "persisted": persist }))
}

fn handle_auth_clear_token(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.session_token = None;
    if let Some(conn) = state.db.as_ref() {
        if let Err(e) = db::settings_delete(conn, db::AUTH_TOKEN_KEY) {
            return err(
                &req.id,
                "db_delete_failed",
                format!("{e:#}"),
                Some(json!({ "table": "settings" })),
            );
        }
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_sync_pull(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let only_class = match optional_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(base_url) = state.config.remote.base_url.clone() else {
        return err(
            &req.id,
            "remote_not_configured",
            "remote base url is not configured",
            None,
        );
    };

    let timeout = state.config.remote.timeout_secs.map(Duration::from_secs);
    let client = match ApiClient::new(&base_url, timeout, Box::new(credential_chain(state, conn))) {
        Ok(c) => c,
        Err(e) => return err(&req.id, e.code(), e.to_string(), e.details()),
    };

    match sync::pull(conn, &client, only_class.as_deref()) {
        Ok(report) => {
            info!(base_url = %base_url, "sync pull finished");
            ok(&req.id, json!({ "report": report }))
        }
        Err(SyncError::Remote(e)) => {
            warn!(error = %e, "sync pull failed");
            err(&req.id, e.code(), e.to_string(), e.details())
        }
        Err(SyncError::Db(e)) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "remote.configure" => Some(handle_remote_configure(state, req)),
        "auth.setToken" => Some(handle_auth_set_token(state, req)),
        "auth.clearToken" => Some(handle_auth_clear_token(state, req)),
        "sync.pull" => Some(handle_sync_pull(state, req)),
        _ => None,
    }
}
