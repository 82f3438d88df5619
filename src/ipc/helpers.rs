use crate::calc;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    let v = req
        .params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))?;
    if v.is_empty() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must not be empty", key),
            None,
        ));
    }
    Ok(v)
}

/// Absent and `null` both read as `None`; blank strings too.
pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    match req.params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a string or null", key),
            None,
        )),
    }
}

pub fn optional_bool(req: &Request, key: &str, default: bool) -> Result<bool, serde_json::Value> {
    match req.params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(serde_json::Value::Bool(b)) => Ok(*b),
        Some(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a boolean", key),
            None,
        )),
    }
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn db_err(req: &Request, code: &str, e: impl std::fmt::Display, table: &str) -> serde_json::Value {
    err(&req.id, code, e.to_string(), Some(json!({ "table": table })))
}

pub fn calc_err(req: &Request, e: calc::CalcError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// `null` clears the score; numbers must be finite and within 0..=100.
pub fn parse_score(v: &serde_json::Value) -> Result<Option<f64>, String> {
    if v.is_null() {
        return Ok(None);
    }
    let Some(n) = v.as_f64() else {
        return Err("value must be a number or null".to_string());
    };
    if !n.is_finite() || !(0.0..=100.0).contains(&n) {
        return Err(format!("value {} is outside 0..100", n));
    }
    Ok(Some(n))
}

pub fn parse_weight(v: &serde_json::Value) -> Result<f64, String> {
    let Some(n) = v.as_f64() else {
        return Err("weight must be a number".to_string());
    };
    if !n.is_finite() || !(0.0..=100.0).contains(&n) {
        return Err(format!("weight {} is outside 0..100", n));
    }
    Ok(n)
}

pub fn parse_date(req: &Request, raw: &str) -> Result<NaiveDate, serde_json::Value> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        err(
            &req.id,
            "bad_params",
            "date must be YYYY-MM-DD",
            Some(json!({ "date": raw })),
        )
    })
}

/// 404-style guard used before writes that reference another row.
pub fn ensure_exists(
    conn: &Connection,
    req: &Request,
    table: &str,
    id: &str,
    what: &str,
) -> Result<(), serde_json::Value> {
    let found: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?", table),
            [id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if found.is_none() {
        return Err(err(
            &req.id,
            "not_found",
            format!("{} not found", what),
            Some(json!({ "id": id })),
        ));
    }
    Ok(())
}
