use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, db_err, ensure_exists, now_rfc3339, optional_bool, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ROLES: &[&str] = &["admin", "teacher", "student"];

fn parse_role(req: &Request, raw: &str) -> Result<String, serde_json::Value> {
    let r = raw.trim().to_ascii_lowercase();
    if ROLES.contains(&r.as_str()) {
        Ok(r)
    } else {
        Err(err(
            &req.id,
            "bad_params",
            "role must be one of: admin, teacher, student",
            Some(json!({ "role": raw })),
        ))
    }
}

fn handle_accounts_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let role = match optional_str(req, "role") {
        Ok(Some(r)) => match parse_role(req, &r) {
            Ok(v) => Some(v),
            Err(e) => return e,
        },
        Ok(None) => None,
        Err(e) => return e,
    };

    let mut sql = String::from(
        "SELECT id, username, display_name, role, email, active, created_at FROM accounts",
    );
    let mut binds: Vec<Value> = Vec::new();
    if let Some(r) = role {
        sql.push_str(" WHERE role = ?");
        binds.push(Value::Text(r));
    }
    sql.push_str(" ORDER BY display_name, username");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "displayName": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "email": r.get::<_, Option<String>>(4)?,
                "active": r.get::<_, i64>(5)? != 0,
                "createdAt": r.get::<_, String>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(accounts) => ok(&req.id, json!({ "accounts": accounts })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_accounts_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let username = match required_str(req, "username") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let display_name = match required_str(req, "displayName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let role = match required_str(req, "role").and_then(|r| parse_role(req, &r)) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match optional_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let taken: Option<i64> = match conn
        .query_row("SELECT 1 FROM accounts WHERE username = ?", [&username], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if taken.is_some() {
        return err(
            &req.id,
            "conflict",
            "username already exists",
            Some(json!({ "username": username })),
        );
    }

    let account_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO accounts(id, username, display_name, role, email, active, created_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (&account_id, &username, &display_name, &role, &email, now_rfc3339()),
    ) {
        return db_err(req, "db_insert_failed", e, "accounts");
    }

    ok(
        &req.id,
        json!({ "accountId": account_id, "username": username, "role": role }),
    )
}

fn handle_accounts_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let account_id = match required_str(req, "accountId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "accounts", &account_id, "account") {
        return e;
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if req.params.get("displayName").is_some() {
        match required_str(req, "displayName") {
            Ok(v) => {
                sets.push("display_name = ?");
                binds.push(Value::Text(v));
            }
            Err(e) => return e,
        }
    }
    if req.params.get("role").is_some() {
        match required_str(req, "role").and_then(|r| parse_role(req, &r)) {
            Ok(v) => {
                sets.push("role = ?");
                binds.push(Value::Text(v));
            }
            Err(e) => return e,
        }
    }
    if req.params.get("email").is_some() {
        match optional_str(req, "email") {
            Ok(v) => {
                sets.push("email = ?");
                binds.push(v.map(Value::Text).unwrap_or(Value::Null));
            }
            Err(e) => return e,
        }
    }
    if req.params.get("active").is_some() {
        match optional_bool(req, "active", true) {
            Ok(v) => {
                sets.push("active = ?");
                binds.push(Value::Integer(v as i64));
            }
            Err(e) => return e,
        }
    }
    if sets.is_empty() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    binds.push(Value::Text(account_id.clone()));
    let sql = format!("UPDATE accounts SET {} WHERE id = ?", sets.join(", "));
    if let Err(e) = conn.execute(&sql, params_from_iter(binds)) {
        return db_err(req, "db_update_failed", e, "accounts");
    }
    ok(&req.id, json!({ "accountId": account_id }))
}

fn handle_accounts_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let account_id = match required_str(req, "accountId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "accounts", &account_id, "account") {
        return e;
    }

    let usage = conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM classes WHERE homeroom_teacher_id = ?1),
           (SELECT COUNT(*) FROM subjects WHERE teacher_id = ?1),
           (SELECT COUNT(*) FROM evaluations WHERE teacher_id = ?1)",
        [&account_id],
        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?)),
    );
    let (homeroom, subjects, evaluations) = match usage {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if homeroom + subjects + evaluations > 0 {
        return err(
            &req.id,
            "in_use",
            "account is still referenced",
            Some(json!({
                "homeroomClasses": homeroom,
                "subjects": subjects,
                "evaluations": evaluations
            })),
        );
    }

    if let Err(e) = conn.execute("DELETE FROM accounts WHERE id = ?", [&account_id]) {
        return db_err(req, "db_delete_failed", e, "accounts");
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "accounts.list" => Some(handle_accounts_list(state, req)),
        "accounts.create" => Some(handle_accounts_create(state, req)),
        "accounts.update" => Some(handle_accounts_update(state, req)),
        "accounts.delete" => Some(handle_accounts_delete(state, req)),
        _ => None,
    }
}
