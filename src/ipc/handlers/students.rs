use crate::gradebook;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    calc_err, db_conn, db_err, ensure_exists, now_rfc3339, optional_bool, optional_str, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let include_inactive = match optional_bool(req, "includeInactive", true) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }
    match gradebook::load_students(conn, &class_id) {
        Ok(students) => {
            let students = students
                .into_iter()
                .filter(|s| include_inactive || s.active)
                .collect::<Vec<_>>();
            ok(&req.id, json!({ "students": students }))
        }
        Err(e) => calc_err(req, e),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let full_name = match required_str(req, "fullName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let nis = match optional_str(req, "nis") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let active = match optional_bool(req, "active", true) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, nis, full_name, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?,
           (SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?),
           ?)",
        (
            &student_id,
            &class_id,
            &nis,
            &full_name,
            active as i64,
            &class_id,
            now_rfc3339(),
        ),
    ) {
        return db_err(req, "db_insert_failed", e, "students");
    }

    ok(&req.id, json!({ "studentId": student_id, "fullName": full_name }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "students", &student_id, "student") {
        return e;
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if req.params.get("fullName").is_some() {
        match required_str(req, "fullName") {
            Ok(v) => {
                sets.push("full_name = ?");
                binds.push(Value::Text(v));
            }
            Err(e) => return e,
        }
    }
    if req.params.get("nis").is_some() {
        match optional_str(req, "nis") {
            Ok(v) => {
                sets.push("nis = ?");
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
    let mut moved_to: Option<String> = None;
    if req.params.get("classId").is_some() {
        match required_str(req, "classId") {
            Ok(v) => {
                if let Err(e) = ensure_exists(conn, req, "classes", &v, "class") {
                    return e;
                }
                let current: String = match conn.query_row(
                    "SELECT class_id FROM students WHERE id = ?",
                    [&student_id],
                    |r| r.get(0),
                ) {
                    Ok(c) => c,
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                };
                if current != v {
                    sets.push("class_id = ?");
                    binds.push(Value::Text(v.clone()));
                    sets.push(
                        "sort_order = (SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?)",
                    );
                    binds.push(Value::Text(v.clone()));
                    moved_to = Some(v);
                }
            }
            Err(e) => return e,
        }
    }
    if sets.is_empty() {
        if req.params.get("classId").is_some() {
            return ok(&req.id, json!({ "studentId": student_id }));
        }
        return err(&req.id, "bad_params", "nothing to update", None);
    }
    sets.push("updated_at = ?");
    binds.push(Value::Text(now_rfc3339()));

    binds.push(Value::Text(student_id.clone()));
    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(&sql, params_from_iter(binds)) {
        let _ = tx.rollback();
        return db_err(req, "db_update_failed", e, "students");
    }
    // Attendance follows the student so tallies and class deletes see it.
    if let Some(class_id) = moved_to.as_deref() {
        if let Err(e) = tx.execute(
            "UPDATE attendance SET class_id = ? WHERE student_id = ?",
            (class_id, &student_id),
        ) {
            let _ = tx.rollback();
            return db_err(req, "db_update_failed", e, "attendance");
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "students", &student_id, "student") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (table, sql) in [
        ("grades", "DELETE FROM grades WHERE student_id = ?"),
        ("attendance", "DELETE FROM attendance WHERE student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&student_id]) {
            let _ = tx.rollback();
            return db_err(req, "db_delete_failed", e, table);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
