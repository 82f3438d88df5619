use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, db_err, ensure_exists, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde_json::json;
use uuid::Uuid;

fn parse_angkatan(req: &Request) -> Result<Option<i64>, serde_json::Value> {
    match req.params.get("angkatan") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => match v.as_i64() {
            Some(y) if db::ANGKATAN_YEARS.contains(&y) => Ok(Some(y)),
            _ => Err(err(
                &req.id,
                "bad_params",
                "angkatan must be a year",
                Some(json!({ "angkatan": v })),
            )),
        },
    }
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Correlated subqueries keep the counts from multiplying through joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.grade_level,
           c.angkatan,
           c.homeroom_teacher_id,
           a.display_name,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.active = 1) AS student_count,
           (SELECT COUNT(*) FROM subjects sj WHERE sj.class_id = c.id) AS subject_count
         FROM classes c
         LEFT JOIN accounts a ON a.id = c.homeroom_teacher_id
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "gradeLevel": row.get::<_, Option<String>>(2)?,
                "angkatan": row.get::<_, Option<i64>>(3)?,
                "homeroomTeacherId": row.get::<_, Option<String>>(4)?,
                "homeroomTeacherName": row.get::<_, Option<String>>(5)?,
                "studentCount": row.get::<_, i64>(6)?,
                "subjectCount": row.get::<_, i64>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_level = match optional_str(req, "gradeLevel") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let angkatan = match parse_angkatan(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let homeroom = match optional_str(req, "homeroomTeacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(t) = homeroom.as_deref() {
        if let Err(e) = ensure_exists(conn, req, "accounts", t, "homeroom teacher") {
            return e;
        }
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, grade_level, angkatan, homeroom_teacher_id) VALUES(?, ?, ?, ?, ?)",
        (&class_id, &name, &grade_level, angkatan, &homeroom),
    ) {
        return db_err(req, "db_insert_failed", e, "classes");
    }

    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if req.params.get("name").is_some() {
        match required_str(req, "name") {
            Ok(v) => {
                sets.push("name = ?");
                binds.push(Value::Text(v));
            }
            Err(e) => return e,
        }
    }
    if req.params.get("gradeLevel").is_some() {
        match optional_str(req, "gradeLevel") {
            Ok(v) => {
                sets.push("grade_level = ?");
                binds.push(v.map(Value::Text).unwrap_or(Value::Null));
            }
            Err(e) => return e,
        }
    }
    if req.params.get("angkatan").is_some() {
        match parse_angkatan(req) {
            Ok(v) => {
                sets.push("angkatan = ?");
                binds.push(v.map(Value::Integer).unwrap_or(Value::Null));
            }
            Err(e) => return e,
        }
    }
    if req.params.get("homeroomTeacherId").is_some() {
        match optional_str(req, "homeroomTeacherId") {
            Ok(v) => {
                if let Some(t) = v.as_deref() {
                    if let Err(e) = ensure_exists(conn, req, "accounts", t, "homeroom teacher") {
                        return e;
                    }
                }
                sets.push("homeroom_teacher_id = ?");
                binds.push(v.map(Value::Text).unwrap_or(Value::Null));
            }
            Err(e) => return e,
        }
    }
    if sets.is_empty() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    binds.push(Value::Text(class_id.clone()));
    let sql = format!("UPDATE classes SET {} WHERE id = ?", sets.join(", "));
    if let Err(e) = conn.execute(&sql, params_from_iter(binds)) {
        return db_err(req, "db_update_failed", e, "classes");
    }
    ok(&req.id, json!({ "classId": class_id }))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // No ON DELETE CASCADE; children go first.
    let steps: [(&str, &str); 6] = [
        (
            "grades",
            "DELETE FROM grades
             WHERE component_id IN (
               SELECT c.id FROM components c
               JOIN subjects s ON s.id = c.subject_id
               WHERE s.class_id = ?1
             )
             OR student_id IN (SELECT id FROM students WHERE class_id = ?1)",
        ),
        (
            "components",
            "DELETE FROM components WHERE subject_id IN (SELECT id FROM subjects WHERE class_id = ?1)",
        ),
        ("subjects", "DELETE FROM subjects WHERE class_id = ?1"),
        (
            "attendance",
            "DELETE FROM attendance
             WHERE class_id = ?1
             OR student_id IN (SELECT id FROM students WHERE class_id = ?1)",
        ),
        ("students", "DELETE FROM students WHERE class_id = ?1"),
        ("classes", "DELETE FROM classes WHERE id = ?1"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&class_id]) {
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
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
