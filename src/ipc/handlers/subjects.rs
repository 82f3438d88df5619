use crate::calc::Category;
use crate::gradebook;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    calc_err, db_conn, db_err, ensure_exists, optional_str, parse_weight, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde_json::json;
use uuid::Uuid;

fn parse_category(req: &Request) -> Result<Category, serde_json::Value> {
    let raw = required_str(req, "category")?;
    Category::parse(&raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            "category must be Pengetahuan or Keterampilan",
            Some(json!({ "category": raw })),
        )
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation)
}

fn weight_param(req: &Request) -> Result<f64, serde_json::Value> {
    let Some(v) = req.params.get("weight") else {
        return Err(err(&req.id, "bad_params", "missing weight", None));
    };
    parse_weight(v).map_err(|m| err(&req.id, "bad_params", m, None))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let mut stmt = match conn.prepare(
        "SELECT
           s.id, s.code, s.name, s.teacher_id, a.display_name,
           (SELECT COUNT(*) FROM components c WHERE c.subject_id = s.id),
           (SELECT COALESCE(SUM(weight), 0) FROM components c
              WHERE c.subject_id = s.id AND c.category = 'Pengetahuan'),
           (SELECT COALESCE(SUM(weight), 0) FROM components c
              WHERE c.subject_id = s.id AND c.category = 'Keterampilan')
         FROM subjects s
         LEFT JOIN accounts a ON a.id = s.teacher_id
         WHERE s.class_id = ?
         ORDER BY s.sort_order, s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "teacherId": r.get::<_, Option<String>>(3)?,
                "teacherName": r.get::<_, Option<String>>(4)?,
                "componentCount": r.get::<_, i64>(5)?,
                "weightTotals": {
                    "Pengetahuan": r.get::<_, f64>(6)?,
                    "Keterampilan": r.get::<_, f64>(7)?
                }
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match optional_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }
    if let Some(t) = teacher_id.as_deref() {
        if let Err(e) = ensure_exists(conn, req, "accounts", t, "teacher") {
            return e;
        }
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, class_id, code, name, teacher_id, sort_order)
         VALUES(?, ?, ?, ?, ?,
           (SELECT COALESCE(MAX(sort_order) + 1, 0) FROM subjects WHERE class_id = ?))",
        (&subject_id, &class_id, &code, &name, &teacher_id, &class_id),
    ) {
        if is_constraint_violation(&e) {
            return err(
                &req.id,
                "conflict",
                "subject code already exists in this class",
                Some(json!({ "code": code })),
            );
        }
        return db_err(req, "db_insert_failed", e, "subjects");
    }

    ok(&req.id, json!({ "subjectId": subject_id, "code": code, "name": name }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "subjects", &subject_id, "subject") {
        return e;
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (key, column) in [("code", "code = ?"), ("name", "name = ?")] {
        if req.params.get(key).is_some() {
            match required_str(req, key) {
                Ok(v) => {
                    sets.push(column);
                    binds.push(Value::Text(v));
                }
                Err(e) => return e,
            }
        }
    }
    if req.params.get("teacherId").is_some() {
        match optional_str(req, "teacherId") {
            Ok(v) => {
                if let Some(t) = v.as_deref() {
                    if let Err(e) = ensure_exists(conn, req, "accounts", t, "teacher") {
                        return e;
                    }
                }
                sets.push("teacher_id = ?");
                binds.push(v.map(Value::Text).unwrap_or(Value::Null));
            }
            Err(e) => return e,
        }
    }
    if sets.is_empty() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    binds.push(Value::Text(subject_id.clone()));
    let sql = format!("UPDATE subjects SET {} WHERE id = ?", sets.join(", "));
    if let Err(e) = conn.execute(&sql, params_from_iter(binds)) {
        if is_constraint_violation(&e) {
            return err(
                &req.id,
                "conflict",
                "subject code already exists in this class",
                Some(json!({ "code": req.params.get("code") })),
            );
        }
        return db_err(req, "db_update_failed", e, "subjects");
    }
    ok(&req.id, json!({ "subjectId": subject_id }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "subjects", &subject_id, "subject") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (table, sql) in [
        (
            "grades",
            "DELETE FROM grades WHERE component_id IN (SELECT id FROM components WHERE subject_id = ?)",
        ),
        ("components", "DELETE FROM components WHERE subject_id = ?"),
        ("subjects", "DELETE FROM subjects WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&subject_id]) {
            let _ = tx.rollback();
            return db_err(req, "db_delete_failed", e, table);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_components_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "subjects", &subject_id, "subject") {
        return e;
    }
    let components = match gradebook::load_components(conn, &subject_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let total = |cat: Category| -> f64 {
        components
            .iter()
            .filter(|c| c.category == cat)
            .map(|c| c.weight)
            .sum()
    };
    ok(
        &req.id,
        json!({
            "components": components,
            "weightTotals": {
                "Pengetahuan": total(Category::Pengetahuan),
                "Keterampilan": total(Category::Keterampilan)
            }
        }),
    )
}

fn handle_components_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let weight = match weight_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let category = match parse_category(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "subjects", &subject_id, "subject") {
        return e;
    }

    let component_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO components(id, subject_id, name, weight, category, sort_order)
         VALUES(?, ?, ?, ?, ?,
           (SELECT COALESCE(MAX(sort_order) + 1, 0) FROM components WHERE subject_id = ?))",
        (
            &component_id,
            &subject_id,
            &name,
            weight,
            category.as_str(),
            &subject_id,
        ),
    ) {
        return db_err(req, "db_insert_failed", e, "components");
    }

    ok(
        &req.id,
        json!({
            "componentId": component_id,
            "name": name,
            "weight": weight,
            "category": category
        }),
    )
}

fn handle_components_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "components", &component_id, "component") {
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
    if req.params.get("weight").is_some() {
        match weight_param(req) {
            Ok(v) => {
                sets.push("weight = ?");
                binds.push(Value::Real(v));
            }
            Err(e) => return e,
        }
    }
    if req.params.get("category").is_some() {
        match parse_category(req) {
            Ok(v) => {
                sets.push("category = ?");
                binds.push(Value::Text(v.as_str().to_string()));
            }
            Err(e) => return e,
        }
    }
    if sets.is_empty() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    binds.push(Value::Text(component_id.clone()));
    let sql = format!("UPDATE components SET {} WHERE id = ?", sets.join(", "));
    if let Err(e) = conn.execute(&sql, params_from_iter(binds)) {
        return db_err(req, "db_update_failed", e, "components");
    }
    ok(&req.id, json!({ "componentId": component_id }))
}

fn handle_components_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "components", &component_id, "component") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (table, sql) in [
        ("grades", "DELETE FROM grades WHERE component_id = ?"),
        ("components", "DELETE FROM components WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&component_id]) {
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
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        "components.list" => Some(handle_components_list(state, req)),
        "components.create" => Some(handle_components_create(state, req)),
        "components.update" => Some(handle_components_update(state, req)),
        "components.delete" => Some(handle_components_delete(state, req)),
        _ => None,
    }
}
