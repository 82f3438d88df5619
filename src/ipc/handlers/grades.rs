use crate::calc;
use crate::gradebook;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    calc_err, db_conn, db_err, ensure_exists, now_rfc3339, optional_bool, optional_str, parse_score,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;

const GRADES_BULK_MAX_EDITS: usize = 5000;

fn handle_grades_grid(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let include_inactive = match optional_bool(req, "includeInactive", false) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match gradebook::load_subject_sheet(conn, &subject_id, include_inactive) {
        Ok(sheet) => ok(
            &req.id,
            json!({
                "subject": sheet.subject,
                "components": sheet.components,
                "weightTotals": sheet.weight_totals,
                "rows": sheet.rows,
                "kkm": calc::KKM
            }),
        ),
        Err(e) => calc_err(req, e),
    }
}

/// Class of the component's subject, or `None` when the component is unknown.
fn component_class(conn: &Connection, component_id: &str) -> rusqlite::Result<Option<(String, String)>> {
    conn.query_row(
        "SELECT s.id, s.class_id FROM components c JOIN subjects s ON s.id = c.subject_id WHERE c.id = ?",
        [component_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
}

fn upsert_grade(conn: &Connection, component_id: &str, student_id: &str, value: Option<f64>) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO grades(component_id, student_id, value, updated_at) VALUES(?, ?, ?, ?)
         ON CONFLICT(component_id, student_id) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        (component_id, student_id, value, now_rfc3339()),
    )
}

fn handle_grades_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let component_id = match required_str(req, "componentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(raw_value) = req.params.get("value") else {
        return err(&req.id, "bad_params", "missing value (use null to clear)", None);
    };
    let value = match parse_score(raw_value) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, Some(json!({ "value": raw_value }))),
    };

    let (subject_id, class_id) = match component_class(conn, &component_id) {
        Ok(Some(v)) => v,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "component not found",
                Some(json!({ "id": component_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let student = match gradebook::load_student(conn, &student_id) {
        Ok(s) => s,
        Err(e) => return calc_err(req, e),
    };
    if student.class_id != class_id {
        return err(
            &req.id,
            "bad_params",
            "student is not in the subject's class",
            Some(json!({ "studentId": student_id, "subjectId": subject_id })),
        );
    }

    if let Err(e) = upsert_grade(conn, &component_id, &student_id, value) {
        return db_err(req, "db_update_failed", e, "grades");
    }

    // Return the recomputed summary so the caller can refresh one row.
    let components = match gradebook::load_components(conn, &subject_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let grades = match gradebook::load_grades(conn, &subject_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let summary = calc::subject_summary(
        &components,
        grades.get(&student_id).unwrap_or(&calc::StudentGrades::new()),
    );
    ok(
        &req.id,
        json!({
            "componentId": component_id,
            "studentId": student_id,
            "value": value,
            "knowledge": summary.knowledge,
            "skill": summary.skill,
            "competency": calc::classify_summary(&summary)
        }),
    )
}

fn handle_grades_bulk_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(edits) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing edits[]", None);
    };
    if edits.len() > GRADES_BULK_MAX_EDITS {
        return err(
            &req.id,
            "too_many_edits",
            format!(
                "bulk payload exceeds max edits: {} > {}",
                edits.len(),
                GRADES_BULK_MAX_EDITS
            ),
            Some(json!({ "max": GRADES_BULK_MAX_EDITS, "received": edits.len() })),
        );
    }

    let subject = match gradebook::load_subject(conn, &subject_id) {
        Ok(s) => s,
        Err(e) => return calc_err(req, e),
    };
    let component_ids: HashSet<String> = match gradebook::load_components(conn, &subject_id) {
        Ok(v) => v.into_iter().map(|c| c.id).collect(),
        Err(e) => return calc_err(req, e),
    };
    let student_ids: HashSet<String> = match gradebook::load_students(conn, &subject.class_id) {
        Ok(v) => v.into_iter().map(|s| s.id).collect(),
        Err(e) => return calc_err(req, e),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for (i, edit) in edits.iter().enumerate() {
        let component_id = edit.get("componentId").and_then(|v| v.as_str());
        let student_id = edit.get("studentId").and_then(|v| v.as_str());
        let (Some(component_id), Some(student_id)) = (component_id, student_id) else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": "edit needs componentId and studentId"
            }));
            continue;
        };
        if !component_ids.contains(component_id) {
            errors.push(json!({
                "index": i,
                "code": "not_found",
                "message": "component is not part of this subject"
            }));
            continue;
        }
        if !student_ids.contains(student_id) {
            errors.push(json!({
                "index": i,
                "code": "not_found",
                "message": "student is not in the subject's class"
            }));
            continue;
        }
        let value = match edit.get("value").map(parse_score) {
            Some(Ok(v)) => v,
            Some(Err(m)) => {
                errors.push(json!({ "index": i, "code": "bad_params", "message": m }));
                continue;
            }
            None => {
                errors.push(json!({
                    "index": i,
                    "code": "bad_params",
                    "message": "missing value (use null to clear)"
                }));
                continue;
            }
        };
        if let Err(e) = upsert_grade(&tx, component_id, student_id, value) {
            let _ = tx.rollback();
            return db_err(req, "db_update_failed", e, "grades");
        }
        updated += 1;
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({
            "updated": updated,
            "rejected": errors.len(),
            "errors": errors
        }),
    )
}

fn handle_grades_clear(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let component_id = match optional_str(req, "componentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "subjects", &subject_id, "subject") {
        return e;
    }

    let res = match component_id.as_deref() {
        Some(cid) => conn.execute(
            "DELETE FROM grades WHERE component_id = ?
               AND component_id IN (SELECT id FROM components WHERE subject_id = ?)",
            (cid, &subject_id),
        ),
        None => conn.execute(
            "DELETE FROM grades WHERE component_id IN (SELECT id FROM components WHERE subject_id = ?)",
            [&subject_id],
        ),
    };
    match res {
        Ok(n) => ok(&req.id, json!({ "cleared": n })),
        Err(e) => db_err(req, "db_delete_failed", e, "grades"),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.grid" => Some(handle_grades_grid(state, req)),
        "grades.set" => Some(handle_grades_set(state, req)),
        "grades.bulkSet" => Some(handle_grades_bulk_set(state, req)),
        "grades.clear" => Some(handle_grades_clear(state, req)),
        _ => None,
    }
}
