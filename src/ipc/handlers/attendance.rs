use crate::gradebook;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, db_err, ensure_exists, optional_str, parse_date, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};

/// Hadir, Sakit, Izin, Alpa.
const STATUS_CODES: [&str; 4] = ["H", "S", "I", "A"];

fn parse_status(raw: &serde_json::Value) -> Result<Option<String>, String> {
    if raw.is_null() {
        return Ok(None);
    }
    let Some(s) = raw.as_str() else {
        return Err("status must be a string or null".to_string());
    };
    let up = s.trim().to_ascii_uppercase();
    if STATUS_CODES.contains(&up.as_str()) {
        Ok(Some(up))
    } else {
        Err(format!("status must be one of H, S, I, A (got {})", s))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceTally {
    pub hadir: i64,
    pub sakit: i64,
    pub izin: i64,
    pub alpa: i64,
    pub recorded_days: i64,
    pub presence_rate: Option<f64>,
}

impl AttendanceTally {
    fn add(&mut self, status: &str, n: i64) {
        match status {
            "H" => self.hadir += n,
            "S" => self.sakit += n,
            "I" => self.izin += n,
            "A" => self.alpa += n,
            _ => return,
        }
        self.recorded_days += n;
    }

    fn finish(mut self) -> Self {
        self.presence_rate = if self.recorded_days > 0 {
            Some(self.hadir as f64 / self.recorded_days as f64)
        } else {
            None
        };
        self
    }
}

/// Per-student tallies for a class over an optional inclusive date range.
pub fn tally_for_class(
    conn: &rusqlite::Connection,
    class_id: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> rusqlite::Result<HashMap<String, AttendanceTally>> {
    let mut sql = String::from(
        "SELECT student_id, status, COUNT(*) FROM attendance WHERE class_id = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(class_id.to_string())];
    if let Some(f) = from {
        sql.push_str(" AND date >= ?");
        binds.push(Value::Text(f.to_string()));
    }
    if let Some(t) = to {
        sql.push_str(" AND date <= ?");
        binds.push(Value::Text(t.to_string()));
    }
    sql.push_str(" GROUP BY student_id, status");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out: HashMap<String, AttendanceTally> = HashMap::new();
    for (student_id, status, n) in rows {
        out.entry(student_id).or_default().add(&status, n);
    }
    Ok(out.into_iter().map(|(k, v)| (k, v.finish())).collect())
}

fn handle_attendance_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date = match required_str(req, "date").and_then(|d| parse_date(req, &d)) {
        Ok(v) => v.format("%Y-%m-%d").to_string(),
        Err(e) => return e,
    };
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries[]", None);
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }
    let members: HashSet<String> = match gradebook::load_students(conn, &class_id) {
        Ok(v) => v.into_iter().map(|s| s.id).collect(),
        Err(e) => return calc_err(req, e),
    };

    // Validate everything first; a mark is all-or-nothing.
    let mut parsed: Vec<(String, Option<String>, Option<String>)> = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                "entry missing studentId",
                Some(json!({ "index": i })),
            );
        };
        if !members.contains(student_id) {
            return err(
                &req.id,
                "bad_params",
                "student is not in this class",
                Some(json!({ "index": i, "studentId": student_id })),
            );
        }
        let status = match parse_status(entry.get("status").unwrap_or(&serde_json::Value::Null)) {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", m, Some(json!({ "index": i }))),
        };
        let note = entry
            .get("note")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        parsed.push((student_id.to_string(), status, note));
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut saved = 0usize;
    let mut cleared = 0usize;
    for (student_id, status, note) in parsed {
        let res = match status {
            Some(s) => tx
                .execute(
                    "INSERT INTO attendance(class_id, student_id, date, status, note) VALUES(?, ?, ?, ?, ?)
                     ON CONFLICT(student_id, date) DO UPDATE SET
                       class_id = excluded.class_id,
                       status = excluded.status,
                       note = excluded.note",
                    (&class_id, &student_id, &date, &s, &note),
                )
                .map(|_| saved += 1),
            None => tx
                .execute(
                    "DELETE FROM attendance WHERE student_id = ? AND date = ?",
                    (&student_id, &date),
                )
                .map(|n| cleared += n),
        };
        if let Err(e) = res {
            let _ = tx.rollback();
            return db_err(req, "db_update_failed", e, "attendance");
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "date": date, "saved": saved, "cleared": cleared }),
    )
}

fn handle_attendance_day(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date = match required_str(req, "date").and_then(|d| parse_date(req, &d)) {
        Ok(v) => v.format("%Y-%m-%d").to_string(),
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }
    let students = match gradebook::load_students(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let mut stmt = match conn.prepare(
        "SELECT student_id, status, note FROM attendance WHERE class_id = ? AND date = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let marks: HashMap<String, (String, Option<String>)> = match stmt
        .query_map((&class_id, &date), |r| {
            Ok((
                r.get::<_, String>(0)?,
                (r.get::<_, String>(1)?, r.get::<_, Option<String>>(2)?),
            ))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = students
        .iter()
        .filter(|s| s.active || marks.contains_key(&s.id))
        .map(|s| {
            let mark = marks.get(&s.id);
            json!({
                "studentId": s.id,
                "fullName": s.full_name,
                "nis": s.nis,
                "status": mark.map(|m| m.0.clone()),
                "note": mark.and_then(|m| m.1.clone())
            })
        })
        .collect::<Vec<_>>();
    ok(&req.id, json!({ "date": date, "rows": rows }))
}

fn handle_attendance_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let from = match optional_str(req, "from") {
        Ok(Some(d)) => match parse_date(req, &d) {
            Ok(v) => Some(v),
            Err(e) => return e,
        },
        Ok(None) => None,
        Err(e) => return e,
    };
    let to = match optional_str(req, "to") {
        Ok(Some(d)) => match parse_date(req, &d) {
            Ok(v) => Some(v),
            Err(e) => return e,
        },
        Ok(None) => None,
        Err(e) => return e,
    };
    if let (Some(f), Some(t)) = (from, to) {
        if f > t {
            return err(&req.id, "bad_params", "from must not be after to", None);
        }
    }
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }
    let students = match gradebook::load_students(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let from_s = from.map(|d| d.format("%Y-%m-%d").to_string());
    let to_s = to.map(|d| d.format("%Y-%m-%d").to_string());
    let tallies = match tally_for_class(conn, &class_id, from_s.as_deref(), to_s.as_deref()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut class_total = AttendanceTally::default();
    let rows = students
        .iter()
        .map(|s| {
            let t = tallies.get(&s.id).cloned().unwrap_or_default();
            class_total.add("H", t.hadir);
            class_total.add("S", t.sakit);
            class_total.add("I", t.izin);
            class_total.add("A", t.alpa);
            json!({
                "studentId": s.id,
                "fullName": s.full_name,
                "active": s.active,
                "tally": t
            })
        })
        .collect::<Vec<_>>();

    ok(
        &req.id,
        json!({
            "from": from_s,
            "to": to_s,
            "rows": rows,
            "classTotal": class_total.finish()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.mark" => Some(handle_attendance_mark(state, req)),
        "attendance.day" => Some(handle_attendance_day(state, req)),
        "attendance.summary" => Some(handle_attendance_summary(state, req)),
        _ => None,
    }
}
