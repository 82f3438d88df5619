use crate::calc::{self, round_off_1_decimal, CalcError, Competency};
use crate::gradebook::{self, StudentRow, SubjectMeta};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

use super::attendance::{self, AttendanceTally};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassHeader {
    id: String,
    name: String,
    grade_level: Option<String>,
    angkatan: Option<i64>,
    homeroom_teacher: Option<String>,
}

fn load_class_header(conn: &Connection, class_id: &str) -> Result<ClassHeader, CalcError> {
    conn.query_row(
        "SELECT c.id, c.name, c.grade_level, c.angkatan, a.display_name
         FROM classes c
         LEFT JOIN accounts a ON a.id = c.homeroom_teacher_id
         WHERE c.id = ?",
        [class_id],
        |r| {
            Ok(ClassHeader {
                id: r.get(0)?,
                name: r.get(1)?,
                grade_level: r.get(2)?,
                angkatan: r.get(3)?,
                homeroom_teacher: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?
    .ok_or_else(|| {
        CalcError::new("not_found", "class not found").with_details(json!({ "id": class_id }))
    })
}

fn display_score(v: Option<f64>) -> Option<f64> {
    v.map(round_off_1_decimal)
}

fn predicate(c: Option<Competency>) -> &'static str {
    c.map(|c| c.label()).unwrap_or("Belum Dinilai")
}

fn fmt_score(v: Option<f64>) -> String {
    match v {
        Some(s) => format!("{:.1}", round_off_1_decimal(s)),
        None => "-".to_string(),
    }
}

/// Every subject of a class with its computed rows keyed by student.
struct ClassRecap {
    subjects: Vec<SubjectMeta>,
    rows: Vec<HashMap<String, StudentRow>>,
}

fn build_recap(conn: &Connection, class_id: &str, include_inactive: bool) -> Result<ClassRecap, CalcError> {
    let subject_ids = gradebook::list_subject_ids(conn, class_id)?;
    let mut subjects = Vec::with_capacity(subject_ids.len());
    let mut rows = Vec::with_capacity(subject_ids.len());
    for sid in &subject_ids {
        let sheet = gradebook::load_subject_sheet(conn, sid, include_inactive)?;
        subjects.push(sheet.subject);
        rows.push(
            sheet
                .rows
                .into_iter()
                .map(|r| (r.student_id.clone(), r))
                .collect::<HashMap<_, _>>(),
        );
    }
    Ok(ClassRecap { subjects, rows })
}

fn handle_reports_report_card(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student = match gradebook::load_student(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let class = match load_class_header(conn, &student.class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let recap = match build_recap(conn, &student.class_id, true) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let attendance: AttendanceTally =
        match attendance::tally_for_class(conn, &student.class_id, None, None) {
            Ok(mut t) => t.remove(&student_id).unwrap_or_default(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

    let mut lines: Vec<String> = vec![
        format!("Nama        : {}", student.full_name),
        format!("NIS         : {}", student.nis.as_deref().unwrap_or("-")),
        format!("Kelas       : {}", class.name),
        format!(
            "Angkatan    : {}",
            class.angkatan.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
        ),
        format!(
            "Wali Kelas  : {}",
            class.homeroom_teacher.as_deref().unwrap_or("-")
        ),
        String::new(),
    ];

    let mut subject_rows = Vec::with_capacity(recap.subjects.len());
    let mut below = 0usize;
    for (subject, by_student) in recap.subjects.iter().zip(recap.rows.iter()) {
        let row = by_student.get(&student_id);
        let knowledge = row.and_then(|r| r.knowledge);
        let skill = row.and_then(|r| r.skill);
        let competency = row.and_then(|r| r.competency);
        if competency == Some(Competency::Below) {
            below += 1;
        }
        lines.push(format!(
            "{:<8} {:<24} P {:>5}  K {:>5}  KKM {}  {}",
            subject.code,
            subject.name,
            fmt_score(knowledge),
            fmt_score(skill),
            calc::KKM,
            predicate(competency)
        ));
        subject_rows.push(json!({
            "subjectId": subject.id,
            "code": subject.code,
            "name": subject.name,
            "teacherName": subject.teacher_name,
            "knowledge": display_score(knowledge),
            "skill": display_score(skill),
            "kkm": calc::KKM,
            "competency": competency,
            "predicate": predicate(competency)
        }));
    }
    lines.push(String::new());
    lines.push(format!(
        "Kehadiran   : Hadir {}  Sakit {}  Izin {}  Alpa {}",
        attendance.hadir, attendance.sakit, attendance.izin, attendance.alpa
    ));

    ok(
        &req.id,
        json!({
            "header": {
                "studentId": student.id,
                "fullName": student.full_name,
                "nis": student.nis,
                "className": class.name,
                "gradeLevel": class.grade_level,
                "angkatan": class.angkatan,
                "homeroomTeacher": class.homeroom_teacher
            },
            "kkm": calc::KKM,
            "subjects": subject_rows,
            "belowCount": below,
            "attendance": attendance,
            "lines": lines
        }),
    )
}

fn recap_rows(recap: &ClassRecap, students: &[gradebook::StudentMeta]) -> Vec<serde_json::Value> {
    students
        .iter()
        .map(|s| {
            let mut below = 0usize;
            let scores = recap
                .subjects
                .iter()
                .zip(recap.rows.iter())
                .map(|(subject, by_student)| {
                    let row = by_student.get(&s.id);
                    let competency = row.and_then(|r| r.competency);
                    if competency == Some(Competency::Below) {
                        below += 1;
                    }
                    json!({
                        "subjectId": subject.id,
                        "knowledge": display_score(row.and_then(|r| r.knowledge)),
                        "skill": display_score(row.and_then(|r| r.skill)),
                        "competency": competency
                    })
                })
                .collect::<Vec<_>>();
            json!({
                "studentId": s.id,
                "fullName": s.full_name,
                "nis": s.nis,
                "scores": scores,
                "belowCount": below
            })
        })
        .collect()
}

fn handle_reports_class_recap(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class = match load_class_header(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let students: Vec<_> = match gradebook::load_students(conn, &class_id) {
        Ok(v) => v.into_iter().filter(|s| s.active).collect(),
        Err(e) => return calc_err(req, e),
    };
    let recap = match build_recap(conn, &class_id, false) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    ok(
        &req.id,
        json!({
            "class": class,
            "kkm": calc::KKM,
            "subjects": recap.subjects.iter().map(|s| json!({
                "subjectId": s.id,
                "code": s.code,
                "name": s.name
            })).collect::<Vec<_>>(),
            "rows": recap_rows(&recap, &students)
        }),
    )
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn csv_score(v: Option<f64>) -> String {
    v.map(|s| format!("{:.1}", round_off_1_decimal(s)))
        .unwrap_or_default()
}

fn recap_csv(recap: &ClassRecap, students: &[gradebook::StudentMeta]) -> String {
    let mut header: Vec<String> = vec!["nis".into(), "full_name".into()];
    for s in &recap.subjects {
        header.push(format!("{}_pengetahuan", s.code));
        header.push(format!("{}_keterampilan", s.code));
        header.push(format!("{}_status", s.code));
    }
    header.push("below_kkm".into());

    let mut out = String::new();
    out.push_str(
        &header
            .iter()
            .map(|h| csv_quote(h))
            .collect::<Vec<_>>()
            .join(","),
    );
    out.push('\n');

    for st in students {
        let mut fields = vec![
            csv_quote(st.nis.as_deref().unwrap_or("")),
            csv_quote(&st.full_name),
        ];
        let mut below = 0usize;
        for by_student in &recap.rows {
            let row = by_student.get(&st.id);
            let competency = row.and_then(|r| r.competency);
            if competency == Some(Competency::Below) {
                below += 1;
            }
            fields.push(csv_score(row.and_then(|r| r.knowledge)));
            fields.push(csv_score(row.and_then(|r| r.skill)));
            fields.push(csv_quote(competency.map(|c| c.as_str()).unwrap_or("")));
        }
        fields.push(below.to_string());
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

fn handle_reports_export_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };
    if let Err(e) = load_class_header(conn, &class_id) {
        return calc_err(req, e);
    }
    let students: Vec<_> = match gradebook::load_students(conn, &class_id) {
        Ok(v) => v.into_iter().filter(|s| s.active).collect(),
        Err(e) => return calc_err(req, e),
    };
    let recap = match build_recap(conn, &class_id, false) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let text = recap_csv(&recap, &students);
    if let Some(parent) = out_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": parent.to_string_lossy() })),
            );
        }
    }
    if let Err(e) = std::fs::write(&out_path, text) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": out_path.to_string_lossy() })),
        );
    }
    info!(class_id = %class_id, path = %out_path.to_string_lossy(), "class recap exported");

    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path.to_string_lossy(),
            "rowsExported": students.len(),
            "subjectCount": recap.subjects.len()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.reportCard" => Some(handle_reports_report_card(state, req)),
        "reports.classRecap" => Some(handle_reports_class_recap(state, req)),
        "reports.exportCsv" => Some(handle_reports_export_csv(state, req)),
        _ => None,
    }
}
