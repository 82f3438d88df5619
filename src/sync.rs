use crate::db::ANGKATAN_YEARS;
use crate::remote::{field_f64, field_str, first_present, number_of, ApiClient, RemoteError};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("database error during sync: {0}")]
    Db(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCounts {
    pub upserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub classes: SyncCounts,
    pub students: SyncCounts,
    pub subjects: SyncCounts,
    pub components: SyncCounts,
    pub grades: SyncCounts,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Cohort year from a remote class; `Err` when present but not a whole year in range.
fn cohort_year(c: &serde_json::Value) -> Result<Option<i64>, ()> {
    match first_present(c, &["angkatan", "cohort"]) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(raw) => match number_of(raw) {
            Some(y)
                if y.fract() == 0.0
                    && y >= *ANGKATAN_YEARS.start() as f64
                    && y <= *ANGKATAN_YEARS.end() as f64 =>
            {
                Ok(Some(y as i64))
            }
            _ => Err(()),
        },
    }
}

fn local_id_for_remote(conn: &Connection, table: &str, remote_id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        &format!("SELECT id FROM {} WHERE remote_id = ?", table),
        [remote_id],
        |r| r.get(0),
    )
    .optional()
}

/// Pulls classes (optionally only `only_class`, a remote id) and everything
/// under them, upserting by remote id. Runs in one transaction.
pub fn pull(conn: &Connection, client: &ApiClient, only_class: Option<&str>) -> Result<SyncReport, SyncError> {
    let mut report = SyncReport::default();

    let remote_classes = client.get_list("classes")?;
    let tx = conn.unchecked_transaction()?;

    for c in remote_classes {
        let Some(remote_class_id) = field_str(&c, &["id", "_id", "classId"]) else {
            warn!("skipping remote class without id");
            report.classes.skipped += 1;
            continue;
        };
        if only_class.is_some_and(|only| only != remote_class_id) {
            continue;
        }
        let Some(name) = field_str(&c, &["name", "nama", "className"]) else {
            warn!(remote_id = %remote_class_id, "skipping remote class without name");
            report.classes.skipped += 1;
            continue;
        };
        let grade_level = field_str(&c, &["gradeLevel", "tingkat", "grade"]);
        let Ok(angkatan) = cohort_year(&c) else {
            warn!(remote_id = %remote_class_id, "skipping remote class with invalid angkatan");
            report.classes.skipped += 1;
            continue;
        };

        tx.execute(
            "INSERT INTO classes(id, name, grade_level, angkatan, remote_id) VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(remote_id) DO UPDATE SET
               name = excluded.name,
               grade_level = excluded.grade_level,
               angkatan = excluded.angkatan",
            (
                Uuid::new_v4().to_string(),
                &name,
                &grade_level,
                angkatan,
                &remote_class_id,
            ),
        )?;
        report.classes.upserted += 1;
        let Some(class_id) = local_id_for_remote(&tx, "classes", &remote_class_id)? else {
            continue;
        };

        let mut student_ids: HashMap<String, String> = HashMap::new();
        for s in client.get_list(&format!("classes/{}/students", remote_class_id))? {
            let (Some(rid), Some(full_name)) = (
                field_str(&s, &["id", "_id", "studentId"]),
                field_str(&s, &["name", "fullName", "nama"]),
            ) else {
                report.students.skipped += 1;
                continue;
            };
            let nis = field_str(&s, &["nis", "studentNo"]);
            tx.execute(
                "INSERT INTO students(id, class_id, nis, full_name, active, sort_order, updated_at, remote_id)
                 VALUES(?, ?, ?, ?, 1,
                   (SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?),
                   ?, ?)
                 ON CONFLICT(remote_id) DO UPDATE SET
                   class_id = excluded.class_id,
                   nis = excluded.nis,
                   full_name = excluded.full_name,
                   updated_at = excluded.updated_at",
                (
                    Uuid::new_v4().to_string(),
                    &class_id,
                    &nis,
                    &full_name,
                    &class_id,
                    now(),
                    &rid,
                ),
            )?;
            if let Some(local) = local_id_for_remote(&tx, "students", &rid)? {
                student_ids.insert(rid, local);
            }
            report.students.upserted += 1;
        }

        for subj in client.get_list(&format!("classes/{}/subjects", remote_class_id))? {
            let (Some(rid), Some(name)) = (
                field_str(&subj, &["id", "_id", "subjectId"]),
                field_str(&subj, &["name", "nama", "subjectName"]),
            ) else {
                report.subjects.skipped += 1;
                continue;
            };
            let code = field_str(&subj, &["code", "kode"]).unwrap_or_else(|| rid.clone());
            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM subjects
                   WHERE class_id = ? AND code = ? AND (remote_id IS NULL OR remote_id <> ?))",
                (&class_id, &code, &rid),
                |r| r.get(0),
            )?;
            if taken {
                warn!(remote_id = %rid, code = %code, "skipping remote subject whose code is taken");
                report.subjects.skipped += 1;
                continue;
            }
            tx.execute(
                "INSERT INTO subjects(id, class_id, code, name, sort_order, remote_id)
                 VALUES(?, ?, ?, ?,
                   (SELECT COALESCE(MAX(sort_order) + 1, 0) FROM subjects WHERE class_id = ?),
                   ?)
                 ON CONFLICT(remote_id) DO UPDATE SET
                   class_id = excluded.class_id,
                   code = excluded.code,
                   name = excluded.name",
                (
                    Uuid::new_v4().to_string(),
                    &class_id,
                    &code,
                    &name,
                    &class_id,
                    &rid,
                ),
            )?;
            report.subjects.upserted += 1;
            let Some(subject_id) = local_id_for_remote(&tx, "subjects", &rid)? else {
                continue;
            };

            let component_ids = pull_components(&tx, client, &rid, &subject_id, &mut report)?;
            pull_grades(&tx, client, &rid, &component_ids, &student_ids, &mut report)?;
        }
    }

    tx.commit()?;
    info!(
        classes = report.classes.upserted,
        students = report.students.upserted,
        grades = report.grades.upserted,
        "remote pull finished"
    );
    Ok(report)
}

fn pull_components(
    conn: &Connection,
    client: &ApiClient,
    remote_subject_id: &str,
    subject_id: &str,
    report: &mut SyncReport,
) -> Result<HashMap<String, String>, SyncError> {
    let mut ids = HashMap::new();
    for comp in client.get_list(&format!("subjects/{}/components", remote_subject_id))? {
        let rid = field_str(&comp, &["id", "_id", "componentId"]);
        let name = field_str(&comp, &["name", "nama"]);
        let weight = field_f64(&comp, &["weight", "bobot"]);
        let category = field_str(&comp, &["category", "kategori", "type"])
            .and_then(|c| crate::calc::Category::parse(&c));
        let (Some(rid), Some(name), Some(weight), Some(category)) = (rid, name, weight, category) else {
            report.components.skipped += 1;
            continue;
        };
        if !weight.is_finite() || !(0.0..=100.0).contains(&weight) {
            warn!(remote_id = %rid, weight, "skipping component with out-of-range weight");
            report.components.skipped += 1;
            continue;
        }
        conn.execute(
            "INSERT INTO components(id, subject_id, name, weight, category, sort_order, remote_id)
             VALUES(?, ?, ?, ?, ?,
               (SELECT COALESCE(MAX(sort_order) + 1, 0) FROM components WHERE subject_id = ?),
               ?)
             ON CONFLICT(remote_id) DO UPDATE SET
               subject_id = excluded.subject_id,
               name = excluded.name,
               weight = excluded.weight,
               category = excluded.category",
            (
                Uuid::new_v4().to_string(),
                subject_id,
                &name,
                weight,
                category.as_str(),
                subject_id,
                &rid,
            ),
        )?;
        if let Some(local) = local_id_for_remote(conn, "components", &rid)? {
            ids.insert(rid, local);
        }
        report.components.upserted += 1;
    }
    Ok(ids)
}

fn pull_grades(
    conn: &Connection,
    client: &ApiClient,
    remote_subject_id: &str,
    component_ids: &HashMap<String, String>,
    student_ids: &HashMap<String, String>,
    report: &mut SyncReport,
) -> Result<(), SyncError> {
    for g in client.get_list(&format!("subjects/{}/grades", remote_subject_id))? {
        let comp = field_str(&g, &["componentId", "component_id"]).and_then(|c| component_ids.get(&c));
        let student = field_str(&g, &["studentId", "student_id"]).and_then(|s| student_ids.get(&s));
        let (Some(component_id), Some(student_id)) = (comp, student) else {
            report.grades.skipped += 1;
            continue;
        };
        // An explicit null clears the grade; a missing or unreadable value is left alone.
        let value = match first_present(&g, &["value", "nilai", "score"]) {
            Some(serde_json::Value::Null) => None,
            Some(raw) => match number_of(raw) {
                Some(v) if v.is_finite() && (0.0..=100.0).contains(&v) => Some(v),
                _ => {
                    report.grades.skipped += 1;
                    continue;
                }
            },
            None => {
                report.grades.skipped += 1;
                continue;
            }
        };
        conn.execute(
            "INSERT INTO grades(component_id, student_id, value, updated_at) VALUES(?, ?, ?, ?)
             ON CONFLICT(component_id, student_id) DO UPDATE SET
               value = excluded.value,
               updated_at = excluded.updated_at",
            (component_id, student_id, value, now()),
        )?;
        report.grades.upserted += 1;
    }
    Ok(())
}
