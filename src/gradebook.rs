//! Loads subject data from the workspace database and runs it through
//! [`crate::calc`]. Every surface that shows aggregated scores goes through
//! [`load_subject_sheet`], so grids, analytics and report cards agree.

use crate::calc::{self, CalcError, Category, ComponentDef, Competency, ScoreSummary, StudentGrades};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMeta {
    pub id: String,
    pub class_id: String,
    pub code: String,
    pub name: String,
    pub teacher_id: Option<String>,
    pub teacher_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentMeta {
    pub id: String,
    pub class_id: String,
    pub nis: Option<String>,
    pub full_name: String,
    pub active: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub student_id: String,
    pub full_name: String,
    pub nis: Option<String>,
    pub sort_order: i64,
    pub active: bool,
    /// Parallel to `SubjectSheet::components`.
    pub values: Vec<Option<f64>>,
    pub knowledge: Option<f64>,
    pub skill: Option<f64>,
    pub competency: Option<Competency>,
}

impl StudentRow {
    pub fn summary(&self) -> ScoreSummary {
        ScoreSummary {
            knowledge: self.knowledge,
            skill: self.skill,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSheet {
    pub subject: SubjectMeta,
    pub components: Vec<ComponentDef>,
    pub weight_totals: HashMap<Category, f64>,
    pub rows: Vec<StudentRow>,
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

pub fn load_subject(conn: &Connection, subject_id: &str) -> Result<SubjectMeta, CalcError> {
    conn.query_row(
        "SELECT s.id, s.class_id, s.code, s.name, s.teacher_id, a.display_name
         FROM subjects s
         LEFT JOIN accounts a ON a.id = s.teacher_id
         WHERE s.id = ?",
        [subject_id],
        |r| {
            Ok(SubjectMeta {
                id: r.get(0)?,
                class_id: r.get(1)?,
                code: r.get(2)?,
                name: r.get(3)?,
                teacher_id: r.get(4)?,
                teacher_name: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| {
        CalcError::new("not_found", "subject not found")
            .with_details(serde_json::json!({ "subjectId": subject_id }))
    })
}

pub fn list_subject_ids(conn: &Connection, class_id: &str) -> Result<Vec<String>, CalcError> {
    let mut stmt = conn
        .prepare("SELECT id FROM subjects WHERE class_id = ? ORDER BY sort_order, name")
        .map_err(db_err)?;
    stmt.query_map([class_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)
}

pub fn load_components(conn: &Connection, subject_id: &str) -> Result<Vec<ComponentDef>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, weight, category
             FROM components
             WHERE subject_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    let raw = stmt
        .query_map([subject_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    raw.into_iter()
        .map(|(id, name, weight, category)| {
            let Some(category) = Category::parse(&category) else {
                return Err(CalcError::new("bad_data", "component has an unknown category")
                    .with_details(serde_json::json!({ "componentId": id, "category": category })));
            };
            Ok(ComponentDef {
                id,
                name,
                weight,
                category,
            })
        })
        .collect()
}

pub fn load_students(conn: &Connection, class_id: &str) -> Result<Vec<StudentMeta>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, class_id, nis, full_name, active, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    stmt.query_map([class_id], |r| {
        Ok(StudentMeta {
            id: r.get(0)?,
            class_id: r.get(1)?,
            nis: r.get(2)?,
            full_name: r.get(3)?,
            active: r.get::<_, i64>(4)? != 0,
            sort_order: r.get(5)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

pub fn load_student(conn: &Connection, student_id: &str) -> Result<StudentMeta, CalcError> {
    conn.query_row(
        "SELECT id, class_id, nis, full_name, active, sort_order FROM students WHERE id = ?",
        [student_id],
        |r| {
            Ok(StudentMeta {
                id: r.get(0)?,
                class_id: r.get(1)?,
                nis: r.get(2)?,
                full_name: r.get(3)?,
                active: r.get::<_, i64>(4)? != 0,
                sort_order: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| {
        CalcError::new("not_found", "student not found")
            .with_details(serde_json::json!({ "studentId": student_id }))
    })
}

/// Grades of one subject keyed by student id.
pub fn load_grades(conn: &Connection, subject_id: &str) -> Result<HashMap<String, StudentGrades>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT g.student_id, g.component_id, g.value
             FROM grades g
             JOIN components c ON c.id = g.component_id
             WHERE c.subject_id = ?",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([subject_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<f64>>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut out: HashMap<String, StudentGrades> = HashMap::new();
    for (student_id, component_id, value) in rows {
        out.entry(student_id).or_default().insert(component_id, value);
    }
    Ok(out)
}

pub fn load_subject_sheet(
    conn: &Connection,
    subject_id: &str,
    include_inactive: bool,
) -> Result<SubjectSheet, CalcError> {
    let subject = load_subject(conn, subject_id)?;
    let components = load_components(conn, subject_id)?;
    let students = load_students(conn, &subject.class_id)?;
    let grades = load_grades(conn, subject_id)?;

    let mut weight_totals = HashMap::new();
    for c in &components {
        *weight_totals.entry(c.category).or_insert(0.0) += c.weight;
    }

    let empty = StudentGrades::new();
    let rows = students
        .into_iter()
        .filter(|s| include_inactive || s.active)
        .map(|s| {
            let g = grades.get(&s.id).unwrap_or(&empty);
            let summary = calc::subject_summary(&components, g);
            StudentRow {
                values: components
                    .iter()
                    .map(|c| g.get(&c.id).copied().flatten())
                    .collect(),
                knowledge: summary.knowledge,
                skill: summary.skill,
                competency: calc::classify_summary(&summary),
                student_id: s.id,
                full_name: s.full_name,
                nis: s.nis,
                sort_order: s.sort_order,
                active: s.active,
            }
        })
        .collect();

    Ok(SubjectSheet {
        subject,
        components,
        weight_totals,
        rows,
    })
}
