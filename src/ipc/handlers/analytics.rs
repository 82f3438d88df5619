use crate::calc::{self, Competency};
use crate::gradebook;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, ensure_exists, optional_bool, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::collections::HashMap;

use super::attendance;

fn parse_buckets(req: &Request) -> Result<calc::BucketSet, serde_json::Value> {
    calc::parse_bucket_set(req.params.get("buckets")).map_err(|e| calc_err(req, e))
}

fn bucket_set_json(set: &calc::BucketSet) -> serde_json::Value {
    json!({ "name": set.name(), "buckets": set.buckets() })
}

fn subject_analytics_value(
    sheet: &gradebook::SubjectSheet,
    set: &calc::BucketSet,
) -> serde_json::Value {
    let knowledge: Vec<Option<f64>> = sheet.rows.iter().map(|r| r.knowledge).collect();
    let skill: Vec<Option<f64>> = sheet.rows.iter().map(|r| r.skill).collect();
    let summaries: Vec<calc::ScoreSummary> = sheet.rows.iter().map(|r| r.summary()).collect();

    let per_component = sheet
        .components
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let vals: Vec<f64> = sheet.rows.iter().filter_map(|r| r.values[i]).collect();
            json!({
                "componentId": c.id,
                "name": c.name,
                "category": c.category,
                "weight": c.weight,
                "average": calc::compute_mean(&vals),
                "median": calc::compute_median(&vals),
                "gradedCount": vals.len(),
                "ungradedCount": sheet.rows.len() - vals.len()
            })
        })
        .collect::<Vec<_>>();

    json!({
        "subject": sheet.subject,
        "kkm": calc::KKM,
        "bucketSet": bucket_set_json(set),
        "studentCount": sheet.rows.len(),
        "knowledge": calc::category_stats(&knowledge, set),
        "skill": calc::category_stats(&skill, set),
        "competency": calc::competency_tally(summaries.iter()),
        "perComponent": per_component,
        "rows": sheet.rows.iter().map(|r| json!({
            "studentId": r.student_id,
            "fullName": r.full_name,
            "knowledge": r.knowledge,
            "skill": r.skill,
            "competency": r.competency
        })).collect::<Vec<_>>()
    })
}

fn handle_analytics_subject(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let set = match parse_buckets(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let include_inactive = match optional_bool(req, "includeInactive", false) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match gradebook::load_subject_sheet(conn, &subject_id, include_inactive) {
        Ok(sheet) => ok(&req.id, subject_analytics_value(&sheet, &set)),
        Err(e) => calc_err(req, e),
    }
}

#[derive(Default)]
struct StudentAcross {
    full_name: String,
    above: usize,
    below: usize,
    ungraded: usize,
    below_subjects: Vec<String>,
}

fn handle_analytics_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let set = match parse_buckets(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "classes", &class_id, "class") {
        return e;
    }
    let subject_ids = match gradebook::list_subject_ids(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let mut subjects = Vec::with_capacity(subject_ids.len());
    let mut across: Vec<(String, StudentAcross)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for sid in &subject_ids {
        let sheet = match gradebook::load_subject_sheet(conn, sid, false) {
            Ok(v) => v,
            Err(e) => return calc_err(req, e),
        };
        let knowledge: Vec<Option<f64>> = sheet.rows.iter().map(|r| r.knowledge).collect();
        let skill: Vec<Option<f64>> = sheet.rows.iter().map(|r| r.skill).collect();
        let summaries: Vec<calc::ScoreSummary> = sheet.rows.iter().map(|r| r.summary()).collect();
        subjects.push(json!({
            "subjectId": sheet.subject.id,
            "code": sheet.subject.code,
            "name": sheet.subject.name,
            "knowledge": calc::category_stats(&knowledge, &set),
            "skill": calc::category_stats(&skill, &set),
            "competency": calc::competency_tally(summaries.iter())
        }));

        for r in &sheet.rows {
            let slot = *index.entry(r.student_id.clone()).or_insert_with(|| {
                across.push((
                    r.student_id.clone(),
                    StudentAcross {
                        full_name: r.full_name.clone(),
                        ..Default::default()
                    },
                ));
                across.len() - 1
            });
            let s = &mut across[slot].1;
            match r.competency {
                Some(Competency::Above) => s.above += 1,
                Some(Competency::Below) => {
                    s.below += 1;
                    s.below_subjects.push(sheet.subject.code.clone());
                }
                None => s.ungraded += 1,
            }
        }
    }

    let students = across
        .into_iter()
        .map(|(id, s)| {
            json!({
                "studentId": id,
                "fullName": s.full_name,
                "aboveCount": s.above,
                "belowCount": s.below,
                "ungradedCount": s.ungraded,
                "belowSubjects": s.below_subjects
            })
        })
        .collect::<Vec<_>>();

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "kkm": calc::KKM,
            "bucketSet": bucket_set_json(&set),
            "subjects": subjects,
            "students": students
        }),
    )
}

fn handle_analytics_student(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subject_ids = match gradebook::list_subject_ids(conn, &student.class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let mut subjects = Vec::with_capacity(subject_ids.len());
    let mut knowledge_scores = Vec::new();
    let mut skill_scores = Vec::new();
    for sid in &subject_ids {
        let sheet = match gradebook::load_subject_sheet(conn, sid, true) {
            Ok(v) => v,
            Err(e) => return calc_err(req, e),
        };
        let Some(row) = sheet.rows.iter().find(|r| r.student_id == student_id) else {
            continue;
        };
        knowledge_scores.extend(row.knowledge);
        skill_scores.extend(row.skill);
        let components = sheet
            .components
            .iter()
            .zip(row.values.iter())
            .map(|(c, v)| {
                json!({
                    "componentId": c.id,
                    "name": c.name,
                    "category": c.category,
                    "weight": c.weight,
                    "value": v
                })
            })
            .collect::<Vec<_>>();
        subjects.push(json!({
            "subjectId": sheet.subject.id,
            "code": sheet.subject.code,
            "name": sheet.subject.name,
            "knowledge": row.knowledge,
            "skill": row.skill,
            "competency": row.competency,
            "components": components
        }));
    }

    let attendance = match attendance::tally_for_class(conn, &student.class_id, None, None) {
        Ok(mut t) => t.remove(&student_id).unwrap_or_default(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "student": student,
            "kkm": calc::KKM,
            "subjects": subjects,
            "knowledgeMean": calc::compute_mean(&knowledge_scores),
            "skillMean": calc::compute_mean(&skill_scores),
            "attendance": attendance
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.subject" => Some(handle_analytics_subject(state, req)),
        "analytics.class" => Some(handle_analytics_class(state, req)),
        "analytics.student" => Some(handle_analytics_student(state, req)),
        _ => None,
    }
}
