use crate::calc::{self, WeightedEntry};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, db_err, ensure_exists, now_rfc3339, optional_str, parse_score, parse_weight, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct EvaluationItem {
    aspect: String,
    weight: f64,
    score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Evaluation {
    id: String,
    teacher_id: String,
    teacher_name: Option<String>,
    period: String,
    evaluator: Option<String>,
    note: Option<String>,
    created_at: String,
    items: Vec<EvaluationItem>,
    /// Weighted over rated aspects; `None` when nothing is rated.
    score: Option<f64>,
}

fn load_evaluations(conn: &Connection, teacher_id: Option<&str>) -> rusqlite::Result<Vec<Evaluation>> {
    let mut sql = String::from(
        "SELECT e.id, e.teacher_id, a.display_name, e.period, e.evaluator, e.note, e.created_at
         FROM evaluations e
         LEFT JOIN accounts a ON a.id = e.teacher_id",
    );
    let mut binds: Vec<Value> = Vec::new();
    if let Some(t) = teacher_id {
        sql.push_str(" WHERE e.teacher_id = ?");
        binds.push(Value::Text(t.to_string()));
    }
    sql.push_str(" ORDER BY e.period, e.created_at");

    let mut stmt = conn.prepare(&sql)?;
    let mut evals = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(Evaluation {
                id: r.get(0)?,
                teacher_id: r.get(1)?,
                teacher_name: r.get(2)?,
                period: r.get(3)?,
                evaluator: r.get(4)?,
                note: r.get(5)?,
                created_at: r.get(6)?,
                items: Vec::new(),
                score: None,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut item_stmt = conn.prepare(
        "SELECT aspect, weight, score FROM evaluation_items WHERE evaluation_id = ? ORDER BY sort_order",
    )?;
    for ev in evals.iter_mut() {
        ev.items = item_stmt
            .query_map([&ev.id], |r| {
                Ok(EvaluationItem {
                    aspect: r.get(0)?,
                    weight: r.get(1)?,
                    score: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        ev.score = calc::weighted_average(ev.items.iter().map(|i| WeightedEntry {
            weight: i.weight,
            value: i.score,
        }));
    }
    Ok(evals)
}

fn handle_evaluations_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period = match required_str(req, "period") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let evaluator = match optional_str(req, "evaluator") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let note = match optional_str(req, "note") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(raw_items) = req.params.get("items").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing items[]", None);
    };
    if raw_items.is_empty() {
        return err(&req.id, "bad_params", "items must not be empty", None);
    }
    if let Err(e) = ensure_exists(conn, req, "accounts", &teacher_id, "teacher") {
        return e;
    }

    let mut items: Vec<EvaluationItem> = Vec::with_capacity(raw_items.len());
    for (i, raw) in raw_items.iter().enumerate() {
        let Some(aspect) = raw
            .get("aspect")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
        else {
            return err(
                &req.id,
                "bad_params",
                "item missing aspect",
                Some(json!({ "index": i })),
            );
        };
        let weight = match raw.get("weight").map(parse_weight) {
            Some(Ok(w)) => w,
            Some(Err(m)) => return err(&req.id, "bad_params", m, Some(json!({ "index": i }))),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "item missing weight",
                    Some(json!({ "index": i })),
                )
            }
        };
        let score = match parse_score(raw.get("score").unwrap_or(&serde_json::Value::Null)) {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", m, Some(json!({ "index": i }))),
        };
        items.push(EvaluationItem {
            aspect,
            weight,
            score,
        });
    }

    let evaluation_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO evaluations(id, teacher_id, period, evaluator, note, created_at) VALUES(?, ?, ?, ?, ?, ?)",
        (&evaluation_id, &teacher_id, &period, &evaluator, &note, now_rfc3339()),
    ) {
        let _ = tx.rollback();
        return db_err(req, "db_insert_failed", e, "evaluations");
    }
    for (i, item) in items.iter().enumerate() {
        if let Err(e) = tx.execute(
            "INSERT INTO evaluation_items(evaluation_id, aspect, weight, score, sort_order) VALUES(?, ?, ?, ?, ?)",
            (&evaluation_id, &item.aspect, item.weight, item.score, i as i64),
        ) {
            let _ = tx.rollback();
            return db_err(req, "db_insert_failed", e, "evaluation_items");
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let score = calc::weighted_average(items.iter().map(|i| WeightedEntry {
        weight: i.weight,
        value: i.score,
    }));
    ok(
        &req.id,
        json!({ "evaluationId": evaluation_id, "score": score }),
    )
}

fn handle_evaluations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match optional_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_evaluations(conn, teacher_id.as_deref()) {
        Ok(evals) => ok(&req.id, json!({ "evaluations": evals })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_evaluations_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "accounts", &teacher_id, "teacher") {
        return e;
    }
    let evals = match load_evaluations(conn, Some(&teacher_id)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let scores: Vec<f64> = evals.iter().filter_map(|e| e.score).collect();
    let mut per_aspect: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for ev in &evals {
        for item in &ev.items {
            if let Some(s) = item.score {
                per_aspect.entry(item.aspect.clone()).or_default().push(s);
            }
        }
    }
    let aspects = per_aspect
        .iter()
        .map(|(aspect, vals)| {
            json!({
                "aspect": aspect,
                "average": calc::compute_mean(vals),
                "ratedCount": vals.len()
            })
        })
        .collect::<Vec<_>>();
    let periods = evals
        .iter()
        .map(|e| json!({ "evaluationId": e.id, "period": e.period, "score": e.score }))
        .collect::<Vec<_>>();
    let overall = calc::compute_mean(&scores);

    ok(
        &req.id,
        json!({
            "teacherId": teacher_id,
            "evaluationCount": evals.len(),
            "ratedCount": scores.len(),
            "overall": overall,
            "meetsKkm": overall.map(|s| s >= calc::KKM),
            "periods": periods,
            "aspects": aspects
        }),
    )
}

fn handle_evaluations_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "evaluations", &evaluation_id, "evaluation") {
        return e;
    }
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (table, sql) in [
        ("evaluation_items", "DELETE FROM evaluation_items WHERE evaluation_id = ?"),
        ("evaluations", "DELETE FROM evaluations WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&evaluation_id]) {
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
        "evaluations.create" => Some(handle_evaluations_create(state, req)),
        "evaluations.list" => Some(handle_evaluations_list(state, req)),
        "evaluations.summary" => Some(handle_evaluations_summary(state, req)),
        "evaluations.delete" => Some(handle_evaluations_delete(state, req)),
        _ => None,
    }
}
