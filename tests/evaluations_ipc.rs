use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rapord");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rapord");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn id_of(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

#[test]
fn evaluation_scores_are_weighted_over_rated_aspects() {
    let workspace = temp_dir("rapord-evaluations");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "t",
        "accounts.create",
        json!({ "username": "pak.budi", "displayName": "Budi Santoso", "role": "teacher" }),
    );
    let teacher_id = id_of(&teacher, "accountId");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "e1",
        "evaluations.create",
        json!({
            "teacherId": teacher_id,
            "period": "2024-S1",
            "evaluator": "Kepala Sekolah",
            "items": [
                { "aspect": "Pedagogik", "weight": 2, "score": 80 },
                { "aspect": "Profesional", "weight": 1, "score": 95 },
                { "aspect": "Sosial", "weight": 1, "score": null }
            ]
        }),
    );
    assert_eq!(first["score"].as_f64(), Some(85.0));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "e2",
        "evaluations.create",
        json!({
            "teacherId": teacher_id,
            "period": "2024-S2",
            "items": [{ "aspect": "Pedagogik", "weight": 1, "score": 70 }]
        }),
    );
    assert_eq!(second["score"].as_f64(), Some(70.0));

    let unrated = request_ok(
        &mut stdin,
        &mut reader,
        "e3",
        "evaluations.create",
        json!({
            "teacherId": teacher_id,
            "period": "2025-S1",
            "items": [{ "aspect": "Kepribadian", "weight": 1, "score": null }]
        }),
    );
    assert_eq!(unrated["score"], json!(null));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "sum",
        "evaluations.summary",
        json!({ "teacherId": teacher_id }),
    );
    assert_eq!(summary["evaluationCount"], json!(3));
    assert_eq!(summary["ratedCount"], json!(2));
    assert_eq!(summary["overall"].as_f64(), Some(77.5));
    assert_eq!(summary["meetsKkm"], json!(true));
    let aspects = summary["aspects"].as_array().expect("aspects");
    let pedagogik = aspects
        .iter()
        .find(|a| a["aspect"] == json!("Pedagogik"))
        .expect("pedagogik");
    assert_eq!(pedagogik["average"].as_f64(), Some(75.0));
    assert_eq!(pedagogik["ratedCount"], json!(2));
    assert!(aspects.iter().all(|a| a["aspect"] != json!("Sosial")));

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "evaluations.list",
        json!({ "teacherId": teacher_id }),
    );
    let evals = list["evaluations"].as_array().expect("evaluations");
    assert_eq!(evals.len(), 3);
    assert_eq!(evals[0]["period"], json!("2024-S1"));
    assert_eq!(evals[0]["teacherName"], json!("Budi Santoso"));
    assert_eq!(evals[0]["items"].as_array().map(|i| i.len()), Some(3));

    // The teacher cannot be removed while evaluations reference them.
    let in_use = request(
        &mut stdin,
        &mut reader,
        "del-teacher",
        "accounts.delete",
        json!({ "accountId": teacher_id }),
    );
    assert_eq!(in_use["error"]["code"], json!("in_use"));
    assert_eq!(in_use["error"]["details"]["evaluations"], json!(3));

    for (i, e) in evals.iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("del{}", i),
            "evaluations.delete",
            json!({ "evaluationId": e["id"] }),
        );
    }
    request_ok(
        &mut stdin,
        &mut reader,
        "del-teacher-2",
        "accounts.delete",
        json!({ "accountId": teacher_id }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn evaluation_input_is_validated() {
    let workspace = temp_dir("rapord-evaluations-invalid");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "t",
        "accounts.create",
        json!({ "username": "bu.rina", "displayName": "Rina", "role": "teacher" }),
    );
    let teacher_id = id_of(&teacher, "accountId");

    let cases = [
        json!({ "teacherId": teacher_id, "period": "p", "items": [] }),
        json!({ "teacherId": teacher_id, "period": "p", "items": [{ "weight": 1, "score": 80 }] }),
        json!({ "teacherId": teacher_id, "period": "p", "items": [{ "aspect": "A", "score": 80 }] }),
        json!({ "teacherId": teacher_id, "period": "p", "items": [{ "aspect": "A", "weight": 1, "score": 120 }] }),
        json!({ "teacherId": teacher_id, "items": [{ "aspect": "A", "weight": 1, "score": 80 }] }),
    ];
    for (i, params) in cases.into_iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("bad{}", i),
            "evaluations.create",
            params,
        );
        assert_eq!(resp["error"]["code"], json!("bad_params"), "case {}", i);
    }

    let unknown = request(
        &mut stdin,
        &mut reader,
        "unknown",
        "evaluations.create",
        json!({ "teacherId": "ghost", "period": "p", "items": [{ "aspect": "A", "weight": 1, "score": 80 }] }),
    );
    assert_eq!(unknown["error"]["code"], json!("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
