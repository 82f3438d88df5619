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
        .env_remove("RAPORD_API_BASE")
        .env_remove("RAPORD_TOKEN")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rapord");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn read_response(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response");
    serde_json::from_str(line.trim()).expect("parse response json")
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

    let value = read_response(reader);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn error_code(v: &serde_json::Value) -> Option<&str> {
    v.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
}

#[test]
fn health_reports_version_and_kkm_without_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["ok"], json!(true));
    assert_eq!(health["result"]["kkm"], json!(75.0));
    assert_eq!(health["result"]["workspacePath"], json!(null));
    assert_eq!(health["result"]["remoteConfigured"], json!(false));

    let no_ws = request(&mut stdin, &mut reader, "2", "grades.grid", json!({ "subjectId": "x" }));
    assert_eq!(error_code(&no_ws), Some("no_workspace"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn malformed_line_and_unknown_method_are_reported() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let bad = read_response(&mut reader);
    assert_eq!(bad["ok"], json!(false));
    assert_eq!(error_code(&bad), Some("bad_json"));

    writeln!(
        stdin,
        "{}",
        json!({ "id": "u1", "method": "nope.nothing", "params": {} })
    )
    .expect("write unknown");
    stdin.flush().expect("flush");
    let unknown = read_response(&mut reader);
    assert_eq!(unknown["id"], json!("u1"));
    assert_eq!(error_code(&unknown), Some("not_implemented"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("rapord-router-smoke");
    let bundle_out = workspace.join("out").join("smoke-backup.zip");
    let csv_out = workspace.join("out").join("smoke-recap.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let selected = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected["ok"], json!(true));

    let teacher = request(
        &mut stdin,
        &mut reader,
        "2",
        "accounts.create",
        json!({ "username": "bu.sari", "displayName": "Sari Wulandari", "role": "teacher" }),
    );
    let teacher_id = teacher["result"]["accountId"].as_str().expect("accountId").to_string();

    let class = request(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "X IPA 1", "angkatan": 2024, "homeroomTeacherId": teacher_id }),
    );
    let class_id = class["result"]["classId"].as_str().expect("classId").to_string();

    let student = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "classId": class_id, "fullName": "Andi Pratama", "nis": "24001" }),
    );
    let student_id = student["result"]["studentId"].as_str().expect("studentId").to_string();

    let subject = request(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.create",
        json!({ "classId": class_id, "code": "MTK", "name": "Matematika", "teacherId": teacher_id }),
    );
    let subject_id = subject["result"]["subjectId"].as_str().expect("subjectId").to_string();

    let comp = request(
        &mut stdin,
        &mut reader,
        "6",
        "components.create",
        json!({ "subjectId": subject_id, "name": "UH1", "weight": 50, "category": "Pengetahuan" }),
    );
    let component_id = comp["result"]["componentId"].as_str().expect("componentId").to_string();

    let calls: Vec<(&str, serde_json::Value)> = vec![
        ("accounts.list", json!({})),
        ("classes.list", json!({})),
        ("students.list", json!({ "classId": class_id })),
        ("subjects.list", json!({ "classId": class_id })),
        ("components.list", json!({ "subjectId": subject_id })),
        (
            "grades.set",
            json!({ "componentId": component_id, "studentId": student_id, "value": 80 }),
        ),
        ("grades.grid", json!({ "subjectId": subject_id })),
        (
            "attendance.mark",
            json!({ "classId": class_id, "date": "2024-08-01", "entries": [
                { "studentId": student_id, "status": "H" }
            ] }),
        ),
        ("attendance.day", json!({ "classId": class_id, "date": "2024-08-01" })),
        ("attendance.summary", json!({ "classId": class_id })),
        (
            "evaluations.create",
            json!({ "teacherId": teacher_id, "period": "2024-S1", "items": [
                { "aspect": "Pedagogik", "weight": 1, "score": 88 }
            ] }),
        ),
        ("evaluations.list", json!({})),
        ("evaluations.summary", json!({ "teacherId": teacher_id })),
        ("analytics.subject", json!({ "subjectId": subject_id })),
        ("analytics.class", json!({ "classId": class_id })),
        ("analytics.student", json!({ "studentId": student_id })),
        ("reports.reportCard", json!({ "studentId": student_id })),
        ("reports.classRecap", json!({ "classId": class_id })),
        (
            "reports.exportCsv",
            json!({ "classId": class_id, "outPath": csv_out.to_string_lossy() }),
        ),
        (
            "backup.exportWorkspace",
            json!({ "outPath": bundle_out.to_string_lossy() }),
        ),
        ("auth.setToken", json!({ "token": "session-token" })),
        ("auth.clearToken", json!({})),
    ];

    for (i, (method, params)) in calls.into_iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("call-{}", i),
            method,
            params,
        );
        assert_eq!(resp["ok"], json!(true), "{} failed: {}", method, resp);
    }

    // Without a base url the pull is refused before any network work.
    let pull = request(&mut stdin, &mut reader, "pull", "sync.pull", json!({}));
    assert_eq!(error_code(&pull), Some("remote_not_configured"));

    assert!(csv_out.is_file());
    assert!(bundle_out.is_file());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn remote_config_does_not_leak_between_workspaces() {
    let with_file = temp_dir("rapord-ws-config-file");
    std::fs::write(
        with_file.join("rapord.toml"),
        "[remote]\nbase_url = \"http://127.0.0.1:9/api\"\n",
    )
    .expect("write workspace config");
    let configured = temp_dir("rapord-ws-config-saved");
    let plain = temp_dir("rapord-ws-config-plain");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let select = |stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str, p: &PathBuf| {
        let r = request(stdin, reader, id, "workspace.select", json!({ "path": p.to_string_lossy() }));
        assert_eq!(r["ok"], json!(true), "{}", r);
    };
    let remote_configured = |stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str| {
        request(stdin, reader, id, "health", json!({}))["result"]["remoteConfigured"].clone()
    };

    select(&mut stdin, &mut reader, "s1", &with_file);
    assert_eq!(remote_configured(&mut stdin, &mut reader, "h1"), json!(true));

    select(&mut stdin, &mut reader, "s2", &configured);
    assert_eq!(remote_configured(&mut stdin, &mut reader, "h2"), json!(false));
    let set = request(
        &mut stdin,
        &mut reader,
        "cfg",
        "remote.configure",
        json!({ "baseUrl": "http://127.0.0.1:9/other", "timeoutSecs": 3 }),
    );
    assert_eq!(set["ok"], json!(true), "{}", set);
    assert_eq!(remote_configured(&mut stdin, &mut reader, "h3"), json!(true));

    select(&mut stdin, &mut reader, "s3", &plain);
    assert_eq!(remote_configured(&mut stdin, &mut reader, "h4"), json!(false));

    // Saved settings come back with their workspace.
    select(&mut stdin, &mut reader, "s4", &configured);
    assert_eq!(remote_configured(&mut stdin, &mut reader, "h5"), json!(true));
    select(&mut stdin, &mut reader, "s5", &plain);
    assert_eq!(remote_configured(&mut stdin, &mut reader, "h6"), json!(false));

    drop(stdin);
    let _ = child.wait();
    for dir in [with_file, configured, plain] {
        let _ = std::fs::remove_dir_all(dir);
    }
}
