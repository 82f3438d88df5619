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
fn accounts_enforce_roles_and_unique_usernames() {
    let workspace = temp_dir("rapord-accounts");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "accounts.create",
        json!({ "username": "admin", "displayName": "Tata Usaha", "role": "Admin" }),
    );
    assert_eq!(admin["role"], json!("admin"));
    request_ok(
        &mut stdin,
        &mut reader,
        "a2",
        "accounts.create",
        json!({ "username": "pak.dedi", "displayName": "Dedi", "role": "teacher" }),
    );

    let dup = request(
        &mut stdin,
        &mut reader,
        "dup",
        "accounts.create",
        json!({ "username": "admin", "displayName": "Lain", "role": "teacher" }),
    );
    assert_eq!(dup["error"]["code"], json!("conflict"));
    let bad_role = request(
        &mut stdin,
        &mut reader,
        "role",
        "accounts.create",
        json!({ "username": "x", "displayName": "X", "role": "principal" }),
    );
    assert_eq!(bad_role["error"]["code"], json!("bad_params"));

    let teachers = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "accounts.list",
        json!({ "role": "teacher" }),
    );
    let teachers = teachers["accounts"].as_array().expect("accounts");
    assert_eq!(teachers.len(), 1);
    assert_eq!(teachers[0]["username"], json!("pak.dedi"));
    let teacher_id = id_of(&teachers[0], "id");

    request_ok(
        &mut stdin,
        &mut reader,
        "upd",
        "accounts.update",
        json!({ "accountId": teacher_id, "displayName": "Dedi Kurniawan", "active": false }),
    );
    let all = request_ok(&mut stdin, &mut reader, "all", "accounts.list", json!({}));
    let dedi = all["accounts"]
        .as_array()
        .expect("accounts")
        .iter()
        .find(|a| a["id"] == json!(teacher_id))
        .cloned()
        .expect("dedi");
    assert_eq!(dedi["displayName"], json!("Dedi Kurniawan"));
    assert_eq!(dedi["active"], json!(false));

    let nothing = request(
        &mut stdin,
        &mut reader,
        "noop",
        "accounts.update",
        json!({ "accountId": teacher_id }),
    );
    assert_eq!(nothing["error"]["code"], json!("bad_params"));

    request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "accounts.delete",
        json!({ "accountId": teacher_id }),
    );
    let gone = request(
        &mut stdin,
        &mut reader,
        "del2",
        "accounts.delete",
        json!({ "accountId": teacher_id }),
    );
    assert_eq!(gone["error"]["code"], json!("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn class_setup_validates_and_delete_cascades() {
    let workspace = temp_dir("rapord-class-setup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c",
        "classes.create",
        json!({ "name": "IX B", "gradeLevel": "IX", "angkatan": 2022 }),
    );
    let class_id = id_of(&class, "classId");

    let bad_year = request(
        &mut stdin,
        &mut reader,
        "year",
        "classes.update",
        json!({ "classId": class_id, "angkatan": "dua ribu" }),
    );
    assert_eq!(bad_year["error"]["code"], json!("bad_params"));
    let ghost_teacher = request(
        &mut stdin,
        &mut reader,
        "ghost",
        "classes.update",
        json!({ "classId": class_id, "homeroomTeacherId": "ghost" }),
    );
    assert_eq!(ghost_teacher["error"]["code"], json!("not_found"));

    let student_id = id_of(
        &request_ok(
            &mut stdin,
            &mut reader,
            "s",
            "students.create",
            json!({ "classId": class_id, "fullName": "Eka", "nis": "9001" }),
        ),
        "studentId",
    );
    let subject_id = id_of(
        &request_ok(
            &mut stdin,
            &mut reader,
            "subj",
            "subjects.create",
            json!({ "classId": class_id, "code": "IPA", "name": "Ilmu Pengetahuan Alam" }),
        ),
        "subjectId",
    );
    let dup_code = request(
        &mut stdin,
        &mut reader,
        "dup",
        "subjects.create",
        json!({ "classId": class_id, "code": "IPA", "name": "IPA Lagi" }),
    );
    assert_eq!(dup_code["error"]["code"], json!("conflict"));

    let heavy = request(
        &mut stdin,
        &mut reader,
        "heavy",
        "components.create",
        json!({ "subjectId": subject_id, "name": "UTS", "weight": 120, "category": "Pengetahuan" }),
    );
    assert_eq!(heavy["error"]["code"], json!("bad_params"));
    let component_id = id_of(
        &request_ok(
            &mut stdin,
            &mut reader,
            "comp",
            "components.create",
            json!({ "subjectId": subject_id, "name": "UTS", "weight": 30, "category": "Pengetahuan" }),
        ),
        "componentId",
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "grade",
        "grades.set",
        json!({ "componentId": component_id, "studentId": student_id, "value": 77 }),
    );

    let listed = request_ok(&mut stdin, &mut reader, "l1", "classes.list", json!({}));
    assert_eq!(listed["classes"][0]["studentCount"], json!(1));
    assert_eq!(listed["classes"][0]["subjectCount"], json!(1));

    request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "classes.delete",
        json!({ "classId": class_id }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "l2", "classes.list", json!({}));
    assert_eq!(listed["classes"].as_array().map(|c| c.len()), Some(0));
    let orphan = request(
        &mut stdin,
        &mut reader,
        "grid",
        "grades.grid",
        json!({ "subjectId": subject_id }),
    );
    assert_eq!(orphan["error"]["code"], json!("not_found"));
    let student_gone = request(
        &mut stdin,
        &mut reader,
        "sdel",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    assert_eq!(student_gone["error"]["code"], json!("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn moved_student_carries_attendance_and_both_classes_delete() {
    let workspace = temp_dir("rapord-student-move");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_a = id_of(
        &request_ok(&mut stdin, &mut reader, "ca", "classes.create", json!({ "name": "VII A" })),
        "classId",
    );
    let class_b = id_of(
        &request_ok(&mut stdin, &mut reader, "cb", "classes.create", json!({ "name": "VII B" })),
        "classId",
    );
    let student_id = id_of(
        &request_ok(
            &mut stdin,
            &mut reader,
            "s",
            "students.create",
            json!({ "classId": class_a, "fullName": "Fajar" }),
        ),
        "studentId",
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "mark",
        "attendance.mark",
        json!({ "classId": class_a, "date": "2024-09-02", "entries": [
            { "studentId": student_id, "status": "S" }
        ] }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "move",
        "students.update",
        json!({ "studentId": student_id, "classId": class_b }),
    );
    // Same class again is a no-op, not an error.
    request_ok(
        &mut stdin,
        &mut reader,
        "stay",
        "students.update",
        json!({ "studentId": student_id, "classId": class_b }),
    );

    let card = request_ok(
        &mut stdin,
        &mut reader,
        "card",
        "reports.reportCard",
        json!({ "studentId": student_id }),
    );
    assert_eq!(card["header"]["className"], json!("VII B"));
    assert_eq!(card["attendance"]["sakit"], json!(1));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "sum",
        "attendance.summary",
        json!({ "classId": class_b }),
    );
    assert_eq!(summary["rows"][0]["tally"]["sakit"], json!(1));
    assert_eq!(summary["classTotal"]["recordedDays"], json!(1));
    let old = request_ok(
        &mut stdin,
        &mut reader,
        "sum-a",
        "attendance.summary",
        json!({ "classId": class_a }),
    );
    assert_eq!(old["classTotal"]["recordedDays"], json!(0));

    request_ok(
        &mut stdin,
        &mut reader,
        "del-b",
        "classes.delete",
        json!({ "classId": class_b }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "del-a",
        "classes.delete",
        json!({ "classId": class_a }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "l", "classes.list", json!({}));
    assert_eq!(listed["classes"].as_array().map(|c| c.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn subject_code_update_reports_conflict() {
    let workspace = temp_dir("rapord-subject-code");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = id_of(
        &request_ok(&mut stdin, &mut reader, "c", "classes.create", json!({ "name": "VIII C" })),
        "classId",
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "ipa",
        "subjects.create",
        json!({ "classId": class_id, "code": "IPA", "name": "Ilmu Pengetahuan Alam" }),
    );
    let mtk = id_of(
        &request_ok(
            &mut stdin,
            &mut reader,
            "mtk",
            "subjects.create",
            json!({ "classId": class_id, "code": "MTK", "name": "Matematika" }),
        ),
        "subjectId",
    );

    let clash = request(
        &mut stdin,
        &mut reader,
        "clash",
        "subjects.update",
        json!({ "subjectId": mtk, "code": "IPA" }),
    );
    assert_eq!(clash["ok"], json!(false));
    assert_eq!(clash["error"]["code"], json!("conflict"));
    assert_eq!(clash["error"]["details"]["code"], json!("IPA"));

    // Renaming to a free code still works.
    request_ok(
        &mut stdin,
        &mut reader,
        "free",
        "subjects.update",
        json!({ "subjectId": mtk, "code": "MAT" }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l",
        "subjects.list",
        json!({ "classId": class_id }),
    );
    let codes: Vec<&str> = listed["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .filter_map(|s| s["code"].as_str())
        .collect();
    assert!(codes.contains(&"IPA"));
    assert!(codes.contains(&"MAT"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
