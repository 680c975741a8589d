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
    let exe = env!("CARGO_BIN_EXE_schoolbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoolbookd");
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
    serde_json::from_str(line.trim()).expect("parse response json")
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
    value.get("result").cloned().unwrap_or(serde_json::Value::Null)
}

fn error_code(value: &serde_json::Value) -> String {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}


#[test]
fn requests_before_workspace_select_report_no_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health.get("workspacePath").expect("workspacePath").is_null());

    let resp = request(&mut stdin, &mut reader, "2", "students.list", json!({}));
    assert_eq!(error_code(&resp), "no_workspace");

    let resp = request(&mut stdin, &mut reader, "3", "nope.method", json!({}));
    assert_eq!(error_code(&resp), "not_implemented");

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let v: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(error_code(&v), "bad_json");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("schoolbook-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert!(workspace.join("schoolbook.sqlite3").is_file());

    let methods = [
        ("setup.get", json!({})),
        ("students.list", json!({})),
        ("representatives.list", json!({})),
        ("teachers.list", json!({})),
        ("subjects.list", json!({})),
        ("periods.list", json!({})),
        ("lapses.list", json!({})),
        ("cutoffs.list", json!({})),
        ("cutoffs.current", json!({})),
        ("sections.list", json!({})),
        ("subjectAssignments.list", json!({})),
        ("guideAssignments.list", json!({})),
        ("evaluations.list", json!({})),
        ("reports.layoutPreview", json!({ "text": "Hola mundo" })),
    ];
    for (i, (method, params)) in methods.iter().enumerate() {
        let id = format!("m{}", i);
        request_ok(&mut stdin, &mut reader, &id, method, params.clone());
    }

    // Methods that need params still dispatch and fail validation, not routing.
    for (i, method) in [
        "students.get",
        "enrollments.list",
        "grades.open",
        "grades.history",
        "grades.lapseSummary",
        "reports.studentCertificate",
        "backup.exportWorkspaceBundle",
    ]
    .iter()
    .enumerate()
    {
        let resp = request(&mut stdin, &mut reader, &format!("p{}", i), method, json!({}));
        assert_eq!(error_code(&resp), "bad_params", "{} -> {}", method, resp);
    }

    let current = request_ok(&mut stdin, &mut reader, "c", "cutoffs.current", json!({}));
    assert!(current.get("cutoff").expect("cutoff").is_null());
    assert_eq!(current.get("editable").and_then(|v| v.as_bool()), Some(false));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn setup_update_validates_and_persists_sections() {
    let workspace = temp_dir("schoolbook-setup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let defaults = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(defaults["reports"]["fontSize"].as_i64(), Some(11));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({
            "section": "institution",
            "patch": { "schoolName": "U.E. Simón Bolívar", "directorName": "  maría  gómez " }
        }),
    );
    assert_eq!(updated["institution"]["directorName"].as_str(), Some("MARÍA  GÓMEZ"));

    let bad = request(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({ "section": "reports", "patch": { "fontSize": 40 } }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    let unknown = request(
        &mut stdin,
        &mut reader,
        "5",
        "setup.update",
        json!({ "section": "reports", "patch": { "colour": "red" } }),
    );
    assert_eq!(error_code(&unknown), "bad_params");

    let again = request_ok(&mut stdin, &mut reader, "6", "setup.get", json!({}));
    assert_eq!(again["institution"]["schoolName"].as_str(), Some("U.E. Simón Bolívar"));
    assert_eq!(again["reports"]["fontSize"].as_i64(), Some(11));

    drop(stdin);
    let _ = child.wait();
}
