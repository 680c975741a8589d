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

fn str_at<'a>(v: &'a serde_json::Value, key: &str) -> &'a str {
    v.get(key).and_then(|x| x.as_str()).expect(key)
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id_number: &str,
    first: &str,
    last: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("student-{}", id_number),
        "students.create",
        json!({ "idNumber": id_number, "firstNames": first, "lastNames": last }),
    );
    str_at(&created, "studentId").to_string()
}

#[test]
fn student_identity_numbers_are_unique_and_names_uppercased() {
    let workspace = temp_dir("schoolbook-students-unique");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({
            "idType": "v",
            "idNumber": "30.123.456",
            "firstNames": "  josé   luis ",
            "lastNames": "rodríguez",
            "birthDate": "2012-03-04",
            "sex": "m"
        }),
    );
    let first_id = str_at(&created, "studentId").to_string();
    let student = created.get("student").expect("student");
    assert_eq!(student["idType"].as_str(), Some("V"));
    assert_eq!(student["idNumber"].as_str(), Some("30123456"));
    assert_eq!(student["firstNames"].as_str(), Some("JOSÉ   LUIS"));
    assert_eq!(student["lastNames"].as_str(), Some("RODRÍGUEZ"));
    assert_eq!(student["sex"].as_str(), Some("M"));

    let dup = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "idNumber": "30123456", "firstNames": "Otro", "lastNames": "Alumno" }),
    );
    assert_eq!(error_code(&dup), "conflict");
    assert_eq!(dup["error"]["details"]["existingId"].as_str(), Some(first_id.as_str()));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "idNumber": "30999888", "firstNames": "María", "lastNames": "Soto" }),
    );
    let second_id = str_at(&second, "studentId").to_string();

    let clash = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.update",
        json!({ "studentId": second_id, "idNumber": "30-123-456" }),
    );
    assert_eq!(error_code(&clash), "conflict");

    // Saving a record with its own number is not a conflict.
    let same = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.update",
        json!({ "studentId": first_id, "idNumber": "30123456", "birthPlace": "caracas" }),
    );
    assert_eq!(same["student"]["birthPlace"].as_str(), Some("CARACAS"));
    assert_eq!(same["student"]["firstNames"].as_str(), Some("JOSÉ   LUIS"));

    let listed = request_ok(&mut stdin, &mut reader, "7", "students.list", json!({ "search": "soto" }));
    let rows = listed["students"].as_array().expect("students");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"].as_str(), Some(second_id.as_str()));

    let bad_date = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.update",
        json!({ "studentId": first_id, "birthDate": "04/03/2012" }),
    );
    assert_eq!(error_code(&bad_date), "bad_params");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn representative_link_blocks_student_and_representative_delete() {
    let workspace = temp_dir("schoolbook-representatives");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let rep = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "representatives.create",
        json!({
            "idNumber": "12345678",
            "firstNames": "Carmen",
            "lastNames": "Díaz",
            "relationship": "madre",
            "email": "Carmen@Example.com"
        }),
    );
    let rep_id = str_at(&rep, "representativeId").to_string();
    assert_eq!(rep["representative"]["email"].as_str(), Some("carmen@example.com"));

    let dup = request(
        &mut stdin,
        &mut reader,
        "3",
        "representatives.create",
        json!({ "idNumber": "12.345.678", "firstNames": "X", "lastNames": "Y" }),
    );
    assert_eq!(error_code(&dup), "conflict");

    let student_id = create_student(&mut stdin, &mut reader, "31000111", "Luis", "Díaz");
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.linkRepresentative",
        json!({ "studentId": student_id, "representativeId": rep_id }),
    );

    let reps = request_ok(&mut stdin, &mut reader, "5", "representatives.list", json!({}));
    assert_eq!(reps["representatives"][0]["studentCount"].as_i64(), Some(1));

    let blocked = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    assert_eq!(error_code(&blocked), "conflict");

    let blocked_rep = request(
        &mut stdin,
        &mut reader,
        "7",
        "representatives.delete",
        json!({ "representativeId": rep_id }),
    );
    assert_eq!(error_code(&blocked_rep), "conflict");

    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.unlinkRepresentative",
        json!({ "studentId": student_id }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "representatives.delete",
        json!({ "representativeId": rep_id }),
    );

    let gone = request(
        &mut stdin,
        &mut reader,
        "11",
        "students.get",
        json!({ "studentId": student_id }),
    );
    assert_eq!(error_code(&gone), "not_found");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn teacher_and_subject_codes_are_unique() {
    let workspace = temp_dir("schoolbook-teachers-subjects");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let t = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({
            "idNumber": "8000001",
            "firstNames": "pedro",
            "lastNames": "álvarez",
            "specialty": "matemática",
            "hiredAt": "2015-09-01"
        }),
    );
    assert_eq!(t["teacher"]["state"].as_str(), Some("active"));
    assert_eq!(t["teacher"]["specialty"].as_str(), Some("MATEMÁTICA"));

    let dup = request(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({ "idNumber": "8000001", "firstNames": "A", "lastNames": "B" }),
    );
    assert_eq!(error_code(&dup), "conflict");

    let bad_state = request(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.update",
        json!({ "teacherId": str_at(&t, "teacherId"), "state": "retired" }),
    );
    assert_eq!(error_code(&bad_state), "bad_params");

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.create",
        json!({ "code": "cast1", "name": "castellano" }),
    );
    let dup_code = request(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.create",
        json!({ "code": "CAST1", "name": "Otra" }),
    );
    assert_eq!(error_code(&dup_code), "conflict");

    drop(stdin);
    let _ = child.wait();
}
