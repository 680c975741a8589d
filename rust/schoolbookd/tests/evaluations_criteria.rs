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


#[allow(dead_code)]
struct School {
    period_id: String,
    lapse_id: String,
    section_id: String,
    subject_id: String,
    teacher_id: String,
}

fn seed_school(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> School {
    let period = request_ok(
        stdin,
        reader,
        "seed-period",
        "periods.create",
        json!({
            "name": "2025-2026",
            "startDate": "2025-09-15",
            "endDate": "2026-07-15",
            "status": "ACTIVE"
        }),
    );
    let period_id = str_at(&period, "schoolPeriodId").to_string();
    let lapse = request_ok(
        stdin,
        reader,
        "seed-lapse",
        "lapses.create",
        json!({
            "schoolPeriodId": period_id,
            "number": 1,
            "startDate": "2025-09-15",
            "endDate": "2025-12-15"
        }),
    );
    let section = request_ok(
        stdin,
        reader,
        "seed-section",
        "sections.create",
        json!({ "schoolPeriodId": period_id, "level": "1er año", "label": "A", "capacity": 30 }),
    );
    let subject = request_ok(
        stdin,
        reader,
        "seed-subject",
        "subjects.create",
        json!({ "code": "MAT1", "name": "Matemática" }),
    );
    let teacher = request_ok(
        stdin,
        reader,
        "seed-teacher",
        "teachers.create",
        json!({ "idNumber": "9000001", "firstNames": "Ana", "lastNames": "Pérez" }),
    );
    School {
        lapse_id: str_at(&lapse, "lapseId").to_string(),
        section_id: str_at(&section, "sectionId").to_string(),
        subject_id: str_at(&subject, "subjectId").to_string(),
        teacher_id: str_at(&teacher, "teacherId").to_string(),
        period_id,
    }
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

fn create_evaluation(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    school: &School,
    extra: serde_json::Value,
) -> serde_json::Value {
    let mut params = json!({
        "name": "Prueba corta",
        "subjectId": school.subject_id,
        "sectionId": school.section_id,
        "lapseId": school.lapse_id,
        "date": "2025-10-01",
        "percentage": 20
    });
    if let (Some(base), Some(more)) = (params.as_object_mut(), extra.as_object()) {
        for (k, v) in more {
            base.insert(k.clone(), v.clone());
        }
    }
    request(stdin, reader, id, "evaluations.create", params)
}

#[test]
fn evaluation_without_criteria_gets_a_single_general_criterion() {
    let workspace = temp_dir("schoolbook-eval-default");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader);

    let created = create_evaluation(&mut stdin, &mut reader, "2", &school, json!({}));
    assert_eq!(created["ok"].as_bool(), Some(true), "{}", created);
    let criteria = created["result"]["evaluation"]["criteria"]
        .as_array()
        .cloned()
        .expect("criteria");
    assert_eq!(criteria.len(), 1);
    assert_eq!(criteria[0]["number"].as_i64(), Some(1));
    assert_eq!(criteria[0]["name"].as_str(), Some("GENERAL"));
    assert_eq!(criteria[0]["weight"].as_f64(), Some(20.0));
    assert_eq!(created["result"]["evaluation"]["name"].as_str(), Some("PRUEBA CORTA"));
    assert_eq!(created["result"]["evaluation"]["status"].as_str(), Some("pending"));

    let empty_list = create_evaluation(
        &mut stdin,
        &mut reader,
        "3",
        &school,
        json!({ "date": "2025-10-02", "criteria": [] }),
    );
    assert_eq!(
        empty_list["result"]["evaluation"]["criteria"][0]["name"].as_str(),
        Some("GENERAL")
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn custom_criteria_must_total_twenty_and_lock_after_grading() {
    let workspace = temp_dir("schoolbook-eval-criteria");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader);

    let short = create_evaluation(
        &mut stdin,
        &mut reader,
        "2",
        &school,
        json!({ "criteria": [
            { "number": 1, "name": "Orden", "weight": 10 },
            { "number": 2, "name": "Contenido", "weight": 5 }
        ] }),
    );
    assert_eq!(error_code(&short), "bad_params");

    let created = create_evaluation(
        &mut stdin,
        &mut reader,
        "3",
        &school,
        json!({ "criteria": [
            { "number": 2, "name": "contenido", "weight": 10 },
            { "number": 1, "name": "orden", "weight": 10 }
        ] }),
    );
    assert_eq!(created["ok"].as_bool(), Some(true), "{}", created);
    let evaluation_id = created["result"]["evaluationId"].as_str().expect("id").to_string();
    let criteria = &created["result"]["evaluation"]["criteria"];
    assert_eq!(criteria[0]["number"].as_i64(), Some(1));
    assert_eq!(criteria[1]["name"].as_str(), Some("CONTENIDO"));

    let same_day = create_evaluation(&mut stdin, &mut reader, "4", &school, json!({ "name": "Otra" }));
    assert_eq!(error_code(&same_day), "conflict");

    let over_budget = create_evaluation(
        &mut stdin,
        &mut reader,
        "5",
        &school,
        json!({ "date": "2025-10-20", "percentage": 85 }),
    );
    assert_eq!(error_code(&over_budget), "conflict");

    let outside_lapse_period = create_evaluation(
        &mut stdin,
        &mut reader,
        "6",
        &school,
        json!({ "date": "2025-10-21", "lapseId": "missing-lapse" }),
    );
    assert_eq!(error_code(&outside_lapse_period), "not_found");

    // Criteria may still change while nothing is graded.
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "evaluations.update",
        json!({ "evaluationId": evaluation_id, "criteria": [
            { "number": 1, "name": "Orden", "weight": 5 },
            { "number": 2, "name": "Contenido", "weight": 15 }
        ] }),
    );

    let student_id = create_student(&mut stdin, &mut reader, "30111222", "Luis", "Rojas");
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "enrollments.enroll",
        json!({ "studentId": student_id, "sectionId": school.section_id }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.save",
        json!({ "evaluationId": evaluation_id, "grades": [
            { "studentId": student_id, "scores": { "1": 20, "2": 20 } }
        ] }),
    );

    let locked = request(
        &mut stdin,
        &mut reader,
        "10",
        "evaluations.update",
        json!({ "evaluationId": evaluation_id, "criteria": [] }),
    );
    assert_eq!(error_code(&locked), "conflict");

    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "evaluations.update",
        json!({ "evaluationId": evaluation_id, "name": "Taller" }),
    );
    assert_eq!(renamed["evaluation"]["name"].as_str(), Some("TALLER"));
    assert_eq!(renamed["evaluation"]["status"].as_str(), Some("graded"));

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "evaluations.delete",
        json!({ "evaluationId": evaluation_id }),
    );
    assert_eq!(deleted["gradesRemoved"].as_i64(), Some(1));

    drop(stdin);
    let _ = child.wait();
}
