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

fn enroll(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    student_id: &str,
    section_id: &str,
) {
    request_ok(
        stdin,
        reader,
        &format!("enroll-{}", student_id),
        "enrollments.enroll",
        json!({ "studentId": student_id, "sectionId": section_id }),
    );
}

#[test]
fn grade_sheet_weighted_final_and_audited_updates() {
    let workspace = temp_dir("schoolbook-grades");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader);
    let rojas = create_student(&mut stdin, &mut reader, "30111222", "Luis", "Rojas");
    let blanco = create_student(&mut stdin, &mut reader, "30333444", "María", "Blanco");
    enroll(&mut stdin, &mut reader, &rojas, &school.section_id);
    enroll(&mut stdin, &mut reader, &blanco, &school.section_id);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "evaluations.create",
        json!({
            "name": "Examen",
            "subjectId": school.subject_id,
            "sectionId": school.section_id,
            "lapseId": school.lapse_id,
            "date": "2025-10-10",
            "percentage": 25,
            "criteria": [
                { "number": 1, "name": "Desarrollo", "weight": 10 },
                { "number": 2, "name": "Resultado", "weight": 10 }
            ]
        }),
    );
    let evaluation_id = str_at(&created, "evaluationId").to_string();

    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.open",
        json!({ "evaluationId": evaluation_id }),
    );
    let rows = sheet["rows"].as_array().cloned().expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["displayName"].as_str(), Some("BLANCO, MARÍA"));
    assert_eq!(rows[0]["hasRecord"].as_bool(), Some(false));
    assert_eq!(rows[0]["scores"]["1"].as_f64(), Some(0.0));
    assert_eq!(rows[0]["scores"]["2"].as_f64(), Some(0.0));
    assert_eq!(rows[0]["finalScore"].as_f64(), Some(0.0));
    assert_eq!(sheet["editable"].as_bool(), Some(false));

    let stranger = create_student(&mut stdin, &mut reader, "30555666", "Pedro", "Díaz");
    let not_enrolled = request(
        &mut stdin,
        &mut reader,
        "4",
        "grades.save",
        json!({ "evaluationId": evaluation_id, "grades": [
            { "studentId": stranger, "scores": { "1": 10 } }
        ] }),
    );
    assert_eq!(error_code(&not_enrolled), "bad_params");

    let out_of_range = request(
        &mut stdin,
        &mut reader,
        "5",
        "grades.save",
        json!({ "evaluationId": evaluation_id, "grades": [
            { "studentId": rojas, "scores": { "1": 21 } }
        ] }),
    );
    assert_eq!(error_code(&out_of_range), "bad_params");

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.save",
        json!({ "evaluationId": evaluation_id, "grades": [
            { "studentId": rojas, "scores": { "1": 8, "2": 6 } }
        ] }),
    );
    assert_eq!(saved["saved"].as_i64(), Some(1));
    assert_eq!(saved["status"].as_str(), Some("pending"));
    assert_eq!(saved["grades"][0]["finalScore"].as_f64(), Some(7.0));
    let grade_id = saved["grades"][0]["gradeId"].as_str().expect("gradeId").to_string();

    let again = request(
        &mut stdin,
        &mut reader,
        "7",
        "grades.save",
        json!({ "evaluationId": evaluation_id, "grades": [
            { "studentId": rojas, "scores": { "1": 20, "2": 20 } }
        ] }),
    );
    assert_eq!(error_code(&again), "conflict");

    let completed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.save",
        json!({ "evaluationId": evaluation_id, "grades": [
            { "studentId": blanco, "scores": [
                { "number": 1, "score": 20 },
                { "number": 2, "score": 20 }
            ] }
        ] }),
    );
    assert_eq!(completed["status"].as_str(), Some("graded"));
    assert_eq!(completed["grades"][0]["finalScore"].as_f64(), Some(20.0));

    let no_reason = request(
        &mut stdin,
        &mut reader,
        "9",
        "grades.update",
        json!({ "gradeId": grade_id, "scores": { "1": 10, "2": 10 }, "reason": "   " }),
    );
    assert_eq!(error_code(&no_reason), "bad_params");

    let closed = request(
        &mut stdin,
        &mut reader,
        "10",
        "grades.update",
        json!({ "gradeId": grade_id, "scores": { "1": 10, "2": 10 }, "reason": "revisión" }),
    );
    assert_eq!(error_code(&closed), "edit_window_closed");

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.history",
        json!({ "gradeId": grade_id }),
    );
    assert_eq!(history["history"].as_array().map(|a| a.len()), Some(0));

    request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "cutoffs.create",
        json!({
            "name": "Corte abierto",
            "startDate": "2000-01-01",
            "endDate": "2099-12-31",
            "status": "ACTIVE"
        }),
    );

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "grades.update",
        json!({
            "gradeId": grade_id,
            "scores": { "1": 10, "2": 10 },
            "reason": "revisión de examen",
            "actor": "coordinación"
        }),
    );
    assert_eq!(updated["oldScore"].as_f64(), Some(7.0));
    assert_eq!(updated["finalScore"].as_f64(), Some(10.0));

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "grades.history",
        json!({ "gradeId": grade_id }),
    );
    let entries = history["history"].as_array().cloned().expect("history");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["oldScore"].as_f64(), Some(7.0));
    assert_eq!(entries[0]["newScore"].as_f64(), Some(10.0));
    assert_eq!(entries[0]["reason"].as_str(), Some("revisión de examen"));
    assert_eq!(entries[0]["actor"].as_str(), Some("coordinación"));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "grades.lapseSummary",
        json!({
            "sectionId": school.section_id,
            "subjectId": school.subject_id,
            "lapseId": school.lapse_id
        }),
    );
    assert_eq!(summary["percentageTotal"].as_f64(), Some(25.0));
    let rows = summary["rows"].as_array().cloned().expect("rows");
    assert_eq!(rows.len(), 2);
    let lapse_of = |id: &str| {
        rows.iter()
            .find(|r| r["studentId"].as_str() == Some(id))
            .and_then(|r| r["lapseGrade"].as_f64())
    };
    assert_eq!(lapse_of(&rojas), Some(2.5));
    assert_eq!(lapse_of(&blanco), Some(5.0));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn roster_changes_move_evaluation_status() {
    let workspace = temp_dir("schoolbook-grades-roster");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = seed_school(&mut stdin, &mut reader);
    let rojas = create_student(&mut stdin, &mut reader, "30111222", "Luis", "Rojas");
    let blanco = create_student(&mut stdin, &mut reader, "30333444", "María", "Blanco");
    enroll(&mut stdin, &mut reader, &rojas, &school.section_id);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "evaluations.create",
        json!({
            "name": "Quiz",
            "subjectId": school.subject_id,
            "sectionId": school.section_id,
            "lapseId": school.lapse_id,
            "date": "2025-10-10",
            "percentage": 10
        }),
    );
    let evaluation_id = str_at(&created, "evaluationId").to_string();
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.save",
        json!({ "evaluationId": evaluation_id, "grades": [
            { "studentId": rojas, "scores": { "1": 15 } }
        ] }),
    );
    assert_eq!(saved["status"].as_str(), Some("graded"));

    let joined = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollments.enroll",
        json!({ "studentId": blanco, "sectionId": school.section_id }),
    );
    let blanco_enrollment = str_at(&joined, "enrollmentId").to_string();
    let after_join = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "evaluations.get",
        json!({ "evaluationId": evaluation_id }),
    );
    assert_eq!(after_join["evaluation"]["status"].as_str(), Some("pending"));

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "enrollments.withdraw",
        json!({ "enrollmentId": blanco_enrollment }),
    );
    let after_leave = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "evaluations.get",
        json!({ "evaluationId": evaluation_id }),
    );
    assert_eq!(after_leave["evaluation"]["status"].as_str(), Some("graded"));

    drop(stdin);
    let _ = child.wait();
}
