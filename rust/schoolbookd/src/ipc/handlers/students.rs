use crate::ipc::helpers::{
    block_if_referenced, choice, db_err, has_key, now_ts, optional_date, optional_str,
    require_row, required_str, today, upper_name, with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

pub const ID_TYPES: &[&str] = &["V", "E", "P", "CE"];
const SEXES: &[&str] = &["M", "F"];

#[derive(Debug, Clone)]
struct StudentRow {
    id: String,
    id_type: String,
    id_number: String,
    first_names: String,
    last_names: String,
    birth_date: Option<String>,
    birth_place: Option<String>,
    sex: Option<String>,
    representative_id: Option<String>,
    created_at: String,
    updated_at: Option<String>,
}

const STUDENT_COLUMNS: &str = "id, id_type, id_number, first_names, last_names, birth_date,
    birth_place, sex, representative_id, created_at, updated_at";

fn student_from_row(r: &Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok(StudentRow {
        id: r.get(0)?,
        id_type: r.get(1)?,
        id_number: r.get(2)?,
        first_names: r.get(3)?,
        last_names: r.get(4)?,
        birth_date: r.get(5)?,
        birth_place: r.get(6)?,
        sex: r.get(7)?,
        representative_id: r.get(8)?,
        created_at: r.get(9)?,
        updated_at: r.get(10)?,
    })
}

impl StudentRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "idType": self.id_type,
            "idNumber": self.id_number,
            "firstNames": self.first_names,
            "lastNames": self.last_names,
            "displayName": format!("{}, {}", self.last_names, self.first_names),
            "birthDate": self.birth_date,
            "birthPlace": self.birth_place,
            "sex": self.sex,
            "representativeId": self.representative_id,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at
        })
    }
}

fn load_student(conn: &Connection, student_id: &str) -> Result<StudentRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS),
        [student_id],
        student_from_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("student").with_details(json!({ "studentId": student_id })))
}

/// Identity numbers are unique across all students; `exclude_id` is the
/// record being edited.
pub fn check_identity_unique(
    conn: &Connection,
    table: &str,
    id_number: &str,
    exclude_id: Option<&str>,
) -> Result<(), HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            &format!("SELECT id FROM {} WHERE id_number = ? AND id <> ?", table),
            (id_number, exclude_id.unwrap_or("")),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(other) = existing {
        return Err(HandlerErr::conflict("identity number already registered")
            .with_details(json!({ "idNumber": id_number, "existingId": other })));
    }
    Ok(())
}

pub fn normalize_id_number(raw: &str) -> Result<String, HandlerErr> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '.' && *c != '-')
        .collect::<String>()
        .to_uppercase();
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(HandlerErr::bad_params("idNumber must be alphanumeric")
            .with_details(json!({ "idNumber": raw })));
    }
    Ok(cleaned)
}

/// Applies the provided params over `row`. Missing keys keep their current
/// value; an explicit empty string or null clears optional fields.
fn apply_params(conn: &Connection, mut row: StudentRow, params: &Value) -> Result<StudentRow, HandlerErr> {
    if has_key(params, "idType") {
        row.id_type = choice(params, "idType", ID_TYPES, "V")?.to_string();
    }
    if has_key(params, "idNumber") {
        row.id_number = normalize_id_number(&required_str(params, "idNumber")?)?;
    }
    if has_key(params, "firstNames") {
        row.first_names = upper_name(&required_str(params, "firstNames")?);
    }
    if has_key(params, "lastNames") {
        row.last_names = upper_name(&required_str(params, "lastNames")?);
    }
    if has_key(params, "birthDate") {
        let d = optional_date(params, "birthDate")?;
        if let Some(d) = d {
            if d > today() {
                return Err(HandlerErr::bad_params("birthDate must not be in the future"));
            }
        }
        row.birth_date = d.map(|d| d.to_string());
    }
    if has_key(params, "birthPlace") {
        row.birth_place = optional_str(params, "birthPlace").map(|s| upper_name(&s));
    }
    if has_key(params, "sex") {
        row.sex = match optional_str(params, "sex") {
            Some(_) => Some(choice(params, "sex", SEXES, "M")?.to_string()),
            None => None,
        };
    }
    if has_key(params, "representativeId") {
        row.representative_id = optional_str(params, "representativeId");
        if let Some(rep) = row.representative_id.as_deref() {
            require_row(conn, "representatives", rep, "representative")?;
        }
    }

    if row.id_number.is_empty() {
        return Err(HandlerErr::bad_params("missing idNumber"));
    }
    if row.first_names.is_empty() || row.last_names.is_empty() {
        return Err(HandlerErr::bad_params("firstNames and lastNames are required"));
    }
    Ok(row)
}

fn students_list(conn: &Connection, params: &Value) -> HandlerResult {
    let search = optional_str(params, "search").map(|s| format!("%{}%", s.to_uppercase()));
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM students
             WHERE (?1 IS NULL OR id_number LIKE ?1 OR first_names LIKE ?1 OR last_names LIKE ?1)
             ORDER BY last_names, first_names",
            STUDENT_COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    let students = stmt
        .query_map([search], student_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "students": students.iter().map(StudentRow::to_json).collect::<Vec<_>>() }))
}

fn students_get(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_str(params, "studentId")?;
    let student = load_student(conn, &student_id)?;
    let current = current_enrollment(conn, &student_id)?;
    Ok(json!({ "student": student.to_json(), "currentEnrollment": current }))
}

fn students_create(conn: &Connection, params: &Value) -> HandlerResult {
    let blank = StudentRow {
        id: Uuid::new_v4().to_string(),
        id_type: "V".to_string(),
        id_number: String::new(),
        first_names: String::new(),
        last_names: String::new(),
        birth_date: None,
        birth_place: None,
        sex: None,
        representative_id: None,
        created_at: now_ts(),
        updated_at: None,
    };
    let row = apply_params(conn, blank, params)?;
    check_identity_unique(conn, "students", &row.id_number, None)?;

    conn.execute(
        "INSERT INTO students(id, id_type, id_number, first_names, last_names, birth_date,
            birth_place, sex, representative_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &row.id,
            &row.id_type,
            &row.id_number,
            &row.first_names,
            &row.last_names,
            row.birth_date.as_deref(),
            row.birth_place.as_deref(),
            row.sex.as_deref(),
            row.representative_id.as_deref(),
            &row.created_at,
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "students" }))
    })?;
    tracing::info!(student_id = %row.id, "student created");
    Ok(json!({ "studentId": row.id, "student": row.to_json() }))
}

fn students_update(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_str(params, "studentId")?;
    let existing = load_student(conn, &student_id)?;
    let mut row = apply_params(conn, existing, params)?;
    check_identity_unique(conn, "students", &row.id_number, Some(&student_id))?;
    row.updated_at = Some(now_ts());

    conn.execute(
        "UPDATE students SET id_type = ?, id_number = ?, first_names = ?, last_names = ?,
            birth_date = ?, birth_place = ?, sex = ?, representative_id = ?, updated_at = ?
         WHERE id = ?",
        (
            &row.id_type,
            &row.id_number,
            &row.first_names,
            &row.last_names,
            row.birth_date.as_deref(),
            row.birth_place.as_deref(),
            row.sex.as_deref(),
            row.representative_id.as_deref(),
            row.updated_at.as_deref(),
            &student_id,
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_update_failed", e.to_string()).with_details(json!({ "table": "students" }))
    })?;
    Ok(json!({ "student": row.to_json() }))
}

fn students_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_str(params, "studentId")?;
    let student = load_student(conn, &student_id)?;
    if let Some(rep) = student.representative_id.as_deref() {
        return Err(HandlerErr::conflict("student has a linked representative; unlink it first")
            .with_details(json!({ "representativeId": rep })));
    }
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM enrollments WHERE student_id = ?",
        &student_id,
        "student has enrollment records",
    )?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM grades WHERE student_id = ?",
        &student_id,
        "student has grade records",
    )?;

    conn.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": "students" }))
        })?;
    tracing::info!(student_id = %student_id, "student deleted");
    Ok(json!({ "ok": true }))
}

fn students_link_representative(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_str(params, "studentId")?;
    let representative_id = required_str(params, "representativeId")?;
    load_student(conn, &student_id)?;
    require_row(conn, "representatives", &representative_id, "representative")?;
    conn.execute(
        "UPDATE students SET representative_id = ?, updated_at = ? WHERE id = ?",
        (&representative_id, now_ts(), &student_id),
    )
    .map_err(db_err("db_update_failed"))?;
    Ok(json!({ "ok": true }))
}

fn students_unlink_representative(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_str(params, "studentId")?;
    load_student(conn, &student_id)?;
    conn.execute(
        "UPDATE students SET representative_id = NULL, updated_at = ? WHERE id = ?",
        (now_ts(), &student_id),
    )
    .map_err(db_err("db_update_failed"))?;
    Ok(json!({ "ok": true }))
}

/// The student's current placement: the active enrollment if there is one,
/// otherwise the most recent one.
pub fn current_enrollment(conn: &Connection, student_id: &str) -> Result<Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT e.id, e.section_id, e.school_period_id, e.status, e.enrolled_at, e.withdrawn_at,
                    s.level, s.label, p.name
             FROM enrollments e
             JOIN sections s ON s.id = e.section_id
             JOIN school_periods p ON p.id = e.school_period_id
             WHERE e.student_id = ?
             ORDER BY CASE e.status WHEN 'active' THEN 0 ELSE 1 END,
                      e.enrolled_at DESC,
                      e.rowid DESC
             LIMIT 1",
            [student_id],
            |r| {
                Ok(json!({
                    "enrollmentId": r.get::<_, String>(0)?,
                    "sectionId": r.get::<_, String>(1)?,
                    "schoolPeriodId": r.get::<_, String>(2)?,
                    "status": r.get::<_, String>(3)?,
                    "enrolledAt": r.get::<_, String>(4)?,
                    "withdrawnAt": r.get::<_, Option<String>>(5)?,
                    "level": r.get::<_, String>(6)?,
                    "label": r.get::<_, String>(7)?,
                    "periodName": r.get::<_, String>(8)?
                }))
            },
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    Ok(row.unwrap_or(Value::Null))
}

fn students_current_section(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_str(params, "studentId")?;
    load_student(conn, &student_id)?;
    Ok(json!({ "current": current_enrollment(conn, &student_id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "students.list" => students_list,
        "students.get" => students_get,
        "students.create" => students_create,
        "students.update" => students_update,
        "students.delete" => students_delete,
        "students.linkRepresentative" => students_link_representative,
        "students.unlinkRepresentative" => students_unlink_representative,
        "students.currentSection" => students_current_section,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
