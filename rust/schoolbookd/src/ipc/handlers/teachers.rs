use crate::ipc::handlers::students::{check_identity_unique, normalize_id_number, ID_TYPES};
use crate::ipc::helpers::{
    block_if_referenced, choice, db_err, has_key, now_ts, optional_date, optional_str,
    required_str, upper_name, with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

pub const TEACHER_STATES: &[&str] = &["active", "inactive"];

#[derive(Debug, Clone)]
pub struct TeacherRow {
    pub id: String,
    pub id_type: String,
    pub id_number: String,
    pub first_names: String,
    pub last_names: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub specialty: Option<String>,
    pub hired_at: Option<String>,
    pub state: String,
    pub created_at: String,
}

const COLUMNS: &str = "id, id_type, id_number, first_names, last_names, email, phone, specialty,
    hired_at, state, created_at";

fn from_row(r: &Row<'_>) -> rusqlite::Result<TeacherRow> {
    Ok(TeacherRow {
        id: r.get(0)?,
        id_type: r.get(1)?,
        id_number: r.get(2)?,
        first_names: r.get(3)?,
        last_names: r.get(4)?,
        email: r.get(5)?,
        phone: r.get(6)?,
        specialty: r.get(7)?,
        hired_at: r.get(8)?,
        state: r.get(9)?,
        created_at: r.get(10)?,
    })
}

impl TeacherRow {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_names, self.last_names)
    }

    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "idType": self.id_type,
            "idNumber": self.id_number,
            "firstNames": self.first_names,
            "lastNames": self.last_names,
            "displayName": self.display_name(),
            "email": self.email,
            "phone": self.phone,
            "specialty": self.specialty,
            "hiredAt": self.hired_at,
            "state": self.state,
            "createdAt": self.created_at
        })
    }
}

pub fn load_teacher(conn: &Connection, teacher_id: &str) -> Result<TeacherRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM teachers WHERE id = ?", COLUMNS),
        [teacher_id],
        from_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("teacher").with_details(json!({ "teacherId": teacher_id })))
}

fn apply_params(mut row: TeacherRow, params: &Value) -> Result<TeacherRow, HandlerErr> {
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
    if has_key(params, "email") {
        row.email = optional_str(params, "email").map(|s| s.to_lowercase());
    }
    if has_key(params, "phone") {
        row.phone = optional_str(params, "phone");
    }
    if has_key(params, "specialty") {
        row.specialty = optional_str(params, "specialty").map(|s| upper_name(&s));
    }
    if has_key(params, "hiredAt") {
        row.hired_at = optional_date(params, "hiredAt")?.map(|d| d.to_string());
    }
    if has_key(params, "state") {
        row.state = choice(params, "state", TEACHER_STATES, "active")?.to_string();
    }
    if row.id_number.is_empty() || row.first_names.is_empty() || row.last_names.is_empty() {
        return Err(HandlerErr::bad_params("idNumber, firstNames and lastNames are required"));
    }
    Ok(row)
}

fn teachers_list(conn: &Connection, params: &Value) -> HandlerResult {
    let state = match optional_str(params, "state") {
        Some(_) => Some(choice(params, "state", TEACHER_STATES, "active")?),
        None => None,
    };
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM teachers
             WHERE (?1 IS NULL OR state = ?1)
             ORDER BY last_names, first_names",
            COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    let teachers = stmt
        .query_map([state], from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "teachers": teachers.iter().map(TeacherRow::to_json).collect::<Vec<_>>() }))
}

fn teachers_get(conn: &Connection, params: &Value) -> HandlerResult {
    let teacher_id = required_str(params, "teacherId")?;
    let teacher = load_teacher(conn, &teacher_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.subject_id, sub.name, a.section_id, s.level, s.label, a.school_period_id, a.state
             FROM teacher_subject_assignments a
             JOIN subjects sub ON sub.id = a.subject_id
             JOIN sections s ON s.id = a.section_id
             WHERE a.teacher_id = ?
             ORDER BY s.level, s.label, sub.name",
        )
        .map_err(db_err("db_query_failed"))?;
    let subjects = stmt
        .query_map([&teacher_id], |r| {
            Ok(json!({
                "assignmentId": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "subjectName": r.get::<_, String>(2)?,
                "sectionId": r.get::<_, String>(3)?,
                "level": r.get::<_, String>(4)?,
                "label": r.get::<_, String>(5)?,
                "schoolPeriodId": r.get::<_, String>(6)?,
                "state": r.get::<_, String>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "teacher": teacher.to_json(), "subjectAssignments": subjects }))
}

fn teachers_create(conn: &Connection, params: &Value) -> HandlerResult {
    let blank = TeacherRow {
        id: Uuid::new_v4().to_string(),
        id_type: "V".to_string(),
        id_number: String::new(),
        first_names: String::new(),
        last_names: String::new(),
        email: None,
        phone: None,
        specialty: None,
        hired_at: None,
        state: "active".to_string(),
        created_at: now_ts(),
    };
    let row = apply_params(blank, params)?;
    check_identity_unique(conn, "teachers", &row.id_number, None)?;
    conn.execute(
        "INSERT INTO teachers(id, id_type, id_number, first_names, last_names, email, phone,
            specialty, hired_at, state, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &row.id,
            &row.id_type,
            &row.id_number,
            &row.first_names,
            &row.last_names,
            row.email.as_deref(),
            row.phone.as_deref(),
            row.specialty.as_deref(),
            row.hired_at.as_deref(),
            &row.state,
            &row.created_at,
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "teachers" }))
    })?;
    tracing::info!(teacher_id = %row.id, "teacher created");
    Ok(json!({ "teacherId": row.id, "teacher": row.to_json() }))
}

fn teachers_update(conn: &Connection, params: &Value) -> HandlerResult {
    let teacher_id = required_str(params, "teacherId")?;
    let row = apply_params(load_teacher(conn, &teacher_id)?, params)?;
    check_identity_unique(conn, "teachers", &row.id_number, Some(&teacher_id))?;
    conn.execute(
        "UPDATE teachers SET id_type = ?, id_number = ?, first_names = ?, last_names = ?,
            email = ?, phone = ?, specialty = ?, hired_at = ?, state = ?, updated_at = ?
         WHERE id = ?",
        (
            &row.id_type,
            &row.id_number,
            &row.first_names,
            &row.last_names,
            row.email.as_deref(),
            row.phone.as_deref(),
            row.specialty.as_deref(),
            row.hired_at.as_deref(),
            &row.state,
            now_ts(),
            &teacher_id,
        ),
    )
    .map_err(db_err("db_update_failed"))?;
    Ok(json!({ "teacher": row.to_json() }))
}

fn teachers_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let teacher_id = required_str(params, "teacherId")?;
    load_teacher(conn, &teacher_id)?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM teacher_subject_assignments WHERE teacher_id = ?",
        &teacher_id,
        "teacher has subject assignments",
    )?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM teacher_grade_assignments WHERE teacher_id = ?",
        &teacher_id,
        "teacher has guide assignments",
    )?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM sections WHERE guide_teacher_id = ?",
        &teacher_id,
        "teacher is the guide of a section",
    )?;
    conn.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id])
        .map_err(db_err("db_delete_failed"))?;
    tracing::info!(teacher_id = %teacher_id, "teacher deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "teachers.list" => teachers_list,
        "teachers.get" => teachers_get,
        "teachers.create" => teachers_create,
        "teachers.update" => teachers_update,
        "teachers.delete" => teachers_delete,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
