use crate::ipc::helpers::{
    block_if_referenced, db_err, has_key, now_ts, optional_str, required_str, upper_name,
    with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SubjectRow {
    id: String,
    code: String,
    name: String,
    level: Option<String>,
    created_at: String,
}

fn from_row(r: &Row<'_>) -> rusqlite::Result<SubjectRow> {
    Ok(SubjectRow {
        id: r.get(0)?,
        code: r.get(1)?,
        name: r.get(2)?,
        level: r.get(3)?,
        created_at: r.get(4)?,
    })
}

impl SubjectRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "code": self.code,
            "name": self.name,
            "level": self.level,
            "createdAt": self.created_at
        })
    }
}

fn load(conn: &Connection, id: &str) -> Result<SubjectRow, HandlerErr> {
    conn.query_row(
        "SELECT id, code, name, level, created_at FROM subjects WHERE id = ?",
        [id],
        from_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("subject").with_details(json!({ "subjectId": id })))
}

fn check_code_unique(conn: &Connection, code: &str, exclude_id: Option<&str>) -> Result<(), HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM subjects WHERE code = ? AND id <> ?",
            (code, exclude_id.unwrap_or("")),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    match existing {
        Some(other) => Err(HandlerErr::conflict("subject code already exists")
            .with_details(json!({ "code": code, "existingId": other }))),
        None => Ok(()),
    }
}

fn apply_params(mut row: SubjectRow, params: &Value) -> Result<SubjectRow, HandlerErr> {
    if has_key(params, "code") {
        let code = upper_name(&required_str(params, "code")?);
        row.code = code.replace(' ', "-");
    }
    if has_key(params, "name") {
        row.name = upper_name(&required_str(params, "name")?);
    }
    if has_key(params, "level") {
        row.level = optional_str(params, "level").map(|s| upper_name(&s));
    }
    if row.code.is_empty() || row.name.is_empty() {
        return Err(HandlerErr::bad_params("code and name are required"));
    }
    Ok(row)
}

fn subjects_list(conn: &Connection, params: &Value) -> HandlerResult {
    let level = optional_str(params, "level").map(|s| upper_name(&s));
    let mut stmt = conn
        .prepare(
            "SELECT id, code, name, level, created_at FROM subjects
             WHERE (?1 IS NULL OR level = ?1)
             ORDER BY name",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([level], from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "subjects": rows.iter().map(SubjectRow::to_json).collect::<Vec<_>>() }))
}

fn subjects_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "subjectId")?;
    Ok(json!({ "subject": load(conn, &id)?.to_json() }))
}

fn subjects_create(conn: &Connection, params: &Value) -> HandlerResult {
    let blank = SubjectRow {
        id: Uuid::new_v4().to_string(),
        code: String::new(),
        name: String::new(),
        level: None,
        created_at: now_ts(),
    };
    let row = apply_params(blank, params)?;
    check_code_unique(conn, &row.code, None)?;
    conn.execute(
        "INSERT INTO subjects(id, code, name, level, created_at) VALUES(?, ?, ?, ?, ?)",
        (&row.id, &row.code, &row.name, row.level.as_deref(), &row.created_at),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "subjects" }))
    })?;
    Ok(json!({ "subjectId": row.id, "subject": row.to_json() }))
}

fn subjects_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "subjectId")?;
    let row = apply_params(load(conn, &id)?, params)?;
    check_code_unique(conn, &row.code, Some(&id))?;
    conn.execute(
        "UPDATE subjects SET code = ?, name = ?, level = ? WHERE id = ?",
        (&row.code, &row.name, row.level.as_deref(), &id),
    )
    .map_err(db_err("db_update_failed"))?;
    Ok(json!({ "subject": row.to_json() }))
}

fn subjects_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "subjectId")?;
    load(conn, &id)?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM teacher_subject_assignments WHERE subject_id = ?",
        &id,
        "subject is assigned to teachers",
    )?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM evaluations WHERE subject_id = ?",
        &id,
        "subject has evaluations",
    )?;
    conn.execute("DELETE FROM subjects WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "subjects.list" => subjects_list,
        "subjects.get" => subjects_get,
        "subjects.create" => subjects_create,
        "subjects.update" => subjects_update,
        "subjects.delete" => subjects_delete,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
