use crate::ipc::handlers::students::{check_identity_unique, normalize_id_number, ID_TYPES};
use crate::ipc::helpers::{
    block_if_referenced, choice, db_err, has_key, now_ts, optional_str, required_str, upper_name,
    with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct RepresentativeRow {
    id: String,
    id_type: String,
    id_number: String,
    first_names: String,
    last_names: String,
    relationship: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    address: Option<String>,
    created_at: String,
}

const COLUMNS: &str =
    "id, id_type, id_number, first_names, last_names, relationship, phone, email, address, created_at";

fn from_row(r: &Row<'_>) -> rusqlite::Result<RepresentativeRow> {
    Ok(RepresentativeRow {
        id: r.get(0)?,
        id_type: r.get(1)?,
        id_number: r.get(2)?,
        first_names: r.get(3)?,
        last_names: r.get(4)?,
        relationship: r.get(5)?,
        phone: r.get(6)?,
        email: r.get(7)?,
        address: r.get(8)?,
        created_at: r.get(9)?,
    })
}

impl RepresentativeRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "idType": self.id_type,
            "idNumber": self.id_number,
            "firstNames": self.first_names,
            "lastNames": self.last_names,
            "relationship": self.relationship,
            "phone": self.phone,
            "email": self.email,
            "address": self.address,
            "createdAt": self.created_at
        })
    }
}

fn load(conn: &Connection, id: &str) -> Result<RepresentativeRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM representatives WHERE id = ?", COLUMNS),
        [id],
        from_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("representative"))
}

fn apply_params(mut row: RepresentativeRow, params: &Value) -> Result<RepresentativeRow, HandlerErr> {
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
    if has_key(params, "relationship") {
        row.relationship = optional_str(params, "relationship").map(|s| upper_name(&s));
    }
    if has_key(params, "phone") {
        row.phone = optional_str(params, "phone");
    }
    if has_key(params, "email") {
        row.email = optional_str(params, "email").map(|s| s.to_lowercase());
        if let Some(e) = row.email.as_deref() {
            if !e.contains('@') {
                return Err(HandlerErr::bad_params("email is not valid"));
            }
        }
    }
    if has_key(params, "address") {
        row.address = optional_str(params, "address");
    }
    if row.id_number.is_empty() || row.first_names.is_empty() || row.last_names.is_empty() {
        return Err(HandlerErr::bad_params("idNumber, firstNames and lastNames are required"));
    }
    Ok(row)
}

fn representatives_list(conn: &Connection, _params: &Value) -> HandlerResult {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {}, (SELECT COUNT(*) FROM students s WHERE s.representative_id = r.id)
             FROM representatives r
             ORDER BY last_names, first_names",
            COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([], |r| {
            let rep = from_row(r)?;
            let student_count: i64 = r.get(10)?;
            let mut v = rep.to_json();
            v["studentCount"] = json!(student_count);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "representatives": rows }))
}

fn representatives_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "representativeId")?;
    let rep = load(conn, &id)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, last_names, first_names FROM students
             WHERE representative_id = ? ORDER BY last_names, first_names",
        )
        .map_err(db_err("db_query_failed"))?;
    let students = stmt
        .query_map([&id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(json!({ "id": r.get::<_, String>(0)?, "displayName": format!("{}, {}", last, first) }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "representative": rep.to_json(), "students": students }))
}

fn representatives_create(conn: &Connection, params: &Value) -> HandlerResult {
    let blank = RepresentativeRow {
        id: Uuid::new_v4().to_string(),
        id_type: "V".to_string(),
        id_number: String::new(),
        first_names: String::new(),
        last_names: String::new(),
        relationship: None,
        phone: None,
        email: None,
        address: None,
        created_at: now_ts(),
    };
    let row = apply_params(blank, params)?;
    check_identity_unique(conn, "representatives", &row.id_number, None)?;
    conn.execute(
        "INSERT INTO representatives(id, id_type, id_number, first_names, last_names,
            relationship, phone, email, address, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &row.id,
            &row.id_type,
            &row.id_number,
            &row.first_names,
            &row.last_names,
            row.relationship.as_deref(),
            row.phone.as_deref(),
            row.email.as_deref(),
            row.address.as_deref(),
            &row.created_at,
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "representatives" }))
    })?;
    Ok(json!({ "representativeId": row.id, "representative": row.to_json() }))
}

fn representatives_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "representativeId")?;
    let row = apply_params(load(conn, &id)?, params)?;
    check_identity_unique(conn, "representatives", &row.id_number, Some(&id))?;
    conn.execute(
        "UPDATE representatives SET id_type = ?, id_number = ?, first_names = ?, last_names = ?,
            relationship = ?, phone = ?, email = ?, address = ?, updated_at = ?
         WHERE id = ?",
        (
            &row.id_type,
            &row.id_number,
            &row.first_names,
            &row.last_names,
            row.relationship.as_deref(),
            row.phone.as_deref(),
            row.email.as_deref(),
            row.address.as_deref(),
            now_ts(),
            &id,
        ),
    )
    .map_err(db_err("db_update_failed"))?;
    Ok(json!({ "representative": row.to_json() }))
}

fn representatives_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "representativeId")?;
    load(conn, &id)?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM students WHERE representative_id = ?",
        &id,
        "representative still has linked students",
    )?;
    conn.execute("DELETE FROM representatives WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed"))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "representatives.list" => representatives_list,
        "representatives.get" => representatives_get,
        "representatives.create" => representatives_create,
        "representatives.update" => representatives_update,
        "representatives.delete" => representatives_delete,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
