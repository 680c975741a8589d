//! School periods, lapses and cut-off windows.
//!
//! All three carry an `ACTIVE|INACTIVE` status and at most one row per table
//! may be `ACTIVE`. The check and the write share one transaction; the
//! partial unique index from `db::open_db` catches anything that slips past.

use crate::grading::{edit_window_open, CutoffWindow};
use crate::ipc::helpers::{
    begin_tx, block_if_referenced, check_date_range, choice, commit_tx, db_err, has_key, now_ts,
    optional_str, parse_date, require_row, required_i64, required_str, today, upper_name,
    with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

const STATUSES: &[&str] = &["ACTIVE", "INACTIVE"];

fn ensure_single_active(
    conn: &Connection,
    table: &str,
    what: &str,
    exclude_id: &str,
) -> Result<(), HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            &format!("SELECT id FROM {} WHERE status = 'ACTIVE' AND id <> ?", table),
            [exclude_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(other) = existing {
        return Err(HandlerErr::conflict(format!("another {} is already ACTIVE", what))
            .with_details(json!({ "existingId": other })));
    }
    Ok(())
}

fn date_param(params: &Value, key: &str, current: &str) -> Result<String, HandlerErr> {
    if has_key(params, key) {
        let raw = required_str(params, key)?;
        Ok(parse_date(&raw, key)?.to_string())
    } else {
        Ok(current.to_string())
    }
}

fn as_date(s: &str) -> Result<NaiveDate, HandlerErr> {
    parse_date(s, "date")
}

// ---------------------------------------------------------------- periods

#[derive(Debug, Clone)]
struct PeriodRow {
    id: String,
    name: String,
    start_date: String,
    end_date: String,
    status: String,
    created_at: String,
}

fn period_from_row(r: &Row<'_>) -> rusqlite::Result<PeriodRow> {
    Ok(PeriodRow {
        id: r.get(0)?,
        name: r.get(1)?,
        start_date: r.get(2)?,
        end_date: r.get(3)?,
        status: r.get(4)?,
        created_at: r.get(5)?,
    })
}

impl PeriodRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "startDate": self.start_date,
            "endDate": self.end_date,
            "status": self.status,
            "createdAt": self.created_at
        })
    }
}

fn load_period(conn: &Connection, id: &str) -> Result<PeriodRow, HandlerErr> {
    conn.query_row(
        "SELECT id, name, start_date, end_date, status, created_at FROM school_periods WHERE id = ?",
        [id],
        period_from_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("school period").with_details(json!({ "schoolPeriodId": id })))
}

fn apply_period(mut row: PeriodRow, params: &Value) -> Result<PeriodRow, HandlerErr> {
    if has_key(params, "name") {
        row.name = upper_name(&required_str(params, "name")?);
    }
    row.start_date = date_param(params, "startDate", &row.start_date)?;
    row.end_date = date_param(params, "endDate", &row.end_date)?;
    if has_key(params, "status") {
        row.status = choice(params, "status", STATUSES, "INACTIVE")?.to_string();
    }
    if row.name.is_empty() || row.start_date.is_empty() || row.end_date.is_empty() {
        return Err(HandlerErr::bad_params("name, startDate and endDate are required"));
    }
    check_date_range(as_date(&row.start_date)?, as_date(&row.end_date)?)?;
    Ok(row)
}

fn periods_list(conn: &Connection, _params: &Value) -> HandlerResult {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, start_date, end_date, status, created_at
             FROM school_periods ORDER BY start_date DESC",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([], period_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "periods": rows.iter().map(PeriodRow::to_json).collect::<Vec<_>>() }))
}

fn periods_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "schoolPeriodId")?;
    Ok(json!({ "period": load_period(conn, &id)?.to_json() }))
}

fn periods_create(conn: &Connection, params: &Value) -> HandlerResult {
    let blank = PeriodRow {
        id: Uuid::new_v4().to_string(),
        name: String::new(),
        start_date: String::new(),
        end_date: String::new(),
        status: "INACTIVE".to_string(),
        created_at: now_ts(),
    };
    let row = apply_period(blank, params)?;
    let tx = begin_tx(conn)?;
    if row.status == "ACTIVE" {
        ensure_single_active(&tx, "school_periods", "school period", &row.id)?;
    }
    tx.execute(
        "INSERT INTO school_periods(id, name, start_date, end_date, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&row.id, &row.name, &row.start_date, &row.end_date, &row.status, &row.created_at),
    )
    .map_err(db_err("db_insert_failed"))?;
    commit_tx(tx)?;
    tracing::info!(period_id = %row.id, status = %row.status, "school period created");
    Ok(json!({ "schoolPeriodId": row.id, "period": row.to_json() }))
}

fn periods_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "schoolPeriodId")?;
    let row = apply_period(load_period(conn, &id)?, params)?;
    let tx = begin_tx(conn)?;
    if row.status == "ACTIVE" {
        ensure_single_active(&tx, "school_periods", "school period", &id)?;
    }
    tx.execute(
        "UPDATE school_periods SET name = ?, start_date = ?, end_date = ?, status = ? WHERE id = ?",
        (&row.name, &row.start_date, &row.end_date, &row.status, &id),
    )
    .map_err(db_err("db_update_failed"))?;
    commit_tx(tx)?;
    Ok(json!({ "period": row.to_json() }))
}

fn periods_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "schoolPeriodId")?;
    load_period(conn, &id)?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM lapses WHERE school_period_id = ?",
        &id,
        "school period has lapses",
    )?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM sections WHERE school_period_id = ?",
        &id,
        "school period has sections",
    )?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM evaluations WHERE school_period_id = ?",
        &id,
        "school period has evaluations",
    )?;
    conn.execute("DELETE FROM school_periods WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed"))?;
    Ok(json!({ "ok": true }))
}

// ---------------------------------------------------------------- lapses

#[derive(Debug, Clone)]
struct LapseRow {
    id: String,
    school_period_id: String,
    number: i64,
    name: String,
    start_date: String,
    end_date: String,
    status: String,
    created_at: String,
}

const LAPSE_COLUMNS: &str =
    "id, school_period_id, number, name, start_date, end_date, status, created_at";

fn lapse_from_row(r: &Row<'_>) -> rusqlite::Result<LapseRow> {
    Ok(LapseRow {
        id: r.get(0)?,
        school_period_id: r.get(1)?,
        number: r.get(2)?,
        name: r.get(3)?,
        start_date: r.get(4)?,
        end_date: r.get(5)?,
        status: r.get(6)?,
        created_at: r.get(7)?,
    })
}

impl LapseRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "schoolPeriodId": self.school_period_id,
            "number": self.number,
            "name": self.name,
            "startDate": self.start_date,
            "endDate": self.end_date,
            "status": self.status,
            "createdAt": self.created_at
        })
    }
}

fn load_lapse(conn: &Connection, id: &str) -> Result<LapseRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM lapses WHERE id = ?", LAPSE_COLUMNS),
        [id],
        lapse_from_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("lapse").with_details(json!({ "lapseId": id })))
}

fn apply_lapse(conn: &Connection, mut row: LapseRow, params: &Value) -> Result<LapseRow, HandlerErr> {
    if has_key(params, "schoolPeriodId") {
        row.school_period_id = required_str(params, "schoolPeriodId")?;
    }
    if has_key(params, "number") {
        row.number = required_i64(params, "number")?;
    }
    if !(1..=3).contains(&row.number) {
        return Err(HandlerErr::bad_params("lapse number must be 1, 2 or 3")
            .with_details(json!({ "number": row.number })));
    }
    if has_key(params, "name") {
        row.name = upper_name(&required_str(params, "name")?);
    }
    if row.name.is_empty() {
        row.name = format!("LAPSO {}", row.number);
    }
    row.start_date = date_param(params, "startDate", &row.start_date)?;
    row.end_date = date_param(params, "endDate", &row.end_date)?;
    if has_key(params, "status") {
        row.status = choice(params, "status", STATUSES, "INACTIVE")?.to_string();
    }
    if row.school_period_id.is_empty() || row.start_date.is_empty() || row.end_date.is_empty() {
        return Err(HandlerErr::bad_params("schoolPeriodId, startDate and endDate are required"));
    }
    let start = as_date(&row.start_date)?;
    let end = as_date(&row.end_date)?;
    check_date_range(start, end)?;

    let period = load_period(conn, &row.school_period_id)?;
    if start < as_date(&period.start_date)? || end > as_date(&period.end_date)? {
        return Err(HandlerErr::bad_params("lapse dates must lie within the school period")
            .with_details(json!({
                "periodStart": period.start_date,
                "periodEnd": period.end_date
            })));
    }
    Ok(row)
}

fn ensure_lapse_number_free(conn: &Connection, row: &LapseRow) -> Result<(), HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM lapses WHERE school_period_id = ? AND number = ? AND id <> ?",
            (&row.school_period_id, row.number, &row.id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    match existing {
        Some(other) => Err(HandlerErr::conflict("lapse number already used in this school period")
            .with_details(json!({ "existingId": other, "number": row.number }))),
        None => Ok(()),
    }
}

fn lapses_list(conn: &Connection, params: &Value) -> HandlerResult {
    let period = optional_str(params, "schoolPeriodId");
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM lapses
             WHERE (?1 IS NULL OR school_period_id = ?1)
             ORDER BY school_period_id, number",
            LAPSE_COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([period], lapse_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "lapses": rows.iter().map(LapseRow::to_json).collect::<Vec<_>>() }))
}

fn lapses_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "lapseId")?;
    Ok(json!({ "lapse": load_lapse(conn, &id)?.to_json() }))
}

fn lapses_create(conn: &Connection, params: &Value) -> HandlerResult {
    let blank = LapseRow {
        id: Uuid::new_v4().to_string(),
        school_period_id: String::new(),
        number: 0,
        name: String::new(),
        start_date: String::new(),
        end_date: String::new(),
        status: "INACTIVE".to_string(),
        created_at: now_ts(),
    };
    let row = apply_lapse(conn, blank, params)?;
    let tx = begin_tx(conn)?;
    ensure_lapse_number_free(&tx, &row)?;
    if row.status == "ACTIVE" {
        ensure_single_active(&tx, "lapses", "lapse", &row.id)?;
    }
    tx.execute(
        "INSERT INTO lapses(id, school_period_id, number, name, start_date, end_date, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &row.id,
            &row.school_period_id,
            row.number,
            &row.name,
            &row.start_date,
            &row.end_date,
            &row.status,
            &row.created_at,
        ),
    )
    .map_err(db_err("db_insert_failed"))?;
    commit_tx(tx)?;
    Ok(json!({ "lapseId": row.id, "lapse": row.to_json() }))
}

fn lapses_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "lapseId")?;
    let row = apply_lapse(conn, load_lapse(conn, &id)?, params)?;
    let tx = begin_tx(conn)?;
    ensure_lapse_number_free(&tx, &row)?;
    if row.status == "ACTIVE" {
        ensure_single_active(&tx, "lapses", "lapse", &id)?;
    }
    tx.execute(
        "UPDATE lapses SET school_period_id = ?, number = ?, name = ?, start_date = ?, end_date = ?,
            status = ?
         WHERE id = ?",
        (
            &row.school_period_id,
            row.number,
            &row.name,
            &row.start_date,
            &row.end_date,
            &row.status,
            &id,
        ),
    )
    .map_err(db_err("db_update_failed"))?;
    commit_tx(tx)?;
    Ok(json!({ "lapse": row.to_json() }))
}

fn lapses_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "lapseId")?;
    load_lapse(conn, &id)?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM evaluations WHERE lapse_id = ?",
        &id,
        "lapse has evaluations",
    )?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM cutoffs WHERE lapse_id = ?",
        &id,
        "lapse has cut-off windows",
    )?;
    conn.execute("DELETE FROM lapses WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed"))?;
    Ok(json!({ "ok": true }))
}

// ---------------------------------------------------------------- cutoffs

#[derive(Debug, Clone)]
struct CutoffRow {
    id: String,
    lapse_id: Option<String>,
    name: String,
    start_date: String,
    end_date: String,
    status: String,
    created_at: String,
}

const CUTOFF_COLUMNS: &str = "id, lapse_id, name, start_date, end_date, status, created_at";

fn cutoff_from_row(r: &Row<'_>) -> rusqlite::Result<CutoffRow> {
    Ok(CutoffRow {
        id: r.get(0)?,
        lapse_id: r.get(1)?,
        name: r.get(2)?,
        start_date: r.get(3)?,
        end_date: r.get(4)?,
        status: r.get(5)?,
        created_at: r.get(6)?,
    })
}

impl CutoffRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "lapseId": self.lapse_id,
            "name": self.name,
            "startDate": self.start_date,
            "endDate": self.end_date,
            "status": self.status,
            "createdAt": self.created_at
        })
    }
}

fn load_cutoff(conn: &Connection, id: &str) -> Result<CutoffRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM cutoffs WHERE id = ?", CUTOFF_COLUMNS),
        [id],
        cutoff_from_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("cut-off window").with_details(json!({ "cutoffId": id })))
}

fn apply_cutoff(conn: &Connection, mut row: CutoffRow, params: &Value) -> Result<CutoffRow, HandlerErr> {
    if has_key(params, "lapseId") {
        row.lapse_id = optional_str(params, "lapseId");
        if let Some(lapse) = row.lapse_id.as_deref() {
            require_row(conn, "lapses", lapse, "lapse")?;
        }
    }
    if has_key(params, "name") {
        row.name = upper_name(&required_str(params, "name")?);
    }
    row.start_date = date_param(params, "startDate", &row.start_date)?;
    row.end_date = date_param(params, "endDate", &row.end_date)?;
    if has_key(params, "status") {
        row.status = choice(params, "status", STATUSES, "INACTIVE")?.to_string();
    }
    if row.name.is_empty() || row.start_date.is_empty() || row.end_date.is_empty() {
        return Err(HandlerErr::bad_params("name, startDate and endDate are required"));
    }
    check_date_range(as_date(&row.start_date)?, as_date(&row.end_date)?)?;
    Ok(row)
}

fn cutoffs_list(conn: &Connection, _params: &Value) -> HandlerResult {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM cutoffs ORDER BY start_date DESC, created_at DESC",
            CUTOFF_COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([], cutoff_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "cutoffs": rows.iter().map(CutoffRow::to_json).collect::<Vec<_>>() }))
}

fn cutoffs_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "cutoffId")?;
    Ok(json!({ "cutoff": load_cutoff(conn, &id)?.to_json() }))
}

fn cutoffs_create(conn: &Connection, params: &Value) -> HandlerResult {
    let blank = CutoffRow {
        id: Uuid::new_v4().to_string(),
        lapse_id: None,
        name: String::new(),
        start_date: String::new(),
        end_date: String::new(),
        status: "INACTIVE".to_string(),
        created_at: now_ts(),
    };
    let row = apply_cutoff(conn, blank, params)?;
    let tx = begin_tx(conn)?;
    if row.status == "ACTIVE" {
        ensure_single_active(&tx, "cutoffs", "cut-off window", &row.id)?;
    }
    tx.execute(
        "INSERT INTO cutoffs(id, lapse_id, name, start_date, end_date, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &row.id,
            row.lapse_id.as_deref(),
            &row.name,
            &row.start_date,
            &row.end_date,
            &row.status,
            &row.created_at,
        ),
    )
    .map_err(db_err("db_insert_failed"))?;
    commit_tx(tx)?;
    tracing::info!(cutoff_id = %row.id, status = %row.status, "cut-off window created");
    Ok(json!({ "cutoffId": row.id, "cutoff": row.to_json() }))
}

fn cutoffs_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "cutoffId")?;
    let row = apply_cutoff(conn, load_cutoff(conn, &id)?, params)?;
    let tx = begin_tx(conn)?;
    if row.status == "ACTIVE" {
        ensure_single_active(&tx, "cutoffs", "cut-off window", &id)?;
    }
    tx.execute(
        "UPDATE cutoffs SET lapse_id = ?, name = ?, start_date = ?, end_date = ?, status = ?
         WHERE id = ?",
        (
            row.lapse_id.as_deref(),
            &row.name,
            &row.start_date,
            &row.end_date,
            &row.status,
            &id,
        ),
    )
    .map_err(db_err("db_update_failed"))?;
    commit_tx(tx)?;
    Ok(json!({ "cutoff": row.to_json() }))
}

fn cutoffs_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "cutoffId")?;
    load_cutoff(conn, &id)?;
    conn.execute("DELETE FROM cutoffs WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed"))?;
    Ok(json!({ "ok": true }))
}

/// The single ACTIVE cut-off window, if any.
pub fn active_cutoff(conn: &Connection) -> Result<Option<CutoffWindow>, HandlerErr> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM cutoffs WHERE status = 'ACTIVE' LIMIT 1", CUTOFF_COLUMNS),
            [],
            cutoff_from_row,
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    match row {
        Some(c) => Ok(Some(CutoffWindow {
            status: c.status,
            start_date: as_date(&c.start_date)?,
            end_date: as_date(&c.end_date)?,
        })),
        None => Ok(None),
    }
}

pub fn grades_editable(conn: &Connection) -> Result<bool, HandlerErr> {
    let window = active_cutoff(conn)?;
    Ok(edit_window_open(window.as_ref(), today()))
}

fn cutoffs_current(conn: &Connection, _params: &Value) -> HandlerResult {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM cutoffs WHERE status = 'ACTIVE' LIMIT 1", CUTOFF_COLUMNS),
            [],
            cutoff_from_row,
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({
        "cutoff": row.as_ref().map(CutoffRow::to_json),
        "today": today().to_string(),
        "editable": grades_editable(conn)?
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "periods.list" => periods_list,
        "periods.get" => periods_get,
        "periods.create" => periods_create,
        "periods.update" => periods_update,
        "periods.delete" => periods_delete,
        "lapses.list" => lapses_list,
        "lapses.get" => lapses_get,
        "lapses.create" => lapses_create,
        "lapses.update" => lapses_update,
        "lapses.delete" => lapses_delete,
        "cutoffs.list" => cutoffs_list,
        "cutoffs.get" => cutoffs_get,
        "cutoffs.create" => cutoffs_create,
        "cutoffs.update" => cutoffs_update,
        "cutoffs.delete" => cutoffs_delete,
        "cutoffs.current" => cutoffs_current,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
