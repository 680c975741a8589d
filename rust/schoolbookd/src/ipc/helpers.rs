use crate::grading::GradingError;
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

pub type HandlerResult = Result<Value, HandlerErr>;

pub fn ok(id: &str, result: Value) -> Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(id: &str, code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

#[derive(Debug)]
pub struct HandlerErr {
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn response(self, id: &str) -> Value {
        err(id, &self.code, self.message, self.details)
    }
}

impl From<GradingError> for HandlerErr {
    fn from(e: GradingError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

/// `.map_err(db_err("db_query_failed"))`
pub fn db_err(code: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| HandlerErr::new(code, e.to_string())
}

pub fn begin_tx(conn: &Connection) -> Result<rusqlite::Transaction<'_>, HandlerErr> {
    conn.unchecked_transaction().map_err(db_err("db_tx_failed"))
}

pub fn commit_tx(tx: rusqlite::Transaction<'_>) -> Result<(), HandlerErr> {
    tx.commit().map_err(db_err("db_tx_failed"))
}

/// Runs a handler body against the open workspace and wraps the outcome in
/// the response envelope.
pub fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &Value) -> HandlerResult,
) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => {
            tracing::warn!(method = %req.method, code = %e.code, message = %e.message, "request failed");
            e.response(&req.id)
        }
    }
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let raw = params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    let s = raw.trim();
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s.to_string())
}

pub fn optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn has_key(params: &Value, key: &str) -> bool {
    params.get(key).is_some()
}

pub fn required_f64(params: &Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .filter(|v| v.is_finite())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key)))
}

pub fn required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key)))
}

pub fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        HandlerErr::bad_params(format!("{} must be a YYYY-MM-DD date", key))
            .with_details(json!({ "value": raw }))
    })
}

pub fn required_date(params: &Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = required_str(params, key)?;
    parse_date(&raw, key)
}

pub fn optional_date(params: &Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    match optional_str(params, key) {
        Some(raw) => parse_date(&raw, key).map(Some),
        None => Ok(None),
    }
}

pub fn check_date_range(start: NaiveDate, end: NaiveDate) -> Result<(), HandlerErr> {
    if end < start {
        return Err(HandlerErr::bad_params("endDate must not be before startDate")
            .with_details(json!({ "startDate": start.to_string(), "endDate": end.to_string() })));
    }
    Ok(())
}

/// Picks one of `allowed` (case-insensitive), returned in the canonical
/// spelling given in `allowed`.
pub fn choice(
    params: &Value,
    key: &str,
    allowed: &[&'static str],
    default: &'static str,
) -> Result<&'static str, HandlerErr> {
    let Some(raw) = optional_str(params, key) else {
        return Ok(default);
    };
    allowed
        .iter()
        .find(|a| a.eq_ignore_ascii_case(&raw))
        .copied()
        .ok_or_else(|| {
            HandlerErr::bad_params(format!("{} must be one of: {}", key, allowed.join(", ")))
        })
}

/// Name fields are stored trimmed and uppercased, inner spacing untouched.
pub fn upper_name(s: &str) -> String {
    s.trim().to_uppercase()
}

pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        &format!("SELECT 1 FROM {} WHERE id = ?", table),
        [id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err("db_query_failed"))
}

pub fn require_row(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    if !row_exists(conn, table, id)? {
        return Err(HandlerErr::not_found(what).with_details(json!({ "id": id })));
    }
    Ok(())
}

/// Number of rows matching `sql` (a `SELECT COUNT(*) ...` with one bind).
pub fn count_where(conn: &Connection, sql: &str, id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get(0))
        .map_err(db_err("db_query_failed"))
}

/// Referential guard for deletes: fails with `conflict` when `sql` counts any
/// dependent row.
pub fn block_if_referenced(
    conn: &Connection,
    sql: &str,
    id: &str,
    message: &str,
) -> Result<(), HandlerErr> {
    let n = count_where(conn, sql, id)?;
    if n > 0 {
        return Err(HandlerErr::conflict(message).with_details(json!({ "count": n })));
    }
    Ok(())
}

pub fn id_label(id_type: &str, id_number: &str) -> String {
    format!("{}-{}", id_type, id_number)
}
