use crate::grading::{self, Criterion};
use crate::ipc::handlers::sections::{active_roster, load_section};
use crate::ipc::helpers::{
    begin_tx, commit_tx, count_where, db_err, has_key, now_ts, optional_str, parse_date,
    require_row, required_f64, required_str, upper_name, with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

const DEFAULT_KIND: &str = "EVALUACION";

#[derive(Debug, Clone)]
pub struct EvaluationRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub subject_id: String,
    pub section_id: String,
    pub school_period_id: String,
    pub lapse_id: String,
    pub percentage: f64,
    pub eval_date: String,
    pub status: String,
    pub created_at: String,
}

const COLUMNS: &str = "id, name, kind, subject_id, section_id, school_period_id, lapse_id,
    percentage, eval_date, status, created_at";

fn from_row(r: &Row<'_>) -> rusqlite::Result<EvaluationRow> {
    Ok(EvaluationRow {
        id: r.get(0)?,
        name: r.get(1)?,
        kind: r.get(2)?,
        subject_id: r.get(3)?,
        section_id: r.get(4)?,
        school_period_id: r.get(5)?,
        lapse_id: r.get(6)?,
        percentage: r.get(7)?,
        eval_date: r.get(8)?,
        status: r.get(9)?,
        created_at: r.get(10)?,
    })
}

impl EvaluationRow {
    pub fn to_json(&self, criteria: &[Criterion]) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "kind": self.kind,
            "subjectId": self.subject_id,
            "sectionId": self.section_id,
            "schoolPeriodId": self.school_period_id,
            "lapseId": self.lapse_id,
            "percentage": self.percentage,
            "date": self.eval_date,
            "status": self.status,
            "criteria": criteria,
            "createdAt": self.created_at
        })
    }
}

pub fn load_evaluation(conn: &Connection, id: &str) -> Result<EvaluationRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM evaluations WHERE id = ?", COLUMNS),
        [id],
        from_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("evaluation").with_details(json!({ "evaluationId": id })))
}

pub fn load_criteria(conn: &Connection, evaluation_id: &str) -> Result<Vec<Criterion>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT number, name, weight FROM evaluation_criteria
             WHERE evaluation_id = ? ORDER BY number",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([evaluation_id], |r| {
            Ok(Criterion {
                number: r.get(0)?,
                name: r.get(1)?,
                weight: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    // Rows written before criteria were stored fall back to the default sheet.
    if rows.is_empty() {
        return Ok(grading::default_criteria());
    }
    Ok(rows)
}

fn write_criteria(conn: &Connection, evaluation_id: &str, criteria: &[Criterion]) -> Result<(), HandlerErr> {
    conn.execute("DELETE FROM evaluation_criteria WHERE evaluation_id = ?", [evaluation_id])
        .map_err(db_err("db_delete_failed"))?;
    let mut stmt = conn
        .prepare(
            "INSERT INTO evaluation_criteria(evaluation_id, number, name, weight)
             VALUES(?, ?, ?, ?)",
        )
        .map_err(db_err("db_insert_failed"))?;
    for c in criteria {
        stmt.execute((evaluation_id, c.number, &c.name, c.weight))
            .map_err(db_err("db_insert_failed"))?;
    }
    Ok(())
}

fn parse_criteria(params: &Value) -> Result<Option<Vec<Criterion>>, HandlerErr> {
    let Some(raw) = params.get("criteria") else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(Some(grading::default_criteria()));
    }
    let parsed: Vec<Criterion> = serde_json::from_value(raw.clone()).map_err(|e| {
        HandlerErr::bad_params(format!("criteria must be a list of {{number, name, weight}}: {}", e))
    })?;
    Ok(Some(grading::normalize_criteria(parsed)?))
}

fn apply_params(conn: &Connection, mut row: EvaluationRow, params: &Value) -> Result<EvaluationRow, HandlerErr> {
    if has_key(params, "name") {
        row.name = upper_name(&required_str(params, "name")?);
    }
    if has_key(params, "kind") {
        row.kind = optional_str(params, "kind")
            .map(|s| upper_name(&s))
            .unwrap_or_else(|| DEFAULT_KIND.to_string());
    }
    if has_key(params, "subjectId") {
        row.subject_id = required_str(params, "subjectId")?;
    }
    if has_key(params, "sectionId") {
        row.section_id = required_str(params, "sectionId")?;
    }
    if has_key(params, "lapseId") {
        row.lapse_id = required_str(params, "lapseId")?;
    }
    if has_key(params, "percentage") {
        row.percentage = required_f64(params, "percentage")?;
    }
    if has_key(params, "date") {
        let raw = required_str(params, "date")?;
        row.eval_date = parse_date(&raw, "date")?.to_string();
    }
    if row.name.is_empty()
        || row.subject_id.is_empty()
        || row.section_id.is_empty()
        || row.lapse_id.is_empty()
        || row.eval_date.is_empty()
    {
        return Err(HandlerErr::bad_params(
            "name, subjectId, sectionId, lapseId and date are required",
        ));
    }

    require_row(conn, "subjects", &row.subject_id, "subject")?;
    let section = load_section(conn, &row.section_id)?;
    row.school_period_id = section.school_period_id;
    let lapse_period: Option<String> = conn
        .query_row(
            "SELECT school_period_id FROM lapses WHERE id = ?",
            [&row.lapse_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    match lapse_period {
        None => return Err(HandlerErr::not_found("lapse").with_details(json!({ "lapseId": row.lapse_id }))),
        Some(p) if p != row.school_period_id => {
            return Err(HandlerErr::bad_params("lapse belongs to a different school period")
                .with_details(json!({ "lapseId": row.lapse_id, "schoolPeriodId": row.school_period_id })))
        }
        Some(_) => {}
    }
    Ok(row)
}

fn check_duplicate(conn: &Connection, row: &EvaluationRow) -> Result<(), HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM evaluations
             WHERE subject_id = ? AND section_id = ? AND eval_date = ? AND id <> ?",
            (&row.subject_id, &row.section_id, &row.eval_date, &row.id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(other) = existing {
        return Err(HandlerErr::conflict(
            "an evaluation for this subject and section already exists on that date",
        )
        .with_details(json!({ "existingId": other, "date": row.eval_date })));
    }
    Ok(())
}

fn check_budget(conn: &Connection, row: &EvaluationRow) -> Result<(), HandlerErr> {
    let used: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(percentage), 0.0) FROM evaluations
             WHERE subject_id = ? AND section_id = ? AND lapse_id = ? AND id <> ?",
            (&row.subject_id, &row.section_id, &row.lapse_id, &row.id),
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    grading::check_percentage_budget(used, row.percentage)?;
    Ok(())
}

fn grade_count(conn: &Connection, evaluation_id: &str) -> Result<i64, HandlerErr> {
    count_where(conn, "SELECT COUNT(*) FROM grades WHERE evaluation_id = ?", evaluation_id)
}

/// `graded` once every actively enrolled student of the section has a
/// record, `pending` otherwise. Returns the new status.
pub fn refresh_status(conn: &Connection, evaluation_id: &str) -> Result<String, HandlerErr> {
    let eval = load_evaluation(conn, evaluation_id)?;
    let roster = active_roster(conn, &eval.section_id)?;
    let mut stmt = conn
        .prepare("SELECT 1 FROM grades WHERE evaluation_id = ? AND student_id = ?")
        .map_err(db_err("db_query_failed"))?;
    let mut all_graded = !roster.is_empty();
    for student_id in &roster {
        let found = stmt
            .query_row((evaluation_id, student_id), |r| r.get::<_, i64>(0))
            .optional()
            .map_err(db_err("db_query_failed"))?;
        if found.is_none() {
            all_graded = false;
            break;
        }
    }
    let status = if all_graded { "graded" } else { "pending" };
    if status != eval.status {
        conn.execute(
            "UPDATE evaluations SET status = ? WHERE id = ?",
            (status, evaluation_id),
        )
        .map_err(db_err("db_update_failed"))?;
    }
    Ok(status.to_string())
}

fn evaluations_list(conn: &Connection, params: &Value) -> HandlerResult {
    let section = optional_str(params, "sectionId");
    let subject = optional_str(params, "subjectId");
    let lapse = optional_str(params, "lapseId");
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM evaluations
             WHERE (?1 IS NULL OR section_id = ?1)
               AND (?2 IS NULL OR subject_id = ?2)
               AND (?3 IS NULL OR lapse_id = ?3)
             ORDER BY eval_date, created_at",
            COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((section, subject, lapse), from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let criteria = load_criteria(conn, &row.id)?;
        let mut v = row.to_json(&criteria);
        v["gradedCount"] = json!(grade_count(conn, &row.id)?);
        out.push(v);
    }
    Ok(json!({ "evaluations": out }))
}

fn evaluations_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "evaluationId")?;
    let row = load_evaluation(conn, &id)?;
    let criteria = load_criteria(conn, &id)?;
    let mut v = row.to_json(&criteria);
    v["gradedCount"] = json!(grade_count(conn, &id)?);
    Ok(json!({ "evaluation": v }))
}

fn evaluations_create(conn: &Connection, params: &Value) -> HandlerResult {
    let blank = EvaluationRow {
        id: Uuid::new_v4().to_string(),
        name: String::new(),
        kind: DEFAULT_KIND.to_string(),
        subject_id: String::new(),
        section_id: String::new(),
        school_period_id: String::new(),
        lapse_id: String::new(),
        percentage: 0.0,
        eval_date: String::new(),
        status: "pending".to_string(),
        created_at: now_ts(),
    };
    if !has_key(params, "percentage") {
        return Err(HandlerErr::bad_params("missing percentage"));
    }
    let row = apply_params(conn, blank, params)?;
    let criteria = parse_criteria(params)?.unwrap_or_else(grading::default_criteria);

    let tx = begin_tx(conn)?;
    check_duplicate(&tx, &row)?;
    check_budget(&tx, &row)?;
    tx.execute(
        "INSERT INTO evaluations(id, name, kind, subject_id, section_id, school_period_id, lapse_id,
            percentage, eval_date, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &row.id,
            &row.name,
            &row.kind,
            &row.subject_id,
            &row.section_id,
            &row.school_period_id,
            &row.lapse_id,
            row.percentage,
            &row.eval_date,
            &row.status,
            &row.created_at,
        ),
    )
    .map_err(db_err("db_insert_failed"))?;
    write_criteria(&tx, &row.id, &criteria)?;
    commit_tx(tx)?;
    tracing::info!(evaluation_id = %row.id, criteria = criteria.len(), "evaluation created");
    Ok(json!({ "evaluationId": row.id, "evaluation": row.to_json(&criteria) }))
}

fn evaluations_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "evaluationId")?;
    let before = load_evaluation(conn, &id)?;
    let row = apply_params(conn, before.clone(), params)?;
    let current_criteria = load_criteria(conn, &id)?;
    let new_criteria = parse_criteria(params)?;
    let graded = grade_count(conn, &id)?;

    if graded > 0 {
        if let Some(c) = new_criteria.as_ref() {
            if *c != current_criteria {
                return Err(HandlerErr::conflict("criteria cannot change once grades are recorded")
                    .with_details(json!({ "gradeCount": graded })));
            }
        }
        if row.section_id != before.section_id {
            return Err(HandlerErr::conflict("section cannot change once grades are recorded")
                .with_details(json!({ "gradeCount": graded })));
        }
    }

    let tx = begin_tx(conn)?;
    check_duplicate(&tx, &row)?;
    check_budget(&tx, &row)?;
    tx.execute(
        "UPDATE evaluations SET name = ?, kind = ?, subject_id = ?, section_id = ?,
            school_period_id = ?, lapse_id = ?, percentage = ?, eval_date = ?
         WHERE id = ?",
        (
            &row.name,
            &row.kind,
            &row.subject_id,
            &row.section_id,
            &row.school_period_id,
            &row.lapse_id,
            row.percentage,
            &row.eval_date,
            &id,
        ),
    )
    .map_err(db_err("db_update_failed"))?;
    let criteria = match new_criteria {
        Some(c) => {
            write_criteria(&tx, &id, &c)?;
            c
        }
        None => current_criteria,
    };
    let status = refresh_status(&tx, &id)?;
    commit_tx(tx)?;
    let mut v = row.to_json(&criteria);
    v["status"] = json!(status);
    Ok(json!({ "evaluation": v }))
}

fn evaluations_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "evaluationId")?;
    load_evaluation(conn, &id)?;
    let tx = begin_tx(conn)?;
    let grades_removed = grade_count(&tx, &id)?;
    for sql in [
        "DELETE FROM grade_history WHERE grade_id IN (SELECT id FROM grades WHERE evaluation_id = ?)",
        "DELETE FROM grade_scores WHERE grade_id IN (SELECT id FROM grades WHERE evaluation_id = ?)",
        "DELETE FROM grades WHERE evaluation_id = ?",
        "DELETE FROM evaluation_criteria WHERE evaluation_id = ?",
        "DELETE FROM evaluations WHERE id = ?",
    ] {
        tx.execute(sql, [&id]).map_err(db_err("db_delete_failed"))?;
    }
    commit_tx(tx)?;
    tracing::info!(evaluation_id = %id, grades_removed, "evaluation deleted");
    Ok(json!({ "ok": true, "gradesRemoved": grades_removed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "evaluations.list" => evaluations_list,
        "evaluations.get" => evaluations_get,
        "evaluations.create" => evaluations_create,
        "evaluations.update" => evaluations_update,
        "evaluations.delete" => evaluations_delete,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
