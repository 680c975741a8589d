use crate::ipc::handlers::sections::{check_guide_exclusive, load_section, SectionRow};
use crate::ipc::helpers::{
    begin_tx, choice, commit_tx, db_err, has_key, now_ts, optional_str, require_row,
    required_str, with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

const ASSIGNMENT_STATES: &[&str] = &["active", "inactive"];

/// The period comes from the section; an explicit `schoolPeriodId` must agree
/// with it.
fn resolve_period(section: &SectionRow, params: &Value) -> Result<String, HandlerErr> {
    match optional_str(params, "schoolPeriodId") {
        Some(p) if p != section.school_period_id => Err(HandlerErr::bad_params(
            "schoolPeriodId does not match the section's school period",
        )
        .with_details(json!({
            "schoolPeriodId": p,
            "sectionPeriodId": section.school_period_id
        }))),
        _ => Ok(section.school_period_id.clone()),
    }
}

// ------------------------------------------------------ subject assignments

#[derive(Debug, Clone)]
struct SubjectAssignment {
    id: String,
    teacher_id: String,
    subject_id: String,
    section_id: String,
    school_period_id: String,
    state: String,
    notes: Option<String>,
    created_at: String,
}

const SA_COLUMNS: &str =
    "id, teacher_id, subject_id, section_id, school_period_id, state, notes, created_at";

fn sa_from_row(r: &Row<'_>) -> rusqlite::Result<SubjectAssignment> {
    Ok(SubjectAssignment {
        id: r.get(0)?,
        teacher_id: r.get(1)?,
        subject_id: r.get(2)?,
        section_id: r.get(3)?,
        school_period_id: r.get(4)?,
        state: r.get(5)?,
        notes: r.get(6)?,
        created_at: r.get(7)?,
    })
}

impl SubjectAssignment {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "teacherId": self.teacher_id,
            "subjectId": self.subject_id,
            "sectionId": self.section_id,
            "schoolPeriodId": self.school_period_id,
            "state": self.state,
            "notes": self.notes,
            "createdAt": self.created_at
        })
    }
}

fn load_sa(conn: &Connection, id: &str) -> Result<SubjectAssignment, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM teacher_subject_assignments WHERE id = ?", SA_COLUMNS),
        [id],
        sa_from_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("subject assignment").with_details(json!({ "assignmentId": id })))
}

fn apply_sa(
    conn: &Connection,
    mut row: SubjectAssignment,
    params: &Value,
) -> Result<SubjectAssignment, HandlerErr> {
    if has_key(params, "teacherId") {
        row.teacher_id = required_str(params, "teacherId")?;
    }
    if has_key(params, "subjectId") {
        row.subject_id = required_str(params, "subjectId")?;
    }
    if has_key(params, "sectionId") {
        row.section_id = required_str(params, "sectionId")?;
    }
    if has_key(params, "state") {
        row.state = choice(params, "state", ASSIGNMENT_STATES, "active")?.to_string();
    }
    if has_key(params, "notes") {
        row.notes = optional_str(params, "notes");
    }
    if row.teacher_id.is_empty() || row.subject_id.is_empty() || row.section_id.is_empty() {
        return Err(HandlerErr::bad_params("teacherId, subjectId and sectionId are required"));
    }
    require_row(conn, "teachers", &row.teacher_id, "teacher")?;
    require_row(conn, "subjects", &row.subject_id, "subject")?;
    let section = load_section(conn, &row.section_id)?;
    row.school_period_id = resolve_period(&section, params)?;
    Ok(row)
}

fn check_sa_duplicate(conn: &Connection, row: &SubjectAssignment) -> Result<(), HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM teacher_subject_assignments
             WHERE teacher_id = ? AND subject_id = ? AND section_id = ? AND school_period_id = ?
               AND id <> ?",
            (
                &row.teacher_id,
                &row.subject_id,
                &row.section_id,
                &row.school_period_id,
                &row.id,
            ),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(other) = existing {
        return Err(HandlerErr::conflict(
            "teacher already holds this subject in this section and period",
        )
        .with_details(json!({ "existingId": other })));
    }
    Ok(())
}

fn subject_assignments_list(conn: &Connection, params: &Value) -> HandlerResult {
    let teacher = optional_str(params, "teacherId");
    let section = optional_str(params, "sectionId");
    let period = optional_str(params, "schoolPeriodId");
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM teacher_subject_assignments
             WHERE (?1 IS NULL OR teacher_id = ?1)
               AND (?2 IS NULL OR section_id = ?2)
               AND (?3 IS NULL OR school_period_id = ?3)
             ORDER BY created_at, id",
            SA_COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((teacher, section, period), sa_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "assignments": rows.iter().map(SubjectAssignment::to_json).collect::<Vec<_>>() }))
}

fn subject_assignments_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "assignmentId")?;
    Ok(json!({ "assignment": load_sa(conn, &id)?.to_json() }))
}

fn subject_assignments_create(conn: &Connection, params: &Value) -> HandlerResult {
    let blank = SubjectAssignment {
        id: Uuid::new_v4().to_string(),
        teacher_id: String::new(),
        subject_id: String::new(),
        section_id: String::new(),
        school_period_id: String::new(),
        state: "active".to_string(),
        notes: None,
        created_at: now_ts(),
    };
    let row = apply_sa(conn, blank, params)?;
    let tx = begin_tx(conn)?;
    check_sa_duplicate(&tx, &row)?;
    tx.execute(
        "INSERT INTO teacher_subject_assignments(id, teacher_id, subject_id, section_id,
            school_period_id, state, notes, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &row.id,
            &row.teacher_id,
            &row.subject_id,
            &row.section_id,
            &row.school_period_id,
            &row.state,
            row.notes.as_deref(),
            &row.created_at,
        ),
    )
    .map_err(db_err("db_insert_failed"))?;
    commit_tx(tx)?;
    tracing::info!(assignment_id = %row.id, teacher_id = %row.teacher_id, "subject assignment created");
    Ok(json!({ "assignmentId": row.id, "assignment": row.to_json() }))
}

fn subject_assignments_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "assignmentId")?;
    let row = apply_sa(conn, load_sa(conn, &id)?, params)?;
    let tx = begin_tx(conn)?;
    check_sa_duplicate(&tx, &row)?;
    tx.execute(
        "UPDATE teacher_subject_assignments SET teacher_id = ?, subject_id = ?, section_id = ?,
            school_period_id = ?, state = ?, notes = ?
         WHERE id = ?",
        (
            &row.teacher_id,
            &row.subject_id,
            &row.section_id,
            &row.school_period_id,
            &row.state,
            row.notes.as_deref(),
            &id,
        ),
    )
    .map_err(db_err("db_update_failed"))?;
    commit_tx(tx)?;
    Ok(json!({ "assignment": row.to_json() }))
}

fn subject_assignments_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "assignmentId")?;
    load_sa(conn, &id)?;
    conn.execute("DELETE FROM teacher_subject_assignments WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed"))?;
    Ok(json!({ "ok": true }))
}

// -------------------------------------------------------- guide assignments

#[derive(Debug, Clone)]
struct GuideAssignment {
    id: String,
    teacher_id: String,
    section_id: String,
    school_period_id: String,
    state: String,
    notes: Option<String>,
    created_at: String,
}

const GA_COLUMNS: &str = "id, teacher_id, section_id, school_period_id, state, notes, created_at";

fn ga_from_row(r: &Row<'_>) -> rusqlite::Result<GuideAssignment> {
    Ok(GuideAssignment {
        id: r.get(0)?,
        teacher_id: r.get(1)?,
        section_id: r.get(2)?,
        school_period_id: r.get(3)?,
        state: r.get(4)?,
        notes: r.get(5)?,
        created_at: r.get(6)?,
    })
}

impl GuideAssignment {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "teacherId": self.teacher_id,
            "sectionId": self.section_id,
            "schoolPeriodId": self.school_period_id,
            "state": self.state,
            "notes": self.notes,
            "createdAt": self.created_at
        })
    }
}

fn load_ga(conn: &Connection, id: &str) -> Result<GuideAssignment, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM teacher_grade_assignments WHERE id = ?", GA_COLUMNS),
        [id],
        ga_from_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("guide assignment").with_details(json!({ "assignmentId": id })))
}

fn apply_ga(
    conn: &Connection,
    mut row: GuideAssignment,
    params: &Value,
) -> Result<(GuideAssignment, SectionRow), HandlerErr> {
    if has_key(params, "teacherId") {
        row.teacher_id = required_str(params, "teacherId")?;
    }
    if has_key(params, "sectionId") {
        row.section_id = required_str(params, "sectionId")?;
    }
    if has_key(params, "state") {
        row.state = choice(params, "state", ASSIGNMENT_STATES, "active")?.to_string();
    }
    if has_key(params, "notes") {
        row.notes = optional_str(params, "notes");
    }
    if row.teacher_id.is_empty() || row.section_id.is_empty() {
        return Err(HandlerErr::bad_params("teacherId and sectionId are required"));
    }
    require_row(conn, "teachers", &row.teacher_id, "teacher")?;
    let section = load_section(conn, &row.section_id)?;
    row.school_period_id = resolve_period(&section, params)?;
    Ok((row, section))
}

/// Clears `sections.guide_teacher_id` when it still mirrors `teacher_id`.
fn clear_guide_mirror(conn: &Connection, section_id: &str, teacher_id: &str) -> Result<(), HandlerErr> {
    conn.execute(
        "UPDATE sections SET guide_teacher_id = NULL WHERE id = ? AND guide_teacher_id = ?",
        (section_id, teacher_id),
    )
    .map_err(db_err("db_update_failed"))?;
    Ok(())
}

/// Validates and mirrors an active guide assignment onto its section. The
/// assignment row must already be written.
fn apply_guide_mirror(
    conn: &Connection,
    row: &GuideAssignment,
    section: &SectionRow,
) -> Result<(), HandlerErr> {
    if row.state != "active" {
        return Ok(());
    }
    let current_guide: Option<String> = conn
        .query_row(
            "SELECT guide_teacher_id FROM sections WHERE id = ?",
            [&row.section_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    if let Some(other) = current_guide.filter(|g| g != &row.teacher_id) {
        return Err(HandlerErr::conflict("section already has a guide teacher")
            .with_details(json!({ "sectionId": row.section_id, "guideTeacherId": other })));
    }
    let other_assignment: Option<String> = conn
        .query_row(
            "SELECT id FROM teacher_grade_assignments
             WHERE section_id = ? AND state = 'active' AND id <> ?",
            (&row.section_id, &row.id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(other) = other_assignment {
        return Err(HandlerErr::conflict("section already has an active guide assignment")
            .with_details(json!({ "existingId": other })));
    }
    check_guide_exclusive(
        conn,
        &row.teacher_id,
        &section.level,
        &row.school_period_id,
        &row.section_id,
    )?;
    conn.execute(
        "UPDATE sections SET guide_teacher_id = ? WHERE id = ?",
        (&row.teacher_id, &row.section_id),
    )
    .map_err(db_err("db_update_failed"))?;
    Ok(())
}

fn guide_assignments_list(conn: &Connection, params: &Value) -> HandlerResult {
    let teacher = optional_str(params, "teacherId");
    let period = optional_str(params, "schoolPeriodId");
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM teacher_grade_assignments
             WHERE (?1 IS NULL OR teacher_id = ?1)
               AND (?2 IS NULL OR school_period_id = ?2)
             ORDER BY created_at, id",
            GA_COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((teacher, period), ga_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "assignments": rows.iter().map(GuideAssignment::to_json).collect::<Vec<_>>() }))
}

fn guide_assignments_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "assignmentId")?;
    Ok(json!({ "assignment": load_ga(conn, &id)?.to_json() }))
}

fn guide_assignments_create(conn: &Connection, params: &Value) -> HandlerResult {
    let blank = GuideAssignment {
        id: Uuid::new_v4().to_string(),
        teacher_id: String::new(),
        section_id: String::new(),
        school_period_id: String::new(),
        state: "active".to_string(),
        notes: None,
        created_at: now_ts(),
    };
    let (row, section) = apply_ga(conn, blank, params)?;
    let tx = begin_tx(conn)?;
    tx.execute(
        "INSERT INTO teacher_grade_assignments(id, teacher_id, section_id, school_period_id,
            state, notes, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &row.id,
            &row.teacher_id,
            &row.section_id,
            &row.school_period_id,
            &row.state,
            row.notes.as_deref(),
            &row.created_at,
        ),
    )
    .map_err(db_err("db_insert_failed"))?;
    apply_guide_mirror(&tx, &row, &section)?;
    commit_tx(tx)?;
    tracing::info!(assignment_id = %row.id, teacher_id = %row.teacher_id, "guide assignment created");
    Ok(json!({ "assignmentId": row.id, "assignment": row.to_json() }))
}

fn guide_assignments_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "assignmentId")?;
    let before = load_ga(conn, &id)?;
    let (row, section) = apply_ga(conn, before.clone(), params)?;
    let tx = begin_tx(conn)?;
    if before.state == "active" {
        clear_guide_mirror(&tx, &before.section_id, &before.teacher_id)?;
    }
    tx.execute(
        "UPDATE teacher_grade_assignments SET teacher_id = ?, section_id = ?, school_period_id = ?,
            state = ?, notes = ?
         WHERE id = ?",
        (
            &row.teacher_id,
            &row.section_id,
            &row.school_period_id,
            &row.state,
            row.notes.as_deref(),
            &id,
        ),
    )
    .map_err(db_err("db_update_failed"))?;
    apply_guide_mirror(&tx, &row, &section)?;
    commit_tx(tx)?;
    Ok(json!({ "assignment": row.to_json() }))
}

fn guide_assignments_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "assignmentId")?;
    let row = load_ga(conn, &id)?;
    let tx = begin_tx(conn)?;
    tx.execute("DELETE FROM teacher_grade_assignments WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed"))?;
    if row.state == "active" {
        clear_guide_mirror(&tx, &row.section_id, &row.teacher_id)?;
    }
    commit_tx(tx)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "subjectAssignments.list" => subject_assignments_list,
        "subjectAssignments.get" => subject_assignments_get,
        "subjectAssignments.create" => subject_assignments_create,
        "subjectAssignments.update" => subject_assignments_update,
        "subjectAssignments.delete" => subject_assignments_delete,
        "guideAssignments.list" => guide_assignments_list,
        "guideAssignments.get" => guide_assignments_get,
        "guideAssignments.create" => guide_assignments_create,
        "guideAssignments.update" => guide_assignments_update,
        "guideAssignments.delete" => guide_assignments_delete,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
