use crate::ipc::handlers::evaluations::refresh_status;
use crate::ipc::helpers::{
    begin_tx, block_if_referenced, choice, commit_tx, count_where, db_err, has_key, now_ts,
    optional_str, require_row, required_i64, required_str, upper_name, with_conn, HandlerErr,
    HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

const SECTION_STATES: &[&str] = &["active", "inactive"];

#[derive(Debug, Clone)]
pub struct SectionRow {
    pub id: String,
    pub school_period_id: String,
    pub level: String,
    pub label: String,
    pub guide_teacher_id: Option<String>,
    pub capacity: i64,
    pub state: String,
    pub created_at: String,
}

const SECTION_COLUMNS: &str =
    "id, school_period_id, level, label, guide_teacher_id, capacity, state, created_at";

fn section_from_row(r: &Row<'_>) -> rusqlite::Result<SectionRow> {
    Ok(SectionRow {
        id: r.get(0)?,
        school_period_id: r.get(1)?,
        level: r.get(2)?,
        label: r.get(3)?,
        guide_teacher_id: r.get(4)?,
        capacity: r.get(5)?,
        state: r.get(6)?,
        created_at: r.get(7)?,
    })
}

impl SectionRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "schoolPeriodId": self.school_period_id,
            "level": self.level,
            "label": self.label,
            "guideTeacherId": self.guide_teacher_id,
            "capacity": self.capacity,
            "state": self.state,
            "createdAt": self.created_at
        })
    }
}

pub fn load_section(conn: &Connection, section_id: &str) -> Result<SectionRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM sections WHERE id = ?", SECTION_COLUMNS),
        [section_id],
        section_from_row,
    )
    .optional()
    .map_err(db_err("db_query_failed"))?
    .ok_or_else(|| HandlerErr::not_found("section").with_details(json!({ "sectionId": section_id })))
}

/// Student ids with an active enrollment in the section, ordered by name.
pub fn active_roster(conn: &Connection, section_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT e.student_id FROM enrollments e
             JOIN students st ON st.id = e.student_id
             WHERE e.section_id = ? AND e.status = 'active'
             ORDER BY st.last_names, st.first_names, st.id",
        )
        .map_err(db_err("db_query_failed"))?;
    stmt.query_map([section_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))
}

fn active_count(conn: &Connection, section_id: &str) -> Result<i64, HandlerErr> {
    count_where(
        conn,
        "SELECT COUNT(*) FROM enrollments WHERE section_id = ? AND status = 'active'",
        section_id,
    )
}

/// Re-derives the status of every evaluation of the section after its
/// roster changed.
fn refresh_section_evaluations(conn: &Connection, section_id: &str) -> Result<(), HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM evaluations WHERE section_id = ?")
        .map_err(db_err("db_query_failed"))?;
    let ids = stmt
        .query_map([section_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    for id in ids {
        refresh_status(conn, &id)?;
    }
    Ok(())
}

/// Guide changes on a section must agree with its active guide assignment.
fn check_guide_matches_assignment(
    conn: &Connection,
    section_id: &str,
    guide: Option<&str>,
) -> Result<(), HandlerErr> {
    let assigned: Option<(String, String)> = conn
        .query_row(
            "SELECT id, teacher_id FROM teacher_grade_assignments
             WHERE section_id = ? AND state = 'active'
             LIMIT 1",
            [section_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    match assigned {
        Some((assignment_id, teacher_id)) if guide != Some(teacher_id.as_str()) => {
            Err(HandlerErr::conflict(
                "section guide is set by an active guide assignment; change the assignment instead",
            )
            .with_details(json!({
                "sectionId": section_id,
                "assignmentId": assignment_id,
                "guideTeacherId": teacher_id
            })))
        }
        _ => Ok(()),
    }
}

/// A section keeps its school period once anything period-scoped points at it.
fn check_period_change(conn: &Connection, section_id: &str) -> Result<(), HandlerErr> {
    block_if_referenced(
        conn,
        "SELECT (SELECT COUNT(*) FROM enrollments WHERE section_id = ?1)
              + (SELECT COUNT(*) FROM teacher_subject_assignments WHERE section_id = ?1)
              + (SELECT COUNT(*) FROM teacher_grade_assignments WHERE section_id = ?1)
              + (SELECT COUNT(*) FROM evaluations WHERE section_id = ?1)",
        section_id,
        "section has enrollments, assignments or evaluations; its school period cannot change",
    )
}

/// A teacher guides at most one section per level within a school period.
/// Both direct section guides and active guide assignments count.
pub fn check_guide_exclusive(
    conn: &Connection,
    teacher_id: &str,
    level: &str,
    school_period_id: &str,
    exclude_section_id: &str,
) -> Result<(), HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT s.id FROM sections s
             WHERE s.level = ?2 AND s.school_period_id = ?3 AND s.id <> ?4
               AND (s.guide_teacher_id = ?1
                    OR EXISTS (SELECT 1 FROM teacher_grade_assignments g
                               WHERE g.section_id = s.id AND g.teacher_id = ?1
                                 AND g.state = 'active'))
             LIMIT 1",
            (teacher_id, level, school_period_id, exclude_section_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(other) = existing {
        return Err(HandlerErr::conflict(
            "teacher already guides a section of this level in the school period",
        )
        .with_details(json!({
            "teacherId": teacher_id,
            "level": level,
            "schoolPeriodId": school_period_id,
            "conflictSectionId": other
        })));
    }
    Ok(())
}

fn apply_params(conn: &Connection, mut row: SectionRow, params: &Value) -> Result<SectionRow, HandlerErr> {
    if has_key(params, "schoolPeriodId") {
        row.school_period_id = required_str(params, "schoolPeriodId")?;
        require_row(conn, "school_periods", &row.school_period_id, "school period")?;
    }
    if has_key(params, "level") {
        row.level = upper_name(&required_str(params, "level")?);
    }
    if has_key(params, "label") {
        row.label = upper_name(&required_str(params, "label")?);
    }
    if has_key(params, "guideTeacherId") {
        row.guide_teacher_id = optional_str(params, "guideTeacherId");
        if let Some(t) = row.guide_teacher_id.as_deref() {
            require_row(conn, "teachers", t, "teacher")?;
        }
    }
    if has_key(params, "capacity") {
        row.capacity = required_i64(params, "capacity")?;
    }
    if row.capacity <= 0 {
        return Err(HandlerErr::bad_params("capacity must be a positive integer"));
    }
    if has_key(params, "state") {
        row.state = choice(params, "state", SECTION_STATES, "active")?.to_string();
    }
    if row.school_period_id.is_empty() || row.level.is_empty() || row.label.is_empty() {
        return Err(HandlerErr::bad_params("schoolPeriodId, level and label are required"));
    }
    Ok(row)
}

fn ensure_label_free(conn: &Connection, row: &SectionRow) -> Result<(), HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM sections
             WHERE school_period_id = ? AND level = ? AND label = ? AND id <> ?",
            (&row.school_period_id, &row.level, &row.label, &row.id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    match existing {
        Some(other) => Err(HandlerErr::conflict("section already exists for this level and period")
            .with_details(json!({ "existingId": other }))),
        None => Ok(()),
    }
}

fn section_json(conn: &Connection, row: &SectionRow) -> Result<Value, HandlerErr> {
    let roster = active_roster(conn, &row.id)?;
    let mut v = row.to_json();
    v["enrolledCount"] = json!(roster.len());
    v["roster"] = json!(roster);
    Ok(v)
}

fn sections_list(conn: &Connection, params: &Value) -> HandlerResult {
    let period = optional_str(params, "schoolPeriodId");
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM sections
             WHERE (?1 IS NULL OR school_period_id = ?1)
             ORDER BY level, label",
            SECTION_COLUMNS
        ))
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([period], section_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    let mut sections = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut v = row.to_json();
        v["enrolledCount"] = json!(active_count(conn, &row.id)?);
        sections.push(v);
    }
    Ok(json!({ "sections": sections }))
}

fn sections_get(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "sectionId")?;
    let row = load_section(conn, &id)?;
    Ok(json!({ "section": section_json(conn, &row)? }))
}

fn sections_create(conn: &Connection, params: &Value) -> HandlerResult {
    let blank = SectionRow {
        id: Uuid::new_v4().to_string(),
        school_period_id: String::new(),
        level: String::new(),
        label: String::new(),
        guide_teacher_id: None,
        capacity: 0,
        state: "active".to_string(),
        created_at: now_ts(),
    };
    let row = apply_params(conn, blank, params)?;
    let tx = begin_tx(conn)?;
    ensure_label_free(&tx, &row)?;
    if let Some(t) = row.guide_teacher_id.as_deref() {
        check_guide_exclusive(&tx, t, &row.level, &row.school_period_id, &row.id)?;
    }
    tx.execute(
        "INSERT INTO sections(id, school_period_id, level, label, guide_teacher_id, capacity, state, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &row.id,
            &row.school_period_id,
            &row.level,
            &row.label,
            row.guide_teacher_id.as_deref(),
            row.capacity,
            &row.state,
            &row.created_at,
        ),
    )
    .map_err(db_err("db_insert_failed"))?;
    commit_tx(tx)?;
    tracing::info!(section_id = %row.id, level = %row.level, label = %row.label, "section created");
    Ok(json!({ "sectionId": row.id, "section": section_json(conn, &row)? }))
}

fn sections_update(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "sectionId")?;
    let before = load_section(conn, &id)?;
    let row = apply_params(conn, before.clone(), params)?;
    let tx = begin_tx(conn)?;
    if row.school_period_id != before.school_period_id {
        check_period_change(&tx, &id)?;
    }
    if row.guide_teacher_id != before.guide_teacher_id {
        check_guide_matches_assignment(&tx, &id, row.guide_teacher_id.as_deref())?;
    }
    ensure_label_free(&tx, &row)?;
    if let Some(t) = row.guide_teacher_id.as_deref() {
        check_guide_exclusive(&tx, t, &row.level, &row.school_period_id, &id)?;
    }
    let enrolled = active_count(&tx, &id)?;
    if row.capacity < enrolled {
        return Err(HandlerErr::conflict("capacity is below the number of enrolled students")
            .with_details(json!({ "capacity": row.capacity, "enrolledCount": enrolled })));
    }
    tx.execute(
        "UPDATE sections SET school_period_id = ?, level = ?, label = ?, guide_teacher_id = ?,
            capacity = ?, state = ?
         WHERE id = ?",
        (
            &row.school_period_id,
            &row.level,
            &row.label,
            row.guide_teacher_id.as_deref(),
            row.capacity,
            &row.state,
            &id,
        ),
    )
    .map_err(db_err("db_update_failed"))?;
    commit_tx(tx)?;
    Ok(json!({ "section": section_json(conn, &row)? }))
}

fn sections_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let id = required_str(params, "sectionId")?;
    load_section(conn, &id)?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM enrollments WHERE section_id = ?",
        &id,
        "section has enrollments",
    )?;
    block_if_referenced(
        conn,
        "SELECT COUNT(*) FROM evaluations WHERE section_id = ?",
        &id,
        "section has evaluations",
    )?;
    block_if_referenced(
        conn,
        "SELECT (SELECT COUNT(*) FROM teacher_subject_assignments WHERE section_id = ?1)
              + (SELECT COUNT(*) FROM teacher_grade_assignments WHERE section_id = ?1)",
        &id,
        "section has teacher assignments",
    )?;
    conn.execute("DELETE FROM sections WHERE id = ?", [&id])
        .map_err(db_err("db_delete_failed"))?;
    tracing::info!(section_id = %id, "section deleted");
    Ok(json!({ "ok": true }))
}

// ------------------------------------------------------------ enrollments

fn enrollment_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let last: String = r.get(7)?;
    let first: String = r.get(8)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "sectionId": r.get::<_, String>(2)?,
        "schoolPeriodId": r.get::<_, String>(3)?,
        "status": r.get::<_, String>(4)?,
        "enrolledAt": r.get::<_, String>(5)?,
        "withdrawnAt": r.get::<_, Option<String>>(6)?,
        "studentName": format!("{}, {}", last, first)
    }))
}

const ENROLLMENT_SELECT: &str = "SELECT e.id, e.student_id, e.section_id, e.school_period_id,
        e.status, e.enrolled_at, e.withdrawn_at, st.last_names, st.first_names
     FROM enrollments e
     JOIN students st ON st.id = e.student_id";

fn enrollments_enroll(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_str(params, "studentId")?;
    let section_id = required_str(params, "sectionId")?;
    require_row(conn, "students", &student_id, "student")?;
    let section = load_section(conn, &section_id)?;
    if section.state != "active" {
        return Err(HandlerErr::conflict("section is inactive")
            .with_details(json!({ "sectionId": section_id })));
    }

    let tx = begin_tx(conn)?;
    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM enrollments
             WHERE student_id = ? AND school_period_id = ? AND status = 'active'",
            (&student_id, &section.school_period_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if let Some(other) = existing {
        return Err(HandlerErr::conflict("student is already enrolled in this school period")
            .with_details(json!({ "enrollmentId": other })));
    }
    let enrolled = active_count(&tx, &section_id)?;
    if enrolled >= section.capacity {
        return Err(HandlerErr::new("section_full", "section has no free places")
            .with_details(json!({ "capacity": section.capacity, "enrolledCount": enrolled })));
    }

    let enrollment_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO enrollments(id, student_id, section_id, school_period_id, status, enrolled_at)
         VALUES(?, ?, ?, ?, 'active', ?)",
        (&enrollment_id, &student_id, &section_id, &section.school_period_id, now_ts()),
    )
    .map_err(db_err("db_insert_failed"))?;
    refresh_section_evaluations(&tx, &section_id)?;
    commit_tx(tx)?;
    tracing::info!(student_id = %student_id, section_id = %section_id, "student enrolled");
    Ok(json!({ "enrollmentId": enrollment_id, "enrolledCount": enrolled + 1 }))
}

fn enrollments_withdraw(conn: &Connection, params: &Value) -> HandlerResult {
    let enrollment_id = required_str(params, "enrollmentId")?;
    let found: Option<(String, String)> = conn
        .query_row(
            "SELECT status, section_id FROM enrollments WHERE id = ?",
            [&enrollment_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let section_id = match found {
        None => return Err(HandlerErr::not_found("enrollment")),
        Some((status, section_id)) if status == "active" => section_id,
        Some((other, _)) => {
            return Err(HandlerErr::conflict("enrollment is not active")
                .with_details(json!({ "status": other })))
        }
    };
    let withdrawn_at = now_ts();
    let tx = begin_tx(conn)?;
    tx.execute(
        "UPDATE enrollments SET status = 'withdrawn', withdrawn_at = ? WHERE id = ?",
        (&withdrawn_at, &enrollment_id),
    )
    .map_err(db_err("db_update_failed"))?;
    refresh_section_evaluations(&tx, &section_id)?;
    commit_tx(tx)?;
    tracing::info!(enrollment_id = %enrollment_id, section_id = %section_id, "student withdrawn");
    Ok(json!({ "ok": true, "withdrawnAt": withdrawn_at }))
}

fn enrollments_list(conn: &Connection, params: &Value) -> HandlerResult {
    let include_withdrawn = params
        .get("includeWithdrawn")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let (filter, key) = if let Some(section_id) = optional_str(params, "sectionId") {
        ("e.section_id = ?1", section_id)
    } else if let Some(student_id) = optional_str(params, "studentId") {
        ("e.student_id = ?1", student_id)
    } else {
        return Err(HandlerErr::bad_params("sectionId or studentId is required"));
    };
    let sql = format!(
        "{} WHERE {} AND (?2 = 1 OR e.status = 'active')
         ORDER BY e.enrolled_at DESC, st.last_names, st.first_names",
        ENROLLMENT_SELECT, filter
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map((&key, include_withdrawn as i64), enrollment_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "enrollments": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "sections.list" => sections_list,
        "sections.get" => sections_get,
        "sections.create" => sections_create,
        "sections.update" => sections_update,
        "sections.delete" => sections_delete,
        "enrollments.enroll" => enrollments_enroll,
        "enrollments.withdraw" => enrollments_withdraw,
        "enrollments.list" => enrollments_list,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
