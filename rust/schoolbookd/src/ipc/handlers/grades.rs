use crate::grading::{self, Criterion};
use crate::ipc::handlers::calendar::grades_editable;
use crate::ipc::handlers::evaluations::{load_criteria, load_evaluation, refresh_status, EvaluationRow};
use crate::ipc::handlers::sections::{active_roster, load_section};
use crate::ipc::helpers::{
    begin_tx, commit_tx, db_err, id_label, now_ts, optional_str, require_row, required_str,
    with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

const DEFAULT_ACTOR: &str = "unknown";

/// One student's line on an evaluation's grade sheet.
#[derive(Debug, Clone)]
pub struct SheetRow {
    pub student_id: String,
    pub display_name: String,
    pub id_label: String,
    pub grade_id: Option<String>,
    pub scores: BTreeMap<i64, f64>,
    pub final_score: f64,
    pub remark: Option<String>,
    pub enrolled: bool,
}

impl SheetRow {
    fn to_json(&self) -> Value {
        json!({
            "studentId": self.student_id,
            "displayName": self.display_name,
            "idLabel": self.id_label,
            "gradeId": self.grade_id,
            "hasRecord": self.grade_id.is_some(),
            "scores": scores_json(&self.scores),
            "finalScore": grading::round_2(self.final_score),
            "remark": self.remark,
            "enrolled": self.enrolled
        })
    }
}

fn scores_json(scores: &BTreeMap<i64, f64>) -> Value {
    let mut m = Map::new();
    for (k, v) in scores {
        m.insert(k.to_string(), json!(v));
    }
    Value::Object(m)
}

/// Accepts `{"1": 8, "2": 6}` or `[{"number": 1, "score": 8}, ...]`.
fn parse_scores(v: Option<&Value>) -> Result<BTreeMap<i64, f64>, HandlerErr> {
    let mut out = BTreeMap::new();
    match v {
        Some(Value::Object(m)) => {
            for (k, s) in m {
                let number: i64 = k
                    .trim()
                    .parse()
                    .map_err(|_| HandlerErr::bad_params(format!("bad criterion key: {}", k)))?;
                let score = s
                    .as_f64()
                    .ok_or_else(|| HandlerErr::bad_params("scores must be numbers"))?;
                out.insert(number, score);
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                let number = item
                    .get("number")
                    .and_then(|x| x.as_i64())
                    .ok_or_else(|| HandlerErr::bad_params("score entries need an integer number"))?;
                let score = item
                    .get("score")
                    .and_then(|x| x.as_f64())
                    .ok_or_else(|| HandlerErr::bad_params("score entries need a numeric score"))?;
                if out.insert(number, score).is_some() {
                    return Err(HandlerErr::bad_params("duplicate criterion in scores")
                        .with_details(json!({ "criterion": number })));
                }
            }
        }
        _ => return Err(HandlerErr::bad_params("scores must be an object or an array")),
    }
    Ok(out)
}

fn load_scores(conn: &Connection, grade_id: &str) -> Result<BTreeMap<i64, f64>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT criterion_number, score FROM grade_scores WHERE grade_id = ?")
        .map_err(db_err("db_query_failed"))?;
    let pairs = stmt
        .query_map([grade_id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(pairs.into_iter().collect())
}

fn write_scores(conn: &Connection, grade_id: &str, scores: &BTreeMap<i64, f64>) -> Result<(), HandlerErr> {
    conn.execute("DELETE FROM grade_scores WHERE grade_id = ?", [grade_id])
        .map_err(db_err("db_delete_failed"))?;
    let mut stmt = conn
        .prepare("INSERT INTO grade_scores(grade_id, criterion_number, score) VALUES(?, ?, ?)")
        .map_err(db_err("db_insert_failed"))?;
    for (number, score) in scores {
        stmt.execute((grade_id, number, score))
            .map_err(db_err("db_insert_failed"))?;
    }
    Ok(())
}

/// Full sheet of an evaluation: every actively enrolled student plus anyone
/// who already holds a record. Students without a record get zero
/// placeholders.
pub fn grade_sheet(
    conn: &Connection,
    evaluation_id: &str,
) -> Result<(EvaluationRow, Vec<Criterion>, Vec<SheetRow>), HandlerErr> {
    let eval = load_evaluation(conn, evaluation_id)?;
    let criteria = load_criteria(conn, evaluation_id)?;
    let roster: HashSet<String> = active_roster(conn, &eval.section_id)?.into_iter().collect();

    let mut stmt = conn
        .prepare(
            "SELECT st.id, st.id_type, st.id_number, st.last_names, st.first_names,
                    g.id, g.final_score, g.remark
             FROM students st
             LEFT JOIN grades g ON g.student_id = st.id AND g.evaluation_id = ?1
             WHERE g.id IS NOT NULL
                OR st.id IN (SELECT student_id FROM enrollments
                             WHERE section_id = ?2 AND status = 'active')
             ORDER BY st.last_names, st.first_names, st.id",
        )
        .map_err(db_err("db_query_failed"))?;
    let raw = stmt
        .query_map((evaluation_id, &eval.section_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, Option<f64>>(6)?,
                r.get::<_, Option<String>>(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut rows = Vec::with_capacity(raw.len());
    for (student_id, id_type, id_number, last, first, grade_id, final_score, remark) in raw {
        let scores = match grade_id.as_deref() {
            Some(g) => {
                let mut s = grading::placeholder_scores(&criteria);
                s.extend(load_scores(conn, g)?);
                s
            }
            None => grading::placeholder_scores(&criteria),
        };
        rows.push(SheetRow {
            enrolled: roster.contains(&student_id),
            student_id,
            display_name: format!("{}, {}", last, first),
            id_label: id_label(&id_type, &id_number),
            grade_id,
            scores,
            final_score: final_score.unwrap_or(0.0),
            remark,
        });
    }
    Ok((eval, criteria, rows))
}

fn grades_open(conn: &Connection, params: &Value) -> HandlerResult {
    let evaluation_id = required_str(params, "evaluationId")?;
    let (eval, criteria, rows) = grade_sheet(conn, &evaluation_id)?;
    Ok(json!({
        "evaluation": eval.to_json(&criteria),
        "criteria": criteria,
        "editable": grades_editable(conn)?,
        "rows": rows.iter().map(SheetRow::to_json).collect::<Vec<_>>()
    }))
}

struct PendingGrade {
    student_id: String,
    scores: BTreeMap<i64, f64>,
    final_score: f64,
    remark: Option<String>,
}

fn grades_save(conn: &Connection, params: &Value) -> HandlerResult {
    let evaluation_id = required_str(params, "evaluationId")?;
    let eval = load_evaluation(conn, &evaluation_id)?;
    let criteria = load_criteria(conn, &evaluation_id)?;
    let roster: HashSet<String> = active_roster(conn, &eval.section_id)?.into_iter().collect();
    let Some(items) = params.get("grades").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("grades must be an array"));
    };

    // Validate everything before the first write.
    let mut pending = Vec::with_capacity(items.len());
    let mut seen = HashSet::new();
    for item in items {
        let student_id = required_str(item, "studentId")?;
        if !seen.insert(student_id.clone()) {
            return Err(HandlerErr::bad_params("student listed twice")
                .with_details(json!({ "studentId": student_id })));
        }
        if !roster.contains(&student_id) {
            return Err(HandlerErr::bad_params("student is not enrolled in the evaluation's section")
                .with_details(json!({ "studentId": student_id, "sectionId": eval.section_id })));
        }
        let scores = parse_scores(item.get("scores"))?;
        grading::validate_scores(&criteria, &scores)
            .map_err(|e| HandlerErr::from(e).with_details(json!({ "studentId": student_id })))?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM grades WHERE evaluation_id = ? AND student_id = ?",
                (&evaluation_id, &student_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err("db_query_failed"))?;
        if let Some(grade_id) = existing {
            return Err(HandlerErr::conflict("grade already recorded; use grades.update to change it")
                .with_details(json!({ "studentId": student_id, "gradeId": grade_id })));
        }
        pending.push(PendingGrade {
            final_score: grading::final_score(&criteria, &scores),
            student_id,
            scores,
            remark: optional_str(item, "remark"),
        });
    }

    let tx = begin_tx(conn)?;
    let created_at = now_ts();
    let mut saved = Vec::with_capacity(pending.len());
    for p in &pending {
        let grade_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO grades(id, evaluation_id, student_id, final_score, remark, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &grade_id,
                &evaluation_id,
                &p.student_id,
                p.final_score,
                p.remark.as_deref(),
                &created_at,
            ),
        )
        .map_err(db_err("db_insert_failed"))?;
        write_scores(&tx, &grade_id, &p.scores)?;
        saved.push(json!({
            "studentId": p.student_id,
            "gradeId": grade_id,
            "finalScore": grading::round_2(p.final_score)
        }));
    }
    let status = refresh_status(&tx, &evaluation_id)?;
    commit_tx(tx)?;
    tracing::info!(evaluation_id = %evaluation_id, saved = saved.len(), status = %status, "grades saved");
    Ok(json!({ "saved": saved.len(), "grades": saved, "status": status }))
}

fn grades_update(conn: &Connection, params: &Value) -> HandlerResult {
    let grade_id = required_str(params, "gradeId")?;
    let reason = grading::require_reason(params.get("reason").and_then(|v| v.as_str()))?;
    let actor = optional_str(params, "actor").unwrap_or_else(|| DEFAULT_ACTOR.to_string());

    let (evaluation_id, old_score): (String, f64) = conn
        .query_row(
            "SELECT evaluation_id, final_score FROM grades WHERE id = ?",
            [&grade_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("grade").with_details(json!({ "gradeId": grade_id })))?;

    if !grades_editable(conn)? {
        return Err(HandlerErr::new(
            "edit_window_closed",
            "grades can only be changed while a cut-off window is open",
        ));
    }

    let criteria = load_criteria(conn, &evaluation_id)?;
    let scores = parse_scores(params.get("scores"))?;
    grading::validate_scores(&criteria, &scores)?;
    let new_score = grading::final_score(&criteria, &scores);
    let remark = optional_str(params, "remark");
    let changed_at = now_ts();

    let tx = begin_tx(conn)?;
    write_scores(&tx, &grade_id, &scores)?;
    let updated = if params.get("remark").is_some() {
        tx.execute(
            "UPDATE grades SET final_score = ?, remark = ?, updated_at = ? WHERE id = ?",
            (new_score, remark.as_deref(), &changed_at, &grade_id),
        )
    } else {
        tx.execute(
            "UPDATE grades SET final_score = ?, updated_at = ? WHERE id = ?",
            (new_score, &changed_at, &grade_id),
        )
    };
    updated.map_err(db_err("db_update_failed"))?;
    tx.execute(
        "INSERT INTO grade_history(id, grade_id, changed_at, old_score, new_score, reason, actor)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &grade_id,
            &changed_at,
            old_score,
            new_score,
            &reason,
            &actor,
        ),
    )
    .map_err(db_err("db_insert_failed"))?;
    commit_tx(tx)?;
    tracing::info!(grade_id = %grade_id, actor = %actor, old_score, new_score, "grade changed");
    Ok(json!({
        "gradeId": grade_id,
        "oldScore": grading::round_2(old_score),
        "finalScore": grading::round_2(new_score),
        "scores": scores_json(&scores),
        "changedAt": changed_at
    }))
}

fn grades_history(conn: &Connection, params: &Value) -> HandlerResult {
    let grade_id = required_str(params, "gradeId")?;
    require_row(conn, "grades", &grade_id, "grade")?;
    let mut stmt = conn
        .prepare(
            "SELECT changed_at, old_score, new_score, reason, actor FROM grade_history
             WHERE grade_id = ? ORDER BY changed_at, rowid",
        )
        .map_err(db_err("db_query_failed"))?;
    let history = stmt
        .query_map([&grade_id], |r| {
            Ok(json!({
                "changedAt": r.get::<_, String>(0)?,
                "oldScore": r.get::<_, f64>(1)?,
                "newScore": r.get::<_, f64>(2)?,
                "reason": r.get::<_, String>(3)?,
                "actor": r.get::<_, String>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "gradeId": grade_id, "history": history }))
}

fn grades_lapse_summary(conn: &Connection, params: &Value) -> HandlerResult {
    let section_id = required_str(params, "sectionId")?;
    let subject_id = required_str(params, "subjectId")?;
    let lapse_id = required_str(params, "lapseId")?;
    load_section(conn, &section_id)?;
    require_row(conn, "subjects", &subject_id, "subject")?;
    require_row(conn, "lapses", &lapse_id, "lapse")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, name, percentage FROM evaluations
             WHERE section_id = ? AND subject_id = ? AND lapse_id = ?
             ORDER BY eval_date, created_at",
        )
        .map_err(db_err("db_query_failed"))?;
    let evaluations = stmt
        .query_map((&section_id, &subject_id, &lapse_id), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, f64>(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let mut score_stmt = conn
        .prepare("SELECT final_score FROM grades WHERE evaluation_id = ? AND student_id = ?")
        .map_err(db_err("db_query_failed"))?;
    let mut name_stmt = conn
        .prepare("SELECT last_names, first_names FROM students WHERE id = ?")
        .map_err(db_err("db_query_failed"))?;

    let mut rows = Vec::new();
    for student_id in active_roster(conn, &section_id)? {
        let mut per_eval = Vec::with_capacity(evaluations.len());
        for (eval_id, _, percentage) in &evaluations {
            let score: Option<f64> = score_stmt
                .query_row((eval_id, &student_id), |r| r.get(0))
                .optional()
                .map_err(db_err("db_query_failed"))?;
            per_eval.push((score, *percentage));
        }
        let (last, first): (String, String) = name_stmt
            .query_row([&student_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .map_err(db_err("db_query_failed"))?;
        rows.push(json!({
            "studentId": student_id,
            "displayName": format!("{}, {}", last, first),
            "scores": per_eval.iter().map(|(s, _)| s.map(grading::round_2)).collect::<Vec<_>>(),
            "lapseGrade": grading::round_2(grading::lapse_grade(per_eval.iter().copied()))
        }));
    }

    let percentage_total: f64 = evaluations.iter().map(|(_, _, p)| p).sum();
    Ok(json!({
        "evaluations": evaluations
            .iter()
            .map(|(id, name, p)| json!({ "id": id, "name": name, "percentage": p }))
            .collect::<Vec<_>>(),
        "percentageTotal": percentage_total,
        "rows": rows
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "grades.open" => grades_open,
        "grades.save" => grades_save,
        "grades.update" => grades_update,
        "grades.history" => grades_history,
        "grades.lapseSummary" => grades_lapse_summary,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scores_accepts_object_and_array_forms() {
        let a = parse_scores(Some(&json!({ "1": 8, "2": 6.5 }))).expect("object");
        let b = parse_scores(Some(&json!([{ "number": 1, "score": 8 }, { "number": 2, "score": 6.5 }])))
            .expect("array");
        assert_eq!(a, b);
        assert_eq!(a.get(&2), Some(&6.5));
    }

    #[test]
    fn parse_scores_rejects_bad_shapes() {
        assert!(parse_scores(None).is_err());
        assert!(parse_scores(Some(&json!({ "x": 1 }))).is_err());
        assert!(parse_scores(Some(&json!([{ "number": 1, "score": 1 }, { "number": 1, "score": 2 }]))).is_err());
    }
}
