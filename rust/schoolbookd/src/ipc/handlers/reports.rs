use crate::certificates::{
    self, AssetProblem, StudentCertificateData, TableColumn, TableReport, TeacherCertificateData,
};
use crate::grading::{self, Criterion};
use crate::ipc::handlers::grades::grade_sheet;
use crate::ipc::handlers::setup::{load_institution, load_report_style};
use crate::ipc::handlers::students::current_enrollment;
use crate::ipc::handlers::teachers::load_teacher;
use crate::ipc::helpers::{
    db_err, id_label, optional_date, parse_date, required_str, today, with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::layout::{self, Font, ParagraphStyle, Span};
use crate::pdf::{PdfDocument, PAGE_WIDTH};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

impl From<AssetProblem> for HandlerErr {
    fn from(p: AssetProblem) -> Self {
        let details = match &p {
            AssetProblem::Missing(path) | AssetProblem::Unsupported(path, _) => {
                json!({ "path": path.to_string_lossy() })
            }
        };
        HandlerErr::new(p.code(), p.message()).with_details(details)
    }
}

fn out_path(params: &Value) -> Result<PathBuf, HandlerErr> {
    let raw = required_str(params, "outPath")?;
    Ok(PathBuf::from(raw))
}

fn write_pdf(doc: &PdfDocument, path: &Path, kind: &str) -> HandlerResult {
    let bytes = doc.to_bytes();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            HandlerErr::new("io_failed", e.to_string())
                .with_details(json!({ "path": parent.to_string_lossy() }))
        })?;
    }
    std::fs::write(path, &bytes).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": path.to_string_lossy() }))
    })?;
    let sha256 = format!("{:x}", Sha256::digest(&bytes));
    tracing::info!(report = kind, path = %path.display(), pages = doc.page_count(), bytes = bytes.len(), "report written");
    Ok(json!({
        "outPath": path.to_string_lossy(),
        "pageCount": doc.page_count(),
        "byteCount": bytes.len(),
        "sha256": sha256
    }))
}

fn issued_on(params: &Value) -> Result<chrono::NaiveDate, HandlerErr> {
    Ok(optional_date(params, "issuedOn")?.unwrap_or_else(today))
}

fn reports_student_certificate(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = required_str(params, "studentId")?;
    let path = out_path(params)?;
    let (id_type, id_number, first, last): (String, String, String, String) = conn
        .query_row(
            "SELECT id_type, id_number, first_names, last_names FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("student"))?;

    let enrollment = current_enrollment(conn, &student_id)?;
    if enrollment.get("status").and_then(|v| v.as_str()) != Some("active") {
        return Err(HandlerErr::conflict("student has no active enrollment")
            .with_details(json!({ "studentId": student_id })));
    }
    let field = |k: &str| enrollment.get(k).and_then(|v| v.as_str()).unwrap_or("").to_string();

    let inst = load_institution(conn)?;
    let style = load_report_style(conn)?;
    let data = StudentCertificateData {
        full_name: format!("{} {}", first, last),
        id_label: id_label(&id_type, &id_number),
        level: field("level"),
        section_label: field("label"),
        period_name: field("periodName"),
        issued_on: issued_on(params)?,
    };
    let cert = certificates::study_certificate(&inst, &data);
    let doc = certificates::render_certificate(&inst, &style, &cert)?;
    write_pdf(&doc, &path, "studentCertificate")
}

fn reports_teacher_certificate(conn: &Connection, params: &Value) -> HandlerResult {
    let teacher_id = required_str(params, "teacherId")?;
    let path = out_path(params)?;
    let teacher = load_teacher(conn, &teacher_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT sub.name FROM teacher_subject_assignments a
             JOIN subjects sub ON sub.id = a.subject_id
             WHERE a.teacher_id = ? AND a.state = 'active'
             ORDER BY sub.name",
        )
        .map_err(db_err("db_query_failed"))?;
    let subjects = stmt
        .query_map([&teacher_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let hired_at = match teacher.hired_at.as_deref() {
        Some(raw) => Some(parse_date(raw, "hiredAt")?),
        None => None,
    };
    let inst = load_institution(conn)?;
    let style = load_report_style(conn)?;
    let data = TeacherCertificateData {
        full_name: teacher.display_name(),
        id_label: id_label(&teacher.id_type, &teacher.id_number),
        specialty: teacher.specialty.clone(),
        hired_at,
        subjects,
        issued_on: issued_on(params)?,
    };
    let cert = certificates::work_certificate(&inst, &data);
    let doc = certificates::render_certificate(&inst, &style, &cert)?;
    write_pdf(&doc, &path, "teacherCertificate")
}

const NUMBER_COL: f64 = 24.0;
const ID_COL: f64 = 76.0;
const FINAL_COL: f64 = 46.0;
const NAME_MIN: f64 = 90.0;
const CRITERION_MAX: f64 = 40.0;

/// Columns of the grade table. Criterion columns shrink so the whole table
/// stays within `usable`; the name column takes whatever is left.
fn grade_columns(criteria: &[Criterion], usable: f64) -> Vec<TableColumn> {
    let fixed = NUMBER_COL + ID_COL + FINAL_COL;
    let crit_width = if criteria.is_empty() {
        0.0
    } else {
        ((usable - fixed - NAME_MIN) / criteria.len() as f64).min(CRITERION_MAX)
    };
    let name_width = usable - fixed - crit_width * criteria.len() as f64;
    let mut columns = vec![
        TableColumn { header: "N°".into(), width: NUMBER_COL },
        TableColumn { header: "Cédula".into(), width: ID_COL },
        TableColumn { header: "Apellidos y nombres".into(), width: name_width },
    ];
    for c in criteria {
        let header = if crit_width >= CRITERION_MAX {
            format!("C{} ({})", c.number, c.weight)
        } else {
            format!("C{}", c.number)
        };
        columns.push(TableColumn { header, width: crit_width });
    }
    columns.push(TableColumn { header: "Nota".into(), width: FINAL_COL });
    columns
}

fn reports_evaluation_grades(conn: &Connection, params: &Value) -> HandlerResult {
    let evaluation_id = required_str(params, "evaluationId")?;
    let path = out_path(params)?;
    let (eval, criteria, rows) = grade_sheet(conn, &evaluation_id)?;

    let (subject, level, label, lapse): (String, String, String, String) = conn
        .query_row(
            "SELECT sub.name, s.level, s.label, l.name
             FROM evaluations e
             JOIN subjects sub ON sub.id = e.subject_id
             JOIN sections s ON s.id = e.section_id
             JOIN lapses l ON l.id = e.lapse_id
             WHERE e.id = ?",
            [&evaluation_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .map_err(db_err("db_query_failed"))?;

    let inst = load_institution(conn)?;
    let style = load_report_style(conn)?;
    let columns = grade_columns(&criteria, PAGE_WIDTH - 2.0 * style.margin);

    let table_rows = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut cells = vec![(i + 1).to_string(), row.id_label.clone(), row.display_name.clone()];
            for c in &criteria {
                let s = row.scores.get(&c.number).copied().unwrap_or(0.0);
                cells.push(format!("{:.2}", s));
            }
            cells.push(format!("{:.2}", grading::round_2(row.final_score)));
            cells
        })
        .collect();

    let report = TableReport {
        title: format!("CALIFICACIONES: {}", eval.name),
        subtitle_lines: vec![
            format!("Asignatura: {}", subject),
            format!("Sección: {} {}  Lapso: {}", level, label, lapse),
            format!("Fecha: {}  Ponderación: {}%", eval.eval_date, eval.percentage),
        ],
        columns,
        rows: table_rows,
    };
    let doc = certificates::render_table(&inst, &style, &report)?;
    let mut result = write_pdf(&doc, &path, "evaluationGrades")?;
    result["rowCount"] = json!(rows.len());
    Ok(result)
}

fn parse_spans(params: &Value) -> Result<Vec<Span>, HandlerErr> {
    if let Some(text) = params.get("text").and_then(|v| v.as_str()) {
        return Ok(vec![Span::plain(text)]);
    }
    let Some(items) = params.get("spans").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("text or spans is required"));
    };
    items
        .iter()
        .map(|item| {
            let text = item
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| HandlerErr::bad_params("every span needs text"))?;
            let underline = item.get("underline").and_then(|v| v.as_bool()).unwrap_or(false);
            Ok(Span { text: text.to_string(), underline })
        })
        .collect()
}

fn reports_layout_preview(conn: &Connection, params: &Value) -> HandlerResult {
    let spans = parse_spans(params)?;
    let style = load_report_style(conn)?;
    let num = |key: &str, default: f64| params.get(key).and_then(|v| v.as_f64()).unwrap_or(default);
    let para = ParagraphStyle {
        font: if params.get("bold").and_then(|v| v.as_bool()).unwrap_or(false) {
            Font::HelveticaBold
        } else {
            Font::Helvetica
        },
        size: num("fontSize", style.font_size),
        width: num("width", PAGE_WIDTH - 2.0 * style.margin),
        first_line_indent: num("firstLineIndent", style.first_line_indent),
    };
    if para.size <= 0.0 || para.width <= 0.0 || para.first_line_indent < 0.0 {
        return Err(HandlerErr::bad_params("fontSize and width must be positive"));
    }
    let lines = layout::layout_paragraph(&spans, &para);
    Ok(json!({
        "width": para.width,
        "fontSize": para.size,
        "lineHeight": para.size * style.line_spacing,
        "lines": lines
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "reports.studentCertificate" => reports_student_certificate,
        "reports.teacherCertificate" => reports_teacher_certificate,
        "reports.evaluationGrades" => reports_evaluation_grades,
        "reports.layoutPreview" => reports_layout_preview,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
