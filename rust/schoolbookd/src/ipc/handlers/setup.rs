use crate::certificates::{Institution, ReportStyle};
use crate::db;
use crate::ipc::helpers::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};
use std::path::PathBuf;

#[derive(Clone, Copy)]
enum SetupSection {
    Institution,
    Reports,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "institution" => Some(Self::Institution),
            "reports" => Some(Self::Reports),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Institution => "setup.institution",
            Self::Reports => "setup.reports",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Institution => json!({
            "schoolName": "",
            "schoolCode": "",
            "city": "",
            "state": "",
            "directorName": "",
            "directorIdNumber": "",
            "logoPath": null,
            "secondaryLogoPath": null,
            "signaturePath": null
        }),
        SetupSection::Reports => json!({
            "fontSize": 11,
            "marginPt": 72,
            "lineSpacing": 1.5,
            "firstLineIndentPt": 36
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v.as_f64().ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_nullable_string_max(v: &Value, key: &str, max_len: usize) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let s = parse_string_max(v, key, max_len)?;
    if s.is_empty() {
        return Ok(Value::Null);
    }
    Ok(Value::String(s))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Institution => match k.as_str() {
                "schoolName" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 160)?));
                }
                "schoolCode" | "directorIdNumber" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 32)?.to_uppercase()));
                }
                "city" | "state" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 80)?));
                }
                "directorName" => {
                    let s = parse_string_max(v, k, 120)?;
                    obj.insert(k.clone(), Value::String(crate::ipc::helpers::upper_name(&s)));
                }
                "logoPath" | "secondaryLogoPath" | "signaturePath" => {
                    obj.insert(k.clone(), parse_nullable_string_max(v, k, 500)?);
                }
                _ => return Err(format!("unknown institution field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "fontSize" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 8, 16)?));
                }
                "marginPt" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 36, 108)?));
                }
                "lineSpacing" => {
                    obj.insert(k.clone(), Value::from(parse_f64_range(v, k, 1.0, 2.5)?));
                }
                "firstLineIndentPt" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 144)?));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(|x| x.as_str()).unwrap_or("").to_string()
}

fn path_field(v: &Value, key: &str) -> Option<PathBuf> {
    v.get(key).and_then(|x| x.as_str()).map(PathBuf::from)
}

pub fn load_institution(conn: &rusqlite::Connection) -> Result<Institution, HandlerErr> {
    let v = load_section(conn, SetupSection::Institution)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(Institution {
        school_name: str_field(&v, "schoolName"),
        school_code: str_field(&v, "schoolCode"),
        city: str_field(&v, "city"),
        state: str_field(&v, "state"),
        director_name: str_field(&v, "directorName"),
        director_id_number: str_field(&v, "directorIdNumber"),
        logo_path: path_field(&v, "logoPath"),
        secondary_logo_path: path_field(&v, "secondaryLogoPath"),
        signature_path: path_field(&v, "signaturePath"),
    })
}

pub fn load_report_style(conn: &rusqlite::Connection) -> Result<ReportStyle, HandlerErr> {
    let v = load_section(conn, SetupSection::Reports)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let num = |key: &str, default: f64| v.get(key).and_then(|x| x.as_f64()).unwrap_or(default);
    Ok(ReportStyle {
        font_size: num("fontSize", 11.0),
        margin: num("marginPt", 72.0),
        line_spacing: num("lineSpacing", 1.5),
        first_line_indent: num("firstLineIndentPt", 36.0),
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let institution = match load_section(conn, SetupSection::Institution) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let reports = match load_section(conn, SetupSection::Reports) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "institution": institution,
            "reports": reports
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section.key(), "setup updated");
    let mut result = json!({ "ok": true });
    result[section_raw] = current;
    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
