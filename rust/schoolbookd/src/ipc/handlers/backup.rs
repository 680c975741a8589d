use crate::backup;
use crate::db;
use crate::ipc::helpers::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn path_param(req: &Request, key: &str) -> Option<PathBuf> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

fn handle_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(out_path) = path_param(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    match backup::export_workspace_bundle(&workspace_path, &out_path) {
        Ok(export) => {
            tracing::info!(path = %out_path.display(), sha256 = %export.db_sha256, "workspace bundle exported");
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "path": out_path.to_string_lossy(),
                    "bundleFormat": export.bundle_format,
                    "entryCount": export.entry_count,
                    "dbSha256": export.db_sha256
                }),
            )
        }
        Err(e) => {
            tracing::warn!(path = %out_path.display(), error = %e, "bundle export failed");
            err(
                &req.id,
                "io_failed",
                format!("{:#}", e),
                Some(json!({ "path": out_path.to_string_lossy() })),
            )
        }
    }
}

fn handle_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(in_path) = path_param(req, "inPath") else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if !in_path.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path.to_string_lossy() })),
        );
    }

    // Drop open handle before replacing file.
    state.db = None;

    let import = backup::import_workspace_bundle(&in_path, &workspace_path);
    let reopened = db::open_db(&workspace_path);
    let conn = match reopened {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(workspace = %workspace_path.display(), error = %e, "failed to reopen workspace");
            return err(&req.id, "db_open_failed", format!("{:#}", e), None);
        }
    };
    state.db = Some(conn);

    match import {
        Ok(summary) => {
            tracing::info!(path = %in_path.display(), sha256 = %summary.db_sha256, "workspace bundle imported");
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormat": summary.bundle_format,
                    "exportedAt": summary.exported_at,
                    "dbSha256": summary.db_sha256
                }),
            )
        }
        Err(e) => {
            tracing::warn!(path = %in_path.display(), error = %e, "bundle import failed");
            err(
                &req.id,
                "io_failed",
                format!("{:#}", e),
                Some(json!({ "path": in_path.to_string_lossy() })),
            )
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_workspace_bundle(state, req)),
        _ => None,
    }
}
