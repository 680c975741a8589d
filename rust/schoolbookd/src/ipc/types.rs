use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One request line: `{"id": "...", "method": "students.create", "params": {...}}`.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Daemon state shared by all handlers. `db` is `None` until a workspace is
/// selected.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
