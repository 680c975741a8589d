mod backup;
mod certificates;
mod config;
mod db;
mod grading;
mod ipc;
mod layout;
mod logging;
mod pdf;

use clap::Parser;
use std::io::{self, BufRead, Write};

fn main() {
    let cfg = config::Config::parse();
    logging::init_tracing(&cfg.log_level);

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };

    if let Some(path) = cfg.workspace.as_ref() {
        // A bad startup workspace is not fatal; the UI can still select another one.
        if let Err(e) = ipc::open_workspace(&mut state, path) {
            tracing::error!(workspace = %path.display(), error = %e, "failed to open startup workspace");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                tracing::warn!(error = %e, "discarding malformed request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    tracing::info!("stdin closed, shutting down");
}
