use clap::Parser;
use std::path::PathBuf;

/// Process-level settings. Institution and report settings live in the
/// workspace database instead (see `setup.get`).
#[derive(Debug, Parser, Clone)]
#[command(name = "schoolbookd", version, about = "School records sidecar daemon")]
pub struct Config {
    /// Workspace directory to open before reading requests.
    #[arg(long, env = "SCHOOLBOOK_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    #[arg(long, env = "SCHOOLBOOK_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}
