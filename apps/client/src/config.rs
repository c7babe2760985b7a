use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Which backing the history store uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryBacking {
    /// JSON file on this machine, no account needed.
    Local,
    /// The service's per-account history; requires a session.
    Remote,
}

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub session_token: Option<String>,
    pub history: HistoryBacking,
    pub history_path: PathBuf,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let session_token = std::env::var("COVERLETTER_SESSION")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let history = match std::env::var("COVERLETTER_HISTORY")
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "local" => HistoryBacking::Local,
            "remote" => HistoryBacking::Remote,
            other => bail!("COVERLETTER_HISTORY must be 'local' or 'remote', got '{other}'"),
        };

        if history == HistoryBacking::Remote && session_token.is_none() {
            bail!("COVERLETTER_HISTORY=remote requires COVERLETTER_SESSION to be set");
        }

        Ok(Config {
            api_url: require_env("COVERLETTER_API_URL")?,
            session_token,
            history,
            history_path: std::env::var("COVERLETTER_HISTORY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("coverletter-history.json")),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}
