use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Current operational state of the daemon.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    /// Starting up or shutting down; no watcher is active.
    Idle,
    /// The polling watcher is scanning the process list.
    Polling,
    /// The window watcher is following focus changes.
    Window,
    /// Focus notifications are unavailable; keystrokes are still tracked.
    Fallback,
    /// Tracking is disabled in the config.
    Paused,
}

/// Runtime status written by the daemon to `<data_dir>/Tally/status.toml`.
/// The `status` subcommand reads this file to report on a running daemon.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: DaemonState,
    /// Enrolled programs seen running in the last polling cycle.
    #[serde(default)]
    pub running_programs: Vec<String>,
    #[serde(default)]
    pub heartbeats_sent: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Human-readable error message if the daemon encountered a non-fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonStatus {
    /// Constructs the initial idle status on daemon startup.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: DaemonState::Idle,
            running_programs: Vec::new(),
            heartbeats_sent: 0,
            last_heartbeat: None,
            error: None,
        }
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged; a status write never stops the daemon.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(dir = %parent.display(), error = %e, "Failed to create status directory");
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!(path = %path.display(), error = %e, "Failed to write status file");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize status"),
    }
}

/// Reads the status file written by a running daemon.
pub fn read_status(path: &Path) -> anyhow::Result<DaemonStatus> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read status file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse status file: {}", path.display()))
}
