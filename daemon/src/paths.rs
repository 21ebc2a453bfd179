/// Canonical file paths for Tally data files.
///
/// Everything lives under `<data_dir>/Tally/`:
///   - config.toml    Written by the user or the CLI, read by the daemon.
///   - programs.toml  Enrolled programs, owned by the registry.
///   - status.toml    Written by the daemon, read by the CLI.
///
/// `TALLY_HOME` overrides the directory.
use anyhow::{Context, Result};
use std::path::PathBuf;

const APP_DIR_NAME: &str = "Tally";
const HOME_OVERRIDE_VAR: &str = "TALLY_HOME";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const PROGRAMS_FILE_NAME: &str = "programs.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the Tally application data directory.
pub fn app_data_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_OVERRIDE_VAR) {
        return Ok(PathBuf::from(home));
    }
    let base = dirs::data_dir().context("Per-user data directory could not be determined")?;
    Ok(base.join(APP_DIR_NAME))
}

/// `<app_data_dir>/config.toml`
pub fn config_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(CONFIG_FILE_NAME))
}

/// `<app_data_dir>/programs.toml`
pub fn programs_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(PROGRAMS_FILE_NAME))
}

/// `<app_data_dir>/status.toml`
pub fn status_file_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join(STATUS_FILE_NAME))
}
