use std::path::PathBuf;

use crate::config::Config;
use crate::platform::{ActiveWindow, KeyEvent};

pub enum DaemonEvent {
    /// The focused window changed (window mode).
    FocusChanged(ActiveWindow),
    /// A key went down or up anywhere on the desktop (window mode).
    Key(KeyEvent),
    /// A polling cycle saw an enrolled program start or exit. Carries the
    /// programs running after that cycle.
    RunningChanged(Vec<PathBuf>),
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// The enrollment file was edited by someone else (usually the CLI).
    RegistryChanged,
    /// Ctrl+C received; the daemon should stop its watcher and exit.
    Shutdown,
}
