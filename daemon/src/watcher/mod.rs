/// Activity watchers. Exactly one runs at a time, chosen at startup:
///
///   - [`PollingWatcher`] scans the process list on a timer and reports every
///     enrolled program it finds running.
///   - [`WindowWatcher`] follows the focused window and reports keystrokes
///     made in enrolled programs.
use std::path::PathBuf;
use std::time::Duration;

use crate::status::DaemonState;

mod polling;
mod window;

pub use polling::{PollCycle, PollingWatcher};
pub use window::WindowWatcher;

/// The watcher the daemon runs, whichever mode it is in.
pub enum ActiveWatcher {
    Polling(PollingWatcher),
    Window(WindowWatcher),
}

impl ActiveWatcher {
    pub fn start(&mut self) {
        match self {
            Self::Polling(w) => w.start(),
            Self::Window(w) => w.start(),
        }
    }

    pub fn stop(&mut self) {
        match self {
            Self::Polling(w) => w.stop(),
            Self::Window(w) => w.stop(),
        }
    }

    /// Only the polling watcher has a period; the window watcher ignores this.
    pub fn set_interval(&mut self, period: Duration) {
        if let Self::Polling(w) = self {
            w.set_interval(period);
        }
    }

    pub fn state(&self, enabled: bool) -> DaemonState {
        match self {
            _ if !enabled => DaemonState::Paused,
            Self::Polling(_) => DaemonState::Polling,
            Self::Window(w) if w.is_fallback() => DaemonState::Fallback,
            Self::Window(_) => DaemonState::Window,
        }
    }

    /// Enrolled programs known to be running. Window mode does not track this.
    pub fn running_programs(&self) -> Vec<PathBuf> {
        match self {
            Self::Polling(w) => w.currently_running_programs(),
            Self::Window(_) => Vec::new(),
        }
    }
}
