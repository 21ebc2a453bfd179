/// OS integration for the window/keyboard watcher: focused-window queries,
/// focus-change subscriptions and the global key listener.
///
/// Hooks run on their own threads and only forward [`DaemonEvent`]s into the
/// daemon's channel; all decisions are made by the watcher on the event loop.
use std::path::PathBuf;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::sync::mpsc;

use crate::error::WindowQueryError;
use crate::event::DaemonEvent;

#[cfg(windows)]
mod win32;

/// Identity of the focused window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveWindow {
    pub process_id: u32,
    /// Owning executable, when the platform reports it.
    pub executable_path: Option<PathBuf>,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    Down,
    Up,
}

/// Focused-window API.
pub trait WindowSource: Send {
    /// Starts delivering [`DaemonEvent::FocusChanged`] on every focus change.
    fn subscribe(&mut self) -> Result<(), WindowQueryError>;
    fn unsubscribe(&mut self) -> Result<(), WindowQueryError>;
    /// Queries the currently focused window.
    fn active_window(&self) -> Result<ActiveWindow, WindowQueryError>;
}

/// Global key listener delivering [`DaemonEvent::Key`].
pub trait KeyListener: Send {
    fn attach(&mut self) -> anyhow::Result<()>;
    /// Detaching a listener that is not attached is a no-op.
    fn detach(&mut self);
}

/// Window and keyboard integration for this platform, or `None` when focus
/// notifications are not available and the daemon should poll instead.
pub fn native(tx: &mpsc::Sender<DaemonEvent>) -> Option<(Box<dyn WindowSource>, Box<dyn KeyListener>)> {
    #[cfg(windows)]
    {
        Some((
            Box::new(win32::ForegroundWindowSource::new(tx.clone())),
            Box::new(win32::LowLevelKeyListener::new(tx.clone())),
        ))
    }

    #[cfg(not(windows))]
    {
        let _ = tx;
        None
    }
}

/// Resolves the executable of `pid`, for window sources that only report the
/// owning process.
pub fn executable_path_for_pid(pid: u32) -> Option<PathBuf> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        false,
        ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
    );
    sys.process(pid)?.exe().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn resolves_own_executable() {
        let resolved = executable_path_for_pid(std::process::id()).unwrap();
        let expected = std::env::current_exe().unwrap();
        assert_eq!(resolved.file_name(), expected.file_name());
    }

    #[test]
    fn unknown_pid_resolves_to_nothing() {
        assert!(executable_path_for_pid(u32::MAX - 1).is_none());
    }

    #[cfg(not(windows))]
    #[test]
    fn no_window_integration_off_windows() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(native(&tx).is_none());
    }
}
