/// Process scanner: answers "is executable X running right now" by listing OS
/// processes through a platform listing command.
///
/// The platform variant is picked once by [`native_lister`]; the matching
/// rules in [`ProcessScanner`] are the same everywhere.
mod ps;
mod tasklist;

use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::ScanError;

pub use ps::PsLister;
pub use tasklist::TasklistLister;

/// Longest suffix treated as a file extension by the name match.
const MAX_EXTENSION_LEN: usize = 4;

/// One row of a process listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Short executable name as reported by the OS (`comm`, image name).
    pub name: String,
    /// Full command line, or the best approximation the platform exposes.
    pub command: String,
}

/// "Return pid + short name + full command line for every process visible to
/// the current user."
pub trait ProcessLister: Send + Sync {
    fn list(&self) -> Result<Vec<ProcessEntry>, ScanError>;
}

/// Returns the listing variant for the platform we were compiled for.
pub fn native_lister() -> Box<dyn ProcessLister> {
    if cfg!(windows) {
        Box::new(TasklistLister)
    } else if cfg!(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    )) {
        Box::new(PsLister::bsd())
    } else {
        Box::new(PsLister::posix())
    }
}

pub struct ProcessScanner {
    lister: Box<dyn ProcessLister>,
}

impl ProcessScanner {
    pub fn new(lister: Box<dyn ProcessLister>) -> Self {
        Self { lister }
    }

    /// Takes a fresh snapshot. Listing failures are logged and yield an empty
    /// snapshot; the next scan simply tries again.
    pub fn list_running_processes(&self) -> Vec<ProcessEntry> {
        match self.lister.list() {
            Ok(processes) => processes,
            Err(e) => {
                warn!(error = %e, "Process listing failed");
                Vec::new()
            }
        }
    }

    /// True if any currently running process matches `executable`.
    pub fn is_running(&self, executable: &Path) -> bool {
        snapshot_contains(&self.list_running_processes(), executable)
    }

    /// Returns the candidates that are currently running, in input order.
    ///
    /// One snapshot is taken and shared by every candidate.
    pub fn running_subset_of<P: AsRef<Path>>(&self, candidates: &[P]) -> Vec<PathBuf> {
        let snapshot = self.list_running_processes();
        candidates
            .iter()
            .map(AsRef::as_ref)
            .filter(|path| snapshot_contains(&snapshot, path))
            .map(Path::to_path_buf)
            .collect()
    }
}

/// Three-way match of `executable` against a snapshot:
///   1. the short name equals the executable's basename,
///   2. the command line contains the full executable path,
///   3. the short name equals the basename once both lose their extensions.
///
/// Listings differ in how much of the path they expose, so the rules are
/// deliberately loose. Rule 2 can match an unrelated process that merely
/// mentions the path in its arguments.
pub fn snapshot_contains(snapshot: &[ProcessEntry], executable: &Path) -> bool {
    let full = executable.to_string_lossy();
    let name = basename(&full);
    if name.is_empty() {
        return false;
    }
    let stem = strip_extensions(name);

    snapshot.iter().any(|p| {
        (!p.name.is_empty() && p.name == name)
            || p.command.contains(&*full)
            || (!stem.is_empty() && strip_extensions(&p.name) == stem)
    })
}

/// Removes trailing extensions ("Code.exe" -> "Code", "app.tar.gz" -> "app").
///
/// Only short suffixes that start with a letter count as extensions, so
/// version numbers and reverse-DNS names stay whole ("python3.11",
/// "com.apple.Safari"). A leading dot is part of the name.
fn strip_extensions(name: &str) -> &str {
    let mut stem = name;
    while let Some(i) = stem.rfind('.') {
        if i == 0 || !is_extension(&stem[i + 1..]) {
            break;
        }
        stem = &stem[..i];
    }
    stem
}

fn is_extension(suffix: &str) -> bool {
    (1..=MAX_EXTENSION_LEN).contains(&suffix.len())
        && suffix.starts_with(|c: char| c.is_ascii_alphabetic())
        && suffix.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Basename of a path-like string using either separator.
fn basename(s: &str) -> &str {
    s.rsplit(['/', '\\']).next().unwrap_or(s)
}
