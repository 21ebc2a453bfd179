/// Error types for the detection core.
///
/// None of these are fatal to the daemon: validation errors are returned to the
/// caller, everything else is logged and degrades tracking for a cycle.
use std::path::PathBuf;

/// Failures of the enrollment registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    // ── Validation ────────────────────────────────────────────────────────────
    #[error("path does not exist: {0}")]
    PathMissing(PathBuf),

    #[error("program already enrolled: {0}")]
    AlreadyEnrolled(PathBuf),

    // ── Persistence ───────────────────────────────────────────────────────────
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize enrolled programs: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RegistryError {
    /// True for rejections of bad enrollment input.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::PathMissing(_) | Self::AlreadyEnrolled(_))
    }
}

/// Failures of the OS process-listing command.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("`{program}` produced non UTF-8 output")]
    Utf8 { program: String },
}

/// Failures of the focused-window APIs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowQueryError {
    #[error("no foreground window")]
    NoForegroundWindow,

    #[error("window API failed: {0}")]
    Os(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_variants_are_classified() {
        assert!(RegistryError::PathMissing(PathBuf::from("/x")).is_validation());
        assert!(RegistryError::AlreadyEnrolled(PathBuf::from("/x")).is_validation());

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let write = RegistryError::Write { path: PathBuf::from("/x"), source: io };
        assert!(!write.is_validation());
    }

    #[test]
    fn messages_include_the_path() {
        let err = RegistryError::AlreadyEnrolled(PathBuf::from("/usr/bin/vim"));
        assert_eq!(err.to_string(), "program already enrolled: /usr/bin/vim");
    }
}
