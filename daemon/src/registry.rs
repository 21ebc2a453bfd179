/// Enrollment registry: the persisted set of executables the user asked us to
/// track.
///
/// The registry is the single owner of the program list and of its on-disk
/// mirror (`programs.toml`). Every mutation is written through immediately and
/// the whole file is rewritten each time. Persistence failures are logged and
/// the in-memory list stays authoritative.
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::RegistryError;

/// A user-selected executable that is a candidate for tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledProgram {
    pub id: String,
    /// Display name, the final segment of `path`.
    pub name: String,
    pub path: PathBuf,
    pub enrolled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// On-disk layout of `programs.toml`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ProgramsFile {
    #[serde(default)]
    programs: Vec<EnrolledProgram>,
}

pub struct Registry {
    file: PathBuf,
    programs: Vec<EnrolledProgram>,
    /// Content of the last successful write, used to ignore our own file
    /// change notifications.
    last_written: Option<String>,
}

impl Registry {
    /// Loads the registry persisted at `file`.
    ///
    /// A missing file starts an empty registry; an unreadable or malformed one
    /// is logged and also treated as empty. Entries whose executable no longer
    /// exists are pruned, and the result is written back, so every load leaves
    /// the file consistent with the filesystem.
    pub fn load(file: impl Into<PathBuf>) -> Self {
        let mut registry = Self {
            file: file.into(),
            programs: Vec::new(),
            last_written: None,
        };
        registry.programs = registry.read_pruned();
        registry.persist();
        registry
    }

    /// Re-reads the backing file after it changed on disk.
    ///
    /// Returns `false` without touching anything when the file still holds the
    /// content this registry wrote last.
    /// A file that cannot be parsed (say, caught mid-write) leaves the current
    /// programs in place.
    pub fn reload(&mut self) -> bool {
        let adopted = self.adopt_external_changes();
        if adopted {
            self.persist();
        }
        adopted
    }

    /// Enrolls `path` for tracking and returns the new record.
    pub fn enroll(&mut self, path: &Path) -> Result<EnrolledProgram, RegistryError> {
        if !path.exists() {
            return Err(RegistryError::PathMissing(path.to_path_buf()));
        }
        self.adopt_external_changes();
        if self.is_enrolled(path) {
            return Err(RegistryError::AlreadyEnrolled(path.to_path_buf()));
        }

        let program = EnrolledProgram {
            id: generate_id(),
            name: display_name(path),
            path: path.to_path_buf(),
            enrolled_at: Utc::now(),
            last_seen: None,
        };
        self.programs.push(program.clone());
        self.persist();

        info!(id = %program.id, path = %path.display(), "Program enrolled");
        Ok(program)
    }

    /// Removes the program with `id`. Returns `None` if no such program exists.
    pub fn remove(&mut self, id: &str) -> Option<EnrolledProgram> {
        self.adopt_external_changes();
        let index = self.programs.iter().position(|p| p.id == id)?;
        let removed = self.programs.remove(index);
        self.persist();

        info!(id = %removed.id, path = %removed.path.display(), "Program removed");
        Some(removed)
    }

    pub fn is_enrolled(&self, path: &Path) -> bool {
        self.get_by_path(path).is_some()
    }

    pub fn get_by_path(&self, path: &Path) -> Option<&EnrolledProgram> {
        self.programs.iter().find(|p| p.path == path)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&EnrolledProgram> {
        self.programs.iter().find(|p| p.id == id)
    }

    pub fn list_all(&self) -> &[EnrolledProgram] {
        &self.programs
    }

    pub fn list_paths(&self) -> Vec<PathBuf> {
        self.programs.iter().map(|p| p.path.clone()).collect()
    }

    /// Stamps `last_seen = now` on the program enrolled at `path`, if any.
    pub fn touch_last_seen(&mut self, path: &Path) {
        self.adopt_external_changes();
        let Some(program) = self.programs.iter_mut().find(|p| p.path == path) else {
            return;
        };
        program.last_seen = Some(Utc::now());
        self.persist();
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    fn read_pruned(&self) -> Vec<EnrolledProgram> {
        match read_file(&self.file) {
            Ok(programs) => prune_missing(programs),
            Err(e) => {
                warn!(error = %e, "Enrolled programs unreadable; starting empty");
                Vec::new()
            }
        }
    }

    /// Takes over the on-disk list when another process rewrote the file since
    /// our last write, so the next write does not clobber its edit. Returns
    /// whether anything was taken over.
    fn adopt_external_changes(&mut self) -> bool {
        let on_disk = std::fs::read_to_string(&self.file).ok();
        if on_disk == self.last_written {
            return false;
        }
        match read_file(&self.file) {
            Ok(programs) => {
                self.programs = prune_missing(programs);
                true
            }
            Err(e) => {
                warn!(error = %e, "Enrolled programs unreadable; keeping current set");
                false
            }
        }
    }

    /// Writes the full program list, logging rather than propagating failures.
    fn persist(&mut self) {
        match write_file(&self.file, &self.programs) {
            Ok(content) => self.last_written = Some(content),
            Err(e) => warn!(error = %e, "Failed to persist enrolled programs"),
        }
    }
}

/// Drops programs whose executable no longer exists.
fn prune_missing(programs: Vec<EnrolledProgram>) -> Vec<EnrolledProgram> {
    programs
        .into_iter()
        .filter(|p| {
            let exists = p.path.exists();
            if !exists {
                info!(
                    id = %p.id,
                    path = %p.path.display(),
                    "Dropping enrolled program whose executable no longer exists"
                );
            }
            exists
        })
        .collect()
}

/// Reads `file`, returning an empty list when it does not exist yet.
fn read_file(file: &Path) -> Result<Vec<EnrolledProgram>, RegistryError> {
    if !file.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(file).map_err(|source| RegistryError::Read {
        path: file.to_path_buf(),
        source,
    })?;
    let parsed: ProgramsFile = toml::from_str(&content).map_err(|source| RegistryError::Parse {
        path: file.to_path_buf(),
        source,
    })?;
    Ok(parsed.programs)
}

/// Serializes `programs` to `file`, returning the written content.
fn write_file(file: &Path, programs: &[EnrolledProgram]) -> Result<String, RegistryError> {
    let content = toml::to_string_pretty(&ProgramsFile {
        programs: programs.to_vec(),
    })?;
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent).map_err(|source| RegistryError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(file, &content).map_err(|source| RegistryError::Write {
        path: file.to_path_buf(),
        source,
    })?;
    Ok(content)
}

/// Time-ordered id with a random suffix: `<unix millis hex>-<u32 hex>`.
fn generate_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen();
    format!("{millis:x}-{suffix:08x}")
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    /// Temp dir holding a registry file and two fake executables.
    fn fixture() -> (TempDir, PathBuf, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("programs.toml");
        let editor = dir.path().join("editor.exe");
        let browser = dir.path().join("browser");
        std::fs::write(&editor, b"").unwrap();
        std::fs::write(&browser, b"").unwrap();
        (dir, file, editor, browser)
    }

    // ── load ──────────────────────────────────────────────────────────────────

    #[test]
    fn load_missing_file_starts_empty_and_persists() {
        let (_dir, file, _, _) = fixture();
        let registry = Registry::load(&file);
        assert!(registry.list_all().is_empty());
        assert!(file.exists());
    }

    #[test]
    fn load_malformed_file_is_treated_as_empty() {
        let (_dir, file, _, _) = fixture();
        std::fs::write(&file, "this is not valid toml ][[[").unwrap();
        let registry = Registry::load(&file);
        assert!(registry.list_all().is_empty());

        // The broken file is replaced by a valid empty one.
        let reloaded = Registry::load(&file);
        assert!(reloaded.list_all().is_empty());
        assert!(toml::from_str::<ProgramsFile>(&std::fs::read_to_string(&file).unwrap()).is_ok());
    }

    #[test]
    fn load_round_trips_enrolled_programs() {
        let (_dir, file, editor, browser) = fixture();
        let mut registry = Registry::load(&file);
        let a = registry.enroll(&editor).unwrap();
        let b = registry.enroll(&browser).unwrap();
        registry.touch_last_seen(&editor);

        let reloaded = Registry::load(&file);
        assert_eq!(reloaded.list_all().len(), 2);
        assert_eq!(reloaded.get_by_id(&a.id).unwrap().path, editor);
        assert!(reloaded.get_by_id(&a.id).unwrap().last_seen.is_some());
        assert_eq!(reloaded.get_by_id(&b.id).unwrap().name, "browser");
        assert!(reloaded.get_by_id(&b.id).unwrap().last_seen.is_none());
    }

    #[test]
    fn load_prunes_programs_whose_path_was_deleted() {
        let (_dir, file, editor, browser) = fixture();
        let mut registry = Registry::load(&file);
        registry.enroll(&editor).unwrap();
        registry.enroll(&browser).unwrap();
        drop(registry);

        std::fs::remove_file(&browser).unwrap();

        let reloaded = Registry::load(&file);
        assert_eq!(reloaded.list_paths(), vec![editor.clone()]);

        // The pruned set was written back.
        let content = std::fs::read_to_string(&file).unwrap();
        assert!(!content.contains("browser"));
        assert!(content.contains("editor.exe"));
    }

    // ── enroll ────────────────────────────────────────────────────────────────

    #[test]
    fn enroll_adds_exactly_one_record() {
        let (_dir, file, editor, _) = fixture();
        let mut registry = Registry::load(&file);
        let program = registry.enroll(&editor).unwrap();

        assert_eq!(program.name, "editor.exe");
        assert_eq!(program.path, editor);
        assert!(program.last_seen.is_none());
        assert!(registry.is_enrolled(&editor));
        assert_eq!(registry.list_all().iter().filter(|p| p.path == editor).count(), 1);
        assert_eq!(registry.get_by_path(&editor), Some(&program));
    }

    #[test]
    fn enroll_missing_path_is_rejected() {
        let (dir, file, _, _) = fixture();
        let mut registry = Registry::load(&file);
        let missing = dir.path().join("nope");

        let err = registry.enroll(&missing).unwrap_err();
        assert!(matches!(err, RegistryError::PathMissing(_)));
        assert!(err.is_validation());
        assert!(registry.list_all().is_empty());
    }

    #[test]
    fn enroll_duplicate_path_is_rejected_without_duplicating() {
        let (_dir, file, editor, _) = fixture();
        let mut registry = Registry::load(&file);
        registry.enroll(&editor).unwrap();

        let err = registry.enroll(&editor).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyEnrolled(_)));
        assert_eq!(registry.list_all().len(), 1);
    }

    #[test]
    fn generated_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    // ── remove ────────────────────────────────────────────────────────────────

    #[test]
    fn remove_unknown_id_is_not_found() {
        let (_dir, file, editor, _) = fixture();
        let mut registry = Registry::load(&file);
        registry.enroll(&editor).unwrap();
        let before = registry.list_all().to_vec();

        assert!(registry.remove("does-not-exist").is_none());
        assert_eq!(registry.list_all(), before.as_slice());
    }

    #[test]
    fn remove_existing_id_unenrolls_and_persists() {
        let (_dir, file, editor, _) = fixture();
        let mut registry = Registry::load(&file);
        let program = registry.enroll(&editor).unwrap();

        let removed = registry.remove(&program.id).unwrap();
        assert_eq!(removed.id, program.id);
        assert!(!registry.is_enrolled(&editor));
        assert!(Registry::load(&file).list_all().is_empty());
    }

    // ── touch_last_seen ───────────────────────────────────────────────────────

    #[test]
    fn touch_last_seen_ignores_unknown_paths() {
        let (_dir, file, editor, browser) = fixture();
        let mut registry = Registry::load(&file);
        registry.enroll(&editor).unwrap();

        registry.touch_last_seen(&browser);
        assert!(registry.get_by_path(&editor).unwrap().last_seen.is_none());

        registry.touch_last_seen(&editor);
        assert!(registry.get_by_path(&editor).unwrap().last_seen.is_some());
    }

    // ── reload ────────────────────────────────────────────────────────────────

    #[test]
    fn reload_skips_our_own_writes() {
        let (_dir, file, editor, _) = fixture();
        let mut registry = Registry::load(&file);
        registry.enroll(&editor).unwrap();
        assert!(!registry.reload());
    }

    #[test]
    fn reload_picks_up_external_changes() {
        let (_dir, file, editor, browser) = fixture();
        let mut daemon_side = Registry::load(&file);
        daemon_side.enroll(&editor).unwrap();

        let mut cli_side = Registry::load(&file);
        cli_side.enroll(&browser).unwrap();

        assert!(daemon_side.reload());
        assert!(daemon_side.is_enrolled(&browser));
        assert!(daemon_side.is_enrolled(&editor));
    }

    #[test]
    fn stamping_last_seen_keeps_an_enrollment_made_elsewhere() {
        let (_dir, file, editor, browser) = fixture();
        let mut daemon_side = Registry::load(&file);
        daemon_side.enroll(&editor).unwrap();

        let mut cli_side = Registry::load(&file);
        cli_side.enroll(&browser).unwrap();

        // A poll tick lands before the file notification is handled.
        daemon_side.touch_last_seen(&editor);
        assert!(daemon_side.is_enrolled(&browser));
        assert!(!daemon_side.reload());

        let on_disk = Registry::load(&file);
        assert!(on_disk.is_enrolled(&browser));
        assert!(on_disk.get_by_path(&editor).unwrap().last_seen.is_some());
    }

    #[test]
    fn remove_keeps_an_enrollment_made_elsewhere() {
        let (_dir, file, editor, browser) = fixture();
        let mut daemon_side = Registry::load(&file);
        let program = daemon_side.enroll(&editor).unwrap();

        Registry::load(&file).enroll(&browser).unwrap();

        daemon_side.remove(&program.id).unwrap();
        assert_eq!(Registry::load(&file).list_paths(), vec![browser]);
    }

    #[test]
    fn missing_file_with_no_prior_write_does_not_drop_programs() {
        let (dir, _, editor, _) = fixture();
        // A registry file under a regular file can never be written.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let mut registry = Registry::load(blocker.join("programs.toml"));

        registry.enroll(&editor).unwrap();
        registry.touch_last_seen(&editor);
        assert!(registry.is_enrolled(&editor));
    }

    #[test]
    fn reload_of_half_written_file_keeps_programs() {
        let (_dir, file, editor, _) = fixture();
        let mut registry = Registry::load(&file);
        registry.enroll(&editor).unwrap();

        std::fs::write(&file, "[[programs]]\nid = \"trunc").unwrap();
        assert!(!registry.reload());
        assert!(registry.is_enrolled(&editor));
    }
}
