use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::event::DaemonEvent;

pub const MIN_POLL_INTERVAL_SECS: u32 = 5;
pub const MAX_POLL_INTERVAL_SECS: u32 = 3600;
pub const DEFAULT_POLL_INTERVAL_SECS: u32 = 60;
pub const DEFAULT_MIN_HEARTBEAT_INTERVAL_SECS: u32 = 120;

/// Root configuration structure. Deserialized from `<data_dir>/Tally/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

/// Which watcher the daemon runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherMode {
    /// Window mode where the platform supports it, polling otherwise.
    #[default]
    Auto,
    Polling,
    Window,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Seconds between polling cycles. Clamped to [5, 3600].
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u32,
    #[serde(default)]
    pub watcher_mode: WatcherMode,
    /// `false` pauses the active watcher without stopping the daemon.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            watcher_mode: WatcherMode::Auto,
            enabled: true,
        }
    }
}

impl GlobalConfig {
    pub fn effective_poll_interval(&self) -> Duration {
        let secs = self
            .poll_interval_secs
            .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS);
        Duration::from_secs(u64::from(secs))
    }
}

/// Where heartbeats go and how they identify themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_plugin")]
    pub plugin: String,
    /// Heartbeat CLI to spawn. Without one, heartbeats are only logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Extra arguments appended to every invocation of `command`.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Same-entity heartbeats closer together than this are coalesced.
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            plugin: default_plugin(),
            command: None,
            args: Vec::new(),
            api_key: None,
            min_interval_secs: DEFAULT_MIN_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Writes `config` to `path` as pretty TOML, creating the parent directory.
pub fn save(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

/// What a filesystem event in the data directory means to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Config,
    Registry,
}

fn classify_change(event: &notify::Event, config_path: &Path, registry_path: &Path) -> Option<Change> {
    let is_write = matches!(
        event.kind,
        notify::EventKind::Create(_) | notify::EventKind::Modify(_) | notify::EventKind::Remove(_)
    );
    if !is_write {
        return None;
    }
    if event.paths.iter().any(|p| p == config_path) {
        Some(Change::Config)
    } else if event.paths.iter().any(|p| p == registry_path) {
        Some(Change::Registry)
    } else {
        None
    }
}

/// Watches `dir` (non-recursively) and reports edits to the config and
/// enrollment files as `ConfigReloaded` / `RegistryChanged` events. Returns
/// when the receiving side of `tx` is gone.
pub async fn watch_files(
    dir: PathBuf,
    config_path: PathBuf,
    registry_path: PathBuf,
    tx: mpsc::Sender<DaemonEvent>,
) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "Failed to create file watcher");
            return;
        }
    };

    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(dir = %dir.display(), error = %e, "Failed to create data directory");
    }
    // Watch the directory rather than the files so editor-style atomic saves
    // (write-new + rename) are seen.
    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        error!(dir = %dir.display(), error = %e, "Failed to watch data directory");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let daemon_event = match classify_change(&event, &config_path, &registry_path) {
            Some(Change::Config) => match load_or_default(&config_path) {
                Ok(config) => DaemonEvent::ConfigReloaded(config),
                Err(e) => {
                    warn!(error = %e, "Failed to reload config");
                    continue;
                }
            },
            Some(Change::Registry) => DaemonEvent::RegistryChanged,
            None => continue,
        };
        debug!(paths = ?event.paths, "Data file changed");
        if tx.send(daemon_event).await.is_err() {
            break;
        }
    }
}

fn default_poll_interval() -> u32 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_enabled() -> bool {
    true
}

fn default_plugin() -> String {
    concat!("tally-daemon/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_min_interval() -> u32 {
    DEFAULT_MIN_HEARTBEAT_INTERVAL_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(poll_secs: u32) -> GlobalConfig {
        GlobalConfig {
            poll_interval_secs: poll_secs,
            ..GlobalConfig::default()
        }
    }

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn global_config_default_values() {
        let g = GlobalConfig::default();
        assert_eq!(g.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(g.watcher_mode, WatcherMode::Auto);
        assert!(g.enabled);
    }

    #[test]
    fn heartbeat_config_defaults_to_logging() {
        let h = HeartbeatConfig::default();
        assert!(h.command.is_none());
        assert!(h.api_key.is_none());
        assert!(h.plugin.starts_with("tally-daemon/"));
        assert_eq!(h.min_interval_secs, DEFAULT_MIN_HEARTBEAT_INTERVAL_SECS);
    }

    // ── effective_poll_interval ───────────────────────────────────────────────

    #[test]
    fn effective_poll_interval_passes_through_in_range() {
        assert_eq!(global(90).effective_poll_interval(), Duration::from_secs(90));
    }

    #[test]
    fn effective_poll_interval_clamps_below_min() {
        assert_eq!(
            global(0).effective_poll_interval(),
            Duration::from_secs(u64::from(MIN_POLL_INTERVAL_SECS))
        );
    }

    #[test]
    fn effective_poll_interval_clamps_above_max() {
        assert_eq!(
            global(86_400).effective_poll_interval(),
            Duration::from_secs(u64::from(MAX_POLL_INTERVAL_SECS))
        );
    }

    // ── load_or_default ───────────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_default(&dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_or_default_parses_valid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[global]
poll_interval_secs = 30
watcher_mode = "polling"
enabled = false

[heartbeat]
plugin = "custom/1.0"
command = "wakatime-cli"
args = ["--verbose"]
api_key = "waka_123"
min_interval_secs = 60
"#,
        )
        .unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.global.poll_interval_secs, 30);
        assert_eq!(config.global.watcher_mode, WatcherMode::Polling);
        assert!(!config.global.enabled);
        assert_eq!(config.heartbeat.plugin, "custom/1.0");
        assert_eq!(config.heartbeat.command.as_deref(), Some("wakatime-cli"));
        assert_eq!(config.heartbeat.args, vec!["--verbose".to_string()]);
        assert_eq!(config.heartbeat.api_key.as_deref(), Some("waka_123"));
        assert_eq!(config.heartbeat.min_interval_secs, 60);
    }

    #[test]
    fn load_or_default_partial_toml_uses_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[global]\nwatcher_mode = \"window\"\n").unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.global.watcher_mode, WatcherMode::Window);
        assert_eq!(config.global.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert!(config.global.enabled);
        assert_eq!(config.heartbeat, HeartbeatConfig::default());
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is not valid toml ][[[").unwrap();
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn load_or_default_unknown_mode_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[global]\nwatcher_mode = \"sometimes\"\n").unwrap();
        assert!(load_or_default(&path).is_err());
    }

    // ── save ──────────────────────────────────────────────────────────────────

    #[test]
    fn save_then_load_preserves_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.global.enabled = false;
        config.global.poll_interval_secs = 15;
        save(&path, &config).unwrap();

        assert_eq!(load_or_default(&path).unwrap(), config);
    }

    #[test]
    fn save_omits_unset_optionals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        save(&path, &Config::default()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("api_key"));
        assert!(!content.contains("command"));
    }

    // ── classify_change ───────────────────────────────────────────────────────

    fn event(kind: notify::EventKind, path: &Path) -> notify::Event {
        notify::Event::new(kind).add_path(path.to_path_buf())
    }

    #[test]
    fn changes_map_to_the_right_file() {
        let config = Path::new("/data/config.toml");
        let registry = Path::new("/data/programs.toml");
        let modify = notify::EventKind::Modify(notify::event::ModifyKind::Any);

        assert_eq!(classify_change(&event(modify, config), config, registry), Some(Change::Config));
        assert_eq!(
            classify_change(&event(modify, registry), config, registry),
            Some(Change::Registry)
        );
        assert_eq!(
            classify_change(&event(modify, Path::new("/data/status.toml")), config, registry),
            None
        );
    }

    #[test]
    fn access_events_are_ignored() {
        let config = Path::new("/data/config.toml");
        let registry = Path::new("/data/programs.toml");
        let access = notify::EventKind::Access(notify::event::AccessKind::Any);
        assert_eq!(classify_change(&event(access, config), config, registry), None);
    }

    #[tokio::test]
    async fn watcher_reports_config_edit() {
        let dir = tempfile::tempdir().unwrap();
        // Event paths are canonical; temp dirs may sit behind a symlink.
        let root = dir.path().canonicalize().unwrap();
        let config_path = root.join("config.toml");
        let registry_path = root.join("programs.toml");
        let (tx, mut rx) = mpsc::channel(8);

        let task = tokio::spawn(watch_files(
            root.clone(),
            config_path.clone(),
            registry_path,
            tx,
        ));
        // Give the watcher a moment to register before writing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&config_path, "[global]\nenabled = false\n").unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(DaemonEvent::ConfigReloaded(config)) if !config.global.enabled => {
                        return true
                    }
                    Some(_) => continue,
                    None => return false,
                }
            }
        })
        .await
        .unwrap_or(false);

        task.abort();
        assert!(received);
    }
}
