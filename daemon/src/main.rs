mod classify;
mod config;
mod error;
mod event;
mod heartbeat;
mod paths;
mod platform;
mod registry;
mod scanner;
mod sink;
mod status;
mod watcher;

use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::classify::AppClassifier;
use crate::config::{Config, WatcherMode};
use crate::event::DaemonEvent;
use crate::heartbeat::Dispatcher;
use crate::registry::Registry;
use crate::scanner::ProcessScanner;
use crate::status::{DaemonState, DaemonStatus};
use crate::watcher::{ActiveWatcher, PollCycle, PollingWatcher, WindowWatcher};

/// How often the status file picks up heartbeat counters between events.
const STATUS_REFRESH: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "tally-daemon", version, about = "Automatic time tracking for enrolled programs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground (default)
    Run,
    /// Manage enrolled programs
    Programs {
        #[command(subcommand)]
        action: ProgramsCommand,
    },
    /// Show what the running daemon is doing
    Status,
    /// Stop tracking until resumed
    Pause,
    /// Resume tracking
    Resume,
    /// Set the polling interval in seconds
    Interval { secs: u32 },
}

#[derive(Subcommand)]
enum ProgramsCommand {
    /// List enrolled programs
    List,
    /// Enroll an executable
    Add { path: PathBuf },
    /// Remove an enrolled program by id
    Remove { id: String },
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon().await,
        Command::Programs { action } => programs(action),
        Command::Status => print_status(),
        Command::Pause => update_config(|c| c.global.enabled = false),
        Command::Resume => update_config(|c| c.global.enabled = true),
        Command::Interval { secs } => set_poll_interval(secs),
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let debug_enabled = env::var("TALLY_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ── Daemon ────────────────────────────────────────────────────────────────────

async fn run_daemon() -> Result<()> {
    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = paths::app_data_dir()?;
    std::fs::create_dir_all(&app_dir)
        .with_context(|| format!("Failed to create app data directory {}", app_dir.display()))?;

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path()?;
    let mut config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Config unusable; using defaults");
        Config::default()
    });

    // ── Initial status ────────────────────────────────────────────────────────
    let status_path = paths::status_file_path()?;
    let mut current_status = DaemonStatus::new();
    status::write_status(&status_path, &current_status);

    // ── Core ──────────────────────────────────────────────────────────────────
    let programs_path = paths::programs_file_path()?;
    let registry = Arc::new(Mutex::new(Registry::load(programs_path.clone())));
    let dispatcher = Arc::new(Dispatcher::new(
        config.heartbeat.plugin.clone(),
        sink::from_config(&config.heartbeat),
    ));

    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(64);
    let mut active = build_watcher(&config, Arc::clone(&registry), Arc::clone(&dispatcher), &event_tx);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_files(
        app_dir,
        config_path,
        programs_path,
        event_tx.clone(),
    ));

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(DaemonEvent::Shutdown).await;
            }
        });
    }

    if config.global.enabled {
        active.start();
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        state = ?active.state(config.global.enabled),
        "tally-daemon started"
    );
    refresh_status(&mut current_status, &active, &config, &dispatcher, &status_path);

    // ── Event loop ────────────────────────────────────────────────────────────
    let mut status_ticker = tokio::time::interval(STATUS_REFRESH);

    loop {
        let evt = tokio::select! {
            evt = event_rx.recv() => match evt {
                Some(evt) => evt,
                None => break,
            },
            _ = status_ticker.tick() => {
                refresh_status(&mut current_status, &active, &config, &dispatcher, &status_path);
                continue;
            }
        };

        match evt {
            DaemonEvent::FocusChanged(window) => {
                if let ActiveWatcher::Window(w) = &mut active {
                    w.handle_focus_change(window);
                }
            }

            DaemonEvent::Key(key) => {
                if let ActiveWatcher::Window(w) = &mut active {
                    w.handle_key(key);
                }
            }

            DaemonEvent::RunningChanged(running) => {
                current_status.running_programs = display_paths(&running);
            }

            DaemonEvent::ConfigReloaded(new_config) => {
                info!("Config reloaded");
                apply_config(&mut active, &config, &new_config);
                config = new_config;
            }

            DaemonEvent::RegistryChanged => {
                let reloaded = registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .reload();
                if reloaded {
                    info!("Enrolled programs reloaded");
                }
            }

            DaemonEvent::Shutdown => {
                info!("Shutting down");
                break;
            }
        }

        refresh_status(&mut current_status, &active, &config, &dispatcher, &status_path);
    }

    active.stop();
    current_status.state = DaemonState::Idle;
    current_status.running_programs.clear();
    current_status.error = None;
    status::write_status(&status_path, &current_status);
    Ok(())
}

/// Picks the watcher for the configured mode. Window mode needs platform
/// support; without it the daemon polls.
fn build_watcher(
    config: &Config,
    registry: Arc<Mutex<Registry>>,
    dispatcher: Arc<Dispatcher>,
    tx: &mpsc::Sender<DaemonEvent>,
) -> ActiveWatcher {
    let native = match config.global.watcher_mode {
        WatcherMode::Polling => None,
        WatcherMode::Auto | WatcherMode::Window => platform::native(tx),
    };

    match native {
        Some((source, keys)) => ActiveWatcher::Window(WindowWatcher::new(
            source,
            keys,
            Box::new(AppClassifier),
            registry,
            dispatcher,
        )),
        None => {
            if config.global.watcher_mode == WatcherMode::Window {
                warn!("Window tracking is not supported on this platform; polling instead");
            }
            let scanner = ProcessScanner::new(scanner::native_lister());
            ActiveWatcher::Polling(PollingWatcher::new(
                PollCycle::new(registry, scanner, dispatcher),
                config.global.effective_poll_interval(),
                tx.clone(),
            ))
        }
    }
}

/// Applies the parts of a reloaded config that can change at runtime.
fn apply_config(active: &mut ActiveWatcher, old: &Config, new: &Config) {
    active.set_interval(new.global.effective_poll_interval());

    match (old.global.enabled, new.global.enabled) {
        (true, false) => {
            active.stop();
            info!("Tracking paused");
        }
        (false, true) => {
            active.start();
            info!("Tracking resumed");
        }
        _ => {}
    }

    if old.global.watcher_mode != new.global.watcher_mode {
        warn!("Watcher mode changes take effect after a restart");
    }
    if old.heartbeat != new.heartbeat {
        warn!("Heartbeat settings take effect after a restart");
    }
}

/// Rewrites the status file if anything it shows has changed.
fn refresh_status(
    current: &mut DaemonStatus,
    active: &ActiveWatcher,
    config: &Config,
    dispatcher: &Dispatcher,
    path: &Path,
) {
    let mut next = current.clone();
    next.state = active.state(config.global.enabled);
    next.heartbeats_sent = dispatcher.sent_count();
    next.last_heartbeat = dispatcher.last_sent();
    next.error = (next.state == DaemonState::Fallback)
        .then(|| "Focus tracking unavailable; reporting on key presses only".to_string());
    if let ActiveWatcher::Polling(_) = active {
        next.running_programs = display_paths(&active.running_programs());
    }

    if next != *current {
        status::write_status(path, &next);
        *current = next;
    }
}

fn display_paths(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| p.display().to_string()).collect()
}

// ── Control commands ──────────────────────────────────────────────────────────

fn programs(action: ProgramsCommand) -> Result<()> {
    let mut registry = Registry::load(paths::programs_file_path()?);

    match action {
        ProgramsCommand::List => {
            if registry.list_all().is_empty() {
                println!("No programs enrolled");
            }
            let scanner = ProcessScanner::new(scanner::native_lister());
            for program in registry.list_all() {
                let last_seen = program
                    .last_seen
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                let running = if scanner.is_running(&program.path) { "running" } else { "stopped" };
                println!(
                    "{}  {}  {}  [{running}]  (last seen: {last_seen})",
                    program.id,
                    program.name,
                    program.path.display()
                );
            }
        }
        ProgramsCommand::Add { path } => {
            // Absolute paths match full command lines; keep the input if it
            // cannot be resolved so the registry reports it as missing.
            let path = std::fs::canonicalize(&path).unwrap_or(path);
            match registry.enroll(&path) {
                Ok(program) => println!("Enrolled {} as {}", program.path.display(), program.id),
                Err(e) if e.is_validation() => anyhow::bail!("Cannot enroll: {e}"),
                Err(e) => return Err(e).context("Failed to enroll program"),
            }
        }
        ProgramsCommand::Remove { id } => {
            if registry.get_by_id(&id).is_none() {
                anyhow::bail!("No enrolled program with id {id}");
            }
            if let Some(program) = registry.remove(&id) {
                println!("Removed {}", program.path.display());
            }
        }
    }
    Ok(())
}

fn print_status() -> Result<()> {
    let status = status::read_status(&paths::status_file_path()?)
        .context("No status available; is the daemon running?")?;

    println!("tally-daemon v{}", status.version);
    println!("state: {:?}", status.state);
    println!("heartbeats sent: {}", status.heartbeats_sent);
    if let Some(last) = status.last_heartbeat {
        println!("last heartbeat: {}", last.to_rfc3339());
    }
    if let Some(error) = &status.error {
        println!("error: {error}");
    }
    if status.running_programs.is_empty() {
        println!("running: none");
    } else {
        println!("running:");
        for program in &status.running_programs {
            println!("  {program}");
        }
    }
    Ok(())
}

fn update_config(edit: impl FnOnce(&mut Config)) -> Result<()> {
    let path = paths::config_file_path()?;
    let mut config = config::load_or_default(&path)?;
    edit(&mut config);
    config::save(&path, &config)?;
    println!("Updated {}", path.display());
    Ok(())
}

fn set_poll_interval(secs: u32) -> Result<()> {
    let clamped = secs.clamp(config::MIN_POLL_INTERVAL_SECS, config::MAX_POLL_INTERVAL_SECS);
    if clamped != secs {
        warn!(requested = secs, effective = clamped, "Polling interval out of range; clamping");
    }
    update_config(|c| c.global.poll_interval_secs = clamped)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── CLI parsing ───────────────────────────────────────────────────────────

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["tally-daemon"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn parses_program_management() {
        let cli = Cli::try_parse_from(["tally-daemon", "programs", "add", "/usr/bin/vim"]).unwrap();
        match cli.command {
            Some(Command::Programs { action: ProgramsCommand::Add { path } }) => {
                assert_eq!(path, PathBuf::from("/usr/bin/vim"));
            }
            _ => panic!("expected programs add"),
        }
    }

    #[test]
    fn interval_requires_a_number() {
        assert!(Cli::try_parse_from(["tally-daemon", "interval", "soon"]).is_err());
        let cli = Cli::try_parse_from(["tally-daemon", "interval", "30"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Interval { secs: 30 })));
    }

    // ── apply_config ──────────────────────────────────────────────────────────

    fn polling_watcher(dir: &Path) -> ActiveWatcher {
        let mut config = Config::default();
        config.global.watcher_mode = WatcherMode::Polling;
        let registry = Arc::new(Mutex::new(Registry::load(dir.join("programs.toml"))));
        let dispatcher = Arc::new(Dispatcher::new("tally/test", Box::new(sink::LogSink)));
        let (tx, _rx) = mpsc::channel(1);
        build_watcher(&config, registry, dispatcher, &tx)
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_follow_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut active = polling_watcher(dir.path());
        active.start();

        let running = Config::default();
        let mut paused = Config::default();
        paused.global.enabled = false;

        apply_config(&mut active, &running, &paused);
        assert_eq!(active.state(paused.global.enabled), DaemonState::Paused);
        let ActiveWatcher::Polling(w) = &active else { panic!("expected polling") };
        assert!(!w.is_running());

        apply_config(&mut active, &paused, &running);
        let ActiveWatcher::Polling(w) = &active else { panic!("expected polling") };
        assert!(w.is_running());
        active.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn interval_change_applies_to_polling() {
        let dir = tempfile::tempdir().unwrap();
        let mut active = polling_watcher(dir.path());

        let old = Config::default();
        let mut new = Config::default();
        new.global.poll_interval_secs = 1;
        apply_config(&mut active, &old, &new);

        let ActiveWatcher::Polling(w) = &active else { panic!("expected polling") };
        assert_eq!(w.interval(), Duration::from_secs(u64::from(config::MIN_POLL_INTERVAL_SECS)));
    }

    // ── refresh_status ────────────────────────────────────────────────────────

    #[test]
    fn status_is_rewritten_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        let active = polling_watcher(dir.path());
        let dispatcher = Dispatcher::new("tally/test", Box::new(sink::LogSink));
        let config = Config::default();
        let mut current = DaemonStatus::new();

        refresh_status(&mut current, &active, &config, &dispatcher, &path);
        assert_eq!(current.state, DaemonState::Polling);
        assert!(path.exists());

        std::fs::remove_file(&path).unwrap();
        refresh_status(&mut current, &active, &config, &dispatcher, &path);
        assert!(!path.exists());
    }
}
