/// Polling-mode watcher.
///
/// Every tick the enrolled paths are matched against one process snapshot.
/// Programs that appear or disappear since the previous tick are logged as
/// entered/exited, and every program still running gets a heartbeat.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::event::DaemonEvent;
use crate::heartbeat::{Dispatcher, HeartbeatContext};
use crate::registry::Registry;
use crate::scanner::ProcessScanner;

/// Outcome of a single [`PollCycle::run`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub entered: Vec<PathBuf>,
    pub exited: Vec<PathBuf>,
    /// Heartbeats handed to the dispatcher.
    pub heartbeats: usize,
    /// The registry was empty and nothing was scanned.
    pub skipped: bool,
}

impl CycleReport {
    /// Whether any program started or stopped.
    pub fn changed(&self) -> bool {
        !self.entered.is_empty() || !self.exited.is_empty()
    }
}

/// The synchronous body of a polling tick plus the state carried between
/// ticks.
pub struct PollCycle {
    registry: Arc<Mutex<Registry>>,
    scanner: ProcessScanner,
    dispatcher: Arc<Dispatcher>,
    last_running: Vec<PathBuf>,
}

impl PollCycle {
    pub fn new(
        registry: Arc<Mutex<Registry>>,
        scanner: ProcessScanner,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            registry,
            scanner,
            dispatcher,
            last_running: Vec::new(),
        }
    }

    /// Enrolled programs seen running by the most recent non-skipped cycle.
    pub fn last_running(&self) -> &[PathBuf] {
        &self.last_running
    }

    pub fn run(&mut self) -> CycleReport {
        let paths = self.lock_registry().list_paths();
        if paths.is_empty() {
            // The running set from before is kept; there is nothing to compare.
            debug!("No enrolled programs; skipping poll");
            return CycleReport {
                skipped: true,
                ..CycleReport::default()
            };
        }

        let running_now = self.scanner.running_subset_of(&paths);

        let entered: Vec<PathBuf> = running_now
            .iter()
            .filter(|p| !self.last_running.contains(p))
            .cloned()
            .collect();
        let exited: Vec<PathBuf> = self
            .last_running
            .iter()
            .filter(|p| !running_now.contains(p))
            .cloned()
            .collect();
        for path in &entered {
            info!(path = %path.display(), "Program started");
        }
        for path in &exited {
            info!(path = %path.display(), "Program exited");
        }

        let heartbeats = running_now
            .iter()
            .filter(|path| self.report(path))
            .count();

        self.last_running = running_now;
        CycleReport {
            entered,
            exited,
            heartbeats,
            skipped: false,
        }
    }

    /// Sends one heartbeat for `path` and stamps its `last_seen`.
    fn report(&self, path: &Path) -> bool {
        let Some(program) = self.lock_registry().get_by_path(path).cloned() else {
            // Removed between the listing and now.
            return false;
        };
        let record = self.dispatcher.build(HeartbeatContext::Program {
            program: &program,
            running_path: path,
        });
        let Some(record) = record else {
            return false;
        };
        self.dispatcher.dispatch(&record);
        self.lock_registry().touch_last_seen(path);
        true
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A running polling task.
struct Task {
    /// Setting this to `true` asks the task to exit before its next tick.
    stop_tx: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

/// Runs a [`PollCycle`] on a fixed interval.
///
/// The first tick fires immediately on `start`. A slow cycle delays the next
/// tick instead of triggering catch-up ticks, and since a cycle never awaits,
/// ticks cannot overlap and a started tick always completes.
pub struct PollingWatcher {
    cycle: Arc<Mutex<PollCycle>>,
    period: Duration,
    events: mpsc::Sender<DaemonEvent>,
    /// Running set after the latest tick, readable without the cycle lock.
    running: Arc<watch::Sender<Vec<PathBuf>>>,
    task: Option<Task>,
}

impl PollingWatcher {
    pub fn new(cycle: PollCycle, period: Duration, events: mpsc::Sender<DaemonEvent>) -> Self {
        let (running, _) = watch::channel(cycle.last_running().to_vec());
        Self {
            cycle: Arc::new(Mutex::new(cycle)),
            period,
            events,
            running: Arc::new(running),
            task: None,
        }
    }

    /// Starts ticking. A watcher that is already running is restarted.
    pub fn start(&mut self) {
        self.stop();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            Arc::clone(&self.cycle),
            self.period,
            self.events.clone(),
            Arc::clone(&self.running),
            stop_rx,
        ));
        info!(interval_secs = self.period.as_secs(), "Polling watcher started");
        self.task = Some(Task {
            stop_tx,
            _handle: handle,
        });
    }

    /// Stops ticking. Does nothing if the watcher is not running.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.stop_tx.send(true);
            info!("Polling watcher stopped");
        }
    }

    /// Changes the tick period, restarting the timer if running.
    pub fn set_interval(&mut self, period: Duration) {
        if period == self.period {
            return;
        }
        self.period = period;
        if self.is_running() {
            self.start();
        }
    }

    pub fn interval(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Never waits on a tick in progress; a tick publishes when it finishes.
    pub fn currently_running_programs(&self) -> Vec<PathBuf> {
        self.running.borrow().clone()
    }
}

impl Drop for PollingWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    cycle: Arc<Mutex<PollCycle>>,
    period: Duration,
    events: mpsc::Sender<DaemonEvent>,
    running_tx: Arc<watch::Sender<Vec<PathBuf>>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            // Err means the watcher was dropped; either way we are done.
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {}
        }
        if *stop_rx.borrow() {
            break;
        }

        let (report, running) = {
            let mut cycle = cycle.lock().unwrap_or_else(PoisonError::into_inner);
            let report = cycle.run();
            (report, cycle.last_running().to_vec())
        };
        debug!(
            heartbeats = report.heartbeats,
            skipped = report.skipped,
            running = running.len(),
            "Poll cycle finished"
        );
        running_tx.send_replace(running.clone());

        if report.changed() && events.send(DaemonEvent::RunningChanged(running)).await.is_err() {
            break;
        }
    }
}
