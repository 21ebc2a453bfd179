/// Window/keyboard-mode watcher.
///
/// Focus changes decide whether the keyboard listener is attached: it is only
/// on while an enrolled program has focus. Each key press then re-queries the
/// focused window and reports a heartbeat for it. If focus notifications are
/// unavailable the watcher falls back to listening to every key press and
/// relying on that live query alone.
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::classify::WindowClassifier;
use crate::heartbeat::{Dispatcher, HeartbeatContext};
use crate::platform::{self, ActiveWindow, KeyEvent, KeyListener, WindowSource};
use crate::registry::Registry;

/// What a focus change did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusTransition {
    /// Same process as before; nothing changed.
    Ignored,
    /// A new window took focus. `monitored` tells whether it belongs to an
    /// enrolled program (and the keyboard listener is now attached).
    Tracked { monitored: bool },
}

pub struct WindowWatcher {
    source: Box<dyn WindowSource>,
    keys: Box<dyn KeyListener>,
    classifier: Box<dyn WindowClassifier>,
    registry: Arc<Mutex<Registry>>,
    dispatcher: Arc<Dispatcher>,

    active: Option<ActiveWindow>,
    subscribed: bool,
    watching_keyboard: bool,
    fallback: bool,
    last_query_error: Option<String>,
}

impl WindowWatcher {
    pub fn new(
        source: Box<dyn WindowSource>,
        keys: Box<dyn KeyListener>,
        classifier: Box<dyn WindowClassifier>,
        registry: Arc<Mutex<Registry>>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            source,
            keys,
            classifier,
            registry,
            dispatcher,
            active: None,
            subscribed: false,
            watching_keyboard: false,
            fallback: false,
            last_query_error: None,
        }
    }

    /// Subscribes to focus changes. When that fails the watcher enters
    /// fallback mode and listens to the keyboard unconditionally.
    pub fn start(&mut self) {
        if self.subscribed {
            return;
        }
        match self.source.subscribe() {
            Ok(()) => {
                self.subscribed = true;
                self.fallback = false;
                info!("Window watcher started");
            }
            Err(e) => {
                warn!(error = %e, "Focus notifications unavailable; tracking every key press");
                self.fallback = true;
                self.attach_keyboard();
            }
        }
    }

    /// Unsubscribes and detaches the keyboard. Safe to call at any time.
    pub fn stop(&mut self) {
        if self.subscribed {
            if let Err(e) = self.source.unsubscribe() {
                warn!(error = %e, "Failed to unsubscribe from focus changes");
            }
            self.subscribed = false;
        }
        self.keys.detach();
        self.watching_keyboard = false;
        self.active = None;
        debug!("Window watcher stopped");
    }

    pub fn handle_focus_change(&mut self, window: ActiveWindow) -> FocusTransition {
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.process_id == window.process_id)
        {
            return FocusTransition::Ignored;
        }

        self.detach_keyboard();
        let monitored =
            resolve_path(&window).is_some_and(|path| self.lock_registry().is_enrolled(&path));
        debug!(pid = window.process_id, title = %window.title, monitored, "Focus changed");
        self.active = Some(window);

        if monitored {
            self.attach_keyboard();
        }
        FocusTransition::Tracked { monitored }
    }

    /// Reports a heartbeat for the focused window on key-down. Returns `true`
    /// when one was dispatched.
    pub fn handle_key(&mut self, event: KeyEvent) -> bool {
        if event == KeyEvent::Up || !self.watching_keyboard {
            return false;
        }

        // The cached window can be stale; always ask for the live one.
        let window = match self.source.active_window() {
            Ok(window) => window,
            Err(e) => {
                let message = e.to_string();
                if self.last_query_error.as_deref() != Some(message.as_str()) {
                    warn!(error = %message, "Failed to query the focused window");
                    self.last_query_error = Some(message);
                }
                self.fallback = true;
                return false;
            }
        };

        let Some(path) = resolve_path(&window) else {
            return false;
        };
        let Some(program) = self.lock_registry().get_by_path(&path).cloned() else {
            return false;
        };

        let classification = self.classifier.classify(&window, &program);
        let record = self.dispatcher.build(HeartbeatContext::Window {
            window: &window,
            program: &program,
            classification,
        });
        match record {
            Some(record) => {
                self.dispatcher.dispatch(&record);
                true
            }
            None => false,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    pub fn is_watching_keyboard(&self) -> bool {
        self.watching_keyboard
    }

    pub fn active_window(&self) -> Option<&ActiveWindow> {
        self.active.as_ref()
    }

    fn attach_keyboard(&mut self) {
        if self.watching_keyboard {
            return;
        }
        match self.keys.attach() {
            Ok(()) => self.watching_keyboard = true,
            Err(e) => warn!(error = %e, "Failed to attach keyboard listener"),
        }
    }

    fn detach_keyboard(&mut self) {
        if self.watching_keyboard {
            self.keys.detach();
            self.watching_keyboard = false;
        }
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn resolve_path(window: &ActiveWindow) -> Option<PathBuf> {
    window
        .executable_path
        .clone()
        .or_else(|| platform::executable_path_for_pid(window.process_id))
}
