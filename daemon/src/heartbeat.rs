/// Heartbeat assembly and dispatch.
///
/// Both watchers hand their context to [`Dispatcher::build`] and forward the
/// resulting record with [`Dispatcher::dispatch`]. Delivery belongs to the
/// [`HeartbeatSink`]: the dispatcher never retries or queues.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use crate::classify::{app_profile, Classification};
use crate::platform::ActiveWindow;
use crate::registry::EnrolledProgram;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    App,
    File,
    Domain,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::File => "file",
            Self::Domain => "domain",
        }
    }
}

/// The unit reported to the time-tracking service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatRecord {
    pub time: DateTime<Utc>,
    /// Identity of the reporting application.
    pub plugin: String,
    /// Executable name of the tracked process or window owner.
    pub app_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_title: Option<String>,
    pub project: String,
    pub entity: String,
    pub entity_type: EntityType,
    pub category: String,
    pub language: String,
    pub is_write: bool,
}

/// What a heartbeat is built from.
pub enum HeartbeatContext<'a> {
    /// Polling mode: an enrolled program found running.
    Program {
        program: &'a EnrolledProgram,
        running_path: &'a Path,
    },
    /// Window mode: the live focused window and what the classifier made of it.
    Window {
        window: &'a ActiveWindow,
        program: &'a EnrolledProgram,
        classification: Option<Classification>,
    },
}

/// Delivers heartbeats to the remote service. Implementations own transport,
/// batching, and retries.
pub trait HeartbeatSink: Send + Sync {
    fn send(&self, record: &HeartbeatRecord) -> anyhow::Result<()>;
}

pub struct Dispatcher {
    plugin: String,
    sink: Box<dyn HeartbeatSink>,
    sent: AtomicU64,
    last_sent: Mutex<Option<DateTime<Utc>>>,
}

impl Dispatcher {
    pub fn new(plugin: impl Into<String>, sink: Box<dyn HeartbeatSink>) -> Self {
        Self {
            plugin: plugin.into(),
            sink,
            sent: AtomicU64::new(0),
            last_sent: Mutex::new(None),
        }
    }

    /// Assembles a record, or `None` when the context carries nothing worth
    /// reporting.
    pub fn build(&self, context: HeartbeatContext<'_>) -> Option<HeartbeatRecord> {
        match context {
            HeartbeatContext::Program { program, running_path } => {
                let profile = app_profile(&program.name);
                Some(HeartbeatRecord {
                    time: Utc::now(),
                    plugin: self.plugin.clone(),
                    app_name: program.name.clone(),
                    window_title: None,
                    project: program.name.clone(),
                    entity: running_path.to_string_lossy().into_owned(),
                    entity_type: EntityType::App,
                    category: profile.category.to_string(),
                    language: profile.language.to_string(),
                    // Process presence says nothing about file writes.
                    is_write: false,
                })
            }
            HeartbeatContext::Window { window, program, classification } => {
                let c = classification?;
                Some(HeartbeatRecord {
                    time: Utc::now(),
                    plugin: self.plugin.clone(),
                    app_name: program.name.clone(),
                    window_title: (!window.title.is_empty()).then(|| window.title.clone()),
                    project: c.project,
                    entity: c.entity,
                    entity_type: c.entity_type,
                    category: c.category,
                    language: c.language,
                    is_write: false,
                })
            }
        }
    }

    /// Hands `record` to the sink. Failures are logged and dropped.
    pub fn dispatch(&self, record: &HeartbeatRecord) {
        match self.sink.send(record) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                *self.last_sent.lock().unwrap_or_else(PoisonError::into_inner) = Some(record.time);
                debug!(entity = %record.entity, project = %record.project, "Heartbeat dispatched");
            }
            Err(e) => warn!(entity = %record.entity, error = %e, "Heartbeat dispatch failed"),
        }
    }

    /// Number of records the sink accepted.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn last_sent(&self) -> Option<DateTime<Utc>> {
        *self.last_sent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
