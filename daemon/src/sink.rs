/// Heartbeat sinks: the remote-reporting side of the dispatcher.
///
/// `CommandSink` hands each heartbeat to an external CLI, the same way editor
/// plugins for time-tracking services do. `LogSink` is used when no command is
/// configured and only writes the heartbeat to the log.
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::heartbeat::{HeartbeatRecord, HeartbeatSink};

/// Builds the sink described by `config`.
pub fn from_config(config: &HeartbeatConfig) -> Box<dyn HeartbeatSink> {
    match &config.command {
        Some(command) => Box::new(CommandSink::new(
            PathBuf::from(command),
            config.args.clone(),
            config.api_key.clone(),
            Duration::seconds(i64::from(config.min_interval_secs)),
        )),
        None => Box::new(LogSink),
    }
}

/// Logs heartbeats instead of sending them anywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl HeartbeatSink for LogSink {
    fn send(&self, record: &HeartbeatRecord) -> Result<()> {
        info!(
            entity = %record.entity,
            entity_type = record.entity_type.as_str(),
            project = %record.project,
            category = %record.category,
            language = %record.language,
            "Heartbeat"
        );
        Ok(())
    }
}

/// Spawns the configured heartbeat CLI once per heartbeat, fire-and-forget.
///
/// Heartbeats for an entity already sent within `min_interval` are coalesced
/// unless they are writes.
pub struct CommandSink {
    program: PathBuf,
    extra_args: Vec<String>,
    api_key: Option<String>,
    min_interval: Duration,
    last_sent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CommandSink {
    pub fn new(
        program: PathBuf,
        extra_args: Vec<String>,
        api_key: Option<String>,
        min_interval: Duration,
    ) -> Self {
        Self {
            program,
            extra_args,
            api_key,
            min_interval,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `record` should go out given the previous sends.
    fn is_due(
        &self,
        last_sent: &HashMap<String, DateTime<Utc>>,
        record: &HeartbeatRecord,
    ) -> bool {
        record.is_write
            || last_sent
                .get(&record.entity)
                .map_or(true, |previous| record.time - *previous >= self.min_interval)
    }

    fn command_args(&self, record: &HeartbeatRecord) -> Vec<String> {
        let time = format!("{:.3}", record.time.timestamp_millis() as f64 / 1000.0);
        let mut args: Vec<String> = [
            ("--entity", record.entity.as_str()),
            ("--entity-type", record.entity_type.as_str()),
            ("--category", record.category.as_str()),
            ("--plugin", record.plugin.as_str()),
            ("--project", record.project.as_str()),
            ("--language", record.language.as_str()),
            ("--time", time.as_str()),
        ]
        .into_iter()
        .flat_map(|(flag, value)| [flag.to_string(), value.to_string()])
        .collect();

        if record.is_write {
            args.push("--write".to_string());
        }
        if let Some(key) = &self.api_key {
            args.extend(["--key".to_string(), key.clone()]);
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl HeartbeatSink for CommandSink {
    fn send(&self, record: &HeartbeatRecord) -> Result<()> {
        // Held until the spawn succeeds so only launched heartbeats count.
        let mut last_sent = self.last_sent.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_due(&last_sent, record) {
            debug!(entity = %record.entity, "Heartbeat coalesced");
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .context("Heartbeat command needs a running async runtime")?;
        let _guard = runtime.enter();

        let child = tokio::process::Command::new(&self.program)
            .args(self.command_args(record))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?;
        last_sent.insert(record.entity.clone(), record.time);
        drop(last_sent);

        let entity = record.entity.clone();
        runtime.spawn(async move {
            match child.wait_with_output().await {
                Ok(output) if output.status.success() => {}
                Ok(output) => warn!(
                    entity = %entity,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Heartbeat command failed"
                ),
                Err(e) => warn!(entity = %entity, error = %e, "Heartbeat command did not finish"),
            }
        });
        Ok(())
    }
}
