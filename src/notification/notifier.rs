use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::SessionEvent;
use crate::config::NotificationConfig;
use crate::session::{SessionId, SessionPhase};

/// One line of `logs/<session>.log`.
#[derive(Debug, Serialize)]
struct EventLine<'a> {
    at: DateTime<Utc>,
    event: &'static str,
    severity: &'static str,
    session_id: &'a SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<SessionPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

impl<'a> From<&'a SessionEvent> for EventLine<'a> {
    fn from(event: &'a SessionEvent) -> Self {
        Self {
            at: event.created_at,
            event: event.event_type.as_str(),
            severity: severity(event),
            session_id: &event.session_id,
            phase: event.phase,
            unit: event.unit.as_deref(),
            progress: event.progress,
            message: event.message.as_deref(),
        }
    }
}

/// Delivers session events to the per-session event log and the configured
/// hook command. Delivery failures are logged and never reach the session.
#[derive(Clone)]
pub struct Notifier {
    config: NotificationConfig,
    logs_dir: Option<PathBuf>,
}

impl Notifier {
    pub fn new(config: NotificationConfig, logs_dir: Option<PathBuf>) -> Self {
        Self { config, logs_dir }
    }

    /// Notifier that drops every event.
    pub fn disabled() -> Self {
        Self {
            config: NotificationConfig {
                enabled: false,
                ..Default::default()
            },
            logs_dir: None,
        }
    }

    pub async fn notify(&self, event: &SessionEvent) {
        if !self.config.enabled {
            return;
        }

        if self.config.event_log
            && let Some(logs_dir) = &self.logs_dir
        {
            let path = logs_dir.join(format!("{}.log", event.session_id));
            if let Err(e) = append_line(logs_dir, &path, event).await {
                warn!(
                    session_id = %event.session_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to append event log"
                );
            }
        }

        if let Some(hook) = &self.config.hook_command {
            self.run_hook(hook, event).await;
        }
    }

    async fn run_hook(&self, hook: &str, event: &SessionEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize event for hook");
                return;
            }
        };

        let mut command = Command::new("sh");
        command
            .args(["-c", hook])
            .env("FANOUT_EVENT", event.event_type.as_str())
            .env("FANOUT_SEVERITY", severity(event))
            .env("FANOUT_SESSION_ID", event.session_id.as_str())
            .env("FANOUT_EVENT_JSON", &json);
        if let Some(phase) = event.phase {
            command.env("FANOUT_PHASE", phase.as_str());
        }
        if let Some(unit) = &event.unit {
            command.env("FANOUT_UNIT", unit);
        }
        if let Some(progress) = event.progress {
            command.env("FANOUT_PROGRESS", format!("{:.1}", progress));
        }

        match command.output().await {
            Ok(output) if !output.status.success() => {
                warn!(
                    session_id = %event.session_id,
                    event = event.event_type.as_str(),
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Hook exited with failure"
                );
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, hook, "Failed to run hook"),
        }
    }
}

fn severity(event: &SessionEvent) -> &'static str {
    if event.event_type.is_error() {
        "error"
    } else {
        "info"
    }
}

async fn append_line(dir: &Path, path: &Path, event: &SessionEvent) -> io::Result<()> {
    let mut line = serde_json::to_string(&EventLine::from(event))?;
    line.push('\n');

    tokio::fs::create_dir_all(dir).await?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await
}
