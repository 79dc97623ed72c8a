use std::io::{self, Write};

use serde::Serialize;

use crate::cli::{Display, OutputFormat};
use crate::metrics::{PilotMetricsSnapshot, SessionReport};
use crate::recovery::{Checkpoint, RefundRecord};
use crate::session::{SessionPhase, SessionStatusView};

/// Output writer that handles the text and JSON formats.
///
/// Text goes through `Display`; JSON writes one document per call to stdout.
pub struct OutputWriter {
    format: OutputFormat,
    display: Display,
}

impl OutputWriter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            display: Display::new(),
        }
    }

    /// Returns the configured output format.
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_text(&self) -> bool {
        self.format == OutputFormat::Text
    }

    pub fn display(&self) -> &Display {
        &self.display
    }

    pub fn emit_status(&self, view: &SessionStatusView) {
        match self.format {
            OutputFormat::Text => self.display.print_status(view),
            OutputFormat::Json => self.write_json(view),
        }
    }

    pub fn emit_report(&self, report: &SessionReport) {
        match self.format {
            OutputFormat::Text => self.display.print_report(report),
            OutputFormat::Json => self.write_json(report),
        }
    }

    pub fn emit_sessions(&self, sessions: &[SessionSummaryOutput]) {
        match self.format {
            OutputFormat::Text => self.print_session_list(sessions),
            OutputFormat::Json => self.write_json(sessions),
        }
    }

    pub fn emit_checkpoints(&self, checkpoints: &[Checkpoint]) {
        match self.format {
            OutputFormat::Text => self.display.print_checkpoints(checkpoints),
            OutputFormat::Json => {
                let list: Vec<CheckpointOutput> =
                    checkpoints.iter().map(CheckpointOutput::from).collect();
                self.write_json(&list);
            }
        }
    }

    pub fn emit_refund(&self, record: &RefundRecord) {
        match self.format {
            OutputFormat::Text => {
                if record.is_completed() {
                    self.display.print_success(&format!(
                        "Refunded {} to {} ({})",
                        record.amount,
                        record.payer_account,
                        record.correlation_ref.as_deref().unwrap_or("-")
                    ));
                } else {
                    self.display.print_error(&format!(
                        "Refund of {} to {} not completed: {}",
                        record.amount,
                        record.payer_account,
                        record.shortfall()
                    ));
                }
            }
            OutputFormat::Json => self.write_json(record),
        }
    }

    pub fn emit_metrics(&self, metrics: &PilotMetricsSnapshot) {
        match self.format {
            OutputFormat::Text => self.display.print_metrics(metrics),
            OutputFormat::Json => self.write_json(metrics),
        }
    }

    /// Emit a simple message.
    pub fn emit_message(&self, message: &str) {
        match self.format {
            OutputFormat::Text => {
                println!("{}", message);
            }
            OutputFormat::Json => {
                let msg = MessageOutput {
                    message: message.to_string(),
                };
                self.write_json(&msg);
            }
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, value: &T) {
        if let Ok(json) = serde_json::to_string(value) {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{}", json);
            let _ = stdout.flush();
        }
    }

    fn print_session_list(&self, sessions: &[SessionSummaryOutput]) {
        if sessions.is_empty() {
            println!("No sessions found.");
            return;
        }

        println!();
        println!(
            "{:<18} {:<14} {:>9}  {}",
            "ID", "Phase", "Progress", "Status"
        );
        println!("{}", "-".repeat(75));

        for session in sessions {
            println!(
                "{:<18} {:<14} {:>8.1}%  {}",
                session.session_id,
                session.phase.to_string(),
                session.progress,
                session.status
            );
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummaryOutput {
    pub session_id: String,
    pub phase: SessionPhase,
    pub progress: f64,
    pub status: String,
}

impl From<&SessionStatusView> for SessionSummaryOutput {
    fn from(view: &SessionStatusView) -> Self {
        Self {
            session_id: view.session_id.to_string(),
            phase: view.phase,
            progress: view.progress,
            status: view.status.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct CheckpointOutput {
    id: String,
    phase: SessionPhase,
    progress: f64,
    reason: String,
    created_at: String,
}

impl From<&Checkpoint> for CheckpointOutput {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            id: cp.id.clone(),
            phase: cp.phase,
            progress: cp.progress,
            reason: cp.reason.clone(),
            created_at: cp.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct MessageOutput {
    message: String,
}
