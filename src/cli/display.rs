use console::{Style, style};
use indicatif::{ProgressBar, ProgressStyle};

use crate::metrics::{PilotMetricsSnapshot, SessionReport};
use crate::recovery::{Checkpoint, EscalationContext};
use crate::session::{SessionPhase, SessionStatusView};

pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", style(text).bold().cyan());
        println!("{}", style("═".repeat(60)).dim());
        println!();
    }

    pub fn print_status(&self, view: &SessionStatusView) {
        self.print_header(&format!("Session: {}", view.session_id));

        println!(
            "Phase:     {}",
            self.phase_style(view.phase).apply_to(view.phase.to_string())
        );
        println!(
            "Progress:  {} {:.1}%",
            self.progress_bar(view.progress, 30),
            view.progress
        );
        println!(
            "Units:     {} activated, {} collected, {} failed of {}",
            view.counts.activated, view.counts.collected, view.counts.failed, view.counts.total
        );
        println!("Status:    {}", view.status.message);
        if let Some(kind) = view.status.error_kind {
            println!("Error:     {}", style(kind).red());
        }
        if let Some(refund) = &view.refund {
            println!("Refund:    {} {}", refund.status, refund.amount);
        }
        println!(
            "{}",
            style(format!(
                "Updated: {}",
                view.updated_at.format("%Y-%m-%d %H:%M:%S")
            ))
            .dim()
        );
    }

    pub fn print_report(&self, report: &SessionReport) {
        let s = &report.summary;
        self.print_header(&format!("Report: {}", s.session_id));

        println!(
            "Final phase:  {}",
            self.phase_style(s.final_phase).apply_to(s.final_phase.to_string())
        );
        println!("Status:       {}", s.status);
        if let Some(secs) = s.duration_secs {
            println!("Duration:     {}s", secs);
        }
        println!(
            "Units:        {}/{} collected ({:.1}% success), {} failed",
            s.collected,
            s.unit_count,
            s.success_rate * 100.0,
            s.failed
        );
        let target = if s.target_reached {
            style("reached").green()
        } else {
            style("not reached").yellow()
        };
        println!("Profit:       {} (target {})", s.total_profit, target);
        if s.recovery_attempts > 0 {
            println!("Recoveries:   {}", s.recovery_attempts);
        }
        if s.refund.attempted {
            println!(
                "Refund:       {} {}",
                s.refund
                    .status
                    .map(|st| st.to_string())
                    .unwrap_or_default(),
                s.refund.amount.map(|a| a.to_string()).unwrap_or_default()
            );
        }
        if let Some(c) = &report.consolidation {
            println!(
                "Consolidated: {} to {} ({})",
                c.amount, c.destination, c.correlation_ref
            );
        }

        if !report.errors.by_kind.is_empty() {
            println!();
            println!("{}", style("Errors:").bold());
            for (kind, count) in &report.errors.by_kind {
                println!("  {:<24} {}", kind.as_str(), count);
            }
        }

        let failed: Vec<_> = report.units.iter().filter(|u| u.status == "failed").collect();
        if !failed.is_empty() {
            println!();
            println!("{}", style("Failed units:").bold());
            for unit in failed {
                println!(
                    "  {} {} ({} retries, {})",
                    style("✗").red(),
                    unit.handle,
                    unit.retry_count,
                    unit.last_error.map(|k| k.as_str()).unwrap_or("unknown")
                );
            }
        }
    }

    pub fn print_checkpoints(&self, checkpoints: &[Checkpoint]) {
        if checkpoints.is_empty() {
            println!("{}", style("No checkpoints found.").dim());
            return;
        }

        println!(
            "{:<40} {:<14} {:>9}  {}",
            style("Checkpoint").bold(),
            style("Phase").bold(),
            style("Progress").bold(),
            style("Reason").bold()
        );
        println!("{}", style("─".repeat(80)).dim());
        for cp in checkpoints {
            println!(
                "{:<40} {:<14} {:>8.1}%  {}",
                cp.id,
                self.phase_style(cp.phase).apply_to(cp.phase.to_string()),
                cp.progress,
                cp.reason
            );
        }
    }

    pub fn print_escalation(&self, escalation: &EscalationContext) {
        eprintln!("{}", style(escalation.to_message()).yellow());
    }

    pub fn print_metrics(&self, metrics: &PilotMetricsSnapshot) {
        println!(
            "{}",
            style(format!(
                "Units executed: {} ({:.1}% ok)  Refunds: {} issued, {} failed  Escalations: {}",
                metrics.units_executed,
                metrics.unit_success_rate * 100.0,
                metrics.refunds_issued,
                metrics.refunds_failed,
                metrics.escalations
            ))
            .dim()
        );
    }

    pub fn print_success(&self, message: &str) {
        println!("{} {}", style("✓").green().bold(), message);
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red().bold(), message);
    }

    pub fn print_warning(&self, message: &str) {
        println!("{} {}", style("!").yellow().bold(), message);
    }

    pub fn print_info(&self, message: &str) {
        println!("{} {}", style("→").cyan(), message);
    }

    /// Percentage bar for a running session, 0-100.
    pub fn create_session_bar(&self) -> ProgressBar {
        let pb = ProgressBar::new(100);
        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{elapsed_precise}] {bar:40.green/dim} {pos:>3}% {msg}")
        {
            pb.set_style(bar_style.progress_chars("█▉░"));
        }
        pb.enable_steady_tick(std::time::Duration::from_millis(120));
        pb
    }

    fn phase_style(&self, phase: SessionPhase) -> Style {
        match phase {
            SessionPhase::Initializing | SessionPhase::PaymentPending => Style::new().dim(),
            SessionPhase::Created => Style::new().blue(),
            SessionPhase::Distributing | SessionPhase::Collecting => {
                Style::new().yellow().bold()
            }
            SessionPhase::Consolidating => Style::new().cyan(),
            SessionPhase::Completed => Style::new().green(),
            SessionPhase::Failed => Style::new().red().bold(),
            SessionPhase::Stopped => Style::new().magenta(),
        }
    }

    fn progress_bar(&self, percentage: f64, width: usize) -> String {
        let filled = ((width as f64 * percentage / 100.0) as usize).min(width);
        let empty = width - filled;

        format!(
            "{}{}",
            style("█".repeat(filled)).green(),
            style("░".repeat(empty)).dim()
        )
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}
