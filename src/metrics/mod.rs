//! Session metrics and reporting.
//!
//! - `SessionMetrics`: live per-session counters fed by every unit outcome
//! - `PilotMetrics`: process-wide atomic counters
//! - `SessionReport`: immutable, exportable summary of a session

mod aggregator;
mod counters;
mod report;

pub use aggregator::{MetricsView, SessionMetrics};
pub use counters::{PilotMetrics, PilotMetricsSnapshot};
pub use report::{
    ConsolidationReport, ErrorAnalysis, ExecutionSummary, RefundSummary, SessionReport,
    UnitReport,
};
