//! Result output for CLI commands.
//!
//! - `OutputWriter`: emits results as styled text or JSON
//! - `SessionSummaryOutput`: compact JSON shape for session lists

mod writer;

pub use writer::{OutputWriter, SessionSummaryOutput};
