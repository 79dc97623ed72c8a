//! Per-unit execution against the external router.

mod unit;

pub use unit::{ExecutionReport, UnitExecutor, UnitJob, UnitResult};
