//! Randomized amount and timing generation for a session's fan-out.
//!
//! - `AllocationGenerator`: splits a total into bounded shares that sum exactly
//! - `ScheduleGenerator`: draws jittered offsets inside a phase window

mod amounts;
mod schedule;

pub use amounts::{AllocationGenerator, AmountBounds};
pub use schedule::ScheduleGenerator;
