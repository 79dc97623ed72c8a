//! Session event notification.
//!
//! - `SessionEvent`: lifecycle events (created, phase changed, refund issued, ...)
//! - `Notifier`: appends JSON lines to `logs/<session>.log` and runs an optional hook

mod events;
mod notifier;

pub use events::{EventType, SessionEvent};
pub use notifier::Notifier;
