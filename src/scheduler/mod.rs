//! Timer scheduling for unit activations and collections.
//!
//! One logical timer per (unit, phase) pair lives in a single `EventQueue`
//! drained by the phase runner, so cancelling a phase is dropping its queue.

mod queue;

pub use queue::EventQueue;
