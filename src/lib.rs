pub mod allocation;
pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod external;
pub mod metrics;
pub mod notification;
pub mod output;
pub mod recovery;
pub mod scheduler;
pub mod session;
pub mod storage;

pub use config::{PilotConfig, ProjectPaths};
pub use error::{ErrorKind, ExecutionError, PilotError, Result};
pub use external::{Ledger, Router, Signer, SimulatedBackends};
pub use metrics::{PilotMetricsSnapshot, SessionReport};
pub use notification::Notifier;
pub use recovery::{Checkpoint, EscalationContext, RefundRecord};
pub use session::{
    Backends, PaymentReceipt, SessionController, SessionId, SessionPhase, SessionRequest,
    SessionStatusView,
};
pub use storage::{FileStore, MemoryStore, SessionStore};
