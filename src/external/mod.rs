//! Narrow interfaces to the collaborators that move and authorize value.
//!
//! The orchestrator never looks inside these: correlation references are
//! opaque strings and only their presence is checked.

mod simulated;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

pub use simulated::{
    RecordedTransfer, Scripted, SimulatedBackends, SimulatedLedger, SimulatedRouter,
    SimulatedSigner,
};

/// Price quote for moving `amount` from one account to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub expected_out: Decimal,
    /// Opaque payload the router needs to execute this quote.
    pub route: String,
}

/// Result of a successful router execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub correlation_ref: String,
    pub realized_amount: Decimal,
}

/// Result of a successful ledger transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub correlation_ref: String,
    pub amount: Decimal,
}

#[async_trait]
pub trait Signer: Send + Sync {
    async fn is_connected(&self) -> bool;

    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, ExecutionError>;
}

#[async_trait]
pub trait Router: Send + Sync {
    async fn quote(&self, from: &str, to: &str, amount: Decimal)
    -> Result<Quote, ExecutionError>;

    async fn execute(&self, quote: &Quote, signer: &dyn Signer)
    -> Result<Execution, ExecutionError>;
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get_balance(&self, account: &str) -> Result<Decimal, ExecutionError>;

    async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
        signer: &dyn Signer,
    ) -> Result<TransferReceipt, ExecutionError>;
}
