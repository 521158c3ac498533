//! Ledger client seam
//!
//! The connector only talks to the chain through `LedgerClient`: submit a
//! call, wait for its receipt, subscribe to events, and run the two
//! read-only queries. `AlloyLedger` is the real implementation,
//! `SimulatedLedger` an in-process stand-in.

mod alloy_ledger;
mod simulated;

pub use alloy_ledger::{AlloyLedger, HttpLedger};
pub use simulated::{SimulatedLedger, SimulatedLedgerConfig, SimulatedTx};

use crate::chain::{LineCall, LineEvent, LinkError};
use alloy_primitives::{B256, U256};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-transaction options applied to every contract-mutating call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    /// Fixed gas ceiling, not estimated
    pub gas_limit: u64,
    /// How long to wait for inclusion (None = provider default)
    pub confirmation_timeout: Option<Duration>,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            gas_limit: 500_000,
            confirmation_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// Transaction receipt information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub gas_used: u64,
    /// false when the transaction reverted
    pub status: bool,
}

impl fmt::Display for TxReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tx={} block={} gas={}",
            self.tx_hash, self.block_number, self.gas_used
        )?;
        if !self.status {
            write!(f, " (REVERTED)")?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait LedgerClient: Send + Sync + 'static {
    /// Handle to a sent, not yet confirmed transaction
    type Pending: Send;

    /// Send a contract call. Fails if it cannot be sent or is rejected up front.
    async fn submit(&self, call: &LineCall, options: &TxOptions) -> Result<Self::Pending, LinkError>;

    /// Wait for inclusion and return the receipt
    async fn confirm(&self, pending: Self::Pending) -> Result<TxReceipt, LinkError>;

    /// Start delivering contract events to `sink` until `cancel_token` fires
    async fn subscribe(
        &self,
        sink: mpsc::UnboundedSender<LineEvent>,
        cancel_token: CancellationToken,
    ) -> Result<(), LinkError>;

    /// Turn currently held by `user_id`
    async fn line_turn(&self, user_id: U256) -> Result<U256, LinkError>;

    /// User id at the head of the line
    async fn first_in_line(&self) -> Result<U256, LinkError>;
}
