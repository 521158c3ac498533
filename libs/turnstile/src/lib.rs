//! Event correlation for the show-line contract.
//!
//! Turns "send a transaction, later see an event" into one awaitable call:
//! - `registry`: pending (event kind, correlation key) -> oneshot waiter
//! - `dispatcher`: routes parsed chain events to the registry
//! - `protocol`: register, submit, confirm, await the event, release
//! - `connector`: connection lifecycle and the show-line operations
//! - `ledger`: the chain client seam, with alloy and simulated backends

pub mod chain;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod ledger;
pub mod protocol;
pub mod registry;

pub use chain::{LineCall, LineEvent, LinkError, encode_key};
pub use config::{LinkConfig, NetworkName, NetworkProfile};
pub use connector::{Allocation, ConnectionState, LineConnector, LineMember};
pub use dispatcher::{DispatchStats, EventDispatcher};
pub use ledger::{HttpLedger, LedgerClient, SimulatedLedger, SimulatedLedgerConfig, TxOptions, TxReceipt};
pub use registry::{CorrelationKey, EventKind, EventRegistry, RegistrationPolicy};
