//! Error types for ledger connectivity and correlated calls

use thiserror::Error;

/// Errors that can occur while talking to the show-line contract
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    // Lifecycle errors
    #[error("not connected to the ledger network")]
    NotConnected,

    // Transaction errors
    #[error("transaction submission failed: {0}")]
    Submission(String),
    #[error("transaction confirmation failed: {0}")]
    Confirmation(String),
    #[error("transaction {tx_hash} reverted in block {block_number}")]
    Reverted { tx_hash: String, block_number: u64 },

    // Correlation errors
    #[error("a {kind} call for key {key} is already in flight")]
    CallInFlight { kind: String, key: String },
    #[error("{kind} waiter for key {key} was replaced by a newer registration")]
    Superseded { kind: String, key: String },
    #[error("no {kind} event for key {key} within {waited_ms}ms")]
    EventTimeout { kind: String, key: String, waited_ms: u64 },
    #[error("expected a {expected} event, got {got}")]
    UnexpectedEvent { expected: String, got: String },

    // Read-only query errors
    #[error("query {call} failed: {reason}")]
    Query { call: String, reason: String },

    // Connection errors
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("Connection lost after {retry_count} retries")]
    ConnectionLost { retry_count: u32 },
    #[error("Subscription error: {0}")]
    Subscription(String),
    #[error("Event parse error: {reason}")]
    EventParse { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for LinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        LinkError::WebSocket(err.to_string())
    }
}
