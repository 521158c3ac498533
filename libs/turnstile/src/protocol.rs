//! Correlated call: submit, confirm, then wait for the matching event
//!
//! A registration is made before the transaction is sent, so an event that
//! lands before the receipt is still caught. Every exit path, including the
//! caller dropping the future, releases the registration by ticket.

use crate::chain::{LineCall, LineEvent, LinkError};
use crate::ledger::{LedgerClient, TxOptions};
use crate::registry::{CorrelationKey, EventKind, EventRegistry, Pending, Ticket};
use std::time::Duration;

/// Releases one registration when dropped
struct Registration<'a> {
    registry: &'a EventRegistry,
    kind: EventKind,
    key: CorrelationKey,
    ticket: Ticket,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.release(self.kind, &self.key, self.ticket);
    }
}

/// Everything a correlated call needs besides the call itself
pub struct CallContext<'a, C> {
    pub registry: &'a EventRegistry,
    /// None while the connector is not connected
    pub client: Option<&'a C>,
    pub options: &'a TxOptions,
    pub event_timeout: Option<Duration>,
}

impl<C: LedgerClient> CallContext<'_, C> {
    /// Run `call` and wait for the `kind` event keyed by `key`.
    ///
    /// Fails with `NotConnected` before touching the registry or the ledger
    /// when there is no client.
    pub async fn call(
        &self,
        call: LineCall,
        kind: EventKind,
        key: CorrelationKey,
    ) -> Result<LineEvent, LinkError> {
        let client = self.client.ok_or(LinkError::NotConnected)?;

        let Pending { ticket, receiver } = self.registry.register(kind, key.clone())?;
        let _registration = Registration {
            registry: self.registry,
            kind,
            key: key.clone(),
            ticket,
        };

        tracing::info!(call = call.name(), kind = %kind, key = %key, "📤 Submitting transaction");

        let pending = client.submit(&call, self.options).await.inspect_err(|e| {
            tracing::error!(call = call.name(), kind = %kind, key = %key, "❌ Submission failed: {}", e);
        })?;

        let receipt = client.confirm(pending).await.inspect_err(|e| {
            tracing::error!(call = call.name(), kind = %kind, key = %key, "❌ Confirmation failed: {}", e);
        })?;

        if !receipt.status {
            tracing::error!(call = call.name(), tx_hash = %receipt.tx_hash, "❌ Transaction reverted");
            return Err(LinkError::Reverted {
                tx_hash: receipt.tx_hash.to_string(),
                block_number: receipt.block_number,
            });
        }

        tracing::info!(call = call.name(), "✅ Transaction confirmed: {}", receipt);

        let delivered = match self.event_timeout {
            Some(limit) => tokio::time::timeout(limit, receiver).await.map_err(|_| {
                tracing::warn!(kind = %kind, key = %key, "⏰ Timed out waiting for event");
                LinkError::EventTimeout {
                    kind: kind.to_string(),
                    key: key.to_string(),
                    waited_ms: limit.as_millis().try_into().unwrap_or(u64::MAX),
                }
            })?,
            None => receiver.await,
        };

        // The sender only goes away without sending when a newer
        // registration displaced this one
        let event = delivered.map_err(|_| LinkError::Superseded {
            kind: kind.to_string(),
            key: key.to_string(),
        })?;

        if event.kind() != kind {
            return Err(LinkError::UnexpectedEvent {
                expected: kind.to_string(),
                got: event.kind().to_string(),
            });
        }

        tracing::info!(kind = %kind, key = %key, payload = %event.payload(), "🎯 Call resolved");
        Ok(event)
    }
}
