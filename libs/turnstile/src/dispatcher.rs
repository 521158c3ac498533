//! Routes chain events to registered waiters
//!
//! The dispatcher owns no business state. It reads parsed events off the
//! listener channel, derives the correlation key for the event's kind and
//! hands the event to the registry.

use crate::chain::LineEvent;
use crate::registry::EventRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Counts kept for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub matched: u64,
    pub unmatched: u64,
}

pub struct EventDispatcher {
    registry: Arc<EventRegistry>,
    stats: parking_lot::Mutex<DispatchStats>,
}

impl EventDispatcher {
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        Self {
            registry,
            stats: parking_lot::Mutex::new(DispatchStats::default()),
        }
    }

    /// Route a single event. Returns whether a waiter was found.
    pub fn route(&self, event: LineEvent) -> bool {
        let kind = event.kind();
        let key = event.correlation_key();

        tracing::info!(
            kind = %kind,
            key = %key,
            payload = %event.payload(),
            tx_hash = %event.tx_hash(),
            block = event.block_number(),
            "📥 Chain event received"
        );

        let matched = self.registry.dispatch(kind, &key, event);

        let mut stats = self.stats.lock();
        if matched {
            stats.matched += 1;
        } else {
            stats.unmatched += 1;
        }
        matched
    }

    pub fn stats(&self) -> DispatchStats {
        *self.stats.lock()
    }

    /// Drain the event channel until it closes or `cancel_token` fires
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<LineEvent>,
        cancel_token: CancellationToken,
    ) {
        tracing::info!("🚦 Event dispatcher started");

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    tracing::info!("🛑 Event dispatcher stopping");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            self.route(event);
                        }
                        None => {
                            tracing::info!("Event stream ended");
                            break;
                        }
                    }
                }
            }
        }

        let stats = self.stats();
        tracing::info!(
            matched = stats.matched,
            unmatched = stats.unmatched,
            "Event dispatcher stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{LinePeekedEvent, TurnAssignedEvent};
    use crate::registry::{CorrelationKey, EventKind};
    use alloy_primitives::{B256, U256};
    use chrono::Utc;
    use std::time::Duration;

    fn turn_event(user: u64, turn: u64) -> LineEvent {
        LineEvent::TurnAssigned(TurnAssignedEvent {
            user_id: U256::from(user),
            turn: U256::from(turn),
            tx_hash: B256::ZERO,
            block_number: 1,
            received_at: Utc::now(),
        })
    }

    fn peek_event(user: u64) -> LineEvent {
        LineEvent::LinePeeked(LinePeekedEvent {
            user_id: U256::from(user),
            tx_hash: B256::ZERO,
            block_number: 1,
            received_at: Utc::now(),
        })
    }

    #[test]
    fn test_route_uses_event_key() {
        let registry = Arc::new(EventRegistry::default());
        let dispatcher = EventDispatcher::new(registry.clone());
        let mut pending = registry
            .register(EventKind::TurnAssigned, CorrelationKey::User(U256::from(9)))
            .unwrap();

        assert!(!dispatcher.route(turn_event(8, 1)));
        assert!(dispatcher.route(turn_event(9, 2)));

        let event = pending.receiver.try_recv().unwrap();
        assert_eq!(event.payload(), U256::from(2));
        assert_eq!(dispatcher.stats(), DispatchStats { matched: 1, unmatched: 1 });
    }

    #[tokio::test]
    async fn test_unmatched_event_does_not_stop_loop() {
        let registry = Arc::new(EventRegistry::default());
        let dispatcher = Arc::new(EventDispatcher::new(registry.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.clone().run(rx, cancel.clone()));

        // Nobody waits for this peek
        tx.send(peek_event(3)).unwrap();

        let pending = registry
            .register(EventKind::TurnAssigned, CorrelationKey::User(U256::from(4)))
            .unwrap();
        tx.send(turn_event(4, 11)).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), pending.receiver)
            .await
            .expect("dispatcher stalled")
            .unwrap();
        assert_eq!(event.payload(), U256::from(11));

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(dispatcher.stats().unmatched, 1);
    }

    #[tokio::test]
    async fn test_run_ends_when_stream_closes() {
        let dispatcher = Arc::new(EventDispatcher::new(Arc::new(EventRegistry::default())));
        let (tx, rx) = mpsc::unbounded_channel::<LineEvent>();
        drop(tx);

        tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.run(rx, CancellationToken::new()),
        )
        .await
        .expect("dispatcher did not stop");
    }
}
