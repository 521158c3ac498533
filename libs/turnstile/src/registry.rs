//! Event registry: pending (event kind, correlation key) -> waiter
//!
//! Each live registration owns the sender half of a oneshot channel. The
//! dispatcher takes the sender out when the matching event arrives, so a
//! waiter is resolved at most once no matter how many duplicates follow.

use crate::chain::{LineEvent, LinkError};
use alloy_primitives::U256;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// Class of on-chain notification a registration waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AllocationConfirmed,
    TurnAssigned,
    PeekCompleted,
    TokenRewarded,
    PointsRewarded,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::AllocationConfirmed,
        EventKind::TurnAssigned,
        EventKind::PeekCompleted,
        EventKind::TokenRewarded,
        EventKind::PointsRewarded,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::AllocationConfirmed => write!(f, "allocation-confirmed"),
            EventKind::TurnAssigned => write!(f, "turn-assigned"),
            EventKind::PeekCompleted => write!(f, "peek-completed"),
            EventKind::TokenRewarded => write!(f, "token-rewarded"),
            EventKind::PointsRewarded => write!(f, "points-rewarded"),
        }
    }
}

/// Routes an event to the one caller waiting for it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    Session(String),
    User(U256),
    /// Used by kinds with no per-caller discriminator
    Sentinel,
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Session(id) => write!(f, "{}", id),
            CorrelationKey::User(id) => write!(f, "{}", id),
            CorrelationKey::Sentinel => write!(f, "_"),
        }
    }
}

/// What to do when a key already has a live registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationPolicy {
    /// Last writer wins; the displaced waiter's channel is closed
    #[default]
    Overwrite,
    /// Refuse the second registration with `CallInFlight`
    Reject,
}

/// Identifies one registration so cleanup never removes a newer one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

/// A registered waiter: its ticket and the receiving end of the continuation
#[derive(Debug)]
pub struct Pending<T> {
    pub ticket: Ticket,
    pub receiver: oneshot::Receiver<T>,
}

struct Entry<T> {
    ticket: Ticket,
    sender: oneshot::Sender<T>,
}

/// In-memory mapping (kind, key) -> continuation
pub struct EventRegistry<T = LineEvent> {
    entries: Mutex<HashMap<EventKind, HashMap<CorrelationKey, Entry<T>>>>,
    policy: RegistrationPolicy,
    next_ticket: AtomicU64,
}

impl<T> EventRegistry<T> {
    pub fn new(policy: RegistrationPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy,
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> RegistrationPolicy {
        self.policy
    }

    /// Store a continuation for (kind, key) and return its receiving end.
    ///
    /// Under `Overwrite` a prior entry is replaced and its sender dropped,
    /// which wakes the displaced waiter with a closed channel.
    pub fn register(&self, kind: EventKind, key: CorrelationKey) -> Result<Pending<T>, LinkError> {
        let (sender, receiver) = oneshot::channel();
        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed));

        let mut entries = self.entries.lock();
        let by_key = entries.entry(kind).or_default();

        if let Some(existing) = by_key.get(&key) {
            // A closed receiver means the old caller is gone; never block on it
            let live = !existing.sender.is_closed();
            if live && self.policy == RegistrationPolicy::Reject {
                tracing::warn!(kind = %kind, key = %key, "Rejecting registration, call already in flight");
                return Err(LinkError::CallInFlight {
                    kind: kind.to_string(),
                    key: key.to_string(),
                });
            }
            if live {
                tracing::warn!(kind = %kind, key = %key, "Overwriting live registration");
            }
        }

        by_key.insert(key.clone(), Entry { ticket, sender });
        tracing::debug!(kind = %kind, key = %key, ticket = ticket.0, "Registered waiter");

        Ok(Pending { ticket, receiver })
    }

    /// Remove the entry for (kind, key) if present
    pub fn deregister(&self, kind: EventKind, key: &CorrelationKey) {
        let mut entries = self.entries.lock();
        if let Some(by_key) = entries.get_mut(&kind) {
            if by_key.remove(key).is_some() {
                tracing::debug!(kind = %kind, key = %key, "Deregistered waiter");
            }
        }
    }

    /// Remove the entry for (kind, key) only if it still belongs to `ticket`.
    ///
    /// Returns whether an entry was removed.
    pub fn release(&self, kind: EventKind, key: &CorrelationKey, ticket: Ticket) -> bool {
        let mut entries = self.entries.lock();
        let Some(by_key) = entries.get_mut(&kind) else {
            return false;
        };
        match by_key.get(key) {
            Some(entry) if entry.ticket == ticket => {
                by_key.remove(key);
                tracing::debug!(kind = %kind, key = %key, ticket = ticket.0, "Released waiter");
                true
            }
            _ => false,
        }
    }

    /// Hand `payload` to the waiter for (kind, key).
    ///
    /// Returns `true` when a waiter was found. Unmatched events are dropped.
    pub fn dispatch(&self, kind: EventKind, key: &CorrelationKey, payload: T) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            entries.get_mut(&kind).and_then(|by_key| by_key.remove(key))
        };

        let Some(entry) = entry else {
            tracing::info!(kind = %kind, key = %key, "No waiter for event, dropping");
            return false;
        };

        if entry.sender.send(payload).is_err() {
            // Caller stopped awaiting; the match still consumed the entry
            tracing::debug!(kind = %kind, key = %key, "Waiter dropped before event arrived");
        } else {
            tracing::debug!(kind = %kind, key = %key, ticket = entry.ticket.0, "Waiter resolved");
        }
        true
    }

    /// Check if (kind, key) has a registration
    pub fn is_pending(&self, kind: EventKind, key: &CorrelationKey) -> bool {
        self.entries
            .lock()
            .get(&kind)
            .is_some_and(|by_key| by_key.contains_key(key))
    }

    /// Number of live registrations across all kinds
    pub fn pending_count(&self) -> usize {
        self.entries.lock().values().map(HashMap::len).sum()
    }
}

impl<T> Default for EventRegistry<T> {
    fn default() -> Self {
        Self::new(RegistrationPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> CorrelationKey {
        CorrelationKey::Session(id.to_string())
    }

    #[test]
    fn test_dispatch_resolves_registered_waiter() {
        let registry: EventRegistry<&str> = EventRegistry::default();
        let mut pending = registry
            .register(EventKind::AllocationConfirmed, session("session-42"))
            .unwrap();

        assert!(registry.dispatch(EventKind::AllocationConfirmed, &session("session-42"), "user-7"));
        assert_eq!(pending.receiver.try_recv().unwrap(), "user-7");
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_second_registration_wins() {
        let registry: EventRegistry<&str> = EventRegistry::default();
        let key = CorrelationKey::User(U256::from(9));
        let mut first = registry.register(EventKind::TurnAssigned, key.clone()).unwrap();
        let mut second = registry.register(EventKind::TurnAssigned, key.clone()).unwrap();

        assert!(registry.dispatch(EventKind::TurnAssigned, &key, "turn-1"));
        assert_eq!(second.receiver.try_recv().unwrap(), "turn-1");
        // First sender was dropped on overwrite, never invoked
        assert!(matches!(
            first.receiver.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn test_reject_policy_refuses_live_duplicate() {
        let registry: EventRegistry<&str> = EventRegistry::new(RegistrationPolicy::Reject);
        let key = CorrelationKey::User(U256::from(9));
        let _first = registry.register(EventKind::TurnAssigned, key.clone()).unwrap();

        let err = registry.register(EventKind::TurnAssigned, key.clone()).unwrap_err();
        assert!(matches!(err, LinkError::CallInFlight { .. }));
        assert_eq!(registry.pending_count(), 1);
    }

    #[test]
    fn test_reject_policy_replaces_abandoned_waiter() {
        let registry: EventRegistry<&str> = EventRegistry::new(RegistrationPolicy::Reject);
        let key = CorrelationKey::Sentinel;
        let first = registry.register(EventKind::PeekCompleted, key.clone()).unwrap();
        drop(first);

        assert!(registry.register(EventKind::PeekCompleted, key).is_ok());
    }

    #[test]
    fn test_deregister_then_dispatch_is_noop() {
        let registry: EventRegistry<&str> = EventRegistry::default();
        let key = CorrelationKey::User(U256::from(1));
        let mut pending = registry.register(EventKind::PointsRewarded, key.clone()).unwrap();

        registry.deregister(EventKind::PointsRewarded, &key);
        assert!(!registry.dispatch(EventKind::PointsRewarded, &key, "100"));
        assert!(pending.receiver.try_recv().is_err());
    }

    #[test]
    fn test_deregister_absent_is_noop() {
        let registry: EventRegistry<&str> = EventRegistry::default();
        registry.deregister(EventKind::TokenRewarded, &CorrelationKey::Sentinel);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_unmatched_dispatch_reports_no_match() {
        let registry: EventRegistry<&str> = EventRegistry::default();
        assert!(!registry.dispatch(EventKind::PeekCompleted, &CorrelationKey::Sentinel, "user-3"));
    }

    #[test]
    fn test_duplicate_dispatch_invokes_once() {
        let registry: EventRegistry<u32> = EventRegistry::default();
        let key = CorrelationKey::User(U256::from(5));
        let mut pending = registry.register(EventKind::TokenRewarded, key.clone()).unwrap();

        assert!(registry.dispatch(EventKind::TokenRewarded, &key, 1));
        assert!(!registry.dispatch(EventKind::TokenRewarded, &key, 2));
        assert_eq!(pending.receiver.try_recv().unwrap(), 1);
    }

    #[test]
    fn test_release_ignores_foreign_ticket() {
        let registry: EventRegistry<u32> = EventRegistry::default();
        let key = CorrelationKey::User(U256::from(5));
        let old = registry.register(EventKind::TurnAssigned, key.clone()).unwrap();
        let new = registry.register(EventKind::TurnAssigned, key.clone()).unwrap();

        assert!(!registry.release(EventKind::TurnAssigned, &key, old.ticket));
        assert!(registry.is_pending(EventKind::TurnAssigned, &key));
        assert!(registry.release(EventKind::TurnAssigned, &key, new.ticket));
        assert!(!registry.is_pending(EventKind::TurnAssigned, &key));
    }

    #[test]
    fn test_kinds_are_independent() {
        let registry: EventRegistry<u32> = EventRegistry::default();
        let key = CorrelationKey::User(U256::from(5));
        let mut turn = registry.register(EventKind::TurnAssigned, key.clone()).unwrap();
        let _points = registry.register(EventKind::PointsRewarded, key.clone()).unwrap();

        assert!(registry.dispatch(EventKind::TurnAssigned, &key, 3));
        assert_eq!(turn.receiver.try_recv().unwrap(), 3);
        assert!(registry.is_pending(EventKind::PointsRewarded, &key));
    }

    #[test]
    fn test_display() {
        assert_eq!(EventKind::PeekCompleted.to_string(), "peek-completed");
        assert_eq!(CorrelationKey::Sentinel.to_string(), "_");
        assert_eq!(CorrelationKey::User(U256::from(12)).to_string(), "12");
    }
}
