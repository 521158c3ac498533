use super::{LedgerClient, TxOptions, TxReceipt};
use crate::chain::{
    LineCall, LineEvent, LinePeekedEvent, LinkError, PointsRewardedEvent, TokenRewardedEvent,
    TurnAssignedEvent, UserAllocatedEvent,
};
use alloy_primitives::{B256, U256, keccak256};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Fault injection switches, all off by default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedLedgerConfig {
    /// `submit` fails before anything is recorded
    pub fail_submission: bool,
    /// `confirm` fails without applying the call
    pub fail_confirmation: bool,
    /// Receipts come back with status = false
    pub revert: bool,
    /// Calls are applied but no event is emitted
    pub mute_events: bool,
    /// `subscribe` fails
    pub fail_subscribe: bool,
}

/// Transaction accepted by the simulated ledger, not yet mined
#[derive(Debug, Clone)]
pub struct SimulatedTx {
    pub call: LineCall,
    pub tx_hash: B256,
}

#[derive(Default)]
struct LineState {
    block_number: u64,
    nonce: u64,
    last_user_id: U256,
    last_turn: U256,
    last_token_id: U256,
    line: VecDeque<U256>,
    turns: HashMap<U256, U256>,
    points: HashMap<U256, U256>,
    calls: Vec<LineCall>,
    queries: u64,
}

struct Subscriber {
    sink: mpsc::UnboundedSender<LineEvent>,
    cancel_token: CancellationToken,
}

/// In-process show-line contract.
///
/// Applies calls on confirmation and emits the same events the real
/// contract would, to every live subscriber.
pub struct SimulatedLedger {
    config: Mutex<SimulatedLedgerConfig>,
    state: Mutex<LineState>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl SimulatedLedger {
    pub fn new() -> Self {
        Self::with_config(SimulatedLedgerConfig::default())
    }

    pub fn with_config(config: SimulatedLedgerConfig) -> Self {
        Self {
            config: Mutex::new(config),
            state: Mutex::new(LineState::default()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Swap fault injection switches at runtime
    pub fn set_config(&self, config: SimulatedLedgerConfig) {
        *self.config.lock() = config;
    }

    pub fn config(&self) -> SimulatedLedgerConfig {
        *self.config.lock()
    }

    /// Every call that made it past `submit`, in order
    pub fn calls(&self) -> Vec<LineCall> {
        self.state.lock().calls.clone()
    }

    /// Number of read-only queries served
    pub fn query_count(&self) -> u64 {
        self.state.lock().queries
    }

    /// Subscribers whose token has not fired and whose channel is open
    pub fn active_subscriptions(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.cancel_token.is_cancelled() && !s.sink.is_closed());
        subscribers.len()
    }

    /// Drop every subscriber's sink, as a listener that died would
    pub fn sever_streams(&self) {
        let dropped = std::mem::take(&mut *self.subscribers.lock());
        tracing::warn!(count = dropped.len(), "Simulated event streams severed");
    }

    /// Deliver an arbitrary event to subscribers, as if the contract had
    /// emitted it. Returns the number of subscribers reached.
    pub fn inject(&self, event: LineEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.cancel_token.is_cancelled() && !s.sink.is_closed());
        subscribers
            .iter()
            .filter(|s| s.sink.send(event.clone()).is_ok())
            .count()
    }

    /// Mutate line state for `call` and build the event it emits.
    ///
    /// `None` means the contract would revert (peek on an empty line).
    fn apply(state: &mut LineState, call: &LineCall, tx_hash: B256) -> Option<LineEvent> {
        let block_number = state.block_number;
        let received_at = Utc::now();

        let event = match call {
            LineCall::AllocateUser { session_id, .. } => {
                state.last_user_id += U256::from(1);
                LineEvent::UserAllocated(UserAllocatedEvent {
                    session_id: session_id.clone(),
                    user_id: state.last_user_id,
                    tx_hash,
                    block_number,
                    received_at,
                })
            }
            LineCall::AddToLine { user_id } => {
                state.last_turn += U256::from(1);
                state.line.push_back(*user_id);
                state.turns.insert(*user_id, state.last_turn);
                LineEvent::TurnAssigned(TurnAssignedEvent {
                    user_id: *user_id,
                    turn: state.last_turn,
                    tx_hash,
                    block_number,
                    received_at,
                })
            }
            LineCall::Peek => {
                let user_id = state.line.pop_front()?;
                LineEvent::LinePeeked(LinePeekedEvent {
                    user_id,
                    tx_hash,
                    block_number,
                    received_at,
                })
            }
            LineCall::RewardGameToken { user_id, .. } => {
                state.last_token_id += U256::from(1);
                LineEvent::TokenRewarded(TokenRewardedEvent {
                    user_id: *user_id,
                    token_id: state.last_token_id,
                    tx_hash,
                    block_number,
                    received_at,
                })
            }
            LineCall::RewardPoints { user_id, points } => {
                let total = state.points.entry(*user_id).or_insert(U256::ZERO);
                *total += *points;
                LineEvent::PointsRewarded(PointsRewardedEvent {
                    user_id: *user_id,
                    points: *total,
                    tx_hash,
                    block_number,
                    received_at,
                })
            }
        };
        Some(event)
    }
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LedgerClient for SimulatedLedger {
    type Pending = SimulatedTx;

    async fn submit(&self, call: &LineCall, options: &TxOptions) -> Result<Self::Pending, LinkError> {
        if self.config().fail_submission {
            tracing::error!(call = call.name(), "Simulated submission failure");
            return Err(LinkError::Submission(format!(
                "{} rejected by simulated ledger",
                call.name()
            )));
        }

        let mut state = self.state.lock();
        state.nonce += 1;
        let tx_hash = keccak256(state.nonce.to_be_bytes());
        state.calls.push(call.clone());

        tracing::debug!(
            call = call.name(),
            tx_hash = %tx_hash,
            gas_limit = options.gas_limit,
            "Simulated transaction sent"
        );

        Ok(SimulatedTx {
            call: call.clone(),
            tx_hash,
        })
    }

    async fn confirm(&self, pending: Self::Pending) -> Result<TxReceipt, LinkError> {
        let config = self.config();
        if config.fail_confirmation {
            return Err(LinkError::Confirmation(format!(
                "{}: simulated confirmation timeout",
                pending.tx_hash
            )));
        }

        let (receipt, event) = {
            let mut state = self.state.lock();
            state.block_number += 1;

            let event = if config.revert {
                None
            } else {
                Self::apply(&mut state, &pending.call, pending.tx_hash)
            };

            let receipt = TxReceipt {
                tx_hash: pending.tx_hash,
                block_number: state.block_number,
                gas_used: 21_000,
                status: event.is_some(),
            };
            (receipt, event)
        };

        tracing::debug!(call = pending.call.name(), "Simulated receipt: {}", receipt);

        if let Some(event) = event {
            if !config.mute_events {
                self.inject(event);
            }
        }

        Ok(receipt)
    }

    async fn subscribe(
        &self,
        sink: mpsc::UnboundedSender<LineEvent>,
        cancel_token: CancellationToken,
    ) -> Result<(), LinkError> {
        if self.config().fail_subscribe {
            return Err(LinkError::Subscription(
                "simulated ledger refused subscription".to_string(),
            ));
        }

        self.subscribers.lock().push(Subscriber { sink, cancel_token });
        tracing::info!("✅ Subscribed to simulated ledger events");
        Ok(())
    }

    async fn line_turn(&self, user_id: U256) -> Result<U256, LinkError> {
        let mut state = self.state.lock();
        state.queries += 1;
        Ok(state.turns.get(&user_id).copied().unwrap_or(U256::ZERO))
    }

    async fn first_in_line(&self) -> Result<U256, LinkError> {
        let mut state = self.state.lock();
        state.queries += 1;
        Ok(state.line.front().copied().unwrap_or(U256::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(ledger: &SimulatedLedger, call: LineCall) -> TxReceipt {
        let pending = ledger.submit(&call, &TxOptions::default()).await.unwrap();
        ledger.confirm(pending).await.unwrap()
    }

    #[tokio::test]
    async fn test_add_to_line_emits_turn() {
        let ledger = SimulatedLedger::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ledger.subscribe(tx, CancellationToken::new()).await.unwrap();

        let receipt = run(&ledger, LineCall::AddToLine { user_id: U256::from(4) }).await;
        assert!(receipt.status);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.payload(), U256::from(1));
        assert_eq!(event.tx_hash(), receipt.tx_hash);
        assert_eq!(ledger.line_turn(U256::from(4)).await.unwrap(), U256::from(1));
        assert_eq!(ledger.first_in_line().await.unwrap(), U256::from(4));
    }

    #[tokio::test]
    async fn test_peek_on_empty_line_reverts() {
        let ledger = SimulatedLedger::new();
        let receipt = run(&ledger, LineCall::Peek).await;
        assert!(!receipt.status);
    }

    #[tokio::test]
    async fn test_points_accumulate() {
        let ledger = SimulatedLedger::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ledger.subscribe(tx, CancellationToken::new()).await.unwrap();

        let user_id = U256::from(2);
        run(&ledger, LineCall::RewardPoints { user_id, points: U256::from(10) }).await;
        run(&ledger, LineCall::RewardPoints { user_id, points: U256::from(5) }).await;

        assert_eq!(rx.try_recv().unwrap().payload(), U256::from(10));
        assert_eq!(rx.try_recv().unwrap().payload(), U256::from(15));
    }

    #[tokio::test]
    async fn test_submission_failure_records_nothing() {
        let ledger = SimulatedLedger::with_config(SimulatedLedgerConfig {
            fail_submission: true,
            ..Default::default()
        });

        let result = ledger.submit(&LineCall::Peek, &TxOptions::default()).await;
        assert!(matches!(result, Err(LinkError::Submission(_))));
        assert!(ledger.calls().is_empty());
    }

    #[tokio::test]
    async fn test_muted_events_still_apply() {
        let ledger = SimulatedLedger::with_config(SimulatedLedgerConfig {
            mute_events: true,
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        ledger.subscribe(tx, CancellationToken::new()).await.unwrap();

        run(&ledger, LineCall::AddToLine { user_id: U256::from(8) }).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(ledger.first_in_line().await.unwrap(), U256::from(8));
    }

    #[tokio::test]
    async fn test_cancelled_subscriber_is_dropped() {
        let ledger = SimulatedLedger::new();
        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        ledger.subscribe(tx, token.clone()).await.unwrap();
        assert_eq!(ledger.active_subscriptions(), 1);

        token.cancel();
        assert_eq!(ledger.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_sever_streams_closes_sinks() {
        let ledger = SimulatedLedger::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ledger.subscribe(tx, CancellationToken::new()).await.unwrap();

        ledger.sever_streams();
        assert_eq!(ledger.active_subscriptions(), 0);
        assert!(rx.recv().await.is_none());
    }
}
