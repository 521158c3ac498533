//! Connection lifecycle and the show-line operations built on it
//!
//! `LineConnector` owns one registry, one dispatcher task and, once
//! connected, one ledger client. Operations fail with `NotConnected` until
//! `connect` succeeds.

use crate::chain::{LineCall, LinkError, encode_key};
use crate::config::LinkConfig;
use crate::dispatcher::{DispatchStats, EventDispatcher};
use crate::ledger::{HttpLedger, LedgerClient, TxOptions};
use crate::protocol::CallContext;
use crate::registry::{CorrelationKey, EventKind, EventRegistry, RegistrationPolicy};
use alloy_primitives::{B256, U256};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Result of `allocate_user`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub user_id: U256,
    /// keccak256 of the secret word, as sent to the contract
    pub encoded_key: B256,
}

/// A participant whose turn can be refreshed from the ledger
pub trait LineMember {
    fn user_id(&self) -> U256;
    fn assign_turn(&mut self, turn: U256);
}

/// Live wiring created by a successful `connect`
struct Session<C> {
    generation: u64,
    client: Arc<C>,
    dispatcher: Arc<EventDispatcher>,
    cancel_token: CancellationToken,
}

/// State and session change together under one lock
struct Link<C> {
    state: ConnectionState,
    session: Option<Session<C>>,
    generation: u64,
}

impl<C> Link<C> {
    /// Cancel the current session, if any. Returns whether there was one.
    fn teardown(&mut self) -> bool {
        match self.session.take() {
            Some(session) => {
                session.cancel_token.cancel();
                true
            }
            None => false,
        }
    }
}

pub struct LineConnector<C: LedgerClient> {
    registry: Arc<EventRegistry>,
    link: Arc<Mutex<Link<C>>>,
    /// Serializes `connect` so two sessions are never live at once
    connecting: tokio::sync::Mutex<()>,
    options: TxOptions,
    event_timeout: Option<Duration>,
}

impl<C: LedgerClient> LineConnector<C> {
    pub fn new(options: TxOptions, event_timeout: Option<Duration>, policy: RegistrationPolicy) -> Self {
        Self {
            registry: Arc::new(EventRegistry::new(policy)),
            link: Arc::new(Mutex::new(Link {
                state: ConnectionState::Disconnected,
                session: None,
                generation: 0,
            })),
            connecting: tokio::sync::Mutex::new(()),
            options,
            event_timeout,
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(
            config.tx_options(),
            config.event_timeout(),
            config.registration_policy,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Dispatcher counters for the current session
    pub fn dispatch_stats(&self) -> Option<DispatchStats> {
        self.link.lock().session.as_ref().map(|s| s.dispatcher.stats())
    }

    /// Bind `client` and start routing its events.
    ///
    /// Any previous subscription and dispatcher are cancelled first, so
    /// calling this again after a connection loss never doubles delivery.
    /// On failure the connector is left disconnected.
    pub async fn connect(&self, client: Arc<C>) -> Result<(), LinkError> {
        let _serial = self.connecting.lock().await;
        self.begin_connecting();
        self.attach(client).await
    }

    /// Tear down the old session and enter `Connecting`
    fn begin_connecting(&self) {
        let mut link = self.link.lock();
        link.teardown();
        link.state = ConnectionState::Connecting;
        tracing::info!("🔌 Connecting to ledger");
    }

    fn fail_connecting(&self) {
        self.link.lock().state = ConnectionState::Disconnected;
    }

    async fn attach(&self, client: Arc<C>) -> Result<(), LinkError> {
        let cancel_token = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        if let Err(e) = client.subscribe(event_tx, cancel_token.clone()).await {
            tracing::error!("❌ Failed to subscribe to ledger events: {}", e);
            cancel_token.cancel();
            self.fail_connecting();
            return Err(e);
        }

        let dispatcher = Arc::new(EventDispatcher::new(self.registry.clone()));

        // The session is stored before the dispatcher runs, so a stream that
        // dies immediately still finds it to tear down
        let generation = {
            let mut link = self.link.lock();
            link.generation += 1;
            link.session = Some(Session {
                generation: link.generation,
                client,
                dispatcher: dispatcher.clone(),
                cancel_token: cancel_token.clone(),
            });
            link.state = ConnectionState::Connected;
            link.generation
        };

        let link = self.link.clone();
        tokio::spawn(async move {
            dispatcher.run(event_rx, cancel_token.clone()).await;
            if !cancel_token.is_cancelled() {
                Self::stream_lost(&link, generation);
            }
        });

        tracing::info!(
            gas_limit = self.options.gas_limit,
            policy = ?self.registry.policy(),
            "✅ Connected to ledger"
        );
        Ok(())
    }

    /// The event stream of session `generation` ended on its own: without
    /// it no correlated call can resolve, so drop to `Disconnected`
    fn stream_lost(link: &Mutex<Link<C>>, generation: u64) {
        let mut link = link.lock();
        let current = link.session.as_ref().map(|s| s.generation);
        if current != Some(generation) {
            return;
        }
        link.teardown();
        link.state = ConnectionState::Disconnected;
        tracing::error!("❌ Ledger event stream lost, connector disconnected");
    }

    /// Stop event delivery and drop the client
    pub fn disconnect(&self) {
        let mut link = self.link.lock();
        if link.teardown() {
            tracing::info!("🛑 Disconnected from ledger");
        }
        link.state = ConnectionState::Disconnected;
    }

    fn client(&self) -> Option<Arc<C>> {
        let link = self.link.lock();
        if link.state != ConnectionState::Connected {
            return None;
        }
        link.session.as_ref().map(|s| s.client.clone())
    }

    async fn correlated(
        &self,
        call: LineCall,
        kind: EventKind,
        key: CorrelationKey,
    ) -> Result<U256, LinkError> {
        let client = self.client();
        let ctx = CallContext {
            registry: &self.registry,
            client: client.as_deref(),
            options: &self.options,
            event_timeout: self.event_timeout,
        };
        ctx.call(call, kind, key).await.map(|event| event.payload())
    }

    /// Allocate a user id for `session_id`, keyed by the session
    pub async fn allocate_user(&self, session_id: &str, secret_word: &str) -> Result<Allocation, LinkError> {
        let encoded_key = encode_key(secret_word);
        let user_id = self
            .correlated(
                LineCall::AllocateUser {
                    session_id: session_id.to_string(),
                    encoded_key,
                },
                EventKind::AllocationConfirmed,
                CorrelationKey::Session(session_id.to_string()),
            )
            .await?;

        Ok(Allocation { user_id, encoded_key })
    }

    /// Put `user_id` in line, returning the assigned turn
    pub async fn add_to_line(&self, user_id: U256) -> Result<U256, LinkError> {
        self.correlated(
            LineCall::AddToLine { user_id },
            EventKind::TurnAssigned,
            CorrelationKey::User(user_id),
        )
        .await
    }

    /// Remove the head of the line, returning its user id.
    ///
    /// Keyed by the sentinel: only one peek may be outstanding at a time.
    pub async fn peek(&self) -> Result<U256, LinkError> {
        self.correlated(LineCall::Peek, EventKind::PeekCompleted, CorrelationKey::Sentinel)
            .await
    }

    /// Mint a game token, returning its token id
    pub async fn reward_game_token(&self, user_id: U256, nft_url: &str) -> Result<U256, LinkError> {
        self.correlated(
            LineCall::RewardGameToken {
                user_id,
                nft_url: nft_url.to_string(),
            },
            EventKind::TokenRewarded,
            CorrelationKey::User(user_id),
        )
        .await
    }

    /// Add points, returning the user's cumulative total
    pub async fn reward_points(&self, user_id: U256, points: U256) -> Result<U256, LinkError> {
        self.correlated(
            LineCall::RewardPoints { user_id, points },
            EventKind::PointsRewarded,
            CorrelationKey::User(user_id),
        )
        .await
    }

    pub async fn line_turn(&self, user_id: U256) -> Result<U256, LinkError> {
        let client = self.client().ok_or(LinkError::NotConnected)?;
        client.line_turn(user_id).await
    }

    pub async fn first_in_line(&self) -> Result<U256, LinkError> {
        let client = self.client().ok_or(LinkError::NotConnected)?;
        client.first_in_line().await
    }

    /// Refresh `member`'s turn from ledger state.
    ///
    /// Reads directly, bypassing the registry. The turn is only assigned
    /// when it is behind the head of the line. Returns whether it was.
    pub async fn sync_user<M: LineMember + Send>(&self, member: &mut M) -> Result<bool, LinkError> {
        let client = self.client().ok_or(LinkError::NotConnected)?;

        let user_id = member.user_id();
        let turn = client.line_turn(user_id).await?;
        let first = client.first_in_line().await?;
        let first_turn = client.line_turn(first).await?;

        tracing::debug!(
            user_id = %user_id,
            turn = %turn,
            first_in_line = %first,
            first_turn = %first_turn,
            "Syncing member turn"
        );

        if turn > first_turn {
            member.assign_turn(turn);
            return Ok(true);
        }
        Ok(false)
    }
}

impl LineConnector<HttpLedger> {
    /// Build the client for the configured network, then connect.
    ///
    /// A client that cannot be built (no contract on the network, bad key,
    /// wrong chain) is logged and leaves the connector disconnected, like
    /// a failed subscription.
    pub async fn connect_network(&self, config: &LinkConfig, private_key: &str) -> Result<(), LinkError> {
        let _serial = self.connecting.lock().await;
        self.begin_connecting();

        let built = match config.listener_config() {
            Ok(listener) => HttpLedger::connect(&config.profile(), private_key, listener).await,
            Err(e) => Err(e),
        };

        match built {
            Ok(ledger) => self.attach(Arc::new(ledger)).await,
            Err(e) => {
                tracing::error!(network = %config.network, "❌ Ledger client setup failed: {}", e);
                self.fail_connecting();
                Err(e)
            }
        }
    }
}

impl<C: LedgerClient> Drop for LineConnector<C> {
    fn drop(&mut self) {
        self.link.lock().teardown();
    }
}
