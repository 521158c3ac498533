//! WebSocket and polling event listener for show-line events
//!
//! Subscribes once to every event topic of the contract, with WebSocket as
//! primary transport and `eth_getLogs` polling as fallback. Parsed events go
//! out on an unbounded channel; logs that fail to parse are skipped.

use crate::chain::{EventSignatures, LineEvent, LinkError, parse_log};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::Filter;
use alloy_primitives::{Address, B256, Log as PrimitiveLog};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Connection state for the event listener
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Polling,
}

/// Configuration for the event listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventListenerConfig {
    /// HTTP RPC URL for polling
    pub rpc_url: String,
    /// WebSocket URL (optional, derived from rpc_url if not provided)
    pub ws_url: Option<String>,
    /// Contract emitting the events
    pub contract_address: Address,
    /// Polling interval in milliseconds (fallback mode)
    pub polling_interval_ms: u64,
    /// Maximum reconnection delay in milliseconds
    pub reconnect_max_delay_ms: u64,
    /// Number of consecutive WebSocket failures before switching to polling
    pub ws_failure_threshold: u32,
    /// Pong timeout in seconds (triggers reconnect if no pong received)
    pub pong_timeout_secs: u64,
}

impl Default for EventListenerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545/".to_string(),
            ws_url: None,
            contract_address: Address::ZERO,
            polling_interval_ms: 3000,
            reconnect_max_delay_ms: 30000,
            ws_failure_threshold: 3,
            pong_timeout_secs: 60,
        }
    }
}

/// Chain event listener with WebSocket primary and polling fallback
pub struct ChainEventListener {
    config: EventListenerConfig,
    state: tokio::sync::RwLock<ListenerState>,
    event_tx: mpsc::UnboundedSender<LineEvent>,
    cancel_token: CancellationToken,
    consecutive_ws_failures: tokio::sync::RwLock<u32>,
    /// Highest block whose logs have been emitted (0 = nothing seen yet)
    last_processed_block: AtomicU64,
    last_pong_time: tokio::sync::RwLock<Option<Instant>>,
}

impl ChainEventListener {
    pub fn new(
        config: EventListenerConfig,
        event_tx: mpsc::UnboundedSender<LineEvent>,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: tokio::sync::RwLock::new(ListenerState::Disconnected),
            event_tx,
            cancel_token,
            consecutive_ws_failures: tokio::sync::RwLock::new(0),
            last_processed_block: AtomicU64::new(0),
            last_pong_time: tokio::sync::RwLock::new(None),
        })
    }

    /// Get current connection state
    pub async fn state(&self) -> ListenerState {
        self.state.read().await.clone()
    }

    /// Start the event listener (main entry point)
    pub async fn start(self: Arc<Self>) -> Result<(), LinkError> {
        tracing::info!("🚀 Starting chain event listener");
        tracing::info!("  RPC URL: {}", self.config.rpc_url);
        tracing::info!("  Contract: {}", self.config.contract_address);

        self.seed_cursor().await;

        // Try WebSocket first, fall back to polling
        if self.config.ws_url.is_some() || self.try_derive_ws_url().is_some() {
            tracing::info!("🔌 Attempting WebSocket connection...");
            if let Err(e) = self.clone().run_websocket_loop().await {
                tracing::warn!("WebSocket failed: {:?}, switching to polling", e);
            }
        }

        if self.cancel_token.is_cancelled() {
            return Ok(());
        }

        tracing::info!("📊 Using polling mode");
        self.run_polling_loop().await
    }

    /// Derive WebSocket URL from HTTP RPC URL
    fn try_derive_ws_url(&self) -> Option<String> {
        let url = &self.config.rpc_url;
        if url.starts_with("https://") {
            Some(url.replacen("https://", "wss://", 1))
        } else if url.starts_with("http://") {
            Some(url.replacen("http://", "ws://", 1))
        } else {
            None
        }
    }

    async fn run_websocket_loop(self: Arc<Self>) -> Result<(), LinkError> {
        let ws_url = self
            .config
            .ws_url
            .clone()
            .or_else(|| self.try_derive_ws_url())
            .ok_or_else(|| LinkError::InvalidConfig("No WebSocket URL available".to_string()))?;

        let mut retry_delay = Duration::from_millis(1000);
        let max_delay = Duration::from_millis(self.config.reconnect_max_delay_ms);

        loop {
            if self.cancel_token.is_cancelled() {
                break;
            }

            let failures = *self.consecutive_ws_failures.read().await;
            if failures >= self.config.ws_failure_threshold {
                tracing::warn!(
                    "🔄 {} consecutive WebSocket failures, switching to polling",
                    failures
                );
                return Err(LinkError::ConnectionLost {
                    retry_count: failures,
                });
            }

            *self.state.write().await = if failures > 0 {
                ListenerState::Reconnecting { attempt: failures }
            } else {
                ListenerState::Connecting
            };

            tracing::info!("🔌 Connecting to WebSocket: {}", ws_url);

            match self.clone().connect_and_subscribe(&ws_url).await {
                Ok(()) => {
                    *self.consecutive_ws_failures.write().await = 0;
                    retry_delay = Duration::from_millis(1000);
                }
                Err(e) => {
                    tracing::error!("❌ WebSocket error: {:?}", e);
                    *self.consecutive_ws_failures.write().await += 1;

                    tracing::info!("⏳ Retrying in {:?}...", retry_delay);
                    tokio::select! {
                        _ = self.cancel_token.cancelled() => break,
                        _ = sleep(retry_delay) => {}
                    }
                    retry_delay = std::cmp::min(retry_delay * 2, max_delay);
                }
            }

            *self.state.write().await = ListenerState::Disconnected;
        }

        Ok(())
    }

    async fn connect_and_subscribe(self: Arc<Self>, ws_url: &str) -> Result<(), LinkError> {
        let (ws_stream, _) = connect_async(ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        *self.state.write().await = ListenerState::Connected;
        tracing::info!("🔌 WebSocket connected");

        let topics: Vec<String> = EventSignatures::all()
            .iter()
            .map(|s| format!("{:?}", s))
            .collect();

        let subscribe_msg = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["logs", {
                "address": format!("{:?}", self.config.contract_address),
                "topics": [topics]
            }]
        });

        write
            .send(Message::Text(subscribe_msg.to_string().into()))
            .await
            .map_err(|e| LinkError::Subscription(e.to_string()))?;

        tracing::info!("📡 Subscribed to {} show-line event types", topics.len());

        // The subscription only carries new logs; replay what was mined
        // while the socket was down
        if let Some(from_block) = self.resume_block() {
            match self.backtrack_events(from_block).await {
                Ok(0) => {}
                Ok(count) => tracing::info!("⏪ Recovered {} event(s) missed while disconnected", count),
                Err(e) => tracing::warn!("Backtrack after reconnect failed: {}", e),
            }
        }

        let mut ping_interval = interval(Duration::from_secs(30));
        let mut pong_check_interval = interval(Duration::from_secs(10));
        let mut subscription_id: Option<String> = None;

        *self.last_pong_time.write().await = Some(Instant::now());

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    tracing::info!("🛑 Shutdown signal received");
                    break;
                }
                _ = ping_interval.tick() => {
                    if write.send(Message::Ping(vec![].into())).await.is_err() {
                        tracing::warn!("Failed to send ping");
                        break;
                    }
                    tracing::trace!("Ping sent");
                }
                _ = pong_check_interval.tick() => {
                    if let Some(last_pong) = *self.last_pong_time.read().await {
                        let elapsed = last_pong.elapsed();
                        if elapsed > Duration::from_secs(self.config.pong_timeout_secs) {
                            tracing::warn!(
                                "⚠️ No pong received for {}s (timeout: {}s), triggering reconnect",
                                elapsed.as_secs(),
                                self.config.pong_timeout_secs
                            );
                            break;
                        }
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.handle_ws_message(&text, &mut subscription_id).await {
                                tracing::error!("Error handling message: {:?}", e);
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            *self.last_pong_time.write().await = Some(Instant::now());
                            tracing::trace!("Pong received, connection healthy");
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!("WebSocket closed by server");
                            break;
                        }
                        Some(Err(e)) => {
                            tracing::error!("WebSocket error: {:?}", e);
                            break;
                        }
                        None => {
                            tracing::info!("WebSocket stream ended");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_ws_message(
        &self,
        text: &str,
        subscription_id: &mut Option<String>,
    ) -> Result<(), LinkError> {
        let json: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| LinkError::EventParse { reason: e.to_string() })?;

        // Subscription confirmation
        if let Some(result) = json.get("result") {
            if let Some(id) = result.as_str() {
                *subscription_id = Some(id.to_string());
                tracing::info!("📋 Subscription confirmed: {}", id);
                return Ok(());
            }
        }

        if let Some(error) = json.get("error") {
            return Err(LinkError::Subscription(error.to_string()));
        }

        // Event notification
        if let Some(result) = json.get("params").and_then(|p| p.get("result")) {
            self.process_log_result(result)?;
        }

        Ok(())
    }

    /// Decode one `eth_subscription` log payload and emit it
    fn process_log_result(&self, result: &serde_json::Value) -> Result<(), LinkError> {
        let address: Address = result
            .get("address")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LinkError::EventParse {
                reason: "Missing address".to_string(),
            })?
            .parse()
            .map_err(|_| LinkError::EventParse {
                reason: "Invalid address".to_string(),
            })?;

        let tx_hash: B256 = result
            .get("transactionHash")
            .and_then(|v| v.as_str())
            .map(|s| s.parse::<B256>())
            .transpose()
            .map_err(|_| LinkError::EventParse {
                reason: "Invalid tx hash".to_string(),
            })?
            .unwrap_or(B256::ZERO);

        let block_number_str = result
            .get("blockNumber")
            .and_then(|v| v.as_str())
            .unwrap_or("0x0");
        let block_number =
            u64::from_str_radix(block_number_str.trim_start_matches("0x"), 16).unwrap_or(0);

        let topics: Vec<B256> = result
            .get("topics")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| t.as_str())
                    .filter_map(|s| s.parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        let data_str = result.get("data").and_then(|v| v.as_str()).unwrap_or("0x");
        let data = hex::decode(data_str.trim_start_matches("0x")).map_err(|e| {
            LinkError::EventParse {
                reason: format!("Invalid log data: {}", e),
            }
        })?;

        let log = PrimitiveLog::new(address, topics, data.into()).ok_or_else(|| {
            LinkError::EventParse {
                reason: "Failed to create log".to_string(),
            }
        })?;

        match parse_log(&log, tx_hash, block_number) {
            Ok(event) => self.emit_event(event),
            Err(e) => tracing::warn!("Failed to parse log: {}", e),
        }

        Ok(())
    }

    async fn run_polling_loop(self: Arc<Self>) -> Result<(), LinkError> {
        let provider = self.http_provider()?;
        *self.state.write().await = ListenerState::Polling;

        // The last block seen over WebSocket may have been delivered only in
        // part, so it is scanned again before regular polling
        let mut rescan_from = self.resume_block();

        tracing::info!(
            from_block = ?rescan_from,
            "📊 Starting polling (interval: {}ms)",
            self.config.polling_interval_ms
        );

        let mut poll_interval = interval(Duration::from_millis(self.config.polling_interval_ms));

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    tracing::info!("🛑 Shutdown signal received");
                    break;
                }
                _ = poll_interval.tick() => {
                    let result = match rescan_from {
                        Some(from_block) => self.backtrack_events(from_block).await.map(|_| ()),
                        None => self.poll_events(&provider).await,
                    };
                    match result {
                        Ok(()) => rescan_from = None,
                        Err(e) => tracing::error!("Polling error: {:?}", e),
                    }
                }
            }
        }

        *self.state.write().await = ListenerState::Disconnected;
        Ok(())
    }

    async fn poll_events<P: Provider>(&self, provider: &P) -> Result<(), LinkError> {
        let from_block = self.last_processed_block();
        let to_block = provider
            .get_block_number()
            .await
            .map_err(|e| LinkError::Rpc(e.to_string()))?;

        // Nothing seen yet: start at the head rather than at genesis
        if from_block == 0 {
            self.advance_cursor(to_block);
            return Ok(());
        }

        if to_block <= from_block {
            return Ok(());
        }

        tracing::debug!("📊 Polling blocks {} to {}", from_block + 1, to_block);
        self.emit_range(provider, from_block + 1, to_block).await?;
        Ok(())
    }

    /// Re-emit contract logs from `from_block` up to the chain head.
    ///
    /// Returns the number of events emitted. Events already delivered may
    /// come out again; the registry resolves each waiter once.
    pub async fn backtrack_events(&self, from_block: u64) -> Result<usize, LinkError> {
        let provider = self.http_provider()?;

        let current_block = provider
            .get_block_number()
            .await
            .map_err(|e| LinkError::Rpc(e.to_string()))?;

        if current_block < from_block {
            return Ok(0);
        }

        tracing::info!(
            "⏪ Backtracking events from block {} to {}",
            from_block,
            current_block
        );

        self.emit_range(&provider, from_block, current_block).await
    }

    async fn emit_range<P: Provider>(
        &self,
        provider: &P,
        from_block: u64,
        to_block: u64,
    ) -> Result<usize, LinkError> {
        let filter = Filter::new()
            .address(self.config.contract_address)
            .event_signature(EventSignatures::all())
            .from_block(from_block)
            .to_block(to_block);

        let logs = provider
            .get_logs(&filter)
            .await
            .map_err(|e| LinkError::Rpc(e.to_string()))?;

        let mut event_count = 0;
        for log in logs {
            let tx_hash = log.transaction_hash.unwrap_or(B256::ZERO);
            let block_number = log.block_number.unwrap_or(0);

            match parse_log(&log.inner, tx_hash, block_number) {
                Ok(event) => {
                    self.emit_event(event);
                    event_count += 1;
                }
                Err(e) => tracing::warn!("Failed to parse log: {}", e),
            }
        }

        self.advance_cursor(to_block);
        Ok(event_count)
    }

    fn http_provider(&self) -> Result<impl Provider, LinkError> {
        let url = self
            .config
            .rpc_url
            .parse()
            .map_err(|_| LinkError::InvalidConfig("Invalid RPC URL".to_string()))?;
        Ok(ProviderBuilder::new().connect_http(url))
    }

    /// Record the chain head at startup so an outage before the first
    /// event can still be backfilled
    async fn seed_cursor(&self) {
        if self.last_processed_block() != 0 {
            return;
        }
        let head = match self.http_provider() {
            Ok(provider) => provider.get_block_number().await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match head {
            Ok(block) => self.advance_cursor(block),
            Err(e) => tracing::warn!("Could not read chain head, backfill starts at first event: {}", e),
        }
    }

    pub fn last_processed_block(&self) -> u64 {
        self.last_processed_block.load(Ordering::Acquire)
    }

    /// Block to rescan from after an outage, None before anything was seen
    fn resume_block(&self) -> Option<u64> {
        match self.last_processed_block() {
            0 => None,
            block => Some(block),
        }
    }

    fn advance_cursor(&self, block: u64) {
        self.last_processed_block.fetch_max(block, Ordering::AcqRel);
    }

    /// Correlation id for log lines.
    /// Format: {tx_hash prefix}:{kind}, UUID prefix when the hash is unknown
    fn generate_correlation_id(&self, event: &LineEvent) -> String {
        let tx_hash = event.tx_hash();
        if tx_hash != B256::ZERO {
            let hash_short = &format!("{:?}", tx_hash)[2..18];
            format!("{}:{}", hash_short, event.kind())
        } else {
            format!("{}:{}", &Uuid::new_v4().to_string()[..8], event.kind())
        }
    }

    fn emit_event(&self, event: LineEvent) {
        let correlation_id = self.generate_correlation_id(&event);
        self.advance_cursor(event.block_number());

        tracing::debug!(
            correlation_id = %correlation_id,
            key = %event.correlation_key(),
            block = event.block_number(),
            "📦 Show-line event decoded"
        );

        if self.event_tx.send(event).is_err() {
            tracing::error!(
                correlation_id = %correlation_id,
                "Failed to send event to channel (receiver dropped)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::event_types::turnAssigned;
    use alloy_primitives::U256;
    use alloy_sol_types::SolEvent;

    fn make_listener(
        config: EventListenerConfig,
    ) -> (Arc<ChainEventListener>, mpsc::UnboundedReceiver<LineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChainEventListener::new(config, tx, CancellationToken::new()), rx)
    }

    #[test]
    fn test_derive_ws_url() {
        let (listener, _rx) = make_listener(EventListenerConfig {
            rpc_url: "https://eth-rpc-api-testnet.thetatoken.org/rpc".to_string(),
            ..Default::default()
        });
        assert_eq!(
            listener.try_derive_ws_url(),
            Some("wss://eth-rpc-api-testnet.thetatoken.org/rpc".to_string())
        );
    }

    #[test]
    fn test_derive_ws_url_http() {
        let (listener, _rx) = make_listener(EventListenerConfig {
            rpc_url: "http://127.0.0.1:18888/rpc".to_string(),
            ..Default::default()
        });
        assert_eq!(
            listener.try_derive_ws_url(),
            Some("ws://127.0.0.1:18888/rpc".to_string())
        );
    }

    #[test]
    fn test_default_config() {
        let config = EventListenerConfig::default();
        assert_eq!(config.polling_interval_ms, 3000);
        assert_eq!(config.reconnect_max_delay_ms, 30000);
        assert_eq!(config.ws_failure_threshold, 3);
        assert_eq!(config.pong_timeout_secs, 60);
        assert!(config.ws_url.is_none());
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let (listener, _rx) = make_listener(EventListenerConfig::default());
        assert_eq!(listener.state().await, ListenerState::Disconnected);
    }

    #[tokio::test]
    async fn test_ws_notification_is_emitted() {
        let (listener, mut rx) = make_listener(EventListenerConfig::default());
        let data = turnAssigned {
            userID: U256::from(9),
            turn: U256::from(4),
        }
        .encode_log_data();

        let notification = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0x1",
                "result": {
                    "address": "0x52d2878492ef30d625fc54ec52c4db7f010d471e",
                    "topics": [format!("{:?}", turnAssigned::SIGNATURE_HASH)],
                    "data": format!("0x{}", hex::encode(&data.data)),
                    "blockNumber": "0x10",
                    "transactionHash": format!("{:?}", B256::repeat_byte(0xab)),
                }
            }
        });

        let mut sub = None;
        listener
            .handle_ws_message(&notification.to_string(), &mut sub)
            .await
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.payload(), U256::from(4));
        assert_eq!(event.block_number(), 16);
        assert_eq!(event.tx_hash(), B256::repeat_byte(0xab));
    }

    #[tokio::test]
    async fn test_subscription_confirmation_is_recorded() {
        let (listener, mut rx) = make_listener(EventListenerConfig::default());
        let mut sub = None;
        listener
            .handle_ws_message(r#"{"jsonrpc":"2.0","id":1,"result":"0xfeed"}"#, &mut sub)
            .await
            .unwrap();

        assert_eq!(sub.as_deref(), Some("0xfeed"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_log_is_skipped() {
        let (listener, mut rx) = make_listener(EventListenerConfig::default());
        let notification = json!({
            "params": {
                "result": {
                    "address": "0x52d2878492ef30d625fc54ec52c4db7f010d471e",
                    "topics": [format!("{:?}", B256::repeat_byte(0xee))],
                    "data": "0x",
                }
            }
        });

        let mut sub = None;
        assert!(listener
            .handle_ws_message(&notification.to_string(), &mut sub)
            .await
            .is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_correlation_id_with_tx_hash() {
        let (listener, _rx) = make_listener(EventListenerConfig::default());
        let event = LineEvent::LinePeeked(crate::chain::LinePeekedEvent {
            user_id: U256::from(3),
            tx_hash: "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef"
                .parse()
                .unwrap(),
            block_number: 1,
            received_at: chrono::Utc::now(),
        });

        let id = listener.generate_correlation_id(&event);
        assert_eq!(id, "1234567890abcdef:peek-completed");
    }

    fn turn_notification(user: u64, block: u64) -> String {
        let data = turnAssigned {
            userID: U256::from(user),
            turn: U256::from(1),
        }
        .encode_log_data();

        json!({
            "params": {
                "result": {
                    "address": "0x52d2878492ef30d625fc54ec52c4db7f010d471e",
                    "topics": [format!("{:?}", turnAssigned::SIGNATURE_HASH)],
                    "data": format!("0x{}", hex::encode(&data.data)),
                    "blockNumber": format!("0x{:x}", block),
                    "transactionHash": format!("{:?}", B256::repeat_byte(0xcd)),
                }
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_emitted_events_advance_cursor() {
        let (listener, _rx) = make_listener(EventListenerConfig::default());
        assert_eq!(listener.resume_block(), None);

        let mut sub = None;
        listener
            .handle_ws_message(&turn_notification(9, 0x10), &mut sub)
            .await
            .unwrap();

        assert_eq!(listener.last_processed_block(), 16);
        // The last seen block is rescanned, it may have been cut short
        assert_eq!(listener.resume_block(), Some(16));
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let (listener, mut rx) = make_listener(EventListenerConfig::default());
        let mut sub = None;
        listener
            .handle_ws_message(&turn_notification(1, 20), &mut sub)
            .await
            .unwrap();
        listener
            .handle_ws_message(&turn_notification(2, 8), &mut sub)
            .await
            .unwrap();

        assert_eq!(listener.last_processed_block(), 20);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_backtrack_rejects_bad_rpc_url() {
        let (listener, _rx) = make_listener(EventListenerConfig {
            rpc_url: "not a url".to_string(),
            ..Default::default()
        });
        assert!(matches!(
            listener.backtrack_events(1).await,
            Err(LinkError::InvalidConfig(_))
        ));
    }
}
