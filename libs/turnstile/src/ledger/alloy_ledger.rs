//! alloy-backed ledger client
//!
//! Signs with a local private key over HTTP and watches events with the
//! WebSocket/polling listener.

use super::{LedgerClient, TxOptions, TxReceipt};
use crate::chain::{ChainEventListener, EventListenerConfig, IShowLine, LineCall, LineEvent, LinkError};
use crate::config::NetworkProfile;
use alloy::network::{Ethereum, EthereumWallet};
use alloy::providers::{DynProvider, PendingTransactionBuilder, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::reqwest::Url;
use alloy_primitives::{Address, U256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Ledger client over a type-erased provider
pub type HttpLedger = AlloyLedger<DynProvider>;

/// Ledger client generic over provider type
pub struct AlloyLedger<P>
where
    P: Provider + Clone,
{
    provider: P,
    contract_address: Address,
    listener_config: EventListenerConfig,
}

impl<P> AlloyLedger<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    /// Create a ledger client with an existing provider
    pub fn new_with_provider(
        provider: P,
        contract_address: Address,
        listener_config: EventListenerConfig,
    ) -> Self {
        Self {
            provider,
            contract_address,
            listener_config,
        }
    }

    pub fn contract_address(&self) -> Address {
        self.contract_address
    }
}

impl HttpLedger {
    /// Build a signing client for `profile` and check that the endpoint
    /// serves the expected chain
    pub async fn connect(
        profile: &NetworkProfile,
        private_key: &str,
        listener_config: EventListenerConfig,
    ) -> Result<Self, LinkError> {
        let contract_address = profile.require_contract()?;
        let url: Url = profile.rpc_url.parse().map_err(|_| {
            LinkError::InvalidConfig(format!("Invalid RPC URL: {}", profile.rpc_url))
        })?;

        let signer: PrivateKeySigner = private_key
            .parse()
            .map_err(|_| LinkError::InvalidConfig("Invalid private key".to_string()))?;
        let from = signer.address();
        let wallet = EthereumWallet::from(signer);

        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(url)
            .erased();

        let chain_id = provider
            .get_chain_id()
            .await
            .map_err(|e| LinkError::Rpc(e.to_string()))?;
        if chain_id != profile.chain_id {
            return Err(LinkError::InvalidConfig(format!(
                "{} expects chain id {}, endpoint reports {}",
                profile.name, profile.chain_id, chain_id
            )));
        }

        tracing::info!(
            network = %profile.name,
            chain_id = chain_id,
            from = %from,
            contract = %contract_address,
            "Wallet loaded for signing transactions"
        );

        Ok(Self::new_with_provider(provider, contract_address, listener_config))
    }
}

#[async_trait::async_trait]
impl<P> LedgerClient for AlloyLedger<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    type Pending = PendingTransactionBuilder<Ethereum>;

    async fn submit(&self, call: &LineCall, options: &TxOptions) -> Result<Self::Pending, LinkError> {
        let tx = TransactionRequest::default()
            .to(self.contract_address)
            .input(call.abi_encode().into())
            .gas_limit(options.gas_limit);

        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(|e| LinkError::Submission(format!("{} failed: {}", call.name(), e)))?
            .with_timeout(options.confirmation_timeout);

        tracing::debug!(call = call.name(), tx_hash = %pending.tx_hash(), "Transaction sent");

        Ok(pending)
    }

    async fn confirm(&self, pending: Self::Pending) -> Result<TxReceipt, LinkError> {
        let tx_hash = *pending.tx_hash();

        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| LinkError::Confirmation(format!("{}: {}", tx_hash, e)))?;

        Ok(TxReceipt {
            tx_hash,
            block_number: receipt.block_number.unwrap_or(0),
            gas_used: receipt.gas_used,
            status: receipt.status(),
        })
    }

    async fn subscribe(
        &self,
        sink: mpsc::UnboundedSender<LineEvent>,
        cancel_token: CancellationToken,
    ) -> Result<(), LinkError> {
        let listener = ChainEventListener::new(self.listener_config.clone(), sink, cancel_token);

        tokio::spawn(async move {
            if let Err(e) = listener.start().await {
                tracing::error!("Event listener stopped: {}", e);
            }
        });

        Ok(())
    }

    async fn line_turn(&self, user_id: U256) -> Result<U256, LinkError> {
        let contract = IShowLine::new(self.contract_address, &self.provider);
        contract
            .line_turn(user_id)
            .call()
            .await
            .map_err(|e| LinkError::Query {
                call: "line_turn".to_string(),
                reason: e.to_string(),
            })
    }

    async fn first_in_line(&self) -> Result<U256, LinkError> {
        let contract = IShowLine::new(self.contract_address, &self.provider);
        contract
            .first_in_line()
            .call()
            .await
            .map_err(|e| LinkError::Query {
                call: "first_in_line".to_string(),
                reason: e.to_string(),
            })
    }
}
