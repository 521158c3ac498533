//! Network profiles and connector configuration

use crate::chain::{EventListenerConfig, LinkError};
use crate::ledger::TxOptions;
use crate::registry::RegistrationPolicy;
use alloy_primitives::{Address, address};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Known deployments. The table is fixed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkName {
    #[default]
    LocalHardhat,
    ThetaPrivatenet,
    ThetaTestnet,
    ThetaMainnet,
}

/// Endpoint, contract and chain id of one deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkProfile {
    pub name: NetworkName,
    pub rpc_url: &'static str,
    /// None until the contract is deployed on that network
    pub contract_address: Option<Address>,
    pub chain_id: u64,
}

impl NetworkName {
    pub const ALL: [NetworkName; 4] = [
        NetworkName::LocalHardhat,
        NetworkName::ThetaPrivatenet,
        NetworkName::ThetaTestnet,
        NetworkName::ThetaMainnet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkName::LocalHardhat => "local_hardhat",
            NetworkName::ThetaPrivatenet => "theta_privatenet",
            NetworkName::ThetaTestnet => "theta_testnet",
            NetworkName::ThetaMainnet => "theta_mainnet",
        }
    }

    pub fn profile(&self) -> NetworkProfile {
        match self {
            NetworkName::LocalHardhat => NetworkProfile {
                name: *self,
                rpc_url: "http://127.0.0.1:8545/",
                contract_address: Some(address!("0x5FbDB2315678afecb367f032d93F642f64180aa3")),
                chain_id: 31337,
            },
            NetworkName::ThetaPrivatenet => NetworkProfile {
                name: *self,
                rpc_url: "http://127.0.0.1:18888/rpc",
                contract_address: Some(address!("0x52d2878492EF30d625fc54EC52c4dB7f010d471e")),
                chain_id: 366,
            },
            NetworkName::ThetaTestnet => NetworkProfile {
                name: *self,
                rpc_url: "https://eth-rpc-api-testnet.thetatoken.org/rpc",
                contract_address: None,
                chain_id: 365,
            },
            NetworkName::ThetaMainnet => NetworkProfile {
                name: *self,
                rpc_url: "https://eth-rpc-api.thetatoken.org/rpc",
                contract_address: None,
                chain_id: 361,
            },
        }
    }
}

impl fmt::Display for NetworkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkName {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NetworkName::ALL
            .into_iter()
            .find(|n| n.as_str() == s)
            .ok_or_else(|| LinkError::InvalidConfig(format!("Unknown network: {}", s)))
    }
}

impl NetworkProfile {
    /// Contract address, or an error for networks without a deployment
    pub fn require_contract(&self) -> Result<Address, LinkError> {
        self.contract_address.ok_or_else(|| {
            LinkError::InvalidConfig(format!("No contract deployed on {}", self.name))
        })
    }
}

/// Event listener knobs that can come from the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    pub ws_url: Option<String>,
    pub polling_interval_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub ws_failure_threshold: u32,
    pub pong_timeout_secs: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        let defaults = EventListenerConfig::default();
        Self {
            ws_url: defaults.ws_url,
            polling_interval_ms: defaults.polling_interval_ms,
            reconnect_max_delay_ms: defaults.reconnect_max_delay_ms,
            ws_failure_threshold: defaults.ws_failure_threshold,
            pong_timeout_secs: defaults.pong_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub network: NetworkName,
    /// Gas ceiling for every contract-mutating call
    pub gas_limit: u64,
    pub confirmation_timeout_secs: u64,
    /// Bound on the wait for a correlated event; None waits forever
    pub event_timeout_secs: Option<u64>,
    pub registration_policy: RegistrationPolicy,
    pub listener: ListenerSettings,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            network: NetworkName::default(),
            gas_limit: 500_000,
            confirmation_timeout_secs: 120,
            event_timeout_secs: None,
            registration_policy: RegistrationPolicy::default(),
            listener: ListenerSettings::default(),
        }
    }
}

impl LinkConfig {
    pub async fn load_from_file(path: &Path) -> Result<Self, LinkError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| LinkError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| LinkError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    /// Apply `NETWORK`, `TURNSTILE_GAS_LIMIT` and `TURNSTILE_EVENT_TIMEOUT_SECS`
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup("NETWORK") {
            match value.parse() {
                Ok(network) => self.network = network,
                Err(e) => tracing::warn!(value = %value, "Ignoring NETWORK override: {}", e),
            }
        }

        if let Some(value) = lookup("TURNSTILE_GAS_LIMIT") {
            match value.parse() {
                Ok(gas_limit) => self.gas_limit = gas_limit,
                Err(_) => tracing::warn!(value = %value, "Ignoring invalid TURNSTILE_GAS_LIMIT"),
            }
        }

        if let Some(value) = lookup("TURNSTILE_EVENT_TIMEOUT_SECS") {
            match value.parse::<u64>() {
                Ok(0) => self.event_timeout_secs = None,
                Ok(secs) => self.event_timeout_secs = Some(secs),
                Err(_) => {
                    tracing::warn!(value = %value, "Ignoring invalid TURNSTILE_EVENT_TIMEOUT_SECS")
                }
            }
        }

        self
    }

    pub fn profile(&self) -> NetworkProfile {
        self.network.profile()
    }

    pub fn tx_options(&self) -> TxOptions {
        TxOptions {
            gas_limit: self.gas_limit,
            confirmation_timeout: Some(Duration::from_secs(self.confirmation_timeout_secs)),
        }
    }

    pub fn event_timeout(&self) -> Option<Duration> {
        self.event_timeout_secs.map(Duration::from_secs)
    }

    /// Listener configuration for the selected network
    pub fn listener_config(&self) -> Result<EventListenerConfig, LinkError> {
        let profile = self.profile();
        Ok(EventListenerConfig {
            rpc_url: profile.rpc_url.to_string(),
            ws_url: self.listener.ws_url.clone(),
            contract_address: profile.require_contract()?,
            polling_interval_ms: self.listener.polling_interval_ms,
            reconnect_max_delay_ms: self.listener.reconnect_max_delay_ms,
            ws_failure_threshold: self.listener.ws_failure_threshold,
            pong_timeout_secs: self.listener.pong_timeout_secs,
        })
    }
}
