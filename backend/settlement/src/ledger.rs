//! On-chain anchoring of donation fingerprints.
//!
//! ## Availability
//!
//! The mirror is built once at startup. Without a complete [`LedgerConfig`]
//! (RPC endpoint, signing key, registry address) it is
//! [`LedgerMirror::Unavailable`] and every [`LedgerMirror::mirror`] call is a
//! no-op that returns `None`. That is a supported mode of operation, not an
//! error.
//!
//! ## Failure isolation
//!
//! [`LedgerMirror::mirror`] never returns an error. Submissions are bounded by
//! a timeout; failures and timeouts are logged at WARN and reported as `None`.
//! Duplicate submissions for the same donation produce at most a harmless
//! extra registry entry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::{parse_abi, Abi};
use ethers::contract::Contract;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::LedgerConfig;
use crate::hasher::Fingerprint;

/// Entity kind recorded for donations.
pub const DONATION_ENTITY: &str = "donation";

/// `DonationRegistry.record(string entity, string entityId, bytes32 hash)`.
const REGISTRY_ABI: &[&str] = &["function record(string entity, string entityId, bytes32 hash)"];

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger setup failed: {0}")]
    Setup(String),

    #[error("ledger submission failed: {0}")]
    Submit(String),

    #[error("transaction dropped before a receipt was produced")]
    Dropped,

    #[error("ledger call exceeded {0:?}")]
    Timeout(Duration),
}

/// An append-only ledger that can record `(kind, entity_id, hash)` triples.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Record the triple and return a confirmation reference (transaction hash).
    async fn record(
        &self,
        kind: &str,
        entity_id: &str,
        hash: &Fingerprint,
    ) -> Result<String, LedgerError>;
}

// ─────────────────────────────────────────────────────────
// EVM registry client
// ─────────────────────────────────────────────────────────

type RegistrySigner = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Sends `record` transactions to the DonationRegistry contract and waits
/// for their receipts.
pub struct EvmRegistry {
    contract: Contract<RegistrySigner>,
}

impl EvmRegistry {
    pub async fn connect(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| LedgerError::Setup(format!("invalid RPC url: {e}")))?;

        let chain_id = match config.chain_id {
            Some(id) => id,
            None => provider
                .get_chainid()
                .await
                .map_err(|e| LedgerError::Setup(format!("chain id lookup failed: {e}")))?
                .as_u64(),
        };

        let wallet = config
            .private_key
            .parse::<LocalWallet>()
            .map_err(|e| LedgerError::Setup(format!("invalid signing key: {e}")))?
            .with_chain_id(chain_id);

        let address: Address = config
            .contract_address
            .parse()
            .map_err(|e| LedgerError::Setup(format!("invalid registry address: {e}")))?;

        let abi: Abi = parse_abi(REGISTRY_ABI)
            .map_err(|e| LedgerError::Setup(format!("registry ABI: {e}")))?;

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        info!(?address, chain_id, "DonationRegistry client ready");
        Ok(Self {
            contract: Contract::new(address, abi, client),
        })
    }
}

#[async_trait]
impl LedgerClient for EvmRegistry {
    async fn record(
        &self,
        kind: &str,
        entity_id: &str,
        hash: &Fingerprint,
    ) -> Result<String, LedgerError> {
        let call = self
            .contract
            .method::<_, ()>(
                "record",
                (
                    kind.to_string(),
                    entity_id.to_string(),
                    H256::from(*hash.as_bytes()),
                ),
            )
            .map_err(|e| LedgerError::Submit(e.to_string()))?;

        let pending = call
            .send()
            .await
            .map_err(|e| LedgerError::Submit(e.to_string()))?;
        let receipt = pending
            .await
            .map_err(|e| LedgerError::Submit(e.to_string()))?
            .ok_or(LedgerError::Dropped)?;

        Ok(format!("{:#x}", receipt.transaction_hash))
    }
}

// ─────────────────────────────────────────────────────────
// Mirror
// ─────────────────────────────────────────────────────────

/// Best-effort ledger adapter handed to the settlement state machine.
#[derive(Clone)]
pub enum LedgerMirror {
    Unavailable,
    Available {
        client: Arc<dyn LedgerClient>,
        timeout: Duration,
    },
}

impl LedgerMirror {
    /// Build the mirror from configuration. Missing configuration, setup
    /// failures and a node that does not answer within `timeout` all yield
    /// [`LedgerMirror::Unavailable`].
    pub async fn from_config(config: Option<&LedgerConfig>, timeout: Duration) -> Self {
        let Some(config) = config else {
            warn!(
                "Ledger env vars missing (ETH_RPC_URL/ETH_RPC, ETH_PRIVATE_KEY, \
                 DONATION_REGISTRY_ADDRESS/CONTRACT_ADDRESS); on-chain anchoring disabled"
            );
            return Self::Unavailable;
        };

        // Chain id resolution talks to the node, so setup shares the call bound.
        let connected = match tokio::time::timeout(timeout, EvmRegistry::connect(config)).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout(timeout)),
        };

        match connected {
            Ok(registry) => Self::with_client(Arc::new(registry), timeout),
            Err(e) => {
                error!("Failed to initialise DonationRegistry client: {e}");
                Self::Unavailable
            }
        }
    }

    pub fn with_client(client: Arc<dyn LedgerClient>, timeout: Duration) -> Self {
        Self::Available { client, timeout }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }

    /// Anchor a donation fingerprint. Returns the ledger reference, or `None`
    /// when the ledger is unavailable, failed, or timed out.
    pub async fn mirror(&self, donation_id: &str, hash: &Fingerprint) -> Option<String> {
        let Self::Available { client, timeout } = self else {
            return None;
        };

        let outcome = match tokio::time::timeout(
            *timeout,
            client.record(DONATION_ENTITY, donation_id, hash),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout(*timeout)),
        };

        match outcome {
            Ok(reference) => {
                info!(donation_id, ledger_tx = %reference, "Donation anchored on-chain");
                Some(reference)
            }
            Err(e) => {
                warn!(donation_id, "On-chain record failed: {e}");
                None
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Test support
// ─────────────────────────────────────────────────────────
