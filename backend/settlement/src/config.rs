//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{Result, SettlementError};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Ledger connection parameters; `None` when any of the three is missing
    pub ledger: Option<LedgerConfig>,
    /// Upper bound for a single on-chain submission
    pub ledger_timeout: Duration,
    /// How long verify waits for a fresh submission before answering without a reference
    pub ledger_inline_wait: Duration,
    /// How often the reconciler sweeps unaggregated / unanchored donations
    pub reconcile_interval: Duration,
    /// Maximum donations handled per sweep
    pub reconcile_batch: u32,
    /// Insert demo causes at startup
    pub seed_demo_causes: bool,
}

/// Everything needed to sign and send `record` calls to the DonationRegistry contract.
#[derive(Clone)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub private_key: String,
    pub contract_address: String,
    /// Resolved from the node when absent
    pub chain_id: Option<u64>,
}

// Keep the signing key out of logs.
impl std::fmt::Debug for LedgerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerConfig")
            .field("rpc_url", &self.rpc_url)
            .field("private_key", &"<redacted>")
            .field("contract_address", &self.contract_address)
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Config {
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:./settlement.db".to_string()),
            api_port: parse_or(&var, "API_PORT", 5000)?,
            ledger: ledger_config(&var)?,
            ledger_timeout: Duration::from_secs(parse_or(&var, "LEDGER_TIMEOUT_SECS", 30)?),
            ledger_inline_wait: Duration::from_millis(parse_or(
                &var,
                "LEDGER_INLINE_WAIT_MS",
                1500,
            )?),
            reconcile_interval: Duration::from_secs(parse_or(
                &var,
                "RECONCILE_INTERVAL_SECS",
                60,
            )?),
            reconcile_batch: parse_or(&var, "RECONCILE_BATCH", 50)?,
            seed_demo_causes: parse_or(&var, "SEED_DEMO_CAUSES", false)?,
        })
    }
}

/// Both the current and the legacy variable names are accepted.
fn ledger_config<F>(var: &F) -> Result<Option<LedgerConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    let rpc_url = var("ETH_RPC_URL").or_else(|| var("ETH_RPC"));
    let private_key = var("ETH_PRIVATE_KEY");
    let contract_address = var("DONATION_REGISTRY_ADDRESS").or_else(|| var("CONTRACT_ADDRESS"));

    let chain_id = match var("ETH_CHAIN_ID") {
        Some(raw) => Some(
            raw.parse()
                .map_err(|_| SettlementError::Config("Invalid ETH_CHAIN_ID".to_string()))?,
        ),
        None => None,
    };

    Ok(match (rpc_url, private_key, contract_address) {
        (Some(rpc_url), Some(private_key), Some(contract_address)) => Some(LedgerConfig {
            rpc_url,
            private_key,
            contract_address,
            chain_id,
        }),
        _ => None,
    })
}

fn parse_or<F, T>(var: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SettlementError::Config(format!("Invalid {key}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database_url, "sqlite:./settlement.db");
        assert_eq!(config.api_port, 5000);
        assert!(config.ledger.is_none());
        assert_eq!(config.ledger_timeout, Duration::from_secs(30));
        assert_eq!(config.ledger_inline_wait, Duration::from_millis(1500));
        assert_eq!(config.reconcile_batch, 50);
        assert!(!config.seed_demo_causes);
    }

    #[test]
    fn ledger_requires_all_three_parameters() {
        let config = Config::from_lookup(lookup(&[
            ("ETH_RPC_URL", "http://127.0.0.1:8545"),
            ("ETH_PRIVATE_KEY", "0xabc"),
        ]))
        .unwrap();
        assert!(config.ledger.is_none());
    }

    #[test]
    fn legacy_ledger_names_are_accepted() {
        let config = Config::from_lookup(lookup(&[
            ("ETH_RPC", "http://127.0.0.1:8545"),
            ("ETH_PRIVATE_KEY", "0xabc"),
            ("CONTRACT_ADDRESS", "0x5FbDB2315678afecb367f032d93F642f64180aa3"),
            ("ETH_CHAIN_ID", "31337"),
        ]))
        .unwrap();
        let ledger = config.ledger.unwrap();
        assert_eq!(ledger.rpc_url, "http://127.0.0.1:8545");
        assert_eq!(ledger.chain_id, Some(31337));
    }

    #[test]
    fn blank_values_count_as_missing() {
        let config = Config::from_lookup(lookup(&[
            ("ETH_RPC_URL", "http://127.0.0.1:8545"),
            ("ETH_PRIVATE_KEY", "  "),
            ("DONATION_REGISTRY_ADDRESS", "0x5FbDB2315678afecb367f032d93F642f64180aa3"),
        ]))
        .unwrap();
        assert!(config.ledger.is_none());
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = Config::from_lookup(lookup(&[("API_PORT", "http")])).unwrap_err();
        assert!(matches!(err, SettlementError::Config(ref m) if m == "Invalid API_PORT"));
    }

    #[test]
    fn debug_output_redacts_private_key() {
        let ledger = LedgerConfig {
            rpc_url: "http://127.0.0.1:8545".into(),
            private_key: "0xdeadbeef".into(),
            contract_address: "0x00".into(),
            chain_id: None,
        };
        assert!(!format!("{ledger:?}").contains("deadbeef"));
    }
}
