// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![warn(missing_docs)]

//! # Relay Node Configuration Module 🕸️
//!
//! A module for configuring the relay node.
//!
//! ## Overview
//!
//! Configuration is read from every toml or json file of a config directory
//! and can be overridden by `MIXNET_` prefixed environment variables.
//! Possible configuration include:
//! * `chain`: RPC endpoint, node key and contract addresses.
//! * `indexer`: confirmation depth, resume block and retry policies.
//! * `tx-manager`: gas settings of the node's own transactions.
//! * `tickets`: what the node expects to be paid per relayed packet.
//!
//! See [config/example](../../config/example) for an example.

/// CLI configuration
#[cfg(feature = "cli")]
pub mod cli;
/// Utils for processing configuration
pub mod utils;

use ethers::types::{Address, U256};
use serde::{Deserialize, Deserializer, Serialize};

use mixnet_relay_types::private_key::PrivateKey;
use mixnet_relay_types::rpc_url::RpcUrl;

const fn default_polling_interval() -> u64 {
    4_000
}

const fn default_max_confirmations() -> u64 {
    8
}

const fn default_max_block_range() -> u64 {
    2_000
}

const fn default_block_fetch_retries() -> usize {
    3
}

const fn default_max_backfill_failures() -> u32 {
    5
}

const fn default_gas_limit() -> u64 {
    400_000
}

fn default_max_fee_per_gas() -> U256 {
    // 10 gwei
    U256::from(10_000_000_000u64)
}

fn default_max_priority_fee_per_gas() -> U256 {
    // 1 gwei
    U256::from(1_000_000_000u64)
}

const fn default_backfill_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_interval: 500,
        max_interval: 8_000,
        max_elapsed_time: 0,
    }
}

const fn default_confirmation_timeout() -> u64 {
    60_000
}

const fn default_keep_confirmed() -> usize {
    5
}

const fn default_min_win_prob() -> f64 {
    1.0
}

/// RelayNodeConfig is the configuration for the relay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayNodeConfig {
    /// Chain connection settings.
    pub chain: ChainConfig,
    /// Chain indexer settings.
    #[serde(default)]
    pub indexer: IndexerConfig,
    /// Own transaction settings.
    #[serde(default)]
    pub tx_manager: TxManagerConfig,
    /// Ticket acceptance settings.
    #[serde(default)]
    pub tickets: TicketsConfig,
}

/// Chain connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    /// Http(s) Endpoint for quick Req/Res
    #[serde(skip_serializing)]
    pub rpc_url: RpcUrl,
    /// Chain specific id.
    #[serde(rename(serialize = "chainId"))]
    pub chain_id: u64,
    /// The node's account key, used to sign its own transactions and to
    /// know which channels belong to it.
    ///
    /// Without it the node indexes read-only and never resends.
    #[serde(default, skip_serializing)]
    pub private_key: Option<PrivateKey>,
    /// Block polling interval in milliseconds.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
    /// Contracts the indexer watches.
    pub contracts: ContractsConfig,
}

/// Addresses of the contracts the indexer watches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ContractsConfig {
    /// Payment channels contract.
    pub channels: Address,
    /// Token contract the channels are funded with.
    pub token: Address,
    /// Peer announcements contract.
    pub announcements: Address,
    /// Network registry contract.
    pub network_registry: Address,
}

/// Chain indexer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IndexerConfig {
    /// Blocks that must follow a block before its events are applied.
    #[serde(default = "default_max_confirmations")]
    pub max_confirmations: u64,
    /// Deployment block of the contracts, indexing never starts before it.
    #[serde(default)]
    pub genesis_block: u64,
    /// Largest block range queried at once while backfilling.
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    /// Attempts to fetch the events of a live block before skipping it.
    #[serde(default = "default_block_fetch_retries")]
    pub block_fetch_retries: usize,
    /// Consecutive failed backfill queries tolerated before giving up.
    #[serde(default = "default_max_backfill_failures")]
    pub max_backfill_failures: u32,
    /// Backoff of indexer restarts after provider failures.
    #[serde(default)]
    pub provider_backoff: BackoffConfig,
    /// Backoff between failed backfill queries. Its elapsed time limit is
    /// ignored, `max-backfill-failures` decides when to give up.
    #[serde(default = "default_backfill_backoff")]
    pub backfill_backoff: BackoffConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_confirmations: default_max_confirmations(),
            genesis_block: 0,
            max_block_range: default_max_block_range(),
            block_fetch_retries: default_block_fetch_retries(),
            max_backfill_failures: default_max_backfill_failures(),
            provider_backoff: BackoffConfig::default(),
            backfill_backoff: default_backfill_backoff(),
        }
    }
}

/// Exponential backoff settings, all in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackoffConfig {
    /// First delay.
    pub initial_interval: u64,
    /// Largest delay between two attempts.
    pub max_interval: u64,
    /// Give up after this long, zero retries forever.
    pub max_elapsed_time: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: 1_000,
            max_interval: 30_000,
            max_elapsed_time: 300_000,
        }
    }
}

/// Settings of the node's own transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TxManagerConfig {
    /// Gas limit of every transaction.
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// Max fee per gas in wei.
    #[serde(
        default = "default_max_fee_per_gas",
        deserialize_with = "deserialize_wei"
    )]
    pub max_fee_per_gas: U256,
    /// Max priority fee per gas in wei.
    #[serde(
        default = "default_max_priority_fee_per_gas",
        deserialize_with = "deserialize_wei"
    )]
    pub max_priority_fee_per_gas: U256,
    /// How long to wait for a confirmation, in milliseconds.
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout: u64,
    /// Confirmed transactions kept for inspection.
    #[serde(default = "default_keep_confirmed")]
    pub keep_confirmed: usize,
}

impl Default for TxManagerConfig {
    fn default() -> Self {
        Self {
            gas_limit: default_gas_limit(),
            max_fee_per_gas: default_max_fee_per_gas(),
            max_priority_fee_per_gas: default_max_priority_fee_per_gas(),
            confirmation_timeout: default_confirmation_timeout(),
            keep_confirmed: default_keep_confirmed(),
        }
    }
}

/// Ticket acceptance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TicketsConfig {
    /// Amount a ticket must carry per relayed packet, in wei.
    #[serde(default, deserialize_with = "deserialize_wei")]
    pub ticket_price: U256,
    /// Lowest winning probability accepted.
    #[serde(default = "default_min_win_prob")]
    pub min_win_prob: f64,
}

impl Default for TicketsConfig {
    fn default() -> Self {
        Self {
            ticket_price: U256::zero(),
            min_win_prob: default_min_win_prob(),
        }
    }
}

/// Accepts wei amounts either as integers or as decimal strings, since toml
/// integers stop at `i64::MAX`.
fn deserialize_wei<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wei {
        Number(u64),
        String(String),
    }

    match Wei::deserialize(deserializer)? {
        Wei::Number(n) => Ok(U256::from(n)),
        Wei::String(s) if s.starts_with("0x") => {
            U256::from_str_radix(&s[2..], 16).map_err(serde::de::Error::custom)
        }
        Wei::String(s) => {
            U256::from_dec_str(&s).map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_config_files_are_correct() {
        // parses every directory right below `config/` at the workspace
        // root.
        let config_dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config");
        let config_dirs = glob::glob(config_dir.join("*").to_str().unwrap())
            .expect("Failed to read config directory")
            .filter_map(|p| p.ok())
            .filter(|p| p.is_dir())
            .collect::<Vec<_>>();
        assert!(
            !config_dirs.is_empty(),
            "No config directories found in the config directory"
        );
        for config_subdir in config_dirs {
            let _ = dotenv::from_path(config_subdir.join(".env.example"));
            if let Err(e) = utils::load(&config_subdir) {
                panic!(
                    "Failed to parse config file in {config_subdir:?}: {e}"
                );
            }
        }
    }

    #[test]
    fn wei_amounts_accept_numbers_and_strings() {
        let cfg: TicketsConfig = serde_json::from_value(serde_json::json!({
            "ticket-price": "100000000000000000000",
            "min-win-prob": 0.5,
        }))
        .unwrap();
        assert_eq!(
            cfg.ticket_price,
            U256::from_dec_str("100000000000000000000").unwrap()
        );
        let cfg: TxManagerConfig = serde_json::from_value(serde_json::json!({
            "max-fee-per-gas": 7,
            "max-priority-fee-per-gas": "0x10",
        }))
        .unwrap();
        assert_eq!(cfg.max_fee_per_gas, U256::from(7));
        assert_eq!(cfg.max_priority_fee_per_gas, U256::from(16));
        assert_eq!(cfg.gas_limit, 400_000);
        assert_eq!(cfg.keep_confirmed, 5);
    }
}
