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
//! # Relay Context Module 🕸️
//!
//! A module for managing the context of the relay node.
//!
//! The context is the explicit observability handle (metrics) and
//! configuration passed into the indexer and the transaction tracker.
use std::sync::Arc;
use std::time::Duration;

use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use tokio::sync::{broadcast, Mutex};

use mixnet_relay_config::RelayNodeConfig;
use mixnet_relay_utils::metric::Metrics;

/// Classification of chain provider failures.
pub mod provider_errors;

/// RelayContext contains the node's configuration, metrics and shutdown
/// signal.
#[derive(Clone)]
pub struct RelayContext {
    /// The configuration of the node.
    pub config: RelayNodeConfig,
    /// Broadcasts a shutdown signal to all background tasks.
    ///
    /// When a task is spawned, it is passed a broadcast receiver handle.
    /// When a graceful shutdown is initiated, a `()` value is sent via the
    /// broadcast::Sender. Each task receives it, reaches a safe terminal
    /// state, and completes.
    notify_shutdown: broadcast::Sender<()>,
    /// Represents the metrics for the node
    pub metrics: Arc<Mutex<Metrics>>,
}

impl RelayContext {
    /// Creates a new RelayContext.
    pub fn new(config: RelayNodeConfig) -> mixnet_relay_utils::Result<Self> {
        let (notify_shutdown, _) = broadcast::channel(2);
        let metrics = Arc::new(Mutex::new(Metrics::new()?));
        Ok(Self {
            config,
            notify_shutdown,
            metrics,
        })
    }

    /// Returns a broadcast receiver handle for the shutdown signal.
    pub fn shutdown_signal(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    /// Sends a shutdown signal to all subscribed tasks.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
    }

    /// Sets up and returns an http provider for the configured chain.
    pub fn evm_provider(&self) -> mixnet_relay_utils::Result<Provider<Http>> {
        let chain = &self.config.chain;
        let provider = Provider::<Http>::try_from(chain.rpc_url.as_str())?
            .interval(Duration::from_millis(chain.polling_interval));
        Ok(provider)
    }

    /// Sets up and returns the node's wallet, `None` in read-only mode.
    pub fn evm_wallet(
        &self,
    ) -> mixnet_relay_utils::Result<Option<LocalWallet>> {
        let chain = &self.config.chain;
        let Some(private_key) = chain.private_key.as_ref() else {
            return Ok(None);
        };
        let wallet = LocalWallet::from_bytes(private_key.as_bytes())?
            .with_chain_id(chain.chain_id);
        Ok(Some(wallet))
    }
}

/// Listens for the shutdown signal.
///
/// Shutdown is signalled using a `broadcast::Receiver`. Only a single value
/// is ever sent. Once a value has been sent via the broadcast channel, the
/// task should shutdown.
///
/// The `Shutdown` struct listens for the signal and tracks that the signal
/// has been received. Callers may query for whether the shutdown signal has
/// been received or not.
#[derive(Debug)]
pub struct Shutdown {
    /// `true` if the shutdown signal has been received
    shutdown: bool,

    /// The receive half of the channel used to listen for shutdown.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Create a new `Shutdown` backed by the given `broadcast::Receiver`.
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    /// Returns `true` if the shutdown signal has been received.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub async fn recv(&mut self) {
        // If the shutdown signal has already been received, then return
        // immediately.
        if self.shutdown {
            return;
        }

        // Cannot receive a "lag error" as only one value is ever sent.
        let _ = self.notify.recv().await;

        // Remember that the signal has been received.
        self.shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn config() -> RelayNodeConfig {
        serde_json::from_value(serde_json::json!({
            "chain": {
                "rpc-url": "http://127.0.0.1:8545",
                "chain-id": 31337,
                "private-key": "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
                "contracts": {
                    "channels": "0x0000000000000000000000000000000000000001",
                    "token": "0x0000000000000000000000000000000000000002",
                    "announcements": "0x0000000000000000000000000000000000000003",
                    "network-registry": "0x0000000000000000000000000000000000000004"
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn shutdown_reaches_every_subscriber() {
        let ctx = RelayContext::new(config()).unwrap();
        let mut first = ctx.shutdown_signal();
        let mut second = ctx.shutdown_signal();
        ctx.shutdown();
        first.recv().await;
        second.recv().await;
        assert!(first.is_shutdown());
        // a second recv returns right away.
        second.recv().await;
    }

    #[test]
    fn wallet_uses_configured_chain() {
        let ctx = RelayContext::new(config()).unwrap();
        let wallet = ctx.evm_wallet().unwrap().unwrap();
        assert_eq!(wallet.chain_id(), 31337);
        assert_eq!(
            wallet.address(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
                .parse::<mixnet_relay_types::Address>()
                .unwrap()
        );
        assert!(ctx.evm_provider().is_ok());
    }
}
