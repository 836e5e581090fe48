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

//! Mixnet Relay Node Binary.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use ethers::types::U256;
use tokio::signal::unix;
use tokio::sync::broadcast;

use mixnet_chain_indexer::{
    EthersChainSource, Indexer, IndexerNotification, IndexerSettings,
};
use mixnet_relay_config::cli::{create_store, load_config, setup_logger, Opts};
use mixnet_relay_context::{RelayContext, Shutdown};
use mixnet_relay_utils::probe;
use mixnet_tx_manager::TransactionManager;

/// The main entry point for the relay node.
///
/// # Arguments
///
/// * `args` - The command line arguments.
#[paw::main]
#[tokio::main]
async fn main(args: Opts) -> anyhow::Result<()> {
    setup_logger(args.verbose)?;
    match dotenv::dotenv() {
        Ok(_) => {
            tracing::trace!("Loaded .env file");
        }
        Err(e) => {
            tracing::warn!("Failed to load .env file: {}", e);
        }
    }

    // The configuration is validated and configured from the given directory
    let config = load_config(args.config_dir.clone())?;
    let ctx = RelayContext::new(config)?;

    // persistent storage for the node
    let store = create_store(&args)?;

    let wallet = ctx.evm_wallet()?;
    let self_address = match wallet.as_ref() {
        Some(wallet) => ethers::signers::Signer::address(wallet),
        None => {
            tracing::warn!("No private key configured, indexing read-only");
            Default::default()
        }
    };
    let chain = &ctx.config.chain;
    let gas = &ctx.config.tx_manager;
    let source = EthersChainSource::builder()
        .provider(Arc::new(ctx.evm_provider()?))
        .wallet(wallet)
        .polling_interval(Duration::from_millis(chain.polling_interval))
        .gas_limit(U256::from(gas.gas_limit))
        .max_fee_per_gas(gas.max_fee_per_gas)
        .build();
    let settings = IndexerSettings::builder()
        .self_address(self_address)
        .contracts(chain.contracts)
        .indexer(ctx.config.indexer.clone())
        .tx_manager(gas.clone())
        .metrics(ctx.metrics.clone())
        .build();
    let indexer = Indexer::new(
        store.clone(),
        Arc::new(source),
        TransactionManager::new(gas.keep_confirmed),
        settings,
    );

    let notifications_handle = tokio::spawn(log_notifications(
        indexer.subscribe(),
        ctx.shutdown_signal(),
    ));
    indexer.start().await?;
    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::Lifecycle,
        started = true,
        data_stored = store.get_data_stored_size(),
    );

    // watch for signals
    let mut ctrlc_signal = unix::signal(unix::SignalKind::interrupt())?;
    let mut termination_signal = unix::signal(unix::SignalKind::terminate())?;
    let mut quit_signal = unix::signal(unix::SignalKind::quit())?;
    tokio::select! {
        _ = ctrlc_signal.recv() => {
            tracing::warn!("Interrupted (Ctrl+C) ...");
        },
        _ = termination_signal.recv() => {
            tracing::warn!("Got Terminate signal ...");
        },
        _ = quit_signal.recv() => {
            tracing::warn!("Quitting ...");
        },
    }

    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::Lifecycle,
        shutdown = true
    );
    tracing::warn!("Shutting down...");
    // lets the block in flight finish before anything else goes away.
    indexer.stop().await;
    ctx.shutdown();
    let _ = notifications_handle.await;
    tracing::info!("Clean Exit ..");
    Ok(())
}

/// Logs what the indexer reports until shutdown.
async fn log_notifications(
    mut notifications: broadcast::Receiver<IndexerNotification>,
    mut shutdown: Shutdown,
) {
    loop {
        let notification = tokio::select! {
            _ = shutdown.recv() => return,
            received = notifications.recv() => match received {
                Ok(notification) => notification,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed indexer notifications");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };
        match notification {
            IndexerNotification::StatusChanged(status) => {
                tracing::info!(?status, "Indexer status changed");
            }
            IndexerNotification::BlockProcessed(block) => {
                tracing::trace!(block, "Block processed");
            }
            IndexerNotification::ChannelClosed {
                channel,
                deleted_tickets,
            } => {
                tracing::info!(
                    channel = ?channel.get_id(),
                    deleted_tickets,
                    "Channel closed",
                );
            }
            IndexerNotification::ChannelWaitingForCommitment(channel) => {
                tracing::info!(
                    channel = ?channel.get_id(),
                    source = ?channel.source,
                    "Channel waits for our commitment",
                );
            }
            IndexerNotification::TicketRedeemed { channel_id, amount } => {
                tracing::info!(?channel_id, %amount, "Ticket redeemed");
            }
            IndexerNotification::NetworkRegistryStatusChanged(enabled) => {
                tracing::info!(enabled, "Network registry toggled");
            }
            other => tracing::debug!(notification = ?other),
        }
    }
}
