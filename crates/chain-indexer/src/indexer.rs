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

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use typed_builder::TypedBuilder;

use mixnet_relay_config::{
    BackoffConfig, ContractsConfig, IndexerConfig, TxManagerConfig,
};
use mixnet_relay_context::provider_errors::ProviderErrorKind;
use mixnet_relay_store::ChainStore;
use mixnet_relay_types::{Address, H256, U256};
use mixnet_relay_utils::metric::Metrics;
use mixnet_relay_utils::retry::{restart_backoff, ConstantWithMaxRetryCount};
use mixnet_relay_utils::{probe, Error, Result};
use mixnet_tx_manager::{
    SendOutcome, TransactionManager, TransactionPayload, TransactionState,
};

use crate::buffer::UnconfirmedEvents;
use crate::collector::PastEventCollector;
use crate::dispatcher::EventDispatcher;
use crate::events::EventDecoder;
use crate::sequencer::{BlockOrigin, BlockSequencer, SequencedBlock};
use crate::source::{ChainSource, ChainTransaction, LogFilter, RawLog};
use crate::{IndexerNotification, IndexerStatus};

/// Pause between two attempts to fetch the logs of a live block.
const BLOCK_FETCH_INTERVAL: Duration = Duration::from_millis(100);
/// Buffered notifications per subscriber before it starts lagging.
const NOTIFICATION_CAPACITY: usize = 1024;

/// The block the backfill starts from.
///
/// Steps back `max_confirmations` from the last saved block, so a reorg
/// that happened while the node was offline gets re-indexed, but never
/// before the contracts were deployed.
pub fn resume_block(
    saved_block: Option<u64>,
    max_confirmations: u64,
    genesis_block: u64,
) -> u64 {
    saved_block
        .map(|saved| saved.saturating_sub(max_confirmations))
        .unwrap_or(0)
        .max(genesis_block)
}

fn backoff_policy(config: &BackoffConfig) -> backoff::ExponentialBackoff {
    restart_backoff(
        Duration::from_millis(config.initial_interval),
        Duration::from_millis(config.max_interval),
        Duration::from_millis(config.max_elapsed_time),
    )
}

/// Everything an [`Indexer`] needs besides its store and chain source.
#[derive(Debug, Clone, TypedBuilder)]
pub struct IndexerSettings {
    /// The node's own chain address.
    self_address: Address,
    /// Contracts whose events are indexed.
    contracts: ContractsConfig,
    /// Pipeline settings.
    #[builder(default)]
    indexer: IndexerConfig,
    /// Gas settings of the node's own transactions.
    #[builder(default)]
    tx_manager: TxManagerConfig,
    /// Metrics sink.
    metrics: Arc<Mutex<Metrics>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainMode {
    /// Runs to completion, used while backfilling.
    Blocking,
    /// Yields to the runtime after every applied event.
    Yielding,
}

/// The running block processing task.
#[derive(Debug)]
struct Run {
    stop: oneshot::Sender<()>,
    processing: JoinHandle<()>,
}

#[derive(Debug)]
struct Inner<S, C> {
    store: S,
    source: Arc<C>,
    tx_manager: TransactionManager,
    decoder: EventDecoder,
    filter: LogFilter,
    dispatcher: EventDispatcher<S>,
    config: IndexerConfig,
    /// Worst case cost of one of our transactions.
    gas_cost: U256,
    max_priority_fee: U256,
    confirmation_timeout: Duration,
    self_address: Address,
    metrics: Arc<Mutex<Metrics>>,
    notifications: broadcast::Sender<IndexerNotification>,
    status: parking_lot::Mutex<IndexerStatus>,
    /// The processing guard. Whoever holds it owns the event buffer.
    pipeline: Mutex<UnconfirmedEvents>,
    run: parking_lot::Mutex<Option<Run>>,
    error_watch: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    /// Serializes start, stop and restarts.
    lifecycle: Mutex<()>,
}

/// Keeps the store in sync with the chain.
///
/// On [`Indexer::start`] the indexer backfills every event since the
/// resume point, then follows new blocks one at a time. Events are only
/// applied once they are `max-confirmations` blocks deep. Provider errors
/// restart the indexer with a capped exponential backoff.
#[derive(Debug)]
pub struct Indexer<S, C> {
    inner: Arc<Inner<S, C>>,
}

impl<S, C> Clone for Indexer<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, C> Indexer<S, C>
where
    S: ChainStore + 'static,
    C: ChainSource,
{
    /// Creates a stopped indexer.
    pub fn new(
        store: S,
        source: Arc<C>,
        tx_manager: TransactionManager,
        settings: IndexerSettings,
    ) -> Self {
        let IndexerSettings {
            self_address,
            contracts,
            indexer,
            tx_manager: gas,
            metrics,
        } = settings;
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let decoder = EventDecoder::new(contracts);
        let filter = decoder.log_filter();
        let dispatcher = EventDispatcher::builder()
            .store(store.clone())
            .self_address(self_address)
            .notifications(notifications.clone())
            .metrics(metrics.clone())
            .build();
        let gas_cost = U256::from(gas.gas_limit)
            .saturating_mul(gas.max_fee_per_gas);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                source,
                tx_manager,
                decoder,
                filter,
                dispatcher,
                config: indexer,
                gas_cost,
                max_priority_fee: gas.max_priority_fee_per_gas,
                confirmation_timeout: Duration::from_millis(
                    gas.confirmation_timeout,
                ),
                self_address,
                metrics,
                notifications,
                status: parking_lot::Mutex::new(IndexerStatus::Stopped),
                pipeline: Mutex::new(UnconfirmedEvents::new()),
                run: parking_lot::Mutex::new(None),
                error_watch: parking_lot::Mutex::new(None),
                shutdown,
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// A new receiver of everything the indexer reports.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexerNotification> {
        self.inner.notifications.subscribe()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> IndexerStatus {
        *self.inner.status.lock()
    }

    /// Tracker of the node's own transactions.
    pub fn tx_manager(&self) -> &TransactionManager {
        &self.inner.tx_manager
    }

    /// The store the indexer writes to.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Sends a transaction on behalf of the node with the configured
    /// priority fee. Confirmation is reported once the indexer sees it
    /// `max-confirmations` blocks deep.
    pub async fn send_transaction(
        &self,
        payload: TransactionPayload,
    ) -> Result<SendOutcome> {
        self.inner
            .tx_manager
            .send_transaction(
                self.inner.source.as_ref(),
                payload,
                self.inner.max_priority_fee,
            )
            .await
    }

    /// Waits until the transaction `hash` is confirmed, for at most the
    /// configured `confirmation-timeout`.
    ///
    /// # Errors
    ///
    /// [`Error::ConfirmationTimeout`] if it is not confirmed in time.
    pub async fn wait_for_confirmation(&self, hash: H256) -> Result<()> {
        self.inner
            .tx_manager
            .wait_for_confirmation(hash, self.inner.confirmation_timeout)
            .await
    }

    /// Starts indexing. Returns once the backfill is done and live blocks
    /// are being processed. Does nothing if already started.
    ///
    /// # Errors
    ///
    /// Fails if the chain cannot be reached or the backfill was aborted.
    /// The indexer is `Stopped` afterwards.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.status() == IndexerStatus::Started {
            tracing::debug!("Indexer already started");
            return Ok(());
        }
        self.inner.shutdown.send_replace(false);
        self.set_status(IndexerStatus::Starting);
        match self.bootstrap().await {
            Ok(()) => {
                self.set_status(IndexerStatus::Started);
                tracing::info!("Indexer started");
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to start the indexer: {e}");
                self.stop_processing().await;
                self.set_status(IndexerStatus::Stopped);
                Err(e)
            }
        }
    }

    /// Stops indexing. Waits for the block being processed, if any.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        // A restart in progress can still replace the watcher.
        loop {
            let watcher = self.inner.error_watch.lock().take();
            match watcher {
                Some(watcher) => {
                    let _ = watcher.await;
                }
                None => break,
            }
        }
        let _lifecycle = self.inner.lifecycle.lock().await;
        if let Some(watcher) = self.inner.error_watch.lock().take() {
            watcher.abort();
        }
        self.stop_processing().await;
        let _guard = self.inner.pipeline.lock().await;
        self.set_status(IndexerStatus::Stopped);
        tracing::info!("Indexer stopped");
    }

    /// Subscribes, backfills and spawns the block processing task.
    async fn bootstrap(&self) -> Result<()> {
        let inner = &self.inner;
        let config = &inner.config;
        let live = inner.source.subscribe_blocks().await?;
        let provider_errors = inner.source.subscribe_provider_errors();
        let head = inner.source.get_latest_block_number().await?;
        let saved = inner.store.get_latest_block_number()?;
        let from_block =
            resume_block(saved, config.max_confirmations, config.genesis_block);
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::Sync,
            starting = true,
            from_block,
            head,
            saved = ?saved,
        );

        let (backlog_tx, backlog_rx) = mpsc::unbounded_channel();
        {
            let mut events = inner.pipeline.lock().await;
            events.clear();
            let mut collector = PastEventCollector::new(
                from_block,
                head,
                config.max_block_range,
                config.max_backfill_failures,
                inner.metrics.clone(),
            )
            .with_backoff(backoff_policy(&config.backfill_backoff));
            while let Some(batch) = collector
                .next_batch(inner.source.as_ref(), &inner.filter)
                .await?
            {
                events.admit(inner.decoder.decode_logs(batch.logs));
                self.drain(&mut events, head, DrainMode::Blocking).await?;
                let _ = backlog_tx.send(batch.to_block);
            }
        }
        drop(backlog_tx);

        let (stop, stop_rx) = oneshot::channel();
        let sequencer = BlockSequencer::new(backlog_rx, live);
        let processing =
            tokio::spawn(self.clone().process_blocks(sequencer, stop_rx));
        *inner.run.lock() = Some(Run { stop, processing });

        let watcher =
            tokio::spawn(self.clone().watch_provider_errors(provider_errors));
        // The previous watcher is the one running this restart, if any.
        drop(inner.error_watch.lock().replace(watcher));
        Ok(())
    }

    /// Stops the block processing task, letting the current block finish.
    async fn stop_processing(&self) {
        let run = self.inner.run.lock().take();
        if let Some(Run { stop, processing }) = run {
            let _ = stop.send(());
            if let Err(e) = processing.await {
                tracing::error!("Block processing task failed: {e}");
            }
        }
    }

    async fn process_blocks(
        self,
        mut sequencer: BlockSequencer,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            let block = tokio::select! {
                biased;
                _ = &mut stop => break,
                block = sequencer.next() => block,
            };
            match block {
                Some(block) => self.process_block(block).await,
                None => {
                    tracing::debug!("Block subscription ended");
                    break;
                }
            }
        }
        sequencer.close();
    }

    /// Runs the per-block pipeline for one sequenced block.
    #[tracing::instrument(skip_all, fields(block = block.number))]
    async fn process_block(&self, block: SequencedBlock) {
        let inner = &self.inner;
        let mut events = inner.pipeline.lock().await;
        inner.metrics.lock().await.current_block.set(block.number as f64);
        let Some(confirmed_block) =
            block.number.checked_sub(inner.config.max_confirmations)
        else {
            tracing::trace!("Not enough blocks for a confirmed one yet");
            return;
        };

        self.track_own_transactions(confirmed_block, block.number)
            .await;

        if block.origin == BlockOrigin::Live {
            match self.fetch_block_logs(confirmed_block).await {
                Ok(logs) => {
                    let admitted =
                        events.admit(inner.decoder.decode_logs(logs));
                    tracing::trace!(confirmed_block, admitted);
                }
                Err(e) => tracing::warn!(
                    confirmed_block,
                    "Skipping the events of a block: {e}",
                ),
            }
        }

        if let Err(e) = self
            .drain(&mut events, block.number, DrainMode::Yielding)
            .await
        {
            tracing::warn!(
                pending = events.len(),
                "Failed to apply events: {e}",
            );
        }

        self.resend_if_affordable().await;

        if let Err(e) = inner.store.update_latest_block_number(block.number) {
            tracing::warn!("Failed to save the latest block number: {e}");
        }
        inner.metrics.lock().await.unconfirmed_blocks_processed.inc();
        drop(events);
        self.notify(IndexerNotification::BlockProcessed(block.number));
    }

    /// Applies every buffered event that is deep enough at
    /// `current_block`, oldest first.
    async fn drain(
        &self,
        events: &mut UnconfirmedEvents,
        current_block: u64,
        mode: DrainMode,
    ) -> Result<usize> {
        let max_confirmations = self.inner.config.max_confirmations;
        let mut applied = 0;
        while let Some(event) =
            events.front_confirmed(current_block, max_confirmations).cloned()
        {
            if self.inner.dispatcher.apply(event).await? {
                applied += 1;
            }
            events.pop_front();
            if mode == DrainMode::Yielding {
                tokio::task::yield_now().await;
            }
        }
        Ok(applied)
    }

    async fn fetch_block_logs(&self, block_number: u64) -> Result<Vec<RawLog>> {
        let policy = ConstantWithMaxRetryCount::new(
            BLOCK_FETCH_INTERVAL,
            self.inner.config.block_fetch_retries,
        );
        let source = self.inner.source.as_ref();
        let filter = &self.inner.filter;
        backoff::future::retry_notify(
            policy,
            || async move {
                source
                    .query_logs(filter, block_number, block_number)
                    .await
                    .map_err(backoff::Error::transient)
            },
            |e: Error, after: Duration| {
                tracing::event!(
                    target: probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %probe::Kind::Retry,
                    block_number,
                    error = %e,
                    retry_after = ?after,
                );
            },
        )
        .await
    }

    /// Settles our transactions in the confirmed block and marks the ones
    /// in the head block as mined.
    async fn track_own_transactions(&self, confirmed_block: u64, head: u64) {
        let tracker = &self.inner.tx_manager;
        let pruned = tracker.prune();
        if pruned > 0 {
            tracing::trace!(pruned, "Pruned confirmed transactions");
        }
        if tracker.next_tracked_nonce().is_none() {
            return;
        }
        match self.own_transactions(confirmed_block).await {
            Ok(txs) => {
                for tx in txs {
                    if !tracker.move_to_confirmed(&tx.hash) {
                        continue;
                    }
                    let replaced = tracker.drop_replaced(tx.nonce, &tx.hash);
                    tracing::event!(
                        target: probe::TARGET,
                        tracing::Level::DEBUG,
                        kind = %probe::Kind::TxManager,
                        confirmed = true,
                        tx_hash = ?tx.hash,
                        nonce = tx.nonce,
                        replaced,
                    );
                }
            }
            Err(e) => tracing::warn!(
                confirmed_block,
                "Failed to settle own transactions: {e}",
            ),
        }
        match self.own_transactions(head).await {
            Ok(txs) => {
                for tx in txs {
                    tracker.move_to_mined(&tx.hash);
                }
            }
            Err(e) => {
                tracing::debug!(head, "Failed to read the head block: {e}")
            }
        }
    }

    async fn own_transactions(
        &self,
        block_number: u64,
    ) -> Result<Vec<ChainTransaction>> {
        let txs = self
            .inner
            .source
            .get_transactions_in_block(block_number)
            .await?;
        Ok(txs
            .into_iter()
            .filter(|tx| tx.from == self.inner.self_address)
            .collect())
    }

    /// Resends queued transactions once the balance covers all of them.
    async fn resend_if_affordable(&self) {
        let inner = &self.inner;
        let queued = inner.tx_manager.get_all(TransactionState::Queuing).len();
        if queued == 0 {
            return;
        }
        let balance =
            match inner.source.get_native_balance(inner.self_address).await {
                Ok(balance) => balance,
                Err(e) => {
                    tracing::warn!("Failed to read the native balance: {e}");
                    return;
                }
            };
        let needed = inner.gas_cost.saturating_mul(U256::from(queued));
        if balance < needed {
            tracing::debug!(
                %balance,
                %needed,
                queued,
                "Balance too low to resend queued transactions",
            );
            return;
        }
        match inner.tx_manager.resend_queuing(inner.source.as_ref()).await {
            Ok(resent) => {
                inner
                    .metrics
                    .lock()
                    .await
                    .transactions_resent
                    .inc_by(resent as f64);
            }
            Err(e) => tracing::warn!("Failed to resend transactions: {e}"),
        }
    }

    /// Waits for the first provider error, then restarts the indexer.
    async fn watch_provider_errors(
        self,
        mut errors: broadcast::Receiver<String>,
    ) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let message = loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => return,
                received = errors.recv() => match received {
                    Ok(message) => break message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Provider errors lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        };
        self.recover(message).await;
    }

    /// Resends queued transactions and restarts the indexer with backoff.
    /// Ends `Started`, or `Stopped` once the backoff gives up.
    fn recover(&self, message: String) -> BoxFuture<'_, ()> {
        async move {
            let kind = ProviderErrorKind::classify(&message);
            tracing::warn!(%kind, "Provider error: {message}");
            match self
                .inner
                .metrics
                .lock()
                .await
                .provider_errors_entry(&kind.to_string())
            {
                Ok(counter) => counter.inc(),
                Err(e) => tracing::warn!("Failed to count provider error: {e}"),
            }

            let _lifecycle = self.inner.lifecycle.lock().await;
            let stopping = *self.inner.shutdown.borrow();
            if stopping || self.status() != IndexerStatus::Started {
                return;
            }
            self.set_status(IndexerStatus::Restarting);
            if let Err(e) = self
                .inner
                .tx_manager
                .resend_queuing(self.inner.source.as_ref())
                .await
            {
                tracing::warn!("Failed to resend transactions: {e}");
            }
            self.stop_processing().await;

            let policy = backoff_policy(&self.inner.config.provider_backoff);
            let restart = backoff::future::retry_notify(
                policy,
                || async move {
                    self.set_status(IndexerStatus::Starting);
                    self.bootstrap().await.map_err(|e| {
                        self.set_status(IndexerStatus::Restarting);
                        backoff::Error::transient(e)
                    })
                },
                |e: Error, after: Duration| {
                    tracing::warn!(
                        retry_after = ?after,
                        "Failed to restart the indexer: {e}",
                    );
                },
            );
            let mut shutdown = self.inner.shutdown.subscribe();
            let restarted = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => {
                    Err(Error::Generic("shutdown while restarting"))
                }
                restarted = restart => restarted,
            };
            match restarted {
                Ok(()) => {
                    self.set_status(IndexerStatus::Started);
                    tracing::info!("Indexer restarted");
                }
                Err(e) => {
                    tracing::error!("Giving up restarting the indexer: {e}");
                    self.stop_processing().await;
                    self.set_status(IndexerStatus::Stopped);
                }
            }
        }
        .boxed()
    }

    fn set_status(&self, status: IndexerStatus) {
        let previous =
            std::mem::replace(&mut *self.inner.status.lock(), status);
        if previous == status {
            return;
        }
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::Lifecycle,
            ?previous,
            ?status,
        );
        self.notify(IndexerNotification::StatusChanged(status));
    }

    fn notify(&self, notification: IndexerNotification) {
        // Nobody listening is fine.
        let _ = self.inner.notifications.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumes_below_the_saved_block() {
        assert_eq!(resume_block(Some(100), 8, 50), 92);
        assert_eq!(resume_block(Some(100), 8, 95), 95);
        assert_eq!(resume_block(Some(3), 8, 0), 0);
        assert_eq!(resume_block(None, 8, 42), 42);
    }
}
