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

use ethers::types::Bytes;
use tokio::sync::{broadcast, Mutex};

use mixnet_chain_indexer::test_utils::{self, FlakyStore, MockChainSource};
use mixnet_chain_indexer::{
    Indexer, IndexerNotification, IndexerSettings, IndexerStatus,
};
use mixnet_relay_config::{BackoffConfig, IndexerConfig, TxManagerConfig};
use mixnet_relay_store::{
    BalanceStore, BlockStore, ChainStore, ChannelStore, InMemoryStore,
};
use mixnet_relay_types::{Address, ChannelStatus, Snapshot, H256, U256};
use mixnet_relay_utils::metric::Metrics;
use mixnet_relay_utils::Error;
use mixnet_tx_manager::{
    SendOutcome, TransactionManager, TransactionPayload, TransactionState,
};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Harness<S = InMemoryStore> {
    indexer: Indexer<S, MockChainSource>,
    store: S,
    chain: MockChainSource,
    metrics: Arc<Mutex<Metrics>>,
    notifications: broadcast::Receiver<IndexerNotification>,
}

fn me() -> Address {
    Address::repeat_byte(0xaa)
}

fn peer() -> Address {
    Address::repeat_byte(0xbb)
}

fn config() -> IndexerConfig {
    IndexerConfig {
        max_confirmations: 2,
        max_block_range: 5,
        backfill_backoff: BackoffConfig {
            initial_interval: 1,
            max_interval: 2,
            max_elapsed_time: 0,
        },
        ..Default::default()
    }
}

fn harness_with<S: ChainStore>(store: S, config: IndexerConfig) -> Harness<S> {
    harness_with_tx_manager(store, config, TxManagerConfig::default())
}

fn harness_with_tx_manager<S: ChainStore>(
    store: S,
    config: IndexerConfig,
    tx_manager: TxManagerConfig,
) -> Harness<S> {
    let chain = MockChainSource::new(me());
    let metrics = Arc::new(Mutex::new(Metrics::new().unwrap()));
    let settings = IndexerSettings::builder()
        .self_address(me())
        .contracts(test_utils::contracts())
        .indexer(config)
        .tx_manager(tx_manager)
        .metrics(metrics.clone())
        .build();
    let indexer = Indexer::new(
        store.clone(),
        Arc::new(chain.clone()),
        TransactionManager::new(5),
        settings,
    );
    let notifications = indexer.subscribe();
    Harness {
        indexer,
        store,
        chain,
        metrics,
        notifications,
    }
}

fn harness() -> Harness {
    harness_with(InMemoryStore::default(), config())
}

impl<S: ChainStore> Harness<S> {
    /// Waits until `expected` is broadcast, skipping everything before it.
    async fn wait_for(&mut self, expected: IndexerNotification) {
        let notifications = &mut self.notifications;
        let found = tokio::time::timeout(TIMEOUT, async {
            loop {
                match notifications.recv().await {
                    Ok(n) if n == expected => return,
                    Ok(_) => continue,
                    Err(e) => panic!("notifications failed: {e}"),
                }
            }
        })
        .await;
        assert!(found.is_ok(), "timed out waiting for {expected:?}");
    }

    /// Produces every block up to `number` and waits for the last one.
    async fn advance_to(&mut self, number: u64) {
        let head = self.chain_head();
        for block in head + 1..=number {
            self.chain.produce_block(block);
        }
        self.wait_for(IndexerNotification::BlockProcessed(number))
            .await;
    }

    fn chain_head(&self) -> u64 {
        self.store.get_latest_block_number().unwrap().unwrap_or(0)
    }

    /// Produces `number` and waits for it, whatever the store says.
    async fn produce(&mut self, number: u64) {
        self.chain.produce_block(number);
        self.wait_for(IndexerNotification::BlockProcessed(number))
            .await;
    }
}

fn payload(tag: u8) -> TransactionPayload {
    TransactionPayload {
        to: peer(),
        data: Bytes::from(vec![tag; 2]),
        value: U256::zero(),
    }
}

#[tokio::test]
#[tracing_test::traced_test]
async fn events_are_applied_in_snapshot_order_once_confirmed() {
    let mut h = harness();
    let open = test_utils::channel(me(), peer(), ChannelStatus::Open);
    let closed = test_utils::channel(me(), peer(), ChannelStatus::Closed);
    // Delivered out of order within the same batch.
    h.chain.add_log(test_utils::channel_updated_log(
        &closed,
        Snapshot::new(5, 1, 0),
    ));
    h.chain.add_log(test_utils::channel_updated_log(
        &open,
        Snapshot::new(5, 0, 0),
    ));
    let at = Snapshot::new(19, 0, 0);
    h.chain.add_log(test_utils::transfer_log(peer(), me(), 7, at));
    h.chain.set_head(20);

    h.indexer.start().await.unwrap();
    assert_eq!(h.indexer.status(), IndexerStatus::Started);
    h.wait_for(IndexerNotification::ChannelUpdated(open.clone()))
        .await;
    h.wait_for(IndexerNotification::ChannelClosed {
        channel: closed.clone(),
        deleted_tickets: 0,
    })
    .await;
    let stored = h.store.get_channel(&closed.get_id()).unwrap().unwrap();
    assert_eq!(stored.status, ChannelStatus::Closed);

    // Block 19 is only one block deep at head 20.
    h.wait_for(IndexerNotification::BlockProcessed(20)).await;
    assert_eq!(h.store.get_hopr_balance().unwrap(), U256::zero());

    h.advance_to(21).await;
    assert_eq!(h.store.get_hopr_balance().unwrap(), U256::from(7));
    assert_eq!(
        h.store.get_latest_confirmed_snapshot().unwrap(),
        Some(Snapshot::new(19, 0, 0))
    );
    assert_eq!(h.store.get_latest_block_number().unwrap(), Some(21));

    h.indexer.stop().await;
}

#[tokio::test]
async fn live_blocks_pick_up_new_events() {
    let mut h = harness();
    h.chain.set_head(10);
    h.indexer.start().await.unwrap();
    h.wait_for(IndexerNotification::BlockProcessed(10)).await;

    let at = Snapshot::new(11, 0, 0);
    h.chain.add_log(test_utils::transfer_log(me(), peer(), 3, at));
    h.store.add_hopr_balance(U256::from(10)).unwrap();
    h.advance_to(12).await;
    assert_eq!(h.store.get_hopr_balance().unwrap(), U256::from(10));
    h.advance_to(13).await;
    assert_eq!(h.store.get_hopr_balance().unwrap(), U256::from(7));

    let metrics = h.metrics.lock().await;
    assert_eq!(metrics.current_block.get(), 13.0);
    assert!(metrics.unconfirmed_blocks_processed.get() >= 3.0);
}

#[tokio::test]
async fn replayed_events_are_not_applied_twice() {
    let store = InMemoryStore::default();
    let transfer =
        test_utils::transfer_log(peer(), me(), 10, Snapshot::new(9, 0, 0));

    let mut h = harness_with(store.clone(), config());
    h.chain.add_log(transfer.clone());
    h.chain.set_head(11);
    h.indexer.start().await.unwrap();
    h.wait_for(IndexerNotification::BlockProcessed(11)).await;
    h.indexer.stop().await;
    assert_eq!(store.get_hopr_balance().unwrap(), U256::from(10));

    // A fresh node on the same store fetches block 9 again.
    let mut h = harness_with(store.clone(), config());
    h.chain.add_log(transfer);
    h.chain.set_head(13);
    h.indexer.start().await.unwrap();
    h.wait_for(IndexerNotification::BlockProcessed(13)).await;
    assert_eq!(h.chain.queries()[0].0, 9);
    assert_eq!(store.get_hopr_balance().unwrap(), U256::from(10));
    h.indexer.stop().await;
}

#[tokio::test]
async fn startup_resumes_below_the_saved_block() {
    for (genesis_block, expected) in [(50, 92), (95, 95)] {
        let store = InMemoryStore::default();
        store.update_latest_block_number(100).unwrap();
        let config = IndexerConfig {
            max_confirmations: 8,
            genesis_block,
            ..Default::default()
        };
        let h = harness_with(store, config);
        h.chain.set_head(120);
        h.indexer.start().await.unwrap();
        assert_eq!(h.chain.queries()[0].0, expected);
        h.indexer.stop().await;
    }
}

#[tokio::test]
#[tracing_test::traced_test]
async fn repeated_backfill_failures_abort_startup() {
    let h = harness();
    h.chain.set_head(100);
    h.chain.fail_next_queries(6);

    let err = h.indexer.start().await.unwrap_err();
    assert!(matches!(err, Error::BackfillAborted { failures: 6, .. }));
    assert_eq!(h.indexer.status(), IndexerStatus::Stopped);
    // A full chunk, then a single block per query.
    assert_eq!(h.chain.queries()[..2], [(0, 4), (0, 0)]);
    assert_eq!(h.metrics.lock().await.backfill_failures.get(), 6.0);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn provider_errors_restart_the_indexer() {
    let mut h = harness();
    h.chain.set_head(10);
    h.indexer.start().await.unwrap();
    h.wait_for(IndexerNotification::BlockProcessed(10)).await;

    h.chain.emit_provider_error("request timed out");
    h.wait_for(IndexerNotification::StatusChanged(
        IndexerStatus::Restarting,
    ))
    .await;
    h.wait_for(IndexerNotification::StatusChanged(IndexerStatus::Started))
        .await;
    assert_eq!(h.indexer.status(), IndexerStatus::Started);
    {
        let mut metrics = h.metrics.lock().await;
        let timeouts = metrics.provider_errors_entry("timeout").unwrap();
        assert_eq!(timeouts.get(), 1.0);
    }

    // Still following the chain after the restart.
    h.advance_to(11).await;
    h.indexer.stop().await;
}

#[tokio::test]
async fn own_transactions_are_resent_and_settled() {
    let mut h = harness();
    h.chain.set_head(10);
    h.indexer.start().await.unwrap();
    h.wait_for(IndexerNotification::BlockProcessed(10)).await;

    h.chain.set_offline(true);
    let outcome = h.indexer.send_transaction(payload(0xde)).await.unwrap();
    let SendOutcome::Queued(hash) = outcome else {
        panic!("expected a queued transaction, got {outcome:?}");
    };
    let tracker = h.indexer.tx_manager().clone();

    // Back online but broke: nothing is resent.
    h.chain.set_offline(false);
    h.advance_to(11).await;
    assert!(h.chain.broadcasted().is_empty());

    h.chain.set_balance(U256::MAX);
    h.advance_to(12).await;
    assert_eq!(h.chain.broadcasted().len(), 1);
    assert_eq!(tracker.state_of(&hash), Some(TransactionState::Pending));
    assert_eq!(h.metrics.lock().await.transactions_resent.get(), 1.0);

    let waiting = {
        let indexer = h.indexer.clone();
        tokio::spawn(async move { indexer.wait_for_confirmation(hash).await })
    };
    h.chain.include_transaction(13, hash);
    h.advance_to(13).await;
    assert_eq!(tracker.state_of(&hash), Some(TransactionState::Mined));
    h.advance_to(15).await;
    assert_eq!(tracker.state_of(&hash), Some(TransactionState::Confirmed));
    waiting.await.unwrap().unwrap();

    h.indexer.stop().await;
}

#[tokio::test]
async fn stop_unsubscribes_and_start_is_idempotent() {
    let mut h = harness();
    h.chain.set_head(3);
    h.indexer.start().await.unwrap();
    h.indexer.start().await.unwrap();
    h.wait_for(IndexerNotification::BlockProcessed(3)).await;
    assert_eq!(h.chain.block_subscribers(), 1);

    h.indexer.stop().await;
    assert_eq!(h.indexer.status(), IndexerStatus::Stopped);
    assert_eq!(h.chain.block_subscribers(), 0);
    h.wait_for(IndexerNotification::StatusChanged(IndexerStatus::Stopped))
        .await;
}

#[tokio::test]
async fn confirmation_waits_are_bounded_by_the_configured_timeout() {
    let tx_manager = TxManagerConfig {
        confirmation_timeout: 50,
        ..Default::default()
    };
    let mut h =
        harness_with_tx_manager(InMemoryStore::default(), config(), tx_manager);
    h.chain.set_head(10);
    h.indexer.start().await.unwrap();
    h.wait_for(IndexerNotification::BlockProcessed(10)).await;

    let outcome = h.indexer.send_transaction(payload(1)).await.unwrap();
    let hash = outcome.hash();
    let err = h.indexer.wait_for_confirmation(hash).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ConfirmationTimeout(pending) if pending == hash
    ));
    h.indexer.stop().await;
}

#[tokio::test]
async fn failed_block_fetches_skip_the_block_and_move_on() {
    let mut h = harness();
    h.chain.set_head(10);
    h.indexer.start().await.unwrap();
    h.wait_for(IndexerNotification::BlockProcessed(10)).await;
    h.advance_to(12).await;

    let at = Snapshot::new(11, 0, 0);
    h.chain.add_log(test_utils::transfer_log(peer(), me(), 5, at));
    // the first try and every retry of block 11
    h.chain.fail_next_queries(4);
    h.advance_to(13).await;
    let attempts = h
        .chain
        .queries()
        .into_iter()
        .filter(|range| *range == (11, 11))
        .count();
    assert_eq!(attempts, 4);
    assert_eq!(h.store.get_latest_block_number().unwrap(), Some(13));

    // The pipeline keeps going, the skipped event stays skipped.
    h.advance_to(15).await;
    assert_eq!(h.store.get_hopr_balance().unwrap(), U256::zero());
    assert_eq!(h.store.get_latest_block_number().unwrap(), Some(15));
    h.indexer.stop().await;
}

#[tokio::test]
async fn failed_store_writes_are_retried_on_the_next_block() {
    let store = FlakyStore::default();
    let mut h = harness_with(store.clone(), config());
    h.chain.set_head(10);
    h.indexer.start().await.unwrap();
    h.wait_for(IndexerNotification::BlockProcessed(10)).await;

    // losing the block number write is not fatal
    store.fail_next_writes(1);
    h.produce(11).await;
    assert_eq!(store.get_latest_block_number().unwrap(), Some(10));
    h.produce(12).await;
    assert_eq!(store.get_latest_block_number().unwrap(), Some(12));

    // neither is failing to apply an event, it stays buffered
    let at = Snapshot::new(13, 0, 0);
    h.chain.add_log(test_utils::transfer_log(peer(), me(), 5, at));
    h.produce(13).await;
    h.produce(14).await;
    store.fail_next_writes(1);
    h.produce(15).await;
    assert_eq!(store.get_hopr_balance().unwrap(), U256::zero());
    assert_eq!(store.get_latest_confirmed_snapshot().unwrap(), None);
    h.produce(16).await;
    assert_eq!(store.get_hopr_balance().unwrap(), U256::from(5));
    assert_eq!(store.get_latest_confirmed_snapshot().unwrap(), Some(at));
    h.indexer.stop().await;
}

#[tokio::test]
async fn confirmed_transactions_are_pruned_once_idle() {
    let mut h = harness();
    h.chain.set_head(10);
    h.indexer.start().await.unwrap();
    h.wait_for(IndexerNotification::BlockProcessed(10)).await;

    let tracker = h.indexer.tx_manager().clone();
    for nonce in 0..8u64 {
        let hash = H256::from_low_u64_be(100 + nonce);
        tracker.add_to_queuing(hash, nonce, U256::one(), payload(nonce as u8));
        tracker.move_to_confirmed(&hash);
    }
    assert_eq!(tracker.next_tracked_nonce(), None);
    h.advance_to(11).await;
    assert_eq!(tracker.get_all(TransactionState::Confirmed).len(), 5);
    h.indexer.stop().await;
}
