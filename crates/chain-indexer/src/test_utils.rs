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

use std::collections::BTreeMap;
use std::sync::Arc;

use ethers::abi::{self, Token};
use ethers::types::Bytes;
use ethers::utils::keccak256;
use mixnet_relay_config::ContractsConfig;
use mixnet_relay_store::{
    AccountStore, BalanceStore, BlockStore, ChannelStore, InMemoryStore,
    NetworkRegistryStore, TicketStore,
};
use mixnet_relay_types::{
    AccountEntry, AcknowledgedTicket, Address, Balance, ChannelEntry,
    ChannelStatus, Snapshot, Ticket, H256, U256,
};
use mixnet_relay_utils::Error;
use mixnet_tx_manager::{
    SignedTransaction, TransactionPayload, TransactionSubmitter,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::events::{signatures, topic};
use crate::source::{ChainSource, ChainTransaction, LogFilter, RawLog};

/// Contract addresses used by every helper of this module.
pub fn contracts() -> ContractsConfig {
    ContractsConfig {
        channels: Address::repeat_byte(0xc1),
        token: Address::repeat_byte(0xc2),
        announcements: Address::repeat_byte(0xc3),
        network_registry: Address::repeat_byte(0xc4),
    }
}

/// A funded channel between two accounts.
pub fn channel(
    source: Address,
    destination: Address,
    status: ChannelStatus,
) -> ChannelEntry {
    ChannelEntry {
        source,
        destination,
        balance: 100.into(),
        commitment: H256::repeat_byte(0x33),
        ticket_epoch: U256::one(),
        ticket_index: U256::zero(),
        status,
        channel_epoch: U256::one(),
        closure_time: U256::zero(),
    }
}

fn log(
    address: Address,
    signature: &str,
    indexed: &[H256],
    data: &[Token],
    at: Snapshot,
) -> RawLog {
    let mut topics = vec![topic(signature)];
    topics.extend_from_slice(indexed);
    RawLog {
        address,
        topics,
        data: abi::encode(data).into(),
        block_number: at.block_number,
        transaction_index: at.transaction_index,
        log_index: at.log_index,
    }
}

fn bool_topic(value: bool) -> H256 {
    H256::from_low_u64_be(value as u64)
}

/// `Announcement` of `account`.
pub fn announcement_log(
    account: Address,
    public_key: &[u8],
    multiaddr: &[u8],
    at: Snapshot,
) -> RawLog {
    log(
        contracts().announcements,
        signatures::ANNOUNCEMENT,
        &[account.into()],
        &[
            Token::Bytes(public_key.to_vec()),
            Token::Bytes(multiaddr.to_vec()),
        ],
        at,
    )
}

/// `ChannelUpdated` carrying `channel` as the new state.
pub fn channel_updated_log(channel: &ChannelEntry, at: Snapshot) -> RawLog {
    log(
        contracts().channels,
        signatures::CHANNEL_UPDATED,
        &[channel.source.into(), channel.destination.into()],
        &[Token::Tuple(vec![
            Token::Uint(channel.balance),
            Token::FixedBytes(channel.commitment.as_bytes().to_vec()),
            Token::Uint(channel.ticket_epoch),
            Token::Uint(channel.ticket_index),
            Token::Uint((channel.status as u8).into()),
            Token::Uint(channel.channel_epoch),
            Token::Uint(channel.closure_time),
        ])],
        at,
    )
}

/// `TicketRedeemed` of a ticket issued by `source`.
pub fn ticket_redeemed_log(
    source: Address,
    destination: Address,
    index: u64,
    amount: u64,
    at: Snapshot,
) -> RawLog {
    log(
        contracts().channels,
        signatures::TICKET_REDEEMED,
        &[source.into(), destination.into()],
        &[
            Token::FixedBytes(vec![1; 32]),
            Token::Uint(U256::one()),
            Token::Uint(index.into()),
            Token::FixedBytes(vec![2; 32]),
            Token::Uint(amount.into()),
            Token::Uint(U256::MAX),
            Token::Bytes(vec![3; 65]),
        ],
        at,
    )
}

/// Token `Transfer`.
pub fn transfer_log(
    from: Address,
    to: Address,
    value: u64,
    at: Snapshot,
) -> RawLog {
    log(
        contracts().token,
        signatures::TRANSFER,
        &[from.into(), to.into()],
        &[Token::Uint(value.into())],
        at,
    )
}

/// `EligibilityUpdated` of `account`.
pub fn eligibility_updated_log(
    account: Address,
    eligible: bool,
    at: Snapshot,
) -> RawLog {
    log(
        contracts().network_registry,
        signatures::ELIGIBILITY_UPDATED,
        &[account.into(), bool_topic(eligible)],
        &[],
        at,
    )
}

/// `Registered` when `registered`, `Deregistered` otherwise.
pub fn registered_log(
    account: Address,
    peer_id: &str,
    registered: bool,
    at: Snapshot,
) -> RawLog {
    let signature = if registered {
        signatures::REGISTERED
    } else {
        signatures::DEREGISTERED
    };
    log(
        contracts().network_registry,
        signature,
        &[account.into()],
        &[Token::String(peer_id.to_owned())],
        at,
    )
}

/// `EnabledNetworkRegistry`.
pub fn enabled_network_registry_log(enabled: bool, at: Snapshot) -> RawLog {
    log(
        contracts().network_registry,
        signatures::ENABLED_NETWORK_REGISTRY,
        &[bool_topic(enabled)],
        &[],
        at,
    )
}

#[derive(Debug, Default)]
struct MockState {
    head: u64,
    logs: Vec<RawLog>,
    failing_queries: usize,
    queries: Vec<(u64, u64)>,
    transactions: BTreeMap<u64, Vec<ChainTransaction>>,
    balance: U256,
    nonce: u64,
    offline: bool,
    broadcast: Vec<SignedTransaction>,
    subscribers: Vec<mpsc::UnboundedSender<u64>>,
}

/// A scriptable in-memory chain.
///
/// Clones share the same chain.
#[derive(Debug, Clone)]
pub struct MockChainSource {
    state: Arc<Mutex<MockState>>,
    errors: broadcast::Sender<String>,
    address: Address,
}

impl MockChainSource {
    /// A chain at block zero where the node controls `address`.
    pub fn new(address: Address) -> Self {
        let (errors, _) = broadcast::channel(16);
        Self {
            state: Default::default(),
            errors,
            address,
        }
    }

    /// Moves the head without announcing the block.
    pub fn set_head(&self, block_number: u64) {
        self.state.lock().head = block_number;
    }

    /// Moves the head and announces the block to every subscriber.
    pub fn produce_block(&self, block_number: u64) {
        let mut state = self.state.lock();
        state.head = block_number;
        state.subscribers.retain(|tx| tx.send(block_number).is_ok());
    }

    /// Number of live block subscriptions.
    pub fn block_subscribers(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Makes `log` visible to `query_logs`.
    pub fn add_log(&self, log: RawLog) {
        self.state.lock().logs.push(log);
    }

    /// Fails the next `count` calls to `query_logs`.
    pub fn fail_next_queries(&self, count: usize) {
        self.state.lock().failing_queries = count;
    }

    /// Every `query_logs` range asked for, failed ones included.
    pub fn queries(&self) -> Vec<(u64, u64)> {
        self.state.lock().queries.clone()
    }

    /// Includes a transaction of the node in `block_number`.
    pub fn include_transaction(&self, block_number: u64, hash: H256) {
        let mut state = self.state.lock();
        let nonce = state.nonce;
        state.nonce += 1;
        state
            .transactions
            .entry(block_number)
            .or_default()
            .push(ChainTransaction {
                hash,
                from: self.address,
                nonce,
            });
    }

    /// Sets the node's native balance.
    pub fn set_balance(&self, balance: U256) {
        self.state.lock().balance = balance;
    }

    /// Makes broadcasts fail while `offline`.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Transactions accepted by `broadcast`.
    pub fn broadcasted(&self) -> Vec<SignedTransaction> {
        self.state.lock().broadcast.clone()
    }

    /// Reports a provider failure to every error subscriber.
    pub fn emit_provider_error(&self, message: &str) {
        let _ = self.errors.send(message.to_owned());
    }
}

#[async_trait::async_trait]
impl TransactionSubmitter for MockChainSource {
    async fn next_nonce(&self) -> mixnet_relay_utils::Result<u64> {
        Ok(self.state.lock().nonce)
    }

    async fn sign(
        &self,
        payload: &TransactionPayload,
        nonce: u64,
        max_priority: U256,
    ) -> mixnet_relay_utils::Result<SignedTransaction> {
        let mut raw = payload.data.to_vec();
        raw.extend_from_slice(&nonce.to_be_bytes());
        raw.extend_from_slice(&max_priority.low_u64().to_be_bytes());
        Ok(SignedTransaction {
            hash: keccak256(&raw).into(),
            raw: Bytes::from(raw),
        })
    }

    async fn broadcast(
        &self,
        tx: &SignedTransaction,
    ) -> mixnet_relay_utils::Result<H256> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(Error::ProviderFailure("connection refused".into()));
        }
        state.broadcast.push(tx.clone());
        Ok(tx.hash)
    }
}

#[async_trait::async_trait]
impl ChainSource for MockChainSource {
    async fn subscribe_blocks(
        &self,
    ) -> mixnet_relay_utils::Result<mpsc::UnboundedReceiver<u64>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(tx);
        Ok(rx)
    }

    fn subscribe_provider_errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    async fn get_latest_block_number(&self) -> mixnet_relay_utils::Result<u64> {
        Ok(self.state.lock().head)
    }

    async fn query_logs(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> mixnet_relay_utils::Result<Vec<RawLog>> {
        let mut state = self.state.lock();
        state.queries.push((from_block, to_block));
        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(Error::ProviderFailure(
                "query returned more than 10000 results".into(),
            ));
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                (from_block..=to_block).contains(&log.block_number)
                    && filter.addresses.contains(&log.address)
                    && log
                        .topics
                        .first()
                        .is_some_and(|t| filter.topics.contains(t))
            })
            .cloned()
            .collect())
    }

    async fn get_transactions_in_block(
        &self,
        block_number: u64,
    ) -> mixnet_relay_utils::Result<Vec<ChainTransaction>> {
        Ok(self
            .state
            .lock()
            .transactions
            .get(&block_number)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_native_balance(
        &self,
        address: Address,
    ) -> mixnet_relay_utils::Result<U256> {
        if address == self.address {
            Ok(self.state.lock().balance)
        } else {
            Ok(U256::zero())
        }
    }
}

/// An [`InMemoryStore`] whose writes can be made to fail.
///
/// Reads always succeed. Clones share the same store and failure budget.
#[derive(Debug, Clone, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    failing_writes: Arc<Mutex<usize>>,
}

impl FlakyStore {
    /// Wraps `inner`.
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            failing_writes: Default::default(),
        }
    }

    /// Fails the next `count` writes, whatever they are.
    pub fn fail_next_writes(&self, count: usize) {
        *self.failing_writes.lock() = count;
    }

    /// The wrapped store.
    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    fn write(&self) -> mixnet_relay_utils::Result<()> {
        let mut failing = self.failing_writes.lock();
        if *failing > 0 {
            *failing -= 1;
            return Err(Error::Generic("store write failed"));
        }
        Ok(())
    }
}

type StoreResult<T> = mixnet_relay_utils::Result<T>;

impl BlockStore for FlakyStore {
    fn get_latest_block_number(&self) -> StoreResult<Option<u64>> {
        self.inner.get_latest_block_number()
    }

    fn update_latest_block_number(&self, block_number: u64) -> StoreResult<()> {
        self.write()?;
        self.inner.update_latest_block_number(block_number)
    }

    fn get_latest_confirmed_snapshot(&self) -> StoreResult<Option<Snapshot>> {
        self.inner.get_latest_confirmed_snapshot()
    }

    fn update_latest_confirmed_snapshot(
        &self,
        snapshot: &Snapshot,
    ) -> StoreResult<()> {
        self.write()?;
        self.inner.update_latest_confirmed_snapshot(snapshot)
    }
}

impl AccountStore for FlakyStore {
    fn get_account(
        &self,
        address: &Address,
    ) -> StoreResult<Option<AccountEntry>> {
        self.inner.get_account(address)
    }

    fn get_accounts(&self) -> StoreResult<Vec<AccountEntry>> {
        self.inner.get_accounts()
    }

    fn update_account_and_snapshot(
        &self,
        address: &Address,
        account: &AccountEntry,
        snapshot: &Snapshot,
    ) -> StoreResult<()> {
        self.write()?;
        self.inner
            .update_account_and_snapshot(address, account, snapshot)
    }
}

impl ChannelStore for FlakyStore {
    fn get_channel(
        &self,
        channel_id: &H256,
    ) -> StoreResult<Option<ChannelEntry>> {
        self.inner.get_channel(channel_id)
    }

    fn update_channel_and_snapshot(
        &self,
        channel_id: &H256,
        channel: &ChannelEntry,
        snapshot: &Snapshot,
    ) -> StoreResult<()> {
        self.write()?;
        self.inner
            .update_channel_and_snapshot(channel_id, channel, snapshot)
    }

    fn get_channels_open(&self) -> StoreResult<Vec<ChannelEntry>> {
        self.inner.get_channels_open()
    }

    fn get_channels_from(
        &self,
        source: &Address,
    ) -> StoreResult<Vec<ChannelEntry>> {
        self.inner.get_channels_from(source)
    }
}

impl TicketStore for FlakyStore {
    fn get_pending_tickets(
        &self,
        channel_id: &H256,
    ) -> StoreResult<Vec<Ticket>> {
        self.inner.get_pending_tickets(channel_id)
    }

    fn store_pending_ticket(
        &self,
        channel_id: &H256,
        ticket: &Ticket,
    ) -> StoreResult<()> {
        self.write()?;
        self.inner.store_pending_ticket(channel_id, ticket)
    }

    fn remove_pending_ticket(
        &self,
        channel_id: &H256,
        challenge: &H256,
    ) -> StoreResult<Option<Ticket>> {
        self.write()?;
        self.inner.remove_pending_ticket(channel_id, challenge)
    }

    fn get_acknowledged_tickets(
        &self,
        channel_id: Option<&H256>,
    ) -> StoreResult<Vec<AcknowledgedTicket>> {
        self.inner.get_acknowledged_tickets(channel_id)
    }

    fn store_acknowledged_ticket(
        &self,
        channel_id: &H256,
        ticket: &AcknowledgedTicket,
    ) -> StoreResult<()> {
        self.write()?;
        self.inner.store_acknowledged_ticket(channel_id, ticket)
    }

    fn delete_acknowledged_tickets_from(
        &self,
        channel_id: &H256,
    ) -> StoreResult<usize> {
        self.write()?;
        self.inner.delete_acknowledged_tickets_from(channel_id)
    }

    fn delete_redeemed_tickets(
        &self,
        channel_id: &H256,
        ticket_index: U256,
    ) -> StoreResult<usize> {
        self.write()?;
        self.inner.delete_redeemed_tickets(channel_id, ticket_index)
    }

    fn get_pending_balance_to(
        &self,
        counterparty: &Address,
    ) -> StoreResult<Balance> {
        self.inner.get_pending_balance_to(counterparty)
    }

    fn add_pending_balance_to(
        &self,
        counterparty: &Address,
        amount: Balance,
    ) -> StoreResult<()> {
        self.write()?;
        self.inner.add_pending_balance_to(counterparty, amount)
    }

    fn resolve_pending_and_snapshot(
        &self,
        counterparty: &Address,
        amount: Balance,
        snapshot: &Snapshot,
    ) -> StoreResult<Balance> {
        self.write()?;
        self.inner
            .resolve_pending_and_snapshot(counterparty, amount, snapshot)
    }
}

impl BalanceStore for FlakyStore {
    fn get_hopr_balance(&self) -> StoreResult<Balance> {
        self.inner.get_hopr_balance()
    }

    fn add_hopr_balance(&self, amount: Balance) -> StoreResult<()> {
        self.write()?;
        self.inner.add_hopr_balance(amount)
    }

    fn sub_hopr_balance(&self, amount: Balance) -> StoreResult<()> {
        self.write()?;
        self.inner.sub_hopr_balance(amount)
    }

    fn update_hopr_balance_and_snapshot(
        &self,
        credit: Balance,
        debit: Balance,
        snapshot: &Snapshot,
    ) -> StoreResult<()> {
        self.write()?;
        self.inner
            .update_hopr_balance_and_snapshot(credit, debit, snapshot)
    }
}

impl NetworkRegistryStore for FlakyStore {
    fn is_network_registry_enabled(&self) -> StoreResult<bool> {
        self.inner.is_network_registry_enabled()
    }

    fn set_network_registry_enabled(&self, enabled: bool) -> StoreResult<()> {
        self.write()?;
        self.inner.set_network_registry_enabled(enabled)
    }

    fn add_to_network_registry(
        &self,
        peer_id: &str,
        account: &Address,
    ) -> StoreResult<()> {
        self.write()?;
        self.inner.add_to_network_registry(peer_id, account)
    }

    fn remove_from_network_registry(&self, peer_id: &str) -> StoreResult<()> {
        self.write()?;
        self.inner.remove_from_network_registry(peer_id)
    }

    fn get_account_of_peer(
        &self,
        peer_id: &str,
    ) -> StoreResult<Option<Address>> {
        self.inner.get_account_of_peer(peer_id)
    }

    fn get_peers_of_account(
        &self,
        account: &Address,
    ) -> StoreResult<Vec<String>> {
        self.inner.get_peers_of_account(account)
    }

    fn set_eligible(
        &self,
        account: &Address,
        eligible: bool,
    ) -> StoreResult<()> {
        self.write()?;
        self.inner.set_eligible(account, eligible)
    }

    fn is_eligible(&self, account: &Address) -> StoreResult<bool> {
        self.inner.is_eligible(account)
    }
}
