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

use ethers::types::Bytes;
use mixnet_relay_types::{Address, Snapshot, H256, U256};
use mixnet_tx_manager::TransactionSubmitter;
use tokio::sync::{broadcast, mpsc};

/// A log as returned by the chain, with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    /// Emitting contract.
    pub address: Address,
    /// Topics, `topics[0]` being the event signature.
    pub topics: Vec<H256>,
    /// Non-indexed parameters.
    pub data: Bytes,
    /// Block the log was emitted in.
    pub block_number: u64,
    /// Position of the emitting transaction in its block.
    pub transaction_index: u64,
    /// Position of the log in its block.
    pub log_index: u64,
}

impl RawLog {
    /// Where the log sits in the chain.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.block_number, self.transaction_index, self.log_index)
    }
}

/// Contracts and event signatures the indexer queries logs for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Any of these contracts.
    pub addresses: Vec<Address>,
    /// Any of these `topic0`s.
    pub topics: Vec<H256>,
}

/// A transaction included in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTransaction {
    /// Transaction hash.
    pub hash: H256,
    /// Sender.
    pub from: Address,
    /// Sender nonce.
    pub nonce: u64,
}

/// Everything the indexer consumes from the chain.
///
/// Transaction signing and broadcasting come from the
/// [`TransactionSubmitter`] supertrait.
#[async_trait::async_trait]
pub trait ChainSource: TransactionSubmitter + 'static {
    /// Starts delivering new block numbers, each exactly once and in
    /// increasing order. Dropping the receiver unsubscribes.
    async fn subscribe_blocks(
        &self,
    ) -> mixnet_relay_utils::Result<mpsc::UnboundedReceiver<u64>>;

    /// Failures of the underlying provider, as messages. Dropping the
    /// receiver unsubscribes.
    fn subscribe_provider_errors(&self) -> broadcast::Receiver<String>;

    /// Current chain head.
    async fn get_latest_block_number(&self) -> mixnet_relay_utils::Result<u64>;

    /// Logs matching `filter` in `from_block..=to_block`.
    async fn query_logs(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> mixnet_relay_utils::Result<Vec<RawLog>>;

    /// Transactions included in `block_number`.
    async fn get_transactions_in_block(
        &self,
        block_number: u64,
    ) -> mixnet_relay_utils::Result<Vec<ChainTransaction>>;

    /// Native currency balance of `address`.
    async fn get_native_balance(
        &self,
        address: Address,
    ) -> mixnet_relay_utils::Result<U256>;
}
