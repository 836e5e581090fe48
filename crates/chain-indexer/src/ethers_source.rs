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

use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    BlockNumber, Eip1559TransactionRequest, Filter, ValueOrArray,
};
use ethers::utils::keccak256;
use tokio::sync::{broadcast, mpsc};

use mixnet_relay_types::{Address, H256, U256};
use mixnet_relay_utils::Error;
use mixnet_tx_manager::{
    SignedTransaction, TransactionPayload, TransactionSubmitter,
};

use crate::source::{ChainSource, ChainTransaction, LogFilter, RawLog};

/// [`ChainSource`] talking JSON-RPC over http through `ethers`.
///
/// Without a wallet it is read-only: signing fails and so does everything
/// that needs the node's own account.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct EthersChainSource {
    /// The RPC client.
    provider: Arc<Provider<Http>>,
    /// The node's key, if it may send transactions.
    #[builder(default)]
    wallet: Option<LocalWallet>,
    /// How often the head is polled.
    polling_interval: Duration,
    /// Gas limit of every transaction.
    gas_limit: U256,
    /// Max fee per gas of every transaction.
    max_fee_per_gas: U256,
    /// Provider failures seen while polling.
    #[builder(default = broadcast::channel(16).0)]
    errors: broadcast::Sender<String>,
}

impl EthersChainSource {
    /// The node's account, `None` when read-only.
    pub fn address(&self) -> Option<Address> {
        self.wallet.as_ref().map(Signer::address)
    }

    fn wallet(&self) -> mixnet_relay_utils::Result<&LocalWallet> {
        self.wallet
            .as_ref()
            .ok_or(Error::Generic("no private key configured"))
    }
}

#[async_trait::async_trait]
impl TransactionSubmitter for EthersChainSource {
    async fn next_nonce(&self) -> mixnet_relay_utils::Result<u64> {
        let address = self.wallet()?.address();
        let nonce = self
            .provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await?;
        Ok(nonce.as_u64())
    }

    async fn sign(
        &self,
        payload: &TransactionPayload,
        nonce: u64,
        max_priority: U256,
    ) -> mixnet_relay_utils::Result<SignedTransaction> {
        let wallet = self.wallet()?;
        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .from(wallet.address())
            .to(payload.to)
            .data(payload.data.clone())
            .value(payload.value)
            .nonce(nonce)
            .gas(self.gas_limit)
            .max_fee_per_gas(self.max_fee_per_gas)
            .max_priority_fee_per_gas(max_priority)
            .chain_id(wallet.chain_id())
            .into();
        let signature = wallet.sign_transaction(&tx).await?;
        let raw = tx.rlp_signed(&signature);
        Ok(SignedTransaction {
            hash: H256::from(keccak256(&raw)),
            raw,
        })
    }

    async fn broadcast(
        &self,
        tx: &SignedTransaction,
    ) -> mixnet_relay_utils::Result<H256> {
        let pending = self.provider.send_raw_transaction(tx.raw.clone()).await?;
        Ok(pending.tx_hash())
    }
}

#[async_trait::async_trait]
impl ChainSource for EthersChainSource {
    async fn subscribe_blocks(
        &self,
    ) -> mixnet_relay_utils::Result<mpsc::UnboundedReceiver<u64>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = self.provider.clone();
        let errors = self.errors.clone();
        let mut interval = tokio::time::interval(self.polling_interval);
        tokio::spawn(async move {
            let mut last: Option<u64> = None;
            loop {
                interval.tick().await;
                if tx.is_closed() {
                    break;
                }
                let head = match provider.get_block_number().await {
                    Ok(head) => head.as_u64(),
                    Err(e) => {
                        let _ = errors.send(e.to_string());
                        continue;
                    }
                };
                // announce every block once, none skipped
                let first = last.map_or(head, |l| l + 1);
                if (first..=head).any(|n| tx.send(n).is_err()) {
                    break;
                }
                last = Some(last.map_or(head, |l| l.max(head)));
            }
            tracing::trace!("Block subscription closed");
        });
        Ok(rx)
    }

    fn subscribe_provider_errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    async fn get_latest_block_number(&self) -> mixnet_relay_utils::Result<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn query_logs(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> mixnet_relay_utils::Result<Vec<RawLog>> {
        let topics: Vec<Option<H256>> =
            filter.topics.iter().copied().map(Some).collect();
        let query = Filter::new()
            .address(ValueOrArray::Array(filter.addresses.clone()))
            .topic0(ValueOrArray::Array(topics))
            .from_block(from_block)
            .to_block(to_block);
        let logs = self.provider.get_logs(&query).await?;
        Ok(logs
            .into_iter()
            .filter(|log| log.removed != Some(true))
            .filter_map(|log| {
                Some(RawLog {
                    address: log.address,
                    topics: log.topics,
                    data: log.data,
                    block_number: log.block_number?.as_u64(),
                    transaction_index: log.transaction_index?.as_u64(),
                    log_index: log.log_index?.as_u64(),
                })
            })
            .collect())
    }

    async fn get_transactions_in_block(
        &self,
        block_number: u64,
    ) -> mixnet_relay_utils::Result<Vec<ChainTransaction>> {
        let block = self.provider.get_block_with_txs(block_number).await?;
        Ok(block
            .map(|b| b.transactions)
            .unwrap_or_default()
            .into_iter()
            .map(|tx| ChainTransaction {
                hash: tx.hash,
                from: tx.from,
                nonce: tx.nonce.as_u64(),
            })
            .collect())
    }

    async fn get_native_balance(
        &self,
        address: Address,
    ) -> mixnet_relay_utils::Result<U256> {
        Ok(self.provider.get_balance(address, None).await?)
    }
}
