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

use ethers::types::{Bytes, H256, U256};
use mixnet_relay_utils::probe;

use crate::{ExistenceCheck, TransactionManager, TransactionPayload};

/// A signed transaction ready to be broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    /// Hash of the signed transaction.
    pub hash: H256,
    /// RLP encoding of the signed transaction.
    pub raw: Bytes,
}

/// Signs and broadcasts transactions on behalf of the node.
#[async_trait::async_trait]
pub trait TransactionSubmitter: Send + Sync {
    /// Next nonce of the node's account as known to the chain, counting
    /// pending transactions.
    async fn next_nonce(&self) -> mixnet_relay_utils::Result<u64>;

    /// Signs `payload` with the given nonce and max priority fee.
    async fn sign(
        &self,
        payload: &TransactionPayload,
        nonce: u64,
        max_priority: U256,
    ) -> mixnet_relay_utils::Result<SignedTransaction>;

    /// Hands a signed transaction to the provider.
    async fn broadcast(
        &self,
        tx: &SignedTransaction,
    ) -> mixnet_relay_utils::Result<H256>;
}

/// What [`TransactionManager::send_transaction`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Signed and accepted by the provider; now `Pending`.
    Broadcast(H256),
    /// Signed but the broadcast failed; left `Queuing` for a later resend.
    Queued(H256),
    /// An equivalent transaction is already tracked.
    AlreadyTracked(H256),
}

impl SendOutcome {
    /// Hash of the transaction that carries the payload.
    pub fn hash(&self) -> H256 {
        match self {
            Self::Broadcast(h)
            | Self::Queued(h)
            | Self::AlreadyTracked(h) => *h,
        }
    }
}

impl TransactionManager {
    /// Signs, tracks and broadcasts `payload`.
    ///
    /// Nothing is sent if the payload is already mined, or pending with at
    /// least `max_priority`. A tracked copy with a lower fee is replaced by
    /// a transaction reusing its nonce.
    #[tracing::instrument(skip_all, fields(to = ?payload.to))]
    pub async fn send_transaction<T>(
        &self,
        submitter: &T,
        payload: TransactionPayload,
        max_priority: U256,
    ) -> mixnet_relay_utils::Result<SendOutcome>
    where
        T: TransactionSubmitter + ?Sized,
    {
        let _guard = self.send_lock.lock().await;
        let check = self
            .exist_in_mined_or_pending_with_higher_fee(&payload, max_priority);
        let (nonce, replaced) = match check {
            ExistenceCheck::Exists(hash) => {
                tracing::debug!(?hash, "Transaction already tracked");
                return Ok(SendOutcome::AlreadyTracked(hash));
            }
            ExistenceCheck::Underpriced { hash, nonce } => (nonce, Some(hash)),
            ExistenceCheck::NotFound => {
                let chain_nonce = submitter.next_nonce().await?;
                let tracked = self.next_tracked_nonce().unwrap_or_default();
                (chain_nonce.max(tracked), None)
            }
        };

        let signed = submitter.sign(&payload, nonce, max_priority).await?;
        if !self.add_to_queuing(signed.hash, nonce, max_priority, payload) {
            return Ok(SendOutcome::AlreadyTracked(signed.hash));
        }
        if let Some(old) = replaced {
            tracing::debug!(?old, new = ?signed.hash, nonce, "Replacing");
            self.remove(&old);
        }
        Ok(self.broadcast(submitter, &signed, nonce).await)
    }

    /// Re-signs and broadcasts every `Queuing` transaction, lowest nonce
    /// first. Stops at the first broadcast failure, since later nonces
    /// would be rejected as well.
    ///
    /// Returns how many transactions moved to `Pending`.
    pub async fn resend_queuing<T>(
        &self,
        submitter: &T,
    ) -> mixnet_relay_utils::Result<usize>
    where
        T: TransactionSubmitter + ?Sized,
    {
        let _guard = self.send_lock.lock().await;
        let mut resent = 0;
        for record in self.get_all(crate::TransactionState::Queuing) {
            let Some(payload) = self.get_payload(&record.hash) else {
                continue;
            };
            let signed = submitter
                .sign(&payload, record.nonce, record.max_priority)
                .await?;
            if signed.hash != record.hash {
                self.remove(&record.hash);
                self.add_to_queuing(
                    signed.hash,
                    record.nonce,
                    record.max_priority,
                    payload,
                );
            }
            match self.broadcast(submitter, &signed, record.nonce).await {
                SendOutcome::Broadcast(_) => resent += 1,
                _ => break,
            }
        }
        Ok(resent)
    }

    async fn broadcast<T>(
        &self,
        submitter: &T,
        signed: &SignedTransaction,
        nonce: u64,
    ) -> SendOutcome
    where
        T: TransactionSubmitter + ?Sized,
    {
        match submitter.broadcast(signed).await {
            Ok(_) => {
                self.move_from_queuing_to_pending(&signed.hash);
                tracing::event!(
                    target: probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %probe::Kind::TxManager,
                    pending = true,
                    tx_hash = ?signed.hash,
                    nonce,
                );
                SendOutcome::Broadcast(signed.hash)
            }
            Err(e) => {
                tracing::warn!(
                    tx_hash = ?signed.hash,
                    nonce,
                    "Broadcast failed, keeping it queued: {e}",
                );
                SendOutcome::Queued(signed.hash)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransactionState;
    use ethers::types::Address;
    use ethers::utils::keccak256;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockSubmitter {
        chain_nonce: u64,
        offline: AtomicBool,
        broadcasts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TransactionSubmitter for MockSubmitter {
        async fn next_nonce(&self) -> mixnet_relay_utils::Result<u64> {
            Ok(self.chain_nonce)
        }

        async fn sign(
            &self,
            payload: &TransactionPayload,
            nonce: u64,
            max_priority: U256,
        ) -> mixnet_relay_utils::Result<SignedTransaction> {
            let mut raw = payload.data.to_vec();
            raw.extend_from_slice(&nonce.to_be_bytes());
            raw.extend_from_slice(&max_priority.as_u64().to_be_bytes());
            Ok(SignedTransaction {
                hash: keccak256(&raw).into(),
                raw: raw.into(),
            })
        }

        async fn broadcast(
            &self,
            tx: &SignedTransaction,
        ) -> mixnet_relay_utils::Result<H256> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(mixnet_relay_utils::Error::ProviderFailure(
                    "connection refused".into(),
                ));
            }
            self.broadcasts.fetch_add(1, Ordering::SeqCst);
            Ok(tx.hash)
        }
    }

    fn payload(tag: u8) -> TransactionPayload {
        TransactionPayload {
            to: Address::repeat_byte(tag),
            data: vec![tag; 4].into(),
            value: U256::zero(),
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn sends_once_per_payload() {
        let submitter = MockSubmitter {
            chain_nonce: 9,
            ..Default::default()
        };
        let manager = TransactionManager::new(5);
        let first = manager
            .send_transaction(&submitter, payload(1), 2.into())
            .await
            .unwrap();
        assert!(matches!(first, SendOutcome::Broadcast(_)));
        assert_eq!(manager.get(&first.hash()).unwrap().nonce, 9);

        let again = manager
            .send_transaction(&submitter, payload(1), 2.into())
            .await
            .unwrap();
        assert_eq!(again, SendOutcome::AlreadyTracked(first.hash()));

        let other = manager
            .send_transaction(&submitter, payload(2), 2.into())
            .await
            .unwrap();
        assert_eq!(manager.get(&other.hash()).unwrap().nonce, 10);
        assert_eq!(submitter.broadcasts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn higher_fee_replaces_with_same_nonce() {
        let submitter = MockSubmitter::default();
        let manager = TransactionManager::new(5);
        let low = manager
            .send_transaction(&submitter, payload(1), 1.into())
            .await
            .unwrap();
        let high = manager
            .send_transaction(&submitter, payload(1), 5.into())
            .await
            .unwrap();
        assert_ne!(low.hash(), high.hash());
        assert!(manager.get(&low.hash()).is_none());
        let record = manager.get(&high.hash()).unwrap();
        assert_eq!(record.nonce, 0);
        assert_eq!(record.state, TransactionState::Pending);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn failed_broadcasts_stay_queued_until_resent() {
        let submitter = MockSubmitter::default();
        submitter.offline.store(true, Ordering::SeqCst);
        let manager = TransactionManager::new(5);
        let a = manager
            .send_transaction(&submitter, payload(1), 1.into())
            .await
            .unwrap();
        let b = manager
            .send_transaction(&submitter, payload(2), 1.into())
            .await
            .unwrap();
        assert!(matches!(a, SendOutcome::Queued(_)));
        assert_eq!(manager.get(&b.hash()).unwrap().nonce, 1);
        assert!(logs_contain("Broadcast failed"));

        assert_eq!(manager.resend_queuing(&submitter).await.unwrap(), 0);

        submitter.offline.store(false, Ordering::SeqCst);
        assert_eq!(manager.resend_queuing(&submitter).await.unwrap(), 2);
        assert!(manager.get_all(TransactionState::Queuing).is_empty());
        assert_eq!(
            manager.state_of(&a.hash()),
            Some(TransactionState::Pending)
        );
    }
}
