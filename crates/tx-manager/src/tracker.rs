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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ethers::types::{H256, U256};
use parking_lot::RwLock;

use crate::waiter::ConfirmationWaiter;
use crate::{
    ExistenceCheck, TransactionPayload, TransactionRecord, TransactionState,
};

#[derive(Debug, Default)]
struct State {
    payloads: HashMap<H256, TransactionPayload>,
    queuing: HashMap<H256, TransactionRecord>,
    pending: HashMap<H256, TransactionRecord>,
    mined: HashMap<H256, TransactionRecord>,
    confirmed: HashMap<H256, TransactionRecord>,
}

impl State {
    fn bucket(
        &mut self,
        state: TransactionState,
    ) -> &mut HashMap<H256, TransactionRecord> {
        match state {
            TransactionState::Queuing => &mut self.queuing,
            TransactionState::Pending => &mut self.pending,
            TransactionState::Mined => &mut self.mined,
            TransactionState::Confirmed => &mut self.confirmed,
        }
    }

    fn state_of(&self, hash: &H256) -> Option<TransactionState> {
        if self.queuing.contains_key(hash) {
            Some(TransactionState::Queuing)
        } else if self.pending.contains_key(hash) {
            Some(TransactionState::Pending)
        } else if self.mined.contains_key(hash) {
            Some(TransactionState::Mined)
        } else if self.confirmed.contains_key(hash) {
            Some(TransactionState::Confirmed)
        } else {
            None
        }
    }

    /// Moves `hash` one step forward, from `from` into the next state.
    fn advance(&mut self, hash: &H256, from: TransactionState) -> bool {
        let to = match from {
            TransactionState::Queuing => TransactionState::Pending,
            TransactionState::Pending => TransactionState::Mined,
            TransactionState::Mined => TransactionState::Confirmed,
            TransactionState::Confirmed => return false,
        };
        let Some(mut record) = self.bucket(from).remove(hash) else {
            return false;
        };
        record.state = to;
        if to == TransactionState::Pending {
            record.created_at = now_millis();
        }
        if to == TransactionState::Confirmed {
            self.payloads.remove(hash);
        }
        self.bucket(to).insert(*hash, record);
        true
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Lifecycle tracker of the node's own transactions.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    state: Arc<RwLock<State>>,
    waiter: ConfirmationWaiter<H256>,
    pub(crate) send_lock: Arc<tokio::sync::Mutex<()>>,
    keep_confirmed: usize,
}

impl TransactionManager {
    /// Creates an empty tracker that keeps at most `keep_confirmed`
    /// confirmed records after [`Self::prune`].
    pub fn new(keep_confirmed: usize) -> Self {
        Self {
            state: Default::default(),
            waiter: ConfirmationWaiter::new(),
            send_lock: Default::default(),
            keep_confirmed,
        }
    }

    /// Starts tracking a freshly signed transaction.
    ///
    /// Returns `false` and changes nothing if `hash` is already tracked.
    pub fn add_to_queuing(
        &self,
        hash: H256,
        nonce: u64,
        max_priority: U256,
        payload: TransactionPayload,
    ) -> bool {
        let mut state = self.state.write();
        if state.state_of(&hash).is_some() {
            return false;
        }
        state.payloads.insert(hash, payload);
        state.queuing.insert(
            hash,
            TransactionRecord {
                hash,
                nonce,
                created_at: 0,
                max_priority,
                state: TransactionState::Queuing,
            },
        );
        true
    }

    /// `Queuing -> Pending`. No-op unless `hash` is queuing.
    pub fn move_from_queuing_to_pending(&self, hash: &H256) -> bool {
        self.state.write().advance(hash, TransactionState::Queuing)
    }

    /// `Pending -> Mined`. No-op unless `hash` is pending.
    pub fn move_from_pending_to_mined(&self, hash: &H256) -> bool {
        self.state.write().advance(hash, TransactionState::Pending)
    }

    /// `Mined -> Confirmed`, dropping the payload. No-op unless `hash` is
    /// mined.
    pub fn move_from_mined_to_confirmed(&self, hash: &H256) -> bool {
        let moved =
            self.state.write().advance(hash, TransactionState::Mined);
        if moved {
            self.waiter.fire(hash);
        }
        moved
    }

    /// Moves a transaction seen in a block that is not final yet into
    /// `Mined`, passing through `Pending` if it was still queuing.
    pub fn move_to_mined(&self, hash: &H256) -> bool {
        let mut state = self.state.write();
        match state.state_of(hash) {
            Some(TransactionState::Queuing) => {
                state.advance(hash, TransactionState::Queuing)
                    && state.advance(hash, TransactionState::Pending)
            }
            Some(TransactionState::Pending) => {
                state.advance(hash, TransactionState::Pending)
            }
            _ => false,
        }
    }

    /// Moves a transaction seen in a final block into `Confirmed`, passing
    /// through every intermediate state in one call.
    pub fn move_to_confirmed(&self, hash: &H256) -> bool {
        let moved = {
            let mut state = self.state.write();
            let mut moved = false;
            while let Some(current) = state.state_of(hash) {
                if current == TransactionState::Confirmed
                    || !state.advance(hash, current)
                {
                    break;
                }
                moved = true;
            }
            moved
        };
        if moved {
            self.waiter.fire(hash);
        }
        moved
    }

    /// Stops tracking `hash` whatever its state.
    pub fn remove(&self, hash: &H256) -> Option<TransactionRecord> {
        let mut state = self.state.write();
        let current = state.state_of(hash)?;
        state.payloads.remove(hash);
        state.bucket(current).remove(hash)
    }

    /// Stops tracking unconfirmed transactions that use `nonce` but are
    /// not `hash`. Called once `hash` is final, since those can never be
    /// mined anymore. Returns how many were dropped.
    pub fn drop_replaced(&self, nonce: u64, hash: &H256) -> usize {
        let mut state = self.state.write();
        let replaced: Vec<H256> = state
            .queuing
            .values()
            .chain(state.pending.values())
            .chain(state.mined.values())
            .filter(|r| r.nonce == nonce && r.hash != *hash)
            .map(|r| r.hash)
            .collect();
        for h in &replaced {
            state.payloads.remove(h);
            state.queuing.remove(h);
            state.pending.remove(h);
            state.mined.remove(h);
        }
        replaced.len()
    }

    /// Keeps only the `keep_confirmed` confirmed records with the highest
    /// nonces. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut state = self.state.write();
        if state.confirmed.len() <= self.keep_confirmed {
            return 0;
        }
        let mut records: Vec<_> = state
            .confirmed
            .values()
            .map(|r| (r.nonce, r.hash))
            .collect();
        records.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        let stale: Vec<_> = records
            .into_iter()
            .skip(self.keep_confirmed)
            .map(|(_, hash)| hash)
            .collect();
        for hash in &stale {
            state.confirmed.remove(hash);
        }
        stale.len()
    }

    /// Looks for a tracked transaction carrying `payload`.
    ///
    /// A mined copy, or a queuing/pending copy signed with at least
    /// `max_priority`, makes a new send unnecessary. A queuing/pending copy
    /// with a strictly lower fee may be replaced. Confirmed records carry
    /// no payload and never match.
    pub fn exist_in_mined_or_pending_with_higher_fee(
        &self,
        payload: &TransactionPayload,
        max_priority: U256,
    ) -> ExistenceCheck {
        let state = self.state.read();
        let matching = state
            .payloads
            .iter()
            .filter(|(_, p)| *p == payload)
            .map(|(hash, _)| hash);
        let mut underpriced = None;
        for hash in matching {
            if let Some(record) = state.mined.get(hash) {
                return ExistenceCheck::Exists(record.hash);
            }
            let record =
                state.pending.get(hash).or_else(|| state.queuing.get(hash));
            match record {
                Some(r) if r.max_priority >= max_priority => {
                    return ExistenceCheck::Exists(r.hash);
                }
                Some(r) => {
                    underpriced = Some(ExistenceCheck::Underpriced {
                        hash: r.hash,
                        nonce: r.nonce,
                    });
                }
                None => {}
            }
        }
        underpriced.unwrap_or(ExistenceCheck::NotFound)
    }

    /// Lifecycle state of `hash`, if tracked.
    pub fn state_of(&self, hash: &H256) -> Option<TransactionState> {
        self.state.read().state_of(hash)
    }

    /// The record of `hash`, if tracked.
    pub fn get(&self, hash: &H256) -> Option<TransactionRecord> {
        let state = self.state.read();
        let current = state.state_of(hash)?;
        match current {
            TransactionState::Queuing => state.queuing.get(hash),
            TransactionState::Pending => state.pending.get(hash),
            TransactionState::Mined => state.mined.get(hash),
            TransactionState::Confirmed => state.confirmed.get(hash),
        }
        .cloned()
    }

    /// The payload of a transaction that is not confirmed yet.
    pub fn get_payload(&self, hash: &H256) -> Option<TransactionPayload> {
        self.state.read().payloads.get(hash).cloned()
    }

    /// Records in `state`, ordered by nonce.
    pub fn get_all(&self, state: TransactionState) -> Vec<TransactionRecord> {
        let mut guard = self.state.write();
        let mut records: Vec<_> =
            guard.bucket(state).values().cloned().collect();
        records.sort_by_key(|r| r.nonce);
        records
    }

    /// Pending and mined records, ordered by nonce.
    pub fn get_pending_and_mined(&self) -> Vec<TransactionRecord> {
        let state = self.state.read();
        let mut records: Vec<_> = state
            .pending
            .values()
            .chain(state.mined.values())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.nonce);
        records
    }

    /// Hashes of pending and mined transactions.
    pub fn get_pending_and_mined_hashes(&self) -> Vec<H256> {
        self.get_pending_and_mined().into_iter().map(|r| r.hash).collect()
    }

    /// Whether `hash` is tracked and not confirmed yet.
    pub fn is_in_flight(&self, hash: &H256) -> bool {
        matches!(
            self.state_of(hash),
            Some(
                TransactionState::Queuing
                    | TransactionState::Pending
                    | TransactionState::Mined
            )
        )
    }

    /// The nonce after the highest one in use by an unconfirmed
    /// transaction, if any.
    pub fn next_tracked_nonce(&self) -> Option<u64> {
        let state = self.state.read();
        state
            .queuing
            .values()
            .chain(state.pending.values())
            .chain(state.mined.values())
            .map(|r| r.nonce + 1)
            .max()
    }

    /// Waits until `hash` is confirmed or `timeout` passes.
    ///
    /// Resolves immediately if it is already confirmed. A confirmation
    /// racing with the call is never missed.
    pub async fn wait_for_confirmation(
        &self,
        hash: H256,
        timeout: Duration,
    ) -> mixnet_relay_utils::Result<()> {
        let registration = {
            let state = self.state.read();
            if state.confirmed.contains_key(&hash) {
                return Ok(());
            }
            // registered under the lock, so a concurrent confirmation
            // either sees it or is seen above.
            self.waiter.register(hash)
        };
        if registration.wait(timeout).await {
            Ok(())
        } else {
            Err(mixnet_relay_utils::Error::ConfirmationTimeout(hash))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, Bytes};

    fn payload(tag: u8) -> TransactionPayload {
        TransactionPayload {
            to: Address::repeat_byte(tag),
            data: Bytes::from(vec![tag; 4]),
            value: U256::zero(),
        }
    }

    fn hash(n: u64) -> H256 {
        H256::from_low_u64_be(n)
    }

    #[test]
    fn moves_cannot_skip_states() {
        let manager = TransactionManager::new(5);
        assert!(manager.add_to_queuing(hash(1), 0, 1.into(), payload(1)));
        assert!(!manager.add_to_queuing(hash(1), 0, 1.into(), payload(1)));

        assert!(!manager.move_from_pending_to_mined(&hash(1)));
        assert!(!manager.move_from_mined_to_confirmed(&hash(1)));
        assert_eq!(
            manager.state_of(&hash(1)),
            Some(TransactionState::Queuing)
        );

        assert!(manager.move_from_queuing_to_pending(&hash(1)));
        let record = manager.get(&hash(1)).unwrap();
        assert_eq!(record.state, TransactionState::Pending);
        assert!(record.created_at > 0);

        assert!(manager.move_from_pending_to_mined(&hash(1)));
        assert!(manager.get_payload(&hash(1)).is_some());
        assert!(manager.move_from_mined_to_confirmed(&hash(1)));
        assert!(manager.get_payload(&hash(1)).is_none());
        assert!(!manager.is_in_flight(&hash(1)));
    }

    #[test]
    fn move_to_confirmed_walks_every_state() {
        let manager = TransactionManager::new(5);
        manager.add_to_queuing(hash(7), 3, 1.into(), payload(7));

        assert!(manager.move_to_confirmed(&hash(7)));
        let record = manager.get(&hash(7)).unwrap();
        assert_eq!(record.state, TransactionState::Confirmed);
        assert!(record.created_at > 0);
        assert!(manager.get_payload(&hash(7)).is_none());
        assert!(manager.get_all(TransactionState::Queuing).is_empty());
        assert!(manager.get_all(TransactionState::Pending).is_empty());
        assert!(manager.get_all(TransactionState::Mined).is_empty());

        // already there
        assert!(!manager.move_to_confirmed(&hash(7)));
        assert!(!manager.move_to_confirmed(&hash(8)));
    }

    #[test]
    fn move_to_mined_passes_through_pending() {
        let manager = TransactionManager::new(5);
        manager.add_to_queuing(hash(1), 0, 1.into(), payload(1));
        assert!(manager.move_to_mined(&hash(1)));
        assert_eq!(manager.state_of(&hash(1)), Some(TransactionState::Mined));
        assert!(!manager.move_to_mined(&hash(1)));
    }

    #[test]
    fn pending_and_mined_are_listed_together() {
        let manager = TransactionManager::new(5);
        manager.add_to_queuing(hash(1), 0, 1.into(), payload(1));
        manager.add_to_queuing(hash(2), 1, 1.into(), payload(2));
        manager.add_to_queuing(hash(3), 2, 1.into(), payload(3));
        manager.move_from_queuing_to_pending(&hash(2));
        manager.move_to_mined(&hash(1));

        assert_eq!(
            manager.get_pending_and_mined_hashes(),
            vec![hash(1), hash(2)]
        );
    }

    #[test]
    fn prune_keeps_highest_nonces() {
        let manager = TransactionManager::new(5);
        for nonce in 0..8u64 {
            let h = hash(100 + nonce);
            manager.add_to_queuing(h, nonce, 1.into(), payload(nonce as u8));
            manager.move_to_confirmed(&h);
        }
        assert_eq!(manager.prune(), 3);
        let nonces: Vec<_> = manager
            .get_all(TransactionState::Confirmed)
            .into_iter()
            .map(|r| r.nonce)
            .collect();
        assert_eq!(nonces, vec![3, 4, 5, 6, 7]);
        assert_eq!(manager.prune(), 0);
    }

    #[test]
    fn existence_check_compares_fees() {
        let manager = TransactionManager::new(5);
        let p = payload(1);
        assert_eq!(
            manager.exist_in_mined_or_pending_with_higher_fee(&p, 10.into()),
            ExistenceCheck::NotFound
        );

        manager.add_to_queuing(hash(1), 4, 10.into(), p.clone());
        manager.move_from_queuing_to_pending(&hash(1));
        assert_eq!(
            manager.exist_in_mined_or_pending_with_higher_fee(&p, 10.into()),
            ExistenceCheck::Exists(hash(1))
        );
        assert_eq!(
            manager.exist_in_mined_or_pending_with_higher_fee(&p, 11.into()),
            ExistenceCheck::Underpriced {
                hash: hash(1),
                nonce: 4
            }
        );

        manager.move_from_pending_to_mined(&hash(1));
        assert_eq!(
            manager.exist_in_mined_or_pending_with_higher_fee(&p, 99.into()),
            ExistenceCheck::Exists(hash(1))
        );

        manager.move_from_mined_to_confirmed(&hash(1));
        assert_eq!(
            manager.exist_in_mined_or_pending_with_higher_fee(&p, 1.into()),
            ExistenceCheck::NotFound
        );
    }

    #[test]
    fn next_tracked_nonce_ignores_confirmed() {
        let manager = TransactionManager::new(5);
        assert_eq!(manager.next_tracked_nonce(), None);
        manager.add_to_queuing(hash(1), 4, 1.into(), payload(1));
        manager.add_to_queuing(hash(2), 5, 1.into(), payload(2));
        assert_eq!(manager.next_tracked_nonce(), Some(6));
        manager.move_to_confirmed(&hash(2));
        assert_eq!(manager.next_tracked_nonce(), Some(5));
        manager.remove(&hash(1));
        assert_eq!(manager.next_tracked_nonce(), None);
    }

    #[test]
    fn replaced_transactions_are_dropped() {
        let manager = TransactionManager::new(5);
        manager.add_to_queuing(hash(1), 3, 1.into(), payload(1));
        manager.move_from_queuing_to_pending(&hash(1));
        manager.add_to_queuing(hash(2), 3, 2.into(), payload(1));
        manager.add_to_queuing(hash(3), 4, 1.into(), payload(2));

        assert!(manager.move_to_confirmed(&hash(2)));
        assert_eq!(manager.drop_replaced(3, &hash(2)), 1);
        assert_eq!(manager.state_of(&hash(1)), None);
        assert_eq!(
            manager.state_of(&hash(2)),
            Some(TransactionState::Confirmed)
        );
        assert!(manager.is_in_flight(&hash(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_resolves_on_confirmation() {
        let manager = TransactionManager::new(5);
        manager.add_to_queuing(hash(1), 0, 1.into(), payload(1));
        let waiting = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .wait_for_confirmation(hash(1), Duration::from_secs(60))
                    .await
            }
        });
        tokio::task::yield_now().await;
        manager.move_to_confirmed(&hash(1));
        assert!(waiting.await.unwrap().is_ok());

        // already confirmed
        manager
            .wait_for_confirmation(hash(1), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_times_out() {
        let manager = TransactionManager::new(5);
        manager.add_to_queuing(hash(1), 0, 1.into(), payload(1));
        let result = manager
            .wait_for_confirmation(hash(1), Duration::from_secs(60))
            .await;
        assert!(matches!(
            result,
            Err(mixnet_relay_utils::Error::ConfirmationTimeout(h))
                if h == hash(1)
        ));
        // a late confirmation finds nobody waiting
        manager.move_to_confirmed(&hash(1));
    }
}
