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

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;

use mixnet_relay_types::{
    AccountEntry, AcknowledgedTicket, Address, Balance, ChannelEntry,
    ChannelStatus, Snapshot, Ticket, H256, U256,
};
use mixnet_relay_utils::Error;

use super::{
    AccountStore, BalanceStore, BlockStore, ChannelStore,
    NetworkRegistryStore, TicketStore,
};

const META_TREE: &str = "meta";
const ACCOUNTS_TREE: &str = "accounts";
const CHANNELS_TREE: &str = "channels";
const PENDING_TICKETS_TREE: &str = "pending_tickets";
const ACKNOWLEDGED_TICKETS_TREE: &str = "acknowledged_tickets";
const PENDING_BALANCES_TREE: &str = "pending_balances";
const REGISTRY_TREE: &str = "network_registry";
const ELIGIBILITY_TREE: &str = "eligibility";

const LATEST_BLOCK_KEY: &[u8] = b"latest_block_number";
const LATEST_SNAPSHOT_KEY: &[u8] = b"latest_confirmed_snapshot";
const HOPR_BALANCE_KEY: &[u8] = b"hopr_balance";
const REGISTRY_ENABLED_KEY: &[u8] = b"network_registry_enabled";

/// SledStore is a store that keeps the node's chain state in a
/// [Sled](https://sled.rs)-based database.
///
/// Values are JSON encoded, one named tree per kind of entry.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    // keeps the directory of a temporary store alive.
    _dir: Option<Arc<tempfile::TempDir>>,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Create a new SledStore.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .mode(sled::Mode::HighThroughput)
            .open()?;
        Ok(Self { db, _dir: None })
    }

    /// Creates a temporary SledStore, removed when the last clone is
    /// dropped.
    pub fn temporary() -> crate::Result<Self> {
        let dir = tempfile::tempdir()?;
        let db = sled::Config::new()
            .path(dir.path())
            .temporary(true)
            .open()?;
        Ok(Self {
            db,
            _dir: Some(Arc::new(dir)),
        })
    }

    /// Gets the total amount of data stored on disk
    pub fn get_data_stored_size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or_default()
    }

    fn get_value<T: DeserializeOwned>(
        &self,
        tree: &str,
        key: impl AsRef<[u8]>,
    ) -> crate::Result<Option<T>> {
        let tree = self.db.open_tree(tree)?;
        match tree.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_value<T: Serialize>(
        &self,
        tree: &str,
        key: impl AsRef<[u8]>,
        value: &T,
    ) -> crate::Result<()> {
        let tree = self.db.open_tree(tree)?;
        tree.insert(key.as_ref(), serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn values<T: DeserializeOwned>(
        &self,
        tree: &str,
        prefix: &[u8],
    ) -> crate::Result<Vec<T>> {
        let tree = self.db.open_tree(tree)?;
        tree.scan_prefix(prefix)
            .values()
            .map(|v| Ok(serde_json::from_slice(&v?)?))
            .collect()
    }

    /// Writes `value` under `key` in `tree` and the watermark in the same
    /// transaction.
    fn put_with_snapshot<T: Serialize>(
        &self,
        tree: &str,
        key: &[u8],
        value: &T,
        snapshot: &Snapshot,
    ) -> crate::Result<()> {
        let tree = self.db.open_tree(tree)?;
        let meta = self.db.open_tree(META_TREE)?;
        let value = serde_json::to_vec(value)?;
        let snapshot = serde_json::to_vec(snapshot)?;
        (&tree, &meta).transaction(|(tree, meta)| {
            tree.insert(key, value.as_slice())?;
            meta.insert(LATEST_SNAPSHOT_KEY, snapshot.as_slice())?;
            Ok::<_, ConflictableTransactionError<std::io::Error>>(())
        })?;
        Ok(())
    }

    fn update_balance(
        &self,
        tree: &str,
        key: &[u8],
        f: impl Fn(Balance) -> Balance,
    ) -> crate::Result<Balance> {
        let current: Balance = self.get_value(tree, key)?.unwrap_or_default();
        let next = f(current);
        self.put_value(tree, key, &next)?;
        Ok(next)
    }

    /// Rewrites the balance under `key` in `tree` and the watermark in the
    /// same transaction.
    fn update_balance_with_snapshot(
        &self,
        tree: &str,
        key: &[u8],
        f: impl Fn(Balance) -> Balance,
        snapshot: &Snapshot,
    ) -> crate::Result<Balance> {
        let tree = self.db.open_tree(tree)?;
        let meta = self.db.open_tree(META_TREE)?;
        let snapshot = serde_json::to_vec(snapshot)?;
        let next = (&tree, &meta).transaction(|(tree, meta)| {
            let current: Balance = match tree.get(key)? {
                Some(bytes) => {
                    serde_json::from_slice(&bytes).map_err(abort_json)?
                }
                None => Balance::zero(),
            };
            let next = f(current);
            let encoded = serde_json::to_vec(&next).map_err(abort_json)?;
            tree.insert(key, encoded)?;
            meta.insert(LATEST_SNAPSHOT_KEY, snapshot.as_slice())?;
            Ok::<_, ConflictableTransactionError<Error>>(next)
        })?;
        Ok(next)
    }
}

fn abort_json(e: serde_json::Error) -> ConflictableTransactionError<Error> {
    ConflictableTransactionError::Abort(e.into())
}

fn ticket_key(channel_id: &H256, challenge: &H256) -> Vec<u8> {
    [channel_id.as_bytes(), challenge.as_bytes()].concat()
}

impl BlockStore for SledStore {
    fn get_latest_block_number(&self) -> crate::Result<Option<u64>> {
        self.get_value(META_TREE, LATEST_BLOCK_KEY)
    }

    #[tracing::instrument(skip(self))]
    fn update_latest_block_number(
        &self,
        block_number: u64,
    ) -> crate::Result<()> {
        self.put_value(META_TREE, LATEST_BLOCK_KEY, &block_number)
    }

    fn get_latest_confirmed_snapshot(&self) -> crate::Result<Option<Snapshot>> {
        self.get_value(META_TREE, LATEST_SNAPSHOT_KEY)
    }

    #[tracing::instrument(skip(self))]
    fn update_latest_confirmed_snapshot(
        &self,
        snapshot: &Snapshot,
    ) -> crate::Result<()> {
        self.put_value(META_TREE, LATEST_SNAPSHOT_KEY, snapshot)
    }
}

impl AccountStore for SledStore {
    fn get_account(
        &self,
        address: &Address,
    ) -> crate::Result<Option<AccountEntry>> {
        self.get_value(ACCOUNTS_TREE, address.as_bytes())
    }

    fn get_accounts(&self) -> crate::Result<Vec<AccountEntry>> {
        self.values(ACCOUNTS_TREE, &[])
    }

    #[tracing::instrument(skip(self, account))]
    fn update_account_and_snapshot(
        &self,
        address: &Address,
        account: &AccountEntry,
        snapshot: &Snapshot,
    ) -> crate::Result<()> {
        self.put_with_snapshot(
            ACCOUNTS_TREE,
            address.as_bytes(),
            account,
            snapshot,
        )
    }
}

impl ChannelStore for SledStore {
    fn get_channel(
        &self,
        channel_id: &H256,
    ) -> crate::Result<Option<ChannelEntry>> {
        self.get_value(CHANNELS_TREE, channel_id.as_bytes())
    }

    #[tracing::instrument(skip(self, channel))]
    fn update_channel_and_snapshot(
        &self,
        channel_id: &H256,
        channel: &ChannelEntry,
        snapshot: &Snapshot,
    ) -> crate::Result<()> {
        self.put_with_snapshot(
            CHANNELS_TREE,
            channel_id.as_bytes(),
            channel,
            snapshot,
        )
    }

    fn get_channels_open(&self) -> crate::Result<Vec<ChannelEntry>> {
        let channels: Vec<ChannelEntry> = self.values(CHANNELS_TREE, &[])?;
        Ok(channels
            .into_iter()
            .filter(|c| c.status == ChannelStatus::Open)
            .collect())
    }

    fn get_channels_from(
        &self,
        source: &Address,
    ) -> crate::Result<Vec<ChannelEntry>> {
        let channels: Vec<ChannelEntry> = self.values(CHANNELS_TREE, &[])?;
        Ok(channels
            .into_iter()
            .filter(|c| &c.source == source)
            .collect())
    }
}

impl TicketStore for SledStore {
    fn get_pending_tickets(
        &self,
        channel_id: &H256,
    ) -> crate::Result<Vec<Ticket>> {
        self.values(PENDING_TICKETS_TREE, channel_id.as_bytes())
    }

    fn store_pending_ticket(
        &self,
        channel_id: &H256,
        ticket: &Ticket,
    ) -> crate::Result<()> {
        self.put_value(
            PENDING_TICKETS_TREE,
            ticket_key(channel_id, &ticket.challenge),
            ticket,
        )
    }

    fn remove_pending_ticket(
        &self,
        channel_id: &H256,
        challenge: &H256,
    ) -> crate::Result<Option<Ticket>> {
        let tree = self.db.open_tree(PENDING_TICKETS_TREE)?;
        match tree.remove(ticket_key(channel_id, challenge))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_acknowledged_tickets(
        &self,
        channel_id: Option<&H256>,
    ) -> crate::Result<Vec<AcknowledgedTicket>> {
        let prefix = channel_id.map(|id| id.as_bytes()).unwrap_or_default();
        self.values(ACKNOWLEDGED_TICKETS_TREE, prefix)
    }

    fn store_acknowledged_ticket(
        &self,
        channel_id: &H256,
        ticket: &AcknowledgedTicket,
    ) -> crate::Result<()> {
        self.put_value(
            ACKNOWLEDGED_TICKETS_TREE,
            ticket_key(channel_id, &ticket.ticket.challenge),
            ticket,
        )
    }

    #[tracing::instrument(skip(self))]
    fn delete_acknowledged_tickets_from(
        &self,
        channel_id: &H256,
    ) -> crate::Result<usize> {
        let mut removed = 0;
        for name in [PENDING_TICKETS_TREE, ACKNOWLEDGED_TICKETS_TREE] {
            let tree = self.db.open_tree(name)?;
            for key in tree.scan_prefix(channel_id.as_bytes()).keys() {
                if tree.remove(key?)?.is_some() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    #[tracing::instrument(skip(self))]
    fn delete_redeemed_tickets(
        &self,
        channel_id: &H256,
        ticket_index: U256,
    ) -> crate::Result<usize> {
        let tree = self.db.open_tree(ACKNOWLEDGED_TICKETS_TREE)?;
        let mut removed = 0;
        for entry in tree.scan_prefix(channel_id.as_bytes()) {
            let (key, value) = entry?;
            let acked: AcknowledgedTicket = serde_json::from_slice(&value)?;
            if acked.ticket.index <= ticket_index
                && tree.remove(key)?.is_some()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn get_pending_balance_to(
        &self,
        counterparty: &Address,
    ) -> crate::Result<Balance> {
        Ok(self
            .get_value(PENDING_BALANCES_TREE, counterparty.as_bytes())?
            .unwrap_or_default())
    }

    fn add_pending_balance_to(
        &self,
        counterparty: &Address,
        amount: Balance,
    ) -> crate::Result<()> {
        self.update_balance(
            PENDING_BALANCES_TREE,
            counterparty.as_bytes(),
            |b| b.saturating_add(amount),
        )?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn resolve_pending_and_snapshot(
        &self,
        counterparty: &Address,
        amount: Balance,
        snapshot: &Snapshot,
    ) -> crate::Result<Balance> {
        self.update_balance_with_snapshot(
            PENDING_BALANCES_TREE,
            counterparty.as_bytes(),
            |b| b.saturating_sub(amount),
            snapshot,
        )
    }
}

impl BalanceStore for SledStore {
    fn get_hopr_balance(&self) -> crate::Result<Balance> {
        Ok(self
            .get_value(META_TREE, HOPR_BALANCE_KEY)?
            .unwrap_or_default())
    }

    fn add_hopr_balance(&self, amount: Balance) -> crate::Result<()> {
        self.update_balance(META_TREE, HOPR_BALANCE_KEY, |b| {
            b.saturating_add(amount)
        })?;
        Ok(())
    }

    fn sub_hopr_balance(&self, amount: Balance) -> crate::Result<()> {
        self.update_balance(META_TREE, HOPR_BALANCE_KEY, |b| {
            b.saturating_sub(amount)
        })?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn update_hopr_balance_and_snapshot(
        &self,
        credit: Balance,
        debit: Balance,
        snapshot: &Snapshot,
    ) -> crate::Result<()> {
        let meta = self.db.open_tree(META_TREE)?;
        let snapshot = serde_json::to_vec(snapshot)?;
        meta.transaction(|meta| {
            let current: Balance = match meta.get(HOPR_BALANCE_KEY)? {
                Some(bytes) => {
                    serde_json::from_slice(&bytes).map_err(abort_json)?
                }
                None => Balance::zero(),
            };
            let next = current.saturating_add(credit).saturating_sub(debit);
            let encoded = serde_json::to_vec(&next).map_err(abort_json)?;
            meta.insert(HOPR_BALANCE_KEY, encoded)?;
            meta.insert(LATEST_SNAPSHOT_KEY, snapshot.as_slice())?;
            Ok::<_, ConflictableTransactionError<Error>>(())
        })?;
        Ok(())
    }
}

impl NetworkRegistryStore for SledStore {
    fn is_network_registry_enabled(&self) -> crate::Result<bool> {
        Ok(self
            .get_value(META_TREE, REGISTRY_ENABLED_KEY)?
            .unwrap_or(true))
    }

    fn set_network_registry_enabled(
        &self,
        enabled: bool,
    ) -> crate::Result<()> {
        self.put_value(META_TREE, REGISTRY_ENABLED_KEY, &enabled)
    }

    fn add_to_network_registry(
        &self,
        peer_id: &str,
        account: &Address,
    ) -> crate::Result<()> {
        self.put_value(REGISTRY_TREE, peer_id.as_bytes(), account)
    }

    fn remove_from_network_registry(&self, peer_id: &str) -> crate::Result<()> {
        let tree = self.db.open_tree(REGISTRY_TREE)?;
        tree.remove(peer_id.as_bytes())?;
        Ok(())
    }

    fn get_account_of_peer(
        &self,
        peer_id: &str,
    ) -> crate::Result<Option<Address>> {
        self.get_value(REGISTRY_TREE, peer_id.as_bytes())
    }

    fn get_peers_of_account(
        &self,
        account: &Address,
    ) -> crate::Result<Vec<String>> {
        let tree = self.db.open_tree(REGISTRY_TREE)?;
        let mut peers = Vec::new();
        for entry in tree.iter() {
            let (peer, value) = entry?;
            let registered: Address = serde_json::from_slice(&value)?;
            if &registered == account {
                peers.push(String::from_utf8_lossy(&peer).into_owned());
            }
        }
        Ok(peers)
    }

    fn set_eligible(
        &self,
        account: &Address,
        eligible: bool,
    ) -> crate::Result<()> {
        self.put_value(ELIGIBILITY_TREE, account.as_bytes(), &eligible)
    }

    fn is_eligible(&self, account: &Address) -> crate::Result<bool> {
        Ok(self
            .get_value(ELIGIBILITY_TREE, account.as_bytes())?
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    #[test]
    fn block_cursors() {
        conformance::block_cursors(&SledStore::temporary().unwrap());
    }

    #[test]
    fn channels_and_snapshot() {
        conformance::channels_and_snapshot(&SledStore::temporary().unwrap());
    }

    #[test]
    fn tickets_and_pending_balances() {
        let store = SledStore::temporary().unwrap();
        conformance::tickets_and_pending_balances(&store);
    }

    #[test]
    fn redeemed_tickets() {
        conformance::redeemed_tickets(&SledStore::temporary().unwrap());
    }

    #[test]
    fn balances_and_registry() {
        let store = SledStore::temporary().unwrap();
        conformance::balances_and_registry(&store);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.update_latest_block_number(7).unwrap();
            let channel = conformance::channel(1, 2);
            store
                .update_channel_and_snapshot(
                    &channel.get_id(),
                    &channel,
                    &Snapshot::new(7, 0, 0),
                )
                .unwrap();
            store.db.flush().unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.get_latest_block_number().unwrap(), Some(7));
        assert_eq!(
            store.get_latest_confirmed_snapshot().unwrap(),
            Some(Snapshot::new(7, 0, 0))
        );
        let id = conformance::channel(1, 2).get_id();
        assert!(store.get_channel(&id).unwrap().is_some());
    }
}
