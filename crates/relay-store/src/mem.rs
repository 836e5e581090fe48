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

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use mixnet_relay_types::{
    AccountEntry, AcknowledgedTicket, Address, Balance, ChannelEntry,
    ChannelStatus, Snapshot, Ticket, H256, U256,
};

use super::{
    AccountStore, BalanceStore, BlockStore, ChannelStore,
    NetworkRegistryStore, TicketStore,
};

type TicketMap<T> = HashMap<H256, BTreeMap<H256, T>>;

/// InMemoryStore keeps the node's chain state in memory.
#[derive(Clone)]
pub struct InMemoryStore {
    latest_block_number: Arc<RwLock<Option<u64>>>,
    latest_snapshot: Arc<RwLock<Option<Snapshot>>>,
    accounts: Arc<RwLock<HashMap<Address, AccountEntry>>>,
    channels: Arc<RwLock<HashMap<H256, ChannelEntry>>>,
    pending_tickets: Arc<RwLock<TicketMap<Ticket>>>,
    acknowledged_tickets: Arc<RwLock<TicketMap<AcknowledgedTicket>>>,
    pending_balances: Arc<RwLock<HashMap<Address, Balance>>>,
    hopr_balance: Arc<RwLock<Balance>>,
    network_registry_enabled: Arc<RwLock<bool>>,
    registered_peers: Arc<RwLock<HashMap<String, Address>>>,
    eligible: Arc<RwLock<HashMap<Address, bool>>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            latest_block_number: Default::default(),
            latest_snapshot: Default::default(),
            accounts: Default::default(),
            channels: Default::default(),
            pending_tickets: Default::default(),
            acknowledged_tickets: Default::default(),
            pending_balances: Default::default(),
            hopr_balance: Default::default(),
            network_registry_enabled: Arc::new(RwLock::new(true)),
            registered_peers: Default::default(),
            eligible: Default::default(),
        }
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish()
    }
}

impl BlockStore for InMemoryStore {
    fn get_latest_block_number(&self) -> crate::Result<Option<u64>> {
        Ok(*self.latest_block_number.read())
    }

    #[tracing::instrument(skip(self))]
    fn update_latest_block_number(
        &self,
        block_number: u64,
    ) -> crate::Result<()> {
        *self.latest_block_number.write() = Some(block_number);
        Ok(())
    }

    fn get_latest_confirmed_snapshot(&self) -> crate::Result<Option<Snapshot>> {
        Ok(*self.latest_snapshot.read())
    }

    #[tracing::instrument(skip(self))]
    fn update_latest_confirmed_snapshot(
        &self,
        snapshot: &Snapshot,
    ) -> crate::Result<()> {
        *self.latest_snapshot.write() = Some(*snapshot);
        Ok(())
    }
}

impl AccountStore for InMemoryStore {
    fn get_account(
        &self,
        address: &Address,
    ) -> crate::Result<Option<AccountEntry>> {
        Ok(self.accounts.read().get(address).cloned())
    }

    fn get_accounts(&self) -> crate::Result<Vec<AccountEntry>> {
        Ok(self.accounts.read().values().cloned().collect())
    }

    #[tracing::instrument(skip(self, account))]
    fn update_account_and_snapshot(
        &self,
        address: &Address,
        account: &AccountEntry,
        snapshot: &Snapshot,
    ) -> crate::Result<()> {
        let mut accounts = self.accounts.write();
        let mut latest = self.latest_snapshot.write();
        accounts.insert(*address, account.clone());
        *latest = Some(*snapshot);
        Ok(())
    }
}

impl ChannelStore for InMemoryStore {
    fn get_channel(
        &self,
        channel_id: &H256,
    ) -> crate::Result<Option<ChannelEntry>> {
        Ok(self.channels.read().get(channel_id).cloned())
    }

    #[tracing::instrument(skip(self, channel))]
    fn update_channel_and_snapshot(
        &self,
        channel_id: &H256,
        channel: &ChannelEntry,
        snapshot: &Snapshot,
    ) -> crate::Result<()> {
        let mut channels = self.channels.write();
        let mut latest = self.latest_snapshot.write();
        channels.insert(*channel_id, channel.clone());
        *latest = Some(*snapshot);
        Ok(())
    }

    fn get_channels_open(&self) -> crate::Result<Vec<ChannelEntry>> {
        Ok(self
            .channels
            .read()
            .values()
            .filter(|c| c.status == ChannelStatus::Open)
            .cloned()
            .collect())
    }

    fn get_channels_from(
        &self,
        source: &Address,
    ) -> crate::Result<Vec<ChannelEntry>> {
        Ok(self
            .channels
            .read()
            .values()
            .filter(|c| &c.source == source)
            .cloned()
            .collect())
    }
}

impl TicketStore for InMemoryStore {
    fn get_pending_tickets(
        &self,
        channel_id: &H256,
    ) -> crate::Result<Vec<Ticket>> {
        Ok(self
            .pending_tickets
            .read()
            .get(channel_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    fn store_pending_ticket(
        &self,
        channel_id: &H256,
        ticket: &Ticket,
    ) -> crate::Result<()> {
        self.pending_tickets
            .write()
            .entry(*channel_id)
            .or_default()
            .insert(ticket.challenge, ticket.clone());
        Ok(())
    }

    fn remove_pending_ticket(
        &self,
        channel_id: &H256,
        challenge: &H256,
    ) -> crate::Result<Option<Ticket>> {
        Ok(self
            .pending_tickets
            .write()
            .get_mut(channel_id)
            .and_then(|t| t.remove(challenge)))
    }

    fn get_acknowledged_tickets(
        &self,
        channel_id: Option<&H256>,
    ) -> crate::Result<Vec<AcknowledgedTicket>> {
        let guard = self.acknowledged_tickets.read();
        let tickets = match channel_id {
            Some(id) => guard
                .get(id)
                .map(|t| t.values().cloned().collect())
                .unwrap_or_default(),
            None => guard
                .values()
                .flat_map(|t| t.values().cloned())
                .collect(),
        };
        Ok(tickets)
    }

    fn store_acknowledged_ticket(
        &self,
        channel_id: &H256,
        ticket: &AcknowledgedTicket,
    ) -> crate::Result<()> {
        self.acknowledged_tickets
            .write()
            .entry(*channel_id)
            .or_default()
            .insert(ticket.ticket.challenge, ticket.clone());
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn delete_acknowledged_tickets_from(
        &self,
        channel_id: &H256,
    ) -> crate::Result<usize> {
        let pending = self
            .pending_tickets
            .write()
            .remove(channel_id)
            .map(|t| t.len())
            .unwrap_or_default();
        let acknowledged = self
            .acknowledged_tickets
            .write()
            .remove(channel_id)
            .map(|t| t.len())
            .unwrap_or_default();
        Ok(pending + acknowledged)
    }

    #[tracing::instrument(skip(self))]
    fn delete_redeemed_tickets(
        &self,
        channel_id: &H256,
        ticket_index: U256,
    ) -> crate::Result<usize> {
        let mut guard = self.acknowledged_tickets.write();
        let Some(tickets) = guard.get_mut(channel_id) else {
            return Ok(0);
        };
        let before = tickets.len();
        tickets.retain(|_, t| t.ticket.index > ticket_index);
        Ok(before - tickets.len())
    }

    fn get_pending_balance_to(
        &self,
        counterparty: &Address,
    ) -> crate::Result<Balance> {
        Ok(self
            .pending_balances
            .read()
            .get(counterparty)
            .copied()
            .unwrap_or_default())
    }

    fn add_pending_balance_to(
        &self,
        counterparty: &Address,
        amount: Balance,
    ) -> crate::Result<()> {
        let mut guard = self.pending_balances.write();
        let entry = guard.entry(*counterparty).or_default();
        *entry = entry.saturating_add(amount);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn resolve_pending_and_snapshot(
        &self,
        counterparty: &Address,
        amount: Balance,
        snapshot: &Snapshot,
    ) -> crate::Result<Balance> {
        let mut guard = self.pending_balances.write();
        let mut latest = self.latest_snapshot.write();
        let entry = guard.entry(*counterparty).or_default();
        *entry = entry.saturating_sub(amount);
        *latest = Some(*snapshot);
        Ok(*entry)
    }
}

impl BalanceStore for InMemoryStore {
    fn get_hopr_balance(&self) -> crate::Result<Balance> {
        Ok(*self.hopr_balance.read())
    }

    fn add_hopr_balance(&self, amount: Balance) -> crate::Result<()> {
        let mut guard = self.hopr_balance.write();
        *guard = guard.saturating_add(amount);
        Ok(())
    }

    fn sub_hopr_balance(&self, amount: Balance) -> crate::Result<()> {
        let mut guard = self.hopr_balance.write();
        *guard = guard.saturating_sub(amount);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn update_hopr_balance_and_snapshot(
        &self,
        credit: Balance,
        debit: Balance,
        snapshot: &Snapshot,
    ) -> crate::Result<()> {
        let mut guard = self.hopr_balance.write();
        let mut latest = self.latest_snapshot.write();
        *guard = guard.saturating_add(credit).saturating_sub(debit);
        *latest = Some(*snapshot);
        Ok(())
    }
}

impl NetworkRegistryStore for InMemoryStore {
    fn is_network_registry_enabled(&self) -> crate::Result<bool> {
        Ok(*self.network_registry_enabled.read())
    }

    fn set_network_registry_enabled(
        &self,
        enabled: bool,
    ) -> crate::Result<()> {
        *self.network_registry_enabled.write() = enabled;
        Ok(())
    }

    fn add_to_network_registry(
        &self,
        peer_id: &str,
        account: &Address,
    ) -> crate::Result<()> {
        self.registered_peers
            .write()
            .insert(peer_id.to_owned(), *account);
        Ok(())
    }

    fn remove_from_network_registry(&self, peer_id: &str) -> crate::Result<()> {
        self.registered_peers.write().remove(peer_id);
        Ok(())
    }

    fn get_account_of_peer(
        &self,
        peer_id: &str,
    ) -> crate::Result<Option<Address>> {
        Ok(self.registered_peers.read().get(peer_id).copied())
    }

    fn get_peers_of_account(
        &self,
        account: &Address,
    ) -> crate::Result<Vec<String>> {
        let mut peers: Vec<String> = self
            .registered_peers
            .read()
            .iter()
            .filter(|(_, a)| *a == account)
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        Ok(peers)
    }

    fn set_eligible(
        &self,
        account: &Address,
        eligible: bool,
    ) -> crate::Result<()> {
        self.eligible.write().insert(*account, eligible);
        Ok(())
    }

    fn is_eligible(&self, account: &Address) -> crate::Result<bool> {
        Ok(self.eligible.read().get(account).copied().unwrap_or(false))
    }
}
