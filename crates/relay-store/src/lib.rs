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

//! # Relay Store Module 🕸️
//!
//! A module for managing the storage of the relay node.
//!
//! ## Overview
//!
//! The store owns the node's view of on-chain state: channels, announced
//! accounts, network registry membership, balances and tickets, together
//! with the cursors the indexer resumes from. The indexer only talks to it
//! through the accessor traits below.
use mixnet_relay_types::{
    AccountEntry, AcknowledgedTicket, Address, Balance, ChannelEntry, Snapshot,
    Ticket, H256, U256,
};
use mixnet_relay_utils::Result;

/// A module for managing in-memory storage of the relay node.
pub mod mem;
/// A module for setting up and managing a [Sled](https://sled.rs)-based database.
#[cfg(feature = "sled")]
pub mod sled;

/// A store that uses [`sled`](https://sled.rs) as the backend.
#[cfg(feature = "sled")]
pub use self::sled::SledStore;
/// A store that uses in memory data structures as the backend.
pub use mem::InMemoryStore;

/// Cursors the indexer resumes from.
pub trait BlockStore: Send + Sync + Clone {
    /// Latest block fully processed by the indexer, if any.
    fn get_latest_block_number(&self) -> Result<Option<u64>>;
    /// Sets the latest processed block.
    fn update_latest_block_number(&self, block_number: u64) -> Result<()>;
    /// Snapshot of the last event applied to the store, if any.
    fn get_latest_confirmed_snapshot(&self) -> Result<Option<Snapshot>>;
    /// Advances the applied-event watermark.
    fn update_latest_confirmed_snapshot(&self, snapshot: &Snapshot)
        -> Result<()>;
}

/// Announced peers.
pub trait AccountStore: Send + Sync + Clone {
    /// Account announced by `address`.
    fn get_account(&self, address: &Address) -> Result<Option<AccountEntry>>;
    /// All announced accounts.
    fn get_accounts(&self) -> Result<Vec<AccountEntry>>;
    /// Upserts an account and advances the watermark atomically.
    fn update_account_and_snapshot(
        &self,
        address: &Address,
        account: &AccountEntry,
        snapshot: &Snapshot,
    ) -> Result<()>;
}

/// Payment channels.
pub trait ChannelStore: Send + Sync + Clone {
    /// Channel with the given id.
    fn get_channel(&self, channel_id: &H256) -> Result<Option<ChannelEntry>>;
    /// Upserts a channel and advances the watermark atomically.
    fn update_channel_and_snapshot(
        &self,
        channel_id: &H256,
        channel: &ChannelEntry,
        snapshot: &Snapshot,
    ) -> Result<()>;
    /// Every channel whose status is `Open`.
    fn get_channels_open(&self) -> Result<Vec<ChannelEntry>>;
    /// Every channel whose source is `source`.
    fn get_channels_from(&self, source: &Address) -> Result<Vec<ChannelEntry>>;
}

/// Tickets received and issued by the node.
pub trait TicketStore: Send + Sync + Clone {
    /// Tickets accepted on receipt and still waiting for their response.
    fn get_pending_tickets(&self, channel_id: &H256) -> Result<Vec<Ticket>>;
    /// Stores a ticket that passed the locked validation.
    fn store_pending_ticket(
        &self,
        channel_id: &H256,
        ticket: &Ticket,
    ) -> Result<()>;
    /// Removes and returns the pending ticket with the given challenge.
    fn remove_pending_ticket(
        &self,
        channel_id: &H256,
        challenge: &H256,
    ) -> Result<Option<Ticket>>;
    /// Winning tickets not yet redeemed, optionally for one channel only.
    fn get_acknowledged_tickets(
        &self,
        channel_id: Option<&H256>,
    ) -> Result<Vec<AcknowledgedTicket>>;
    /// Stores a winning ticket for later redemption.
    fn store_acknowledged_ticket(
        &self,
        channel_id: &H256,
        ticket: &AcknowledgedTicket,
    ) -> Result<()>;
    /// Drops every unredeemed ticket of the channel, returns how many.
    fn delete_acknowledged_tickets_from(&self, channel_id: &H256)
        -> Result<usize>;
    /// Drops the winning tickets of the channel with an index up to
    /// `ticket_index`, which the chain already paid out. Returns how many.
    fn delete_redeemed_tickets(
        &self,
        channel_id: &H256,
        ticket_index: U256,
    ) -> Result<usize>;
    /// Value of tickets this node issued to `counterparty` and that are not
    /// redeemed yet.
    fn get_pending_balance_to(&self, counterparty: &Address)
        -> Result<Balance>;
    /// Records newly issued tickets to `counterparty`.
    fn add_pending_balance_to(
        &self,
        counterparty: &Address,
        amount: Balance,
    ) -> Result<()>;
    /// Reduces the pending balance to `counterparty`, floored at zero, and
    /// advances the watermark atomically. Returns the new pending balance.
    fn resolve_pending_and_snapshot(
        &self,
        counterparty: &Address,
        amount: Balance,
        snapshot: &Snapshot,
    ) -> Result<Balance>;
}

/// Token balance of the node.
pub trait BalanceStore: Send + Sync + Clone {
    /// Tracked token balance.
    fn get_hopr_balance(&self) -> Result<Balance>;
    /// Adds to the tracked balance.
    fn add_hopr_balance(&self, amount: Balance) -> Result<()>;
    /// Subtracts from the tracked balance, floored at zero.
    fn sub_hopr_balance(&self, amount: Balance) -> Result<()>;
    /// Adds `credit` and subtracts `debit` (floored at zero) and advances
    /// the watermark atomically.
    fn update_hopr_balance_and_snapshot(
        &self,
        credit: Balance,
        debit: Balance,
        snapshot: &Snapshot,
    ) -> Result<()>;
}

/// Network registry membership and eligibility.
pub trait NetworkRegistryStore: Send + Sync + Clone {
    /// Whether the registry gate is enabled. Defaults to enabled.
    fn is_network_registry_enabled(&self) -> Result<bool>;
    /// Turns the registry gate on or off.
    fn set_network_registry_enabled(&self, enabled: bool) -> Result<()>;
    /// Registers `peer_id` under `account`.
    fn add_to_network_registry(
        &self,
        peer_id: &str,
        account: &Address,
    ) -> Result<()>;
    /// Deregisters `peer_id`.
    fn remove_from_network_registry(&self, peer_id: &str) -> Result<()>;
    /// Account `peer_id` is registered under.
    fn get_account_of_peer(&self, peer_id: &str) -> Result<Option<Address>>;
    /// Peers registered under `account`.
    fn get_peers_of_account(&self, account: &Address) -> Result<Vec<String>>;
    /// Sets the eligibility of `account`.
    fn set_eligible(&self, account: &Address, eligible: bool) -> Result<()>;
    /// Whether `account` is eligible.
    fn is_eligible(&self, account: &Address) -> Result<bool>;
}

/// Everything the indexer and the ticket validation need from a store.
pub trait ChainStore:
    BlockStore
    + AccountStore
    + ChannelStore
    + TicketStore
    + BalanceStore
    + NetworkRegistryStore
    + 'static
{
}

impl<T> ChainStore for T where
    T: BlockStore
        + AccountStore
        + ChannelStore
        + TicketStore
        + BalanceStore
        + NetworkRegistryStore
        + 'static
{
}
