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

#![warn(missing_docs)]
//! # Chain Indexer Module 🕸️
//!
//! The relay node's authoritative view of on-chain payment channel state.
//!
//! ## Overview
//!
//! Past events are backfilled by the [`collector`], live block numbers come
//! from the [`source`], and the [`sequencer`] merges both into one order.
//! Every sequenced block runs the per-block pipeline of the [`Indexer`]:
//! logs are decoded once into [`events::ChainEventKind`], admitted through
//! the snapshot watermark into the [`buffer`], and applied by the
//! [`dispatcher`] once they are `max-confirmations` blocks deep.
//!
//! Consumers follow what happened through [`IndexerNotification`]s.

/// Unconfirmed event buffer and snapshot watermark.
pub mod buffer;
/// Chunked backfill of historical logs.
pub mod collector;
/// Applies confirmed events to the store.
pub mod dispatcher;
/// `ethers` backed [`source::ChainSource`].
pub mod ethers_source;
/// Decoding of raw logs into chain events.
pub mod events;
/// The per-block pipeline and its lifecycle.
pub mod indexer;
/// Backlog first ordering of block numbers.
pub mod sequencer;
/// What the indexer needs from the chain.
pub mod source;
/// In-memory chain and log encoders for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use dispatcher::EventDispatcher;
pub use ethers_source::EthersChainSource;
pub use indexer::{Indexer, IndexerSettings};
pub use source::{ChainSource, ChainTransaction, LogFilter, RawLog};

use mixnet_relay_types::{AccountEntry, Address, ChannelEntry, H256, U256};

/// Lifecycle state of an [`Indexer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerStatus {
    /// Not running.
    Stopped,
    /// Backfilling, live blocks are queued.
    Starting,
    /// Processing live blocks.
    Started,
    /// Recovering from a provider failure.
    Restarting,
}

/// Everything the indexer tells its consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexerNotification {
    /// The indexer changed its lifecycle state.
    StatusChanged(IndexerStatus),
    /// A block went through the per-block pipeline.
    BlockProcessed(u64),
    /// A peer announced its key and address.
    AccountAnnounced(AccountEntry),
    /// Any channel changed.
    ChannelUpdated(ChannelEntry),
    /// A channel this node is a party of changed.
    OwnChannelUpdated(ChannelEntry),
    /// A channel towards this node waits for our commitment.
    ChannelWaitingForCommitment(ChannelEntry),
    /// A channel got closed and its unredeemed tickets were dropped.
    ChannelClosed {
        /// The channel in its closed state.
        channel: ChannelEntry,
        /// How many tickets of the channel were deleted.
        deleted_tickets: usize,
    },
    /// A ticket of a channel this node is a party of got redeemed.
    TicketRedeemed {
        /// Channel the ticket belongs to.
        channel_id: H256,
        /// Redeemed amount.
        amount: U256,
    },
    /// The network registry eligibility of an account changed.
    EligibilityUpdated {
        /// The account.
        account: Address,
        /// Whether it may join the network.
        eligible: bool,
    },
    /// A peer got registered to an account.
    PeerRegistered {
        /// Peer id as announced.
        peer_id: String,
        /// Account that registered it.
        account: Address,
    },
    /// A peer got removed from the registry.
    PeerDeregistered {
        /// Peer id as announced.
        peer_id: String,
    },
    /// The network registry got enabled or disabled.
    NetworkRegistryStatusChanged(bool),
}
