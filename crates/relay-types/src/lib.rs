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

//! # Relay Types Module 🕸️
//!
//! Domain types shared by the indexer, the ticket validation and the
//! transaction tracker, plus config wrapper types that support reading
//! secrets from the environment.

#![warn(missing_docs)]

/// Announced peer accounts.
pub mod account;
/// Payment channels and their status machine.
pub mod channels;
/// A module for managing the private key.
pub mod private_key;
/// A module for managing the RPC URL.
pub mod rpc_url;
/// Watermark used to order and deduplicate chain events.
pub mod snapshot;
/// Probabilistic payment tickets.
pub mod tickets;

pub use account::{AccountEntry, PublicKey};
pub use channels::{generate_channel_id, ChannelEntry, ChannelStatus};
pub use snapshot::Snapshot;
pub use tickets::{AcknowledgedTicket, Ticket};

pub use ethers::types::{Address, H256, U256};

/// Token amounts as used on chain.
pub type Balance = U256;
