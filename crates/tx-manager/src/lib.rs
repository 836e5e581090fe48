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
//! # Transaction Manager Module 🕸️
//!
//! Tracks the node's own outgoing transactions from signing to finality.
//!
//! ## Overview
//!
//! Every transaction goes `Queuing -> Pending -> Mined -> Confirmed`:
//!
//! * `Queuing`: signed, not (successfully) broadcast yet.
//! * `Pending`: accepted by the provider.
//! * `Mined`: seen in a block that is not final yet.
//! * `Confirmed`: seen in a final block. Only now the payload is dropped.
//!
//! The chain indexer settles transactions as blocks arrive and resends the
//! queued ones when the provider recovers or the balance allows it.

/// Signing and broadcasting of payloads.
pub mod submit;
/// In-memory lifecycle bookkeeping.
pub mod tracker;
/// Timeout-bound waiting for confirmations.
pub mod waiter;

pub use submit::{SendOutcome, SignedTransaction, TransactionSubmitter};
pub use tracker::TransactionManager;
pub use waiter::ConfirmationWaiter;

use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// What a transaction does, independent of nonce and fees.
///
/// Two payloads are the same transaction iff they are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionPayload {
    /// Called contract or receiver.
    pub to: Address,
    /// Call data.
    pub data: Bytes,
    /// Native value sent along.
    pub value: U256,
}

/// Lifecycle state of a tracked transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Signed, waiting to be broadcast.
    Queuing,
    /// Broadcast, waiting to be mined.
    Pending,
    /// Mined in a block that is not final yet.
    Mined,
    /// Mined in a final block.
    Confirmed,
}

/// A tracked transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction hash.
    pub hash: H256,
    /// Account nonce the transaction uses.
    pub nonce: u64,
    /// Milliseconds since the unix epoch when it entered `Pending`, zero
    /// before.
    pub created_at: u64,
    /// Max priority fee per gas it was signed with.
    pub max_priority: U256,
    /// Where in the lifecycle it is.
    pub state: TransactionState,
}

/// Outcome of looking for an already tracked copy of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistenceCheck {
    /// Already mined, or pending with at least the requested fee. Nothing
    /// to send.
    Exists(H256),
    /// Pending or queuing with a strictly lower fee. It may be replaced by
    /// a transaction with the same nonce and the higher fee.
    Underpriced {
        /// The tracked transaction.
        hash: H256,
        /// Its nonce, to be reused by the replacement.
        nonce: u64,
    },
    /// Not tracked.
    NotFound,
}
