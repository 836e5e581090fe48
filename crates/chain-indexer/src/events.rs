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

use ethers::abi::{self, ParamType, Token};
use ethers::utils::keccak256;
use mixnet_relay_config::ContractsConfig;
use mixnet_relay_types::{
    Address, ChannelEntry, ChannelStatus, Snapshot, H256, U256,
};
use mixnet_relay_utils::Error;

use crate::source::{LogFilter, RawLog};

/// Event signatures of the watched contracts.
pub mod signatures {
    /// `account` is indexed.
    pub const ANNOUNCEMENT: &str = "Announcement(address,bytes,bytes)";
    /// `source` and `destination` are indexed.
    pub const CHANNEL_UPDATED: &str = "ChannelUpdated(address,address,\
        (uint256,bytes32,uint256,uint256,uint8,uint256,uint32))";
    /// `source` and `destination` are indexed.
    pub const TICKET_REDEEMED: &str = "TicketRedeemed(address,address,\
        bytes32,uint256,uint256,bytes32,uint256,uint256,bytes)";
    /// `from` and `to` are indexed.
    pub const TRANSFER: &str = "Transfer(address,address,uint256)";
    /// Both parameters are indexed.
    pub const ELIGIBILITY_UPDATED: &str = "EligibilityUpdated(address,bool)";
    /// `account` is indexed.
    pub const REGISTERED: &str = "Registered(address,string)";
    /// `account` is indexed.
    pub const DEREGISTERED: &str = "Deregistered(address,string)";
    /// `account` is indexed.
    pub const REGISTERED_BY_OWNER: &str = "RegisteredByOwner(address,string)";
    /// `account` is indexed.
    pub const DEREGISTERED_BY_OWNER: &str =
        "DeregisteredByOwner(address,string)";
    /// The flag is indexed.
    pub const ENABLED_NETWORK_REGISTRY: &str = "EnabledNetworkRegistry(bool)";
}

/// `topic0` of an event signature.
pub fn topic(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}

/// An event the indexer knows how to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEventKind {
    /// A peer published its public key and multiaddress.
    Announcement {
        /// Announcing account.
        account: Address,
        /// SEC1 encoded public key, unchecked.
        public_key: Vec<u8>,
        /// Binary multiaddress, unchecked.
        multiaddr: Vec<u8>,
    },
    /// The full new state of a channel.
    ChannelUpdated(ChannelEntry),
    /// A ticket got redeemed on chain.
    TicketRedeemed {
        /// Issuer of the ticket.
        source: Address,
        /// Redeemer of the ticket.
        destination: Address,
        /// Index of the redeemed ticket.
        ticket_index: U256,
        /// Paid amount.
        amount: U256,
    },
    /// Token transfer.
    Transfer {
        /// Sender.
        from: Address,
        /// Receiver.
        to: Address,
        /// Amount.
        value: U256,
    },
    /// Registry eligibility of an account changed.
    EligibilityUpdated {
        /// The account.
        account: Address,
        /// New eligibility.
        eligible: bool,
    },
    /// A peer id got registered, by its account or by the registry owner.
    Registered {
        /// The account.
        account: Address,
        /// Peer id, unchecked.
        peer_id: String,
    },
    /// A peer id got deregistered, by its account or by the registry owner.
    Deregistered {
        /// The account.
        account: Address,
        /// Peer id, unchecked.
        peer_id: String,
    },
    /// The registry got enabled or disabled.
    EnabledNetworkRegistry(bool),
}

/// A decoded event with its position in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    /// Where the event was emitted.
    pub snapshot: Snapshot,
    /// What happened.
    pub kind: ChainEventKind,
}

#[derive(Debug, Clone)]
struct Topics {
    announcement: H256,
    channel_updated: H256,
    ticket_redeemed: H256,
    transfer: H256,
    eligibility_updated: H256,
    registered: [H256; 2],
    deregistered: [H256; 2],
    enabled_network_registry: H256,
}

/// Decodes logs of the watched contracts into [`ChainEvent`]s.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    contracts: ContractsConfig,
    topics: Topics,
}

impl EventDecoder {
    /// Creates a decoder for the given contract deployment.
    pub fn new(contracts: ContractsConfig) -> Self {
        use signatures::*;
        Self {
            contracts,
            topics: Topics {
                announcement: topic(ANNOUNCEMENT),
                channel_updated: topic(CHANNEL_UPDATED),
                ticket_redeemed: topic(TICKET_REDEEMED),
                transfer: topic(TRANSFER),
                eligibility_updated: topic(ELIGIBILITY_UPDATED),
                registered: [topic(REGISTERED), topic(REGISTERED_BY_OWNER)],
                deregistered: [
                    topic(DEREGISTERED),
                    topic(DEREGISTERED_BY_OWNER),
                ],
                enabled_network_registry: topic(ENABLED_NETWORK_REGISTRY),
            },
        }
    }

    /// Filter selecting every log this decoder understands.
    pub fn log_filter(&self) -> LogFilter {
        let c = &self.contracts;
        let t = &self.topics;
        LogFilter {
            addresses: vec![
                c.announcements,
                c.channels,
                c.token,
                c.network_registry,
            ],
            topics: vec![
                t.announcement,
                t.channel_updated,
                t.ticket_redeemed,
                t.transfer,
                t.eligibility_updated,
                t.registered[0],
                t.registered[1],
                t.deregistered[0],
                t.deregistered[1],
                t.enabled_network_registry,
            ],
        }
    }

    /// Decodes a single log.
    ///
    /// Returns `None` for logs of other contracts or unknown events, and an
    /// [`Error::InvalidEventPayload`] for known events that do not decode.
    pub fn decode(
        &self,
        log: &RawLog,
    ) -> mixnet_relay_utils::Result<Option<ChainEvent>> {
        let Some(topic0) = log.topics.first() else {
            return Ok(None);
        };
        let c = &self.contracts;
        let t = &self.topics;
        let kind = if log.address == c.announcements
            && *topic0 == t.announcement
        {
            let mut data =
                decode_data(&[ParamType::Bytes, ParamType::Bytes], log)?;
            ChainEventKind::Announcement {
                account: indexed_address(log, 1)?,
                public_key: next(&mut data, Token::into_bytes)?,
                multiaddr: next(&mut data, Token::into_bytes)?,
            }
        } else if log.address == c.channels && *topic0 == t.channel_updated {
            decode_channel_updated(log)?
        } else if log.address == c.channels && *topic0 == t.ticket_redeemed {
            let mut data = decode_data(
                &[
                    ParamType::FixedBytes(32),
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                    ParamType::FixedBytes(32),
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                    ParamType::Bytes,
                ],
                log,
            )?;
            let _next_commitment = next(&mut data, Token::into_fixed_bytes)?;
            let _ticket_epoch = next(&mut data, Token::into_uint)?;
            let ticket_index = next(&mut data, Token::into_uint)?;
            let _secret = next(&mut data, Token::into_fixed_bytes)?;
            let amount = next(&mut data, Token::into_uint)?;
            ChainEventKind::TicketRedeemed {
                source: indexed_address(log, 1)?,
                destination: indexed_address(log, 2)?,
                ticket_index,
                amount,
            }
        } else if log.address == c.token && *topic0 == t.transfer {
            let mut data = decode_data(&[ParamType::Uint(256)], log)?;
            ChainEventKind::Transfer {
                from: indexed_address(log, 1)?,
                to: indexed_address(log, 2)?,
                value: next(&mut data, Token::into_uint)?,
            }
        } else if log.address != c.network_registry {
            return Ok(None);
        } else if *topic0 == t.eligibility_updated {
            ChainEventKind::EligibilityUpdated {
                account: indexed_address(log, 1)?,
                eligible: !indexed(log, 2)?.is_zero(),
            }
        } else if t.registered.contains(topic0) {
            let mut data = decode_data(&[ParamType::String], log)?;
            ChainEventKind::Registered {
                account: indexed_address(log, 1)?,
                peer_id: next(&mut data, Token::into_string)?,
            }
        } else if t.deregistered.contains(topic0) {
            let mut data = decode_data(&[ParamType::String], log)?;
            ChainEventKind::Deregistered {
                account: indexed_address(log, 1)?,
                peer_id: next(&mut data, Token::into_string)?,
            }
        } else if *topic0 == t.enabled_network_registry {
            ChainEventKind::EnabledNetworkRegistry(!indexed(log, 1)?.is_zero())
        } else {
            return Ok(None);
        };
        Ok(Some(ChainEvent {
            snapshot: log.snapshot(),
            kind,
        }))
    }

    /// Decodes a batch, sorted by snapshot. Logs that are unknown or do
    /// not decode are logged and skipped.
    pub fn decode_logs(&self, logs: Vec<RawLog>) -> Vec<ChainEvent> {
        let mut events: Vec<_> = logs
            .iter()
            .filter_map(|log| match self.decode(log) {
                Ok(Some(event)) => Some(event),
                Ok(None) => {
                    tracing::trace!(
                        address = ?log.address,
                        snapshot = %log.snapshot(),
                        "Skipping unknown log",
                    );
                    None
                }
                Err(e) => {
                    tracing::warn!(
                        address = ?log.address,
                        snapshot = %log.snapshot(),
                        "Skipping undecodable log: {e}",
                    );
                    None
                }
            })
            .collect();
        events.sort_by_key(|e| e.snapshot);
        events
    }
}

fn decode_channel_updated(
    log: &RawLog,
) -> mixnet_relay_utils::Result<ChainEventKind> {
    let state = ParamType::Tuple(vec![
        ParamType::Uint(256),
        ParamType::FixedBytes(32),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(8),
        ParamType::Uint(256),
        ParamType::Uint(32),
    ]);
    let mut data = decode_data(&[state], log)?;
    let mut state = next(&mut data, Token::into_tuple)?.into_iter();
    let balance = next(&mut state, Token::into_uint)?;
    let commitment = next(&mut state, Token::into_fixed_bytes)?;
    let ticket_epoch = next(&mut state, Token::into_uint)?;
    let ticket_index = next(&mut state, Token::into_uint)?;
    let status = next(&mut state, Token::into_uint)?;
    let channel_epoch = next(&mut state, Token::into_uint)?;
    let closure_time = next(&mut state, Token::into_uint)?;

    let status = u8::try_from(status)
        .map_err(|_| invalid(log, "channel status out of range"))?;
    Ok(ChainEventKind::ChannelUpdated(ChannelEntry {
        source: indexed_address(log, 1)?,
        destination: indexed_address(log, 2)?,
        balance,
        commitment: H256::from_slice(&commitment),
        ticket_epoch,
        ticket_index,
        status: ChannelStatus::try_from(status)?,
        channel_epoch,
        closure_time,
    }))
}

fn invalid(log: &RawLog, reason: &str) -> Error {
    Error::InvalidEventPayload(format!(
        "{reason} in log at {}",
        log.snapshot()
    ))
}

fn decode_data(
    types: &[ParamType],
    log: &RawLog,
) -> mixnet_relay_utils::Result<std::vec::IntoIter<Token>> {
    abi::decode(types, &log.data)
        .map(Vec::into_iter)
        .map_err(|e| invalid(log, &e.to_string()))
}

fn next<T>(
    tokens: &mut impl Iterator<Item = Token>,
    into: fn(Token) -> Option<T>,
) -> mixnet_relay_utils::Result<T> {
    tokens.next().and_then(into).ok_or_else(|| {
        Error::InvalidEventPayload("unexpected event parameter".into())
    })
}

fn indexed(log: &RawLog, position: usize) -> mixnet_relay_utils::Result<H256> {
    log.topics
        .get(position)
        .copied()
        .ok_or_else(|| invalid(log, "missing indexed parameter"))
}

fn indexed_address(
    log: &RawLog,
    position: usize,
) -> mixnet_relay_utils::Result<Address> {
    indexed(log, position).map(Address::from)
}
