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

use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

/// Status of a payment channel.
///
/// Channels move `Closed -> WaitingForCommitment -> Open -> PendingToClose
/// -> Closed`. The discriminants match the on-chain encoding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ChannelStatus {
    /// No funds locked, or the channel was finalized.
    #[default]
    Closed = 0,
    /// Funded but the destination has not set a commitment yet.
    WaitingForCommitment = 1,
    /// Tickets can be issued and redeemed.
    Open = 2,
    /// Closure initiated, waiting for the notice period.
    PendingToClose = 3,
}

impl TryFrom<u8> for ChannelStatus {
    type Error = mixnet_relay_utils::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Closed),
            1 => Ok(Self::WaitingForCommitment),
            2 => Ok(Self::Open),
            3 => Ok(Self::PendingToClose),
            _ => Err(mixnet_relay_utils::Error::InvalidEventPayload(format!(
                "unknown channel status {value}"
            ))),
        }
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::WaitingForCommitment => "waiting_for_commitment",
            Self::Open => "open",
            Self::PendingToClose => "pending_to_close",
        };
        f.write_str(s)
    }
}

/// Identifier of the channel from `source` to `destination`.
pub fn generate_channel_id(source: &Address, destination: &Address) -> H256 {
    let mut buf = [0u8; 40];
    buf[..20].copy_from_slice(source.as_bytes());
    buf[20..].copy_from_slice(destination.as_bytes());
    H256(keccak256(buf))
}

/// Full state of a unidirectional payment channel as last seen on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEntry {
    /// Party paying with tickets.
    pub source: Address,
    /// Party receiving tickets.
    pub destination: Address,
    /// Funds locked in the channel.
    pub balance: U256,
    /// Current commitment set by the destination.
    pub commitment: H256,
    /// Epoch of the ticket counter.
    pub ticket_epoch: U256,
    /// Index of the last redeemed ticket.
    pub ticket_index: U256,
    /// Channel status.
    pub status: ChannelStatus,
    /// Incremented each time the channel is reopened.
    pub channel_epoch: U256,
    /// Timestamp after which a pending closure can be finalized.
    pub closure_time: U256,
}

impl ChannelEntry {
    /// Identifier of this channel.
    pub fn get_id(&self) -> H256 {
        generate_channel_id(&self.source, &self.destination)
    }

    /// Whether `address` is one of the two parties.
    pub fn has_party(&self, address: &Address) -> bool {
        &self.source == address || &self.destination == address
    }
}

impl std::fmt::Display for ChannelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "channel {:?} ({:?} -> {:?}, {}, balance {})",
            self.get_id(),
            self.source,
            self.destination,
            self.status,
            self.balance
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_depends_on_direction() {
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        assert_ne!(generate_channel_id(&a, &b), generate_channel_id(&b, &a));
        let mut packed = a.as_bytes().to_vec();
        packed.extend_from_slice(b.as_bytes());
        assert_eq!(generate_channel_id(&a, &b), H256(keccak256(packed)));
    }

    #[test]
    fn status_decodes_from_u8() {
        assert_eq!(ChannelStatus::try_from(2).unwrap(), ChannelStatus::Open);
        assert_eq!(
            ChannelStatus::try_from(3).unwrap(),
            ChannelStatus::PendingToClose
        );
        assert!(ChannelStatus::try_from(4).is_err());
    }
}
