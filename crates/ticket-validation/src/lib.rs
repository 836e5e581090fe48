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
//! # Ticket Validation Module 🕸️
//!
//! Decides whether a payment ticket received by the node is worth keeping.
//!
//! Validation happens in two phases that follow the ticket's lifecycle:
//!
//! * **locked**: the challenge response is still unknown. The ticket must be
//!   properly signed, drawn on an open channel of the current epoch, carry
//!   enough expected value, be covered by the channel balance together with
//!   every other unredeemed ticket, and have a fresh index.
//! * **unlocked**: the response is known. The ticket wins iff
//!   `keccak256(keccak256(ticket) || response || opening)`, read as an
//!   unsigned integer, is below the encoded winning probability.

/// Commitment chains used to test tickets.
pub mod commitment;
/// Store backed validator.
pub mod validator;

pub use commitment::CommitmentChain;
pub use validator::TicketValidator;

use ethers::types::{H256, U256};
use ethers::utils::keccak256;

use mixnet_relay_config::TicketsConfig;
use mixnet_relay_types::tickets::{f64_to_win_prob, win_prob_to_f64};
use mixnet_relay_types::{ChannelEntry, ChannelStatus, Ticket};

/// Reasons a ticket is refused.
#[derive(Debug, thiserror::Error)]
pub enum TicketValidationError {
    /// The ticket is not worth what relaying costs.
    #[error("ticket value {value} is below the expected {expected}")]
    ValueTooLow {
        /// Expected value of the ticket.
        value: U256,
        /// What the node charges.
        expected: U256,
    },
    /// The winning probability is zero or below the configured minimum.
    #[error("winning probability {win_prob} is zero or below {min}")]
    WinProbOutOfRange {
        /// Winning probability of the ticket.
        win_prob: f64,
        /// Lowest accepted winning probability.
        min: f64,
    },
    /// The channel cannot pay out this ticket on top of the stored ones.
    #[error("channel balance {balance} does not cover {required}")]
    InsufficientChannelBalance {
        /// Value of this and every unredeemed ticket of the channel.
        required: U256,
        /// Balance of the channel.
        balance: U256,
    },
    /// The ticket index was already used.
    #[error("ticket index {index} is not above {last}")]
    IndexTooLow {
        /// Index of the ticket.
        index: U256,
        /// Highest index seen for the channel.
        last: U256,
    },
    /// No channel from the signer to us.
    #[error("channel {0:?} not found")]
    ChannelNotFound(H256),
    /// The channel does not accept tickets in its current status.
    #[error("channel is {0}, tickets are not accepted")]
    ChannelNotOpen(ChannelStatus),
    /// The ticket was issued for another channel epoch.
    #[error("ticket channel epoch {ticket} differs from {channel}")]
    EpochMismatch {
        /// Channel epoch of the ticket.
        ticket: U256,
        /// Channel epoch on chain.
        channel: U256,
    },
    /// The signature does not belong to the channel source.
    #[error("ticket signature is invalid")]
    InvalidSignature,
    /// No pending ticket matches the acknowledgement.
    #[error("no pending ticket with challenge {0:?}")]
    UnknownTicket(H256),
    /// The commitment of the channel is not part of our chain.
    #[error("no opening for commitment {0:?}")]
    UnknownCommitment(H256),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] mixnet_relay_utils::Error),
}

/// What the node expects from tickets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationParams {
    /// Minimal expected value per ticket.
    pub ticket_price: U256,
    /// Minimal winning probability, in `(0, 1]`.
    pub min_win_prob: f64,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            ticket_price: U256::zero(),
            min_win_prob: 1.0,
        }
    }
}

impl From<&TicketsConfig> for ValidationParams {
    fn from(config: &TicketsConfig) -> Self {
        Self {
            ticket_price: config.ticket_price,
            min_win_prob: config.min_win_prob,
        }
    }
}

/// Economic checks of a ticket whose response is not known yet.
///
/// `stored` holds every other unredeemed ticket of the same channel.
/// Signature and channel status are checked by [`TicketValidator`], this
/// function only needs the channel state.
pub fn validate_locked(
    ticket: &Ticket,
    channel: &ChannelEntry,
    stored: &[Ticket],
    params: &ValidationParams,
) -> Result<(), TicketValidationError> {
    // compared in the encoded domain, the float loses precision near 1.
    let min = f64_to_win_prob(params.min_win_prob);
    if ticket.win_prob.is_zero() || ticket.win_prob < min {
        return Err(TicketValidationError::WinProbOutOfRange {
            win_prob: win_prob_to_f64(ticket.win_prob),
            min: params.min_win_prob,
        });
    }

    let value = ticket.value();
    if value < params.ticket_price {
        return Err(TicketValidationError::ValueTooLow {
            value,
            expected: params.ticket_price,
        });
    }

    let outstanding = stored
        .iter()
        .fold(U256::zero(), |acc, t| acc.saturating_add(t.value()));
    let required = value.saturating_add(outstanding);
    if channel.balance < required {
        return Err(TicketValidationError::InsufficientChannelBalance {
            required,
            balance: channel.balance,
        });
    }

    let last = stored
        .iter()
        .map(|t| t.index)
        .chain(std::iter::once(channel.ticket_index))
        .max()
        .unwrap_or_default();
    if ticket.index <= last {
        return Err(TicketValidationError::IndexTooLow {
            index: ticket.index,
            last,
        });
    }

    Ok(())
}

/// Whether the ticket wins given the challenge response and the commitment
/// opening.
pub fn is_winning(ticket: &Ticket, response: &H256, opening: &H256) -> bool {
    let mut preimage = [0u8; 96];
    preimage[..32].copy_from_slice(ticket.get_hash().as_bytes());
    preimage[32..64].copy_from_slice(response.as_bytes());
    preimage[64..].copy_from_slice(opening.as_bytes());
    let luck = U256::from_big_endian(&keccak256(preimage));
    luck < ticket.win_prob
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mixnet_relay_types::Address;

    pub fn channel(balance: u64) -> ChannelEntry {
        ChannelEntry {
            source: Address::repeat_byte(1),
            destination: Address::repeat_byte(2),
            balance: balance.into(),
            commitment: H256::zero(),
            ticket_epoch: U256::one(),
            ticket_index: U256::zero(),
            status: ChannelStatus::Open,
            channel_epoch: U256::one(),
            closure_time: U256::zero(),
        }
    }

    pub fn ticket(amount: u64, index: u64) -> Ticket {
        Ticket {
            counterparty: Address::repeat_byte(2),
            challenge: H256::from_low_u64_be(index),
            epoch: U256::one(),
            index: index.into(),
            amount: amount.into(),
            win_prob: U256::MAX,
            channel_epoch: U256::one(),
            signature: None,
        }
    }

    #[test]
    fn balance_covers_new_and_stored_tickets() {
        let params = ValidationParams::default();
        let stored = vec![ticket(20, 1)];
        assert!(validate_locked(&ticket(50, 2), &channel(100), &stored, &params)
            .is_ok());
        let err =
            validate_locked(&ticket(90, 2), &channel(100), &stored, &params)
                .unwrap_err();
        assert!(matches!(
            err,
            TicketValidationError::InsufficientChannelBalance { required, .. }
                if required == 110.into()
        ));
    }

    #[test]
    fn index_must_increase() {
        let params = ValidationParams::default();
        let mut ch = channel(1_000);
        ch.ticket_index = 5.into();
        for index in [1, 5] {
            assert!(matches!(
                validate_locked(&ticket(1, index), &ch, &[], &params),
                Err(TicketValidationError::IndexTooLow { .. })
            ));
        }
        assert!(validate_locked(&ticket(1, 6), &ch, &[], &params).is_ok());
        // stored tickets raise the bar too.
        let stored = vec![ticket(1, 8)];
        assert!(matches!(
            validate_locked(&ticket(1, 7), &ch, &stored, &params),
            Err(TicketValidationError::IndexTooLow { .. })
        ));
    }

    #[test]
    fn value_and_probability_limits() {
        let params = ValidationParams {
            ticket_price: 10.into(),
            min_win_prob: 0.5,
        };
        assert!(matches!(
            validate_locked(&ticket(9, 1), &channel(100), &[], &params),
            Err(TicketValidationError::ValueTooLow { .. })
        ));

        let mut low = ticket(100, 1);
        low.win_prob = U256::MAX / 4;
        assert!(matches!(
            validate_locked(&low, &channel(1_000), &[], &params),
            Err(TicketValidationError::WinProbOutOfRange { .. })
        ));

        let mut zero = ticket(100, 1);
        zero.win_prob = U256::zero();
        assert!(matches!(
            validate_locked(&zero, &channel(1_000), &[], &params),
            Err(TicketValidationError::WinProbOutOfRange { .. })
        ));

        // half probability halves the expected value.
        let mut half = ticket(30, 1);
        half.win_prob = f64_to_win_prob(0.5);
        assert!(validate_locked(&half, &channel(1_000), &[], &params).is_ok());
    }

    #[test]
    fn params_follow_the_tickets_config() {
        let config = TicketsConfig {
            ticket_price: 25.into(),
            min_win_prob: 0.25,
        };
        let params = ValidationParams::from(&config);
        assert_eq!(params.ticket_price, U256::from(25));
        assert_eq!(params.min_win_prob, 0.25);
        assert!(matches!(
            validate_locked(&ticket(20, 1), &channel(100), &[], &params),
            Err(TicketValidationError::ValueTooLow { .. })
        ));
    }

    #[test]
    fn winner_is_deterministic() {
        let t = ticket(10, 1);
        let response = H256::repeat_byte(0xaa);
        let opening = H256::repeat_byte(0xbb);
        // probability one always wins.
        assert!(is_winning(&t, &response, &opening));
        let mut never = t.clone();
        never.win_prob = U256::zero();
        assert!(!is_winning(&never, &response, &opening));

        let mut half = t.clone();
        half.win_prob = U256::MAX / 2;
        let first = is_winning(&half, &response, &opening);
        for _ in 0..10 {
            assert_eq!(is_winning(&half, &response, &opening), first);
        }
    }
}
