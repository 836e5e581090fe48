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

use ethers::types::{Address, Signature, H256, U256, U512};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

use mixnet_relay_utils::Error;

/// A probabilistic payment ticket received from the channel source.
///
/// `win_prob` is the winning probability scaled to `2^256 - 1`, so
/// `U256::MAX` means the ticket always wins and zero means it never does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    /// Destination of the channel the ticket is drawn on.
    pub counterparty: Address,
    /// Challenge the response must solve.
    pub challenge: H256,
    /// Ticket epoch of the channel when the ticket was issued.
    pub epoch: U256,
    /// Monotonically increasing ticket index.
    pub index: U256,
    /// Face value paid out if the ticket wins.
    pub amount: U256,
    /// Encoded winning probability.
    pub win_prob: U256,
    /// Channel epoch the ticket was issued under.
    pub channel_epoch: U256,
    /// Signature of the channel source over [`Ticket::get_hash`].
    pub signature: Option<Signature>,
}

impl Ticket {
    /// Packed encoding of the signed ticket fields.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + 32 * 6);
        out.extend_from_slice(self.counterparty.as_bytes());
        out.extend_from_slice(self.challenge.as_bytes());
        for value in [
            self.epoch,
            self.amount,
            self.win_prob,
            self.index,
            self.channel_epoch,
        ] {
            let mut word = [0u8; 32];
            value.to_big_endian(&mut word);
            out.extend_from_slice(&word);
        }
        out
    }

    /// Hash the issuer signs.
    pub fn get_hash(&self) -> H256 {
        H256(keccak256(self.to_bytes()))
    }

    /// Recovers the issuer from the EIP-191 signature over the ticket hash.
    pub fn recover_signer(&self) -> Result<Address, Error> {
        let signature = self
            .signature
            .as_ref()
            .ok_or(Error::Generic("ticket is not signed"))?;
        Ok(signature.recover(self.get_hash().as_bytes())?)
    }

    /// Winning probability as a float, for logs and config comparisons.
    pub fn win_probability(&self) -> f64 {
        win_prob_to_f64(self.win_prob)
    }

    /// Expected value of the ticket, `amount * win_prob / (2^256 - 1)`.
    pub fn value(&self) -> U256 {
        let scaled: U512 = self.amount.full_mul(self.win_prob);
        let value = scaled / U512::from(U256::MAX);
        // win_prob <= 2^256 - 1 keeps the quotient below amount.
        U256::try_from(value).unwrap_or(self.amount)
    }
}

/// Converts an encoded winning probability to a float in `[0, 1]`.
pub fn win_prob_to_f64(win_prob: U256) -> f64 {
    // the top 64 bits are plenty for comparisons against config values.
    let top = (win_prob >> 192).low_u64();
    top as f64 / u64::MAX as f64
}

/// Encodes a float probability, clamped to `[0, 1]`.
pub fn f64_to_win_prob(probability: f64) -> U256 {
    if probability >= 1.0 {
        return U256::MAX;
    }
    if probability <= 0.0 {
        return U256::zero();
    }
    let top = (probability * u64::MAX as f64) as u64;
    (U256::from(top) << 192) | (U256::MAX >> 64)
}

/// A winning ticket together with what is needed to redeem it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcknowledgedTicket {
    /// The ticket itself.
    pub ticket: Ticket,
    /// Response to the ticket challenge.
    pub response: H256,
    /// Opening of the channel commitment used to test the ticket.
    pub opening: H256,
    /// Channel source that issued the ticket.
    pub signer: Address,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::LocalWallet;

    fn ticket(amount: u64, win_prob: U256) -> Ticket {
        Ticket {
            counterparty: Address::repeat_byte(7),
            challenge: H256::repeat_byte(3),
            epoch: 1.into(),
            index: 1.into(),
            amount: amount.into(),
            win_prob,
            channel_epoch: 1.into(),
            signature: None,
        }
    }

    #[test]
    fn value_is_scaled_by_probability() {
        assert_eq!(ticket(50, U256::MAX).value(), 50.into());
        // (2^255 - 1) / (2^256 - 1) is just below one half.
        assert_eq!(ticket(50, U256::MAX / 2).value(), 24.into());
        assert_eq!(ticket(50, U256::zero()).value(), U256::zero());
    }

    #[test]
    fn probability_round_trips_at_the_edges() {
        assert_eq!(win_prob_to_f64(U256::MAX), 1.0);
        assert_eq!(win_prob_to_f64(U256::zero()), 0.0);
        assert_eq!(f64_to_win_prob(1.0), U256::MAX);
        let p = win_prob_to_f64(f64_to_win_prob(0.5));
        assert!((p - 0.5).abs() < 1e-9);
    }

    #[test]
    fn signature_recovers_issuer() {
        let wallet: LocalWallet = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
            .parse()
            .unwrap();
        let mut t = ticket(10, U256::MAX);
        let digest = ethers::utils::hash_message(t.get_hash().as_bytes());
        t.signature = Some(wallet.sign_hash(digest).unwrap());
        assert_eq!(
            t.recover_signer().unwrap(),
            ethers::signers::Signer::address(&wallet)
        );
        assert!(ticket(10, U256::MAX).recover_signer().is_err());
    }
}
