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

use ethers::core::k256::ecdsa::VerifyingKey;
use ethers::types::Address;
use serde::{Deserialize, Serialize};

use mixnet_relay_utils::Error;

/// A secp256k1 public key announced by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parses a compressed or uncompressed SEC1 encoded key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        VerifyingKey::from_sec1_bytes(bytes).map(Self).map_err(|_| {
            Error::InvalidEventPayload(format!(
                "malformed public key 0x{}",
                hex::encode(bytes)
            ))
        })
    }

    /// Compressed SEC1 encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_encoded_point(true).as_bytes().to_vec()
    }

    /// The chain account controlled by this key.
    pub fn to_address(&self) -> Address {
        ethers::utils::public_key_to_address(&self.0)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_bytes()))
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(key: VerifyingKey) -> Self {
        Self(key)
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(serde::de::Error::custom)?;
        PublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// A peer that announced itself on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEntry {
    /// Key the peer signs with.
    pub public_key: PublicKey,
    /// Where the peer can be reached.
    pub multiaddr: String,
    /// Block of the announcement.
    pub updated_block: u64,
}

impl AccountEntry {
    /// Chain address of the announcing peer.
    pub fn get_address(&self) -> Address {
        self.public_key.to_address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};

    #[test]
    fn public_key_matches_wallet_address() {
        let wallet = LocalWallet::new(&mut rand_core());
        let key = PublicKey::from(*wallet.signer().verifying_key());
        assert_eq!(key.to_address(), wallet.address());

        let parsed = PublicKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(parsed, key);

        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(serde_json::from_str::<PublicKey>(&json).unwrap(), key);
    }

    #[test]
    fn malformed_public_key_is_rejected() {
        assert!(matches!(
            PublicKey::from_bytes(&[0x02, 1, 2, 3]),
            Err(Error::InvalidEventPayload(_))
        ));
    }

    fn rand_core() -> ethers::core::rand::rngs::ThreadRng {
        ethers::core::rand::thread_rng()
    }
}
