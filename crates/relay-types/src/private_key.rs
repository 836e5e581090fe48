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

use std::str::FromStr;

use ethers::types::H256;
use serde::Deserialize;

/// The chain account secret of the node.
///
/// Deserializes from a `0x` prefixed hex string or from `$ENV_VAR`, where
/// the variable holds the hex string.
#[derive(Clone)]
pub struct PrivateKey(H256);

impl PrivateKey {
    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl From<H256> for PrivateKey {
    fn from(secret: H256) -> Self {
        PrivateKey(secret)
    }
}

fn parse_secret<E: serde::de::Error>(value: &str) -> Result<H256, E> {
    H256::from_str(value).map_err(|e| {
        E::custom(format!(
            "{e}\n expected a 66 chars string (including the 0x prefix) but found {} chars",
            value.len()
        ))
    })
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PrivateKeyVistor;
        impl<'de> serde::de::Visitor<'de> for PrivateKeyVistor {
            type Value = H256;

            fn expecting(
                &self,
                formatter: &mut std::fmt::Formatter,
            ) -> std::fmt::Result {
                formatter.write_str(
                    "hex string or an env var containing a hex string in it",
                )
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if value.starts_with("0x") {
                    parse_secret(value)
                } else if let Some(var) = value.strip_prefix('$') {
                    tracing::trace!("Reading {} from env", var);
                    let val = std::env::var(var).map_err(|e| {
                        serde::de::Error::custom(format!(
                            "error while loading this env {var}: {e}",
                        ))
                    })?;
                    parse_secret(&val)
                } else {
                    Err(serde::de::Error::custom(
                        "private key must be 0x prefixed hex or $ENV_VAR",
                    ))
                }
            }
        }

        let secret = deserializer.deserialize_str(PrivateKeyVistor)?;
        Ok(Self(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str =
        "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn reads_hex_and_env() {
        let key: PrivateKey =
            serde_json::from_value(serde_json::json!(KEY)).unwrap();
        assert_eq!(hex::encode(key.as_bytes()), KEY[2..]);

        std::env::set_var("MIXNET_TEST_PRIVATE_KEY", KEY);
        let key: PrivateKey = serde_json::from_value(serde_json::json!(
            "$MIXNET_TEST_PRIVATE_KEY"
        ))
        .unwrap();
        assert_eq!(hex::encode(key.as_bytes()), KEY[2..]);
        assert_eq!(format!("{key:?}"), "PrivateKey(..)");
    }

    #[test]
    fn rejects_other_formats() {
        assert!(serde_json::from_value::<PrivateKey>(serde_json::json!(
            "not a key"
        ))
        .is_err());
        assert!(
            serde_json::from_value::<PrivateKey>(serde_json::json!("0x1234"))
                .is_err()
        );
    }
}
