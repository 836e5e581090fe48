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

use serde::{Deserialize, Serialize};

/// Position of an event on chain, used as a watermark.
///
/// Ordering is lexicographic on `(block_number, transaction_index,
/// log_index)`, which is the order the fields are declared in.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Block the event was emitted in.
    pub block_number: u64,
    /// Index of the transaction inside the block.
    pub transaction_index: u64,
    /// Index of the log inside the block.
    pub log_index: u64,
}

impl Snapshot {
    /// Creates a new snapshot.
    pub fn new(
        block_number: u64,
        transaction_index: u64,
        log_index: u64,
    ) -> Self {
        Self {
            block_number,
            transaction_index,
            log_index,
        }
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.block_number, self.transaction_index, self.log_index
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic() {
        let a = Snapshot::new(10, 5, 9);
        let b = Snapshot::new(10, 6, 0);
        let c = Snapshot::new(11, 0, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(Snapshot::new(10, 5, 8) < a);
        assert_eq!(a, Snapshot::new(10, 5, 9));

        let mut v = vec![c, a, b];
        v.sort();
        assert_eq!(v, vec![a, b, c]);
    }
}
