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

use ethers::types::H256;
use ethers::utils::keccak256;

/// A hash chain `seed, h(seed), h(h(seed)), ...` whose last element is set
/// on chain as the channel commitment.
///
/// Each redemption reveals the preimage of the current commitment, which
/// then becomes the new commitment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentChain {
    values: Vec<H256>,
}

impl CommitmentChain {
    /// Builds a chain of `length` iterations on top of `seed`.
    pub fn new(seed: H256, length: usize) -> Self {
        let mut values = Vec::with_capacity(length + 1);
        values.push(seed);
        for i in 0..length {
            let next = H256(keccak256(values[i]));
            values.push(next);
        }
        Self { values }
    }

    /// The value to publish on chain.
    pub fn commitment(&self) -> H256 {
        // never empty, `new` always pushes the seed.
        self.values.last().copied().unwrap_or(self.values[0])
    }

    /// Preimage of `commitment`, `None` if it is the seed or not part of the
    /// chain.
    pub fn opening_for(&self, commitment: &H256) -> Option<H256> {
        let position = self.values.iter().position(|v| v == commitment)?;
        position.checked_sub(1).map(|p| self.values[p])
    }

    /// Number of openings left.
    pub fn len(&self) -> usize {
        self.values.len() - 1
    }

    /// Whether every opening was used.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openings_walk_back_to_the_seed() {
        let seed = H256::repeat_byte(0x42);
        let chain = CommitmentChain::new(seed, 3);
        assert_eq!(chain.len(), 3);

        let commitment = chain.commitment();
        let opening = chain.opening_for(&commitment).unwrap();
        assert_eq!(H256(keccak256(opening)), commitment);

        let next = chain.opening_for(&opening).unwrap();
        let last = chain.opening_for(&next).unwrap();
        assert_eq!(last, seed);
        assert_eq!(chain.opening_for(&seed), None);
        assert_eq!(chain.opening_for(&H256::zero()), None);
    }
}
