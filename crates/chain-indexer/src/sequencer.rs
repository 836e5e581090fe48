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

use tokio::sync::mpsc;

/// Where a sequenced block number came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    /// Reached by the backfill; its logs were already collected.
    Backlog,
    /// Announced by the live subscription.
    Live,
}

/// A block number ready for the per-block pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencedBlock {
    /// The block number.
    pub number: u64,
    /// Which sequence delivered it.
    pub origin: BlockOrigin,
}

/// Merges the backlog and the live block sequences into one order.
///
/// The backlog is drained until its sender is dropped before any live
/// block is handed out. Live blocks announced meanwhile stay queued, and
/// those not above the last handed out block are dropped. `next` is
/// cancel safe.
#[derive(Debug)]
pub struct BlockSequencer {
    backlog: Option<mpsc::UnboundedReceiver<u64>>,
    live: Option<mpsc::UnboundedReceiver<u64>>,
    last: Option<u64>,
}

impl BlockSequencer {
    /// Creates a sequencer over both sequences.
    pub fn new(
        backlog: mpsc::UnboundedReceiver<u64>,
        live: mpsc::UnboundedReceiver<u64>,
    ) -> Self {
        Self {
            backlog: Some(backlog),
            live: Some(live),
            last: None,
        }
    }

    /// Waits for the next block. `None` once closed or both sequences
    /// ended.
    pub async fn next(&mut self) -> Option<SequencedBlock> {
        loop {
            if let Some(backlog) = self.backlog.as_mut() {
                match backlog.recv().await {
                    Some(number) => {
                        self.last = self.last.max(Some(number));
                        return Some(SequencedBlock {
                            number,
                            origin: BlockOrigin::Backlog,
                        });
                    }
                    None => {
                        tracing::trace!(last = ?self.last, "Backlog drained");
                        self.backlog = None;
                        continue;
                    }
                }
            }
            let live = self.live.as_mut()?;
            match live.recv().await {
                Some(number) if self.last.is_some_and(|l| number <= l) => {
                    tracing::trace!(number, "Dropping already covered block");
                }
                Some(number) => {
                    self.last = Some(number);
                    return Some(SequencedBlock {
                        number,
                        origin: BlockOrigin::Live,
                    });
                }
                None => {
                    self.live = None;
                    return None;
                }
            }
        }
    }

    /// Closes both sequences, dropping whatever is still queued.
    pub fn close(&mut self) {
        self.backlog = None;
        self.live = None;
    }

    /// Whether `next` will never yield again.
    pub fn is_closed(&self) -> bool {
        self.backlog.is_none() && self.live.is_none()
    }
}
