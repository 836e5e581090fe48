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

use std::collections::VecDeque;

use mixnet_relay_types::Snapshot;

use crate::events::ChainEvent;

/// FIFO of decoded events that are not deep enough to be final yet.
///
/// Admission goes through a watermark: the snapshot of the last admitted
/// event. Overlapping log queries therefore never admit an event twice.
#[derive(Debug, Default)]
pub struct UnconfirmedEvents {
    queue: VecDeque<ChainEvent>,
    watermark: Option<Snapshot>,
}

impl UnconfirmedEvents {
    /// An empty buffer with no watermark.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a batch sorted by snapshot.
    ///
    /// Leading events at or below the watermark are skipped, everything
    /// after them is queued, and the watermark moves to the last queued
    /// event. Returns how many events were queued.
    pub fn admit(&mut self, batch: Vec<ChainEvent>) -> usize {
        let watermark = self.watermark;
        let admitted: Vec<_> = batch
            .into_iter()
            .skip_while(|e| watermark.is_some_and(|w| e.snapshot <= w))
            .collect();
        if let Some(last) = admitted.last() {
            self.watermark = Some(last.snapshot);
        }
        let count = admitted.len();
        self.queue.extend(admitted);
        count
    }

    /// The oldest event if it is at least `max_confirmations` blocks below
    /// `current_block`.
    pub fn front_confirmed(
        &self,
        current_block: u64,
        max_confirmations: u64,
    ) -> Option<&ChainEvent> {
        self.queue.front().filter(|e| {
            e.snapshot.block_number.saturating_add(max_confirmations)
                <= current_block
        })
    }

    /// Removes the oldest event.
    pub fn pop_front(&mut self) -> Option<ChainEvent> {
        self.queue.pop_front()
    }

    /// Snapshot of the last admitted event.
    pub fn watermark(&self) -> Option<Snapshot> {
        self.watermark
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drops every queued event and the watermark.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.watermark = None;
    }
}
