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

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use mixnet_relay_utils::metric::Metrics;
use mixnet_relay_utils::retry::restart_backoff;
use mixnet_relay_utils::{probe, Error};
use tokio::sync::Mutex;

use crate::source::{ChainSource, LogFilter, RawLog};

/// Logs of one successfully queried chunk.
#[derive(Debug, Clone)]
pub struct Batch {
    /// First block of the chunk.
    pub from_block: u64,
    /// Last block of the chunk.
    pub to_block: u64,
    /// Matching logs, in no particular order.
    pub logs: Vec<RawLog>,
}

/// Pulls historical logs between a resume point and a head in chunks.
///
/// Chunks are `max_chunk_size` blocks wide. Each consecutive query failure
/// divides the width of the next attempt by four, starting again at the
/// same block after an exponential backoff. Once failures exceed
/// `max_failures` the backfill is aborted. A successful query resets the
/// failure count and the backoff.
#[derive(Debug)]
pub struct PastEventCollector {
    next_block: u64,
    to_block: u64,
    start_block: u64,
    max_chunk_size: u64,
    max_failures: u32,
    failures: u32,
    backoff: ExponentialBackoff,
    metrics: Arc<Mutex<Metrics>>,
}

impl PastEventCollector {
    /// Collects `from_block..=to_block`.
    pub fn new(
        from_block: u64,
        to_block: u64,
        max_chunk_size: u64,
        max_failures: u32,
        metrics: Arc<Mutex<Metrics>>,
    ) -> Self {
        Self {
            next_block: from_block,
            to_block,
            start_block: from_block,
            max_chunk_size: max_chunk_size.max(1),
            max_failures,
            failures: 0,
            backoff: restart_backoff(
                Duration::from_millis(500),
                Duration::from_secs(8),
                Duration::ZERO,
            ),
            metrics,
        }
    }

    /// Waits according to `policy` between failed queries.
    pub fn with_backoff(mut self, policy: ExponentialBackoff) -> Self {
        self.backoff = policy;
        self
    }

    /// Width of the next query.
    pub fn chunk_size(&self) -> u64 {
        let divisor = 4u64.saturating_pow(self.failures);
        (self.max_chunk_size / divisor).max(1)
    }

    /// Consecutive failures so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Queries the next chunk. `None` once the head is reached.
    ///
    /// # Errors
    ///
    /// [`Error::BackfillAborted`] once too many consecutive queries failed.
    pub async fn next_batch<C>(
        &mut self,
        source: &C,
        filter: &LogFilter,
    ) -> mixnet_relay_utils::Result<Option<Batch>>
    where
        C: ChainSource + ?Sized,
    {
        loop {
            if self.next_block > self.to_block {
                return Ok(None);
            }
            let from_block = self.next_block;
            let to_block = from_block
                .saturating_add(self.chunk_size() - 1)
                .min(self.to_block);
            match source.query_logs(filter, from_block, to_block).await {
                Ok(logs) => {
                    self.failures = 0;
                    self.backoff.reset();
                    self.next_block = to_block + 1;
                    self.report_progress(from_block, to_block, logs.len());
                    self.metrics
                        .lock()
                        .await
                        .current_block
                        .set(to_block as f64);
                    return Ok(Some(Batch {
                        from_block,
                        to_block,
                        logs,
                    }));
                }
                Err(e) => {
                    self.failures += 1;
                    self.metrics.lock().await.backfill_failures.inc();
                    tracing::warn!(
                        from_block,
                        to_block,
                        failures = self.failures,
                        "Failed to query past logs: {e}",
                    );
                    if self.failures > self.max_failures {
                        return Err(Error::BackfillAborted {
                            from_block,
                            to_block,
                            failures: self.failures,
                        });
                    }
                    let delay = self
                        .backoff
                        .next_backoff()
                        .unwrap_or(self.backoff.max_interval);
                    tracing::event!(
                        target: probe::TARGET,
                        tracing::Level::DEBUG,
                        kind = %probe::Kind::Retry,
                        from_block,
                        retry_after = ?delay,
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn report_progress(&self, from_block: u64, to_block: u64, logs: usize) {
        let total = self.to_block.saturating_sub(self.start_block) + 1;
        let done = to_block.saturating_sub(self.start_block) + 1;
        let progress = done as f64 / total as f64 * 100.0;
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::Sync,
            from_block,
            to_block,
            target_block = self.to_block,
            logs,
            progress,
        );
    }
}
