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

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use prometheus::core::{AtomicF64, GenericCounter, GenericGauge};
use prometheus::{labels, opts};
use prometheus::{Counter, Encoder, Gauge, Registry, TextEncoder};

/// A struct definition for collecting metrics in the relay node.
///
/// Every instance owns its own registry so several nodes (or tests) can live
/// in the same process.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    /// Unconfirmed blocks handed to the block pipeline.
    pub unconfirmed_blocks_processed: GenericCounter<AtomicF64>,
    /// Announcements applied to the account store.
    pub announcements: GenericCounter<AtomicF64>,
    /// Latest block seen by the indexer.
    pub current_block: GenericGauge<AtomicF64>,
    /// Tickets redeemed by this node.
    pub tickets_redeemed: GenericCounter<AtomicF64>,
    /// Failed historical log queries.
    pub backfill_failures: GenericCounter<AtomicF64>,
    /// Own transactions broadcast again after a provider failure.
    pub transactions_resent: GenericCounter<AtomicF64>,
    /// Tickets refused by the locked validation.
    pub tickets_refused: GenericCounter<AtomicF64>,
    /// Tickets found to be winning on unlock.
    pub winning_tickets: GenericCounter<AtomicF64>,
    provider_errors: HashMap<String, GenericCounter<AtomicF64>>,
    channel_status: HashMap<String, GenericGauge<AtomicF64>>,
}

impl Metrics {
    /// Instantiates the various metrics and their counters, also creates a
    /// registry for the counters and registers the counters
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let unconfirmed_blocks_processed = Counter::with_opts(opts!(
            "indexer_unconfirmed_blocks_processed",
            "The total number of unconfirmed blocks processed by the indexer"
        ))?;
        registry.register(Box::new(unconfirmed_blocks_processed.clone()))?;

        let announcements = Counter::with_opts(opts!(
            "indexer_announcements",
            "The total number of peer announcements applied"
        ))?;
        registry.register(Box::new(announcements.clone()))?;

        let current_block = Gauge::with_opts(opts!(
            "indexer_current_block",
            "The latest block number observed by the indexer"
        ))?;
        registry.register(Box::new(current_block.clone()))?;

        let tickets_redeemed = Counter::with_opts(opts!(
            "indexer_tickets_redeemed",
            "The total number of tickets redeemed by this node"
        ))?;
        registry.register(Box::new(tickets_redeemed.clone()))?;

        let backfill_failures = Counter::with_opts(opts!(
            "indexer_backfill_failures",
            "How many historical log queries failed during backfill"
        ))?;
        registry.register(Box::new(backfill_failures.clone()))?;

        let transactions_resent = Counter::with_opts(opts!(
            "tx_manager_transactions_resent",
            "How many own transactions were broadcast again"
        ))?;
        registry.register(Box::new(transactions_resent.clone()))?;

        let tickets_refused = Counter::with_opts(opts!(
            "tickets_refused",
            "The total number of tickets refused on receipt"
        ))?;
        registry.register(Box::new(tickets_refused.clone()))?;

        let winning_tickets = Counter::with_opts(opts!(
            "tickets_winning",
            "The total number of tickets that turned out to be winners"
        ))?;
        registry.register(Box::new(winning_tickets.clone()))?;

        Ok(Self {
            registry,
            unconfirmed_blocks_processed,
            announcements,
            current_block,
            tickets_redeemed,
            backfill_failures,
            transactions_resent,
            tickets_refused,
            winning_tickets,
            provider_errors: Default::default(),
            channel_status: Default::default(),
        })
    }

    /// Gathers the whole node metrics in the prometheus text format.
    pub fn gather_metrics(&self) -> Result<String, GatherMetricsError> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }

    /// Counter of provider errors, labelled by their classification.
    pub fn provider_errors_entry(
        &mut self,
        kind: &str,
    ) -> Result<&mut GenericCounter<AtomicF64>, prometheus::Error> {
        let registry = &self.registry;
        match self.provider_errors.entry(kind.to_owned()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let counter = Counter::with_opts(opts!(
                    "indexer_provider_errors",
                    "The total number of provider errors by kind",
                    labels! {"kind" => kind}
                ))?;
                registry.register(Box::new(counter.clone()))?;
                Ok(e.insert(counter))
            }
        }
    }

    /// Gauge holding the numeric status of a channel.
    pub fn channel_status_entry(
        &mut self,
        channel: &str,
    ) -> Result<&mut GenericGauge<AtomicF64>, prometheus::Error> {
        let registry = &self.registry;
        match self.channel_status.entry(channel.to_owned()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let gauge = Gauge::with_opts(opts!(
                    "indexer_channel_status",
                    "The status of a payment channel",
                    labels! {"channel" => channel}
                ))?;
                registry.register(Box::new(gauge.clone()))?;
                Ok(e.insert(gauge))
            }
        }
    }
}

/// Error gathering metrics.
#[derive(Debug, thiserror::Error)]
pub enum GatherMetricsError {
    /// Error encoding the metrics.
    #[error(transparent)]
    PrometheusError(#[from] prometheus::Error),
    /// Error converting the encoded metrics to a string.
    #[error(transparent)]
    FromUtf8Error(#[from] std::string::FromUtf8Error),
}
