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
use std::sync::Arc;

use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use tokio::sync::{broadcast, Mutex};

use mixnet_relay_store::ChainStore;
use mixnet_relay_types::{
    AccountEntry, Address, ChannelEntry, ChannelStatus, PublicKey, Snapshot,
    U256,
};
use mixnet_relay_utils::metric::Metrics;
use mixnet_relay_utils::{probe, Error};

use crate::events::{ChainEvent, ChainEventKind};
use crate::IndexerNotification;

/// Applies confirmed events to the store and tells consumers about it.
///
/// Every applied event advances the persisted snapshot, so an event is
/// never applied twice, even across restarts. The snapshot moves last, or
/// in the same write as the state change, so an event whose writes failed
/// is applied again on the next attempt.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct EventDispatcher<S> {
    /// Owner of all indexed state.
    store: S,
    /// The node's own chain address.
    self_address: Address,
    /// Where notifications go.
    notifications: broadcast::Sender<IndexerNotification>,
    /// Metrics sink.
    metrics: Arc<Mutex<Metrics>>,
}

impl<S> EventDispatcher<S>
where
    S: ChainStore,
{
    /// Applies `event` unless the store already went past its snapshot.
    ///
    /// Returns whether the event was applied. Events with malformed
    /// payloads count as applied: they are logged and dropped.
    #[tracing::instrument(skip_all, fields(snapshot = %event.snapshot))]
    pub async fn apply(
        &self,
        event: ChainEvent,
    ) -> mixnet_relay_utils::Result<bool> {
        let ChainEvent { snapshot, kind } = event;
        if let Some(last) = self.store.get_latest_confirmed_snapshot()? {
            if snapshot <= last {
                tracing::trace!(%last, "Discarding stale event");
                return Ok(false);
            }
        }
        match kind {
            ChainEventKind::Announcement {
                account,
                public_key,
                multiaddr,
            } => {
                self.on_announcement(account, &public_key, multiaddr, snapshot)
                    .await?
            }
            ChainEventKind::ChannelUpdated(channel) => {
                self.on_channel_updated(channel, snapshot).await?
            }
            ChainEventKind::TicketRedeemed {
                source,
                destination,
                ticket_index,
                amount,
            } => {
                self.on_ticket_redeemed(
                    source,
                    destination,
                    ticket_index,
                    amount,
                    snapshot,
                )
                .await?
            }
            ChainEventKind::Transfer { from, to, value } => {
                let credit = if to == self.self_address {
                    value
                } else {
                    U256::zero()
                };
                let debit = if from == self.self_address {
                    value
                } else {
                    U256::zero()
                };
                if credit.is_zero() && debit.is_zero() {
                    self.store.update_latest_confirmed_snapshot(&snapshot)?;
                } else {
                    self.store.update_hopr_balance_and_snapshot(
                        credit, debit, &snapshot,
                    )?;
                }
            }
            ChainEventKind::EligibilityUpdated { account, eligible } => {
                self.store.set_eligible(&account, eligible)?;
                self.store.update_latest_confirmed_snapshot(&snapshot)?;
                self.registry_event("eligibility_updated");
                self.notify(IndexerNotification::EligibilityUpdated {
                    account,
                    eligible,
                });
            }
            ChainEventKind::Registered { account, peer_id } => {
                let peer_id = parse_peer_id(&peer_id);
                if let Some(peer_id) = &peer_id {
                    self.store.add_to_network_registry(peer_id, &account)?;
                }
                self.store.update_latest_confirmed_snapshot(&snapshot)?;
                if let Some(peer_id) = peer_id {
                    self.registry_event("registered");
                    self.notify(IndexerNotification::PeerRegistered {
                        peer_id,
                        account,
                    });
                }
            }
            ChainEventKind::Deregistered { peer_id, .. } => {
                let peer_id = parse_peer_id(&peer_id);
                if let Some(peer_id) = &peer_id {
                    self.store.remove_from_network_registry(peer_id)?;
                }
                self.store.update_latest_confirmed_snapshot(&snapshot)?;
                if let Some(peer_id) = peer_id {
                    self.registry_event("deregistered");
                    self.notify(IndexerNotification::PeerDeregistered {
                        peer_id,
                    });
                }
            }
            ChainEventKind::EnabledNetworkRegistry(enabled) => {
                self.store.set_network_registry_enabled(enabled)?;
                self.store.update_latest_confirmed_snapshot(&snapshot)?;
                self.registry_event("status_changed");
                self.notify(IndexerNotification::NetworkRegistryStatusChanged(
                    enabled,
                ));
            }
        }
        Ok(true)
    }

    async fn on_announcement(
        &self,
        account: Address,
        public_key: &[u8],
        multiaddr: Vec<u8>,
        snapshot: Snapshot,
    ) -> mixnet_relay_utils::Result<()> {
        let entry = match parse_announcement(
            account,
            public_key,
            multiaddr,
            snapshot.block_number,
        ) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(?account, "Dropping announcement: {e}");
                return self.store.update_latest_confirmed_snapshot(&snapshot);
            }
        };
        self.store
            .update_account_and_snapshot(&account, &entry, &snapshot)?;
        self.metrics.lock().await.announcements.inc();
        tracing::debug!(?account, multiaddr = %entry.multiaddr, "Announced");
        self.notify(IndexerNotification::AccountAnnounced(entry));
        Ok(())
    }

    async fn on_channel_updated(
        &self,
        channel: ChannelEntry,
        snapshot: Snapshot,
    ) -> mixnet_relay_utils::Result<()> {
        let id = channel.get_id();
        // a channel never seen before was closed
        let previous = self
            .store
            .get_channel(&id)?
            .map(|c| c.status)
            .unwrap_or_default();
        let closed = previous != ChannelStatus::Closed
            && channel.status == ChannelStatus::Closed;
        let deleted_tickets = if closed {
            self.store.delete_acknowledged_tickets_from(&id)?
        } else {
            0
        };
        self.store
            .update_channel_and_snapshot(&id, &channel, &snapshot)?;

        {
            let mut metrics = self.metrics.lock().await;
            match metrics.channel_status_entry(&format!("{id:?}")) {
                Ok(gauge) => gauge.set(channel.status as u8 as f64),
                Err(e) => tracing::warn!("Failed to register gauge: {e}"),
            }
        }
        tracing::debug!(
            channel = ?id,
            from = %previous,
            to = %channel.status,
            "Channel updated",
        );

        if closed {
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::DEBUG,
                kind = %probe::Kind::Tickets,
                channel_closed = ?id,
                deleted_tickets,
            );
            self.notify(IndexerNotification::ChannelClosed {
                channel: channel.clone(),
                deleted_tickets,
            });
        }
        self.notify(IndexerNotification::ChannelUpdated(channel.clone()));
        if channel.has_party(&self.self_address) {
            if channel.destination == self.self_address
                && channel.status == ChannelStatus::WaitingForCommitment
            {
                self.notify(IndexerNotification::ChannelWaitingForCommitment(
                    channel.clone(),
                ));
            }
            self.notify(IndexerNotification::OwnChannelUpdated(channel));
        }
        Ok(())
    }

    async fn on_ticket_redeemed(
        &self,
        source: Address,
        destination: Address,
        ticket_index: U256,
        amount: U256,
        snapshot: Snapshot,
    ) -> mixnet_relay_utils::Result<()> {
        let channel_id = mixnet_relay_types::generate_channel_id(
            &source,
            &destination,
        );
        if destination == self.self_address {
            // paid out, so they no longer hold back the channel balance
            let redeemed =
                self.store.delete_redeemed_tickets(&channel_id, ticket_index)?;
            tracing::debug!(
                channel = ?channel_id,
                %ticket_index,
                redeemed,
                "Dropped redeemed tickets",
            );
        }
        if source == self.self_address {
            // floored at zero: a wiped local database lets the counterparty
            // redeem more than we still track as owed.
            let remaining = self.store.resolve_pending_and_snapshot(
                &destination,
                amount,
                &snapshot,
            )?;
            tracing::debug!(
                counterparty = ?destination,
                %amount,
                %remaining,
                "Resolved pending balance",
            );
        } else {
            self.store.update_latest_confirmed_snapshot(&snapshot)?;
        }
        if destination == self.self_address {
            self.metrics.lock().await.tickets_redeemed.inc();
        }
        if source == self.self_address || destination == self.self_address {
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::DEBUG,
                kind = %probe::Kind::Tickets,
                redeemed = ?channel_id,
                %ticket_index,
                %amount,
            );
            self.notify(IndexerNotification::TicketRedeemed {
                channel_id,
                amount,
            });
        }
        Ok(())
    }

    fn registry_event(&self, change: &'static str) {
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::NetworkRegistry,
            change,
        );
    }

    fn notify(&self, notification: IndexerNotification) {
        // nobody listening is fine
        let _ = self.notifications.send(notification);
    }
}

fn parse_announcement(
    account: Address,
    public_key: &[u8],
    multiaddr: Vec<u8>,
    block_number: u64,
) -> mixnet_relay_utils::Result<AccountEntry> {
    let public_key = PublicKey::from_bytes(public_key)?;
    if public_key.to_address() != account {
        return Err(Error::InvalidEventPayload(format!(
            "public key {public_key} does not belong to {account:?}"
        )));
    }
    let multiaddr = Multiaddr::try_from(multiaddr).map_err(|e| {
        Error::InvalidEventPayload(format!("malformed multiaddress: {e}"))
    })?;
    Ok(AccountEntry {
        public_key,
        multiaddr: multiaddr.to_string(),
        updated_block: block_number,
    })
}

fn parse_peer_id(peer_id: &str) -> Option<String> {
    match PeerId::from_str(peer_id) {
        Ok(peer_id) => Some(peer_id.to_string()),
        Err(e) => {
            tracing::warn!(peer_id, "Dropping registry event: {e}");
            None
        }
    }
}
