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

use tokio::sync::Mutex;

use mixnet_relay_store::{ChannelStore, TicketStore};
use mixnet_relay_types::{
    generate_channel_id, AcknowledgedTicket, Address, ChannelStatus, Ticket,
    H256,
};
use mixnet_relay_utils::metric::Metrics;
use mixnet_relay_utils::probe;

use crate::{
    is_winning, validate_locked, CommitmentChain, TicketValidationError,
    ValidationParams,
};

/// Validates tickets against the channels and tickets of a store and keeps
/// the ones worth keeping.
#[derive(typed_builder::TypedBuilder)]
pub struct TicketValidator<S> {
    /// Store holding channels and tickets.
    store: S,
    /// The node's own chain address, the destination of tickets it accepts.
    self_address: Address,
    /// Acceptance limits.
    #[builder(default)]
    params: ValidationParams,
    /// Metrics sink.
    metrics: Arc<Mutex<Metrics>>,
    /// Held from the balance check until the ticket is stored.
    #[builder(default, setter(skip))]
    acceptance: Mutex<()>,
}

impl<S> TicketValidator<S>
where
    S: ChannelStore + TicketStore,
{
    /// Runs the locked validation and stores the ticket as pending when it
    /// passes. Returns the id of the channel the ticket is drawn on.
    #[tracing::instrument(skip_all, fields(index = %ticket.index))]
    pub async fn validate_unacknowledged(
        &self,
        ticket: &Ticket,
    ) -> Result<H256, TicketValidationError> {
        let _acceptance = self.acceptance.lock().await;
        let result = self.check_unacknowledged(ticket);
        match &result {
            Ok(channel_id) => {
                self.store.store_pending_ticket(channel_id, ticket)?;
                tracing::trace!(channel = ?channel_id, "ticket accepted");
            }
            Err(e) => {
                self.metrics.lock().await.tickets_refused.inc();
                tracing::event!(
                    target: probe::TARGET,
                    tracing::Level::DEBUG,
                    kind = %probe::Kind::Tickets,
                    refused = %e,
                );
            }
        }
        result
    }

    fn check_unacknowledged(
        &self,
        ticket: &Ticket,
    ) -> Result<H256, TicketValidationError> {
        if ticket.counterparty != self.self_address {
            return Err(TicketValidationError::InvalidSignature);
        }
        let signer = ticket
            .recover_signer()
            .map_err(|_| TicketValidationError::InvalidSignature)?;
        let channel_id = generate_channel_id(&signer, &self.self_address);
        let channel = self
            .store
            .get_channel(&channel_id)?
            .ok_or(TicketValidationError::ChannelNotFound(channel_id))?;
        if !matches!(
            channel.status,
            ChannelStatus::Open | ChannelStatus::PendingToClose
        ) {
            return Err(TicketValidationError::ChannelNotOpen(channel.status));
        }
        if ticket.channel_epoch != channel.channel_epoch {
            return Err(TicketValidationError::EpochMismatch {
                ticket: ticket.channel_epoch,
                channel: channel.channel_epoch,
            });
        }

        let mut stored = self.store.get_pending_tickets(&channel_id)?;
        stored.extend(
            self.store
                .get_acknowledged_tickets(Some(&channel_id))?
                .into_iter()
                .map(|t| t.ticket),
        );
        // redeemed ones are already taken out of the channel balance
        stored.retain(|t| t.index > channel.ticket_index);
        validate_locked(ticket, &channel, &stored, &self.params)?;
        Ok(channel_id)
    }

    /// Unlocks a pending ticket with its challenge response.
    ///
    /// Winners are stored for redemption and returned, losers are dropped
    /// and `None` is returned.
    #[tracing::instrument(skip_all, fields(channel = ?channel_id))]
    pub async fn acknowledge(
        &self,
        channel_id: &H256,
        challenge: &H256,
        response: &H256,
        commitments: &CommitmentChain,
    ) -> Result<Option<AcknowledgedTicket>, TicketValidationError> {
        let channel = self
            .store
            .get_channel(channel_id)?
            .ok_or(TicketValidationError::ChannelNotFound(*channel_id))?;
        let opening = commitments
            .opening_for(&channel.commitment)
            .ok_or(TicketValidationError::UnknownCommitment(
                channel.commitment,
            ))?;
        let ticket = self
            .store
            .remove_pending_ticket(channel_id, challenge)?
            .ok_or(TicketValidationError::UnknownTicket(*challenge))?;

        if !is_winning(&ticket, response, &opening) {
            tracing::trace!(index = %ticket.index, "ticket lost");
            return Ok(None);
        }
        let acknowledged = AcknowledgedTicket {
            ticket,
            response: *response,
            opening,
            signer: channel.source,
        };
        self.store
            .store_acknowledged_ticket(channel_id, &acknowledged)?;
        self.metrics.lock().await.winning_tickets.inc();
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::Tickets,
            winning = %acknowledged.ticket.index,
            channel = ?channel_id,
        );
        Ok(Some(acknowledged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{channel, ticket};
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::U256;
    use mixnet_relay_store::InMemoryStore;
    use mixnet_relay_types::{ChannelEntry, Snapshot};

    struct Setup {
        store: InMemoryStore,
        validator: TicketValidator<InMemoryStore>,
        wallet: LocalWallet,
        channel: ChannelEntry,
        commitments: CommitmentChain,
    }

    fn setup() -> Setup {
        let wallet: LocalWallet =
            "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"
                .parse()
                .unwrap();
        let me = Address::repeat_byte(2);
        let commitments = CommitmentChain::new(H256::repeat_byte(7), 10);
        let mut ch = channel(100);
        ch.source = wallet.address();
        ch.destination = me;
        ch.commitment = commitments.commitment();
        let store = InMemoryStore::default();
        store
            .update_channel_and_snapshot(
                &ch.get_id(),
                &ch,
                &Snapshot::default(),
            )
            .unwrap();
        let validator = TicketValidator::builder()
            .store(store.clone())
            .self_address(me)
            .metrics(Arc::new(Mutex::new(Metrics::new().unwrap())))
            .build();
        Setup {
            store,
            validator,
            wallet,
            channel: ch,
            commitments,
        }
    }

    fn sign(wallet: &LocalWallet, mut t: Ticket) -> Ticket {
        let digest = ethers::utils::hash_message(t.get_hash().as_bytes());
        t.signature = Some(wallet.sign_hash(digest).unwrap());
        t
    }

    #[tokio::test]
    async fn accepts_until_the_balance_is_exhausted() {
        let s = setup();
        let id = s
            .validator
            .validate_unacknowledged(&sign(&s.wallet, ticket(20, 1)))
            .await
            .unwrap();
        assert_eq!(id, s.channel.get_id());
        assert!(s
            .validator
            .validate_unacknowledged(&sign(&s.wallet, ticket(50, 2)))
            .await
            .is_ok());
        // 20 + 50 + 40 > 100
        assert!(matches!(
            s.validator
                .validate_unacknowledged(&sign(&s.wallet, ticket(40, 3)))
                .await,
            Err(TicketValidationError::InsufficientChannelBalance { .. })
        ));
        assert_eq!(s.store.get_pending_tickets(&id).unwrap().len(), 2);
        let metrics = s.validator.metrics.lock().await;
        assert_eq!(metrics.tickets_refused.get(), 1.0);
    }

    #[tokio::test]
    async fn redeemed_tickets_do_not_count_twice() {
        let s = setup();
        let id = s.channel.get_id();
        let winner = sign(&s.wallet, ticket(60, 1));
        s.validator.validate_unacknowledged(&winner).await.unwrap();
        s.validator
            .acknowledge(
                &id,
                &winner.challenge,
                &H256::repeat_byte(1),
                &s.commitments,
            )
            .await
            .unwrap()
            .unwrap();

        // the winner was redeemed on chain before the store caught up
        let mut redeemed = s.channel.clone();
        redeemed.balance = 40.into();
        redeemed.ticket_index = 1.into();
        s.store
            .update_channel_and_snapshot(
                &id,
                &redeemed,
                &Snapshot::new(1, 0, 0),
            )
            .unwrap();

        s.validator
            .validate_unacknowledged(&sign(&s.wallet, ticket(30, 2)))
            .await
            .unwrap();
        assert!(matches!(
            s.validator
                .validate_unacknowledged(&sign(&s.wallet, ticket(30, 3)))
                .await,
            Err(TicketValidationError::InsufficientChannelBalance {
                required,
                ..
            }) if required == U256::from(60)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tickets_never_overcommit_a_channel() {
        let s = setup();
        let id = s.channel.get_id();
        let validator = Arc::new(s.validator);
        let handles: Vec<_> = (1..=8u64)
            .map(|index| {
                let validator = validator.clone();
                let ticket = sign(&s.wallet, ticket(30, index));
                tokio::spawn(async move {
                    validator.validate_unacknowledged(&ticket).await
                })
            })
            .collect();
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        let pending = s.store.get_pending_tickets(&id).unwrap();
        assert_eq!(pending.len(), accepted);
        // 4 * 30 > 100
        assert!((1..=3).contains(&accepted));
    }

    #[tokio::test]
    async fn refuses_foreign_signatures_and_old_epochs() {
        let s = setup();
        let stranger = LocalWallet::new(&mut ethers::core::rand::thread_rng());
        assert!(matches!(
            s.validator
                .validate_unacknowledged(&sign(&stranger, ticket(1, 1)))
                .await,
            Err(TicketValidationError::ChannelNotFound(_))
        ));
        assert!(matches!(
            s.validator.validate_unacknowledged(&ticket(1, 1)).await,
            Err(TicketValidationError::InvalidSignature)
        ));
        let mut old = ticket(1, 1);
        old.channel_epoch = U256::zero();
        assert!(matches!(
            s.validator
                .validate_unacknowledged(&sign(&s.wallet, old))
                .await,
            Err(TicketValidationError::EpochMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn refuses_tickets_on_closed_channels() {
        let s = setup();
        let mut closed = s.channel.clone();
        closed.status = ChannelStatus::Closed;
        s.store
            .update_channel_and_snapshot(
                &closed.get_id(),
                &closed,
                &Snapshot::default(),
            )
            .unwrap();
        assert!(matches!(
            s.validator
                .validate_unacknowledged(&sign(&s.wallet, ticket(1, 1)))
                .await,
            Err(TicketValidationError::ChannelNotOpen(ChannelStatus::Closed))
        ));
    }

    #[tokio::test]
    async fn winners_are_stored_losers_dropped() {
        let s = setup();
        let id = s.channel.get_id();
        let winner = sign(&s.wallet, ticket(10, 1));
        // wins only if the hash is zero.
        let mut loser = ticket(10, 2);
        loser.win_prob = U256::one();
        let loser = sign(&s.wallet, loser);

        s.validator.validate_unacknowledged(&winner).await.unwrap();
        // the default minimum refuses such a ticket, store it directly.
        s.store.store_pending_ticket(&id, &loser).unwrap();

        let response = H256::repeat_byte(1);
        let won = s
            .validator
            .acknowledge(&id, &winner.challenge, &response, &s.commitments)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(won.signer, s.wallet.address());
        assert_eq!(
            won.opening,
            s.commitments.opening_for(&s.channel.commitment).unwrap()
        );
        let lost = s
            .validator
            .acknowledge(&id, &loser.challenge, &response, &s.commitments)
            .await
            .unwrap();
        assert!(lost.is_none());
        let acked = s.store.get_acknowledged_tickets(Some(&id)).unwrap();
        assert_eq!(acked.len(), 1);
        assert!(s.store.get_pending_tickets(&id).unwrap().is_empty());
        assert!(matches!(
            s.validator
                .acknowledge(&id, &loser.challenge, &response, &s.commitments)
                .await,
            Err(TicketValidationError::UnknownTicket(_))
        ));
    }
}
