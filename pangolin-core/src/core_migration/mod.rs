//! Conversation protocol migration
//!
//! Decides, per conversation, which protocol is authoritative and drives
//! the one-way migration from Proteus to MLS. Policy changes arrive as
//! [`MigrationConfigChanged`] events over a channel and are handled
//! single-threaded, so each conversation's state machine only ever moves
//! forward.
//!
//! Network distribution of commit bundles happens strictly outside open
//! transactions: the coordinator stages the group mutation in one
//! transaction, hands the bundle to the distributor, and only then marks
//! the commit accepted in a second transaction.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core_crypto::engine::CryptoEngine;
use crate::core_crypto::errors::CryptoResult;
use crate::core_crypto::transaction::TransactionProvider;
use crate::core_crypto::types::{CommitBundle, GroupId, QualifiedId};
use crate::metrics::record_counter;

mod state;
mod store;

pub use state::{
    ConversationProtocolState, MigrationConfig, MigrationConfigChanged, MigrationStatus,
    Participant, Protocol,
};
pub use store::{MemoryProtocolStateStore, ProtocolStateStore};

/// Hands commit bundles to the network layer for delivery to the group.
///
/// Delivery failures are per-recipient conditions reported as retryable
/// errors; the coordinator reacts by keeping the migration `InProgress`.
#[async_trait]
pub trait CommitDistributor: Send + Sync {
    /// Deliver a commit bundle to the members of a group
    async fn distribute(&self, group_id: &GroupId, bundle: &CommitBundle) -> CryptoResult<()>;
}

/// Pick the protocol for a *new* conversation.
///
/// MLS wins only when the server prefers it and every intended participant
/// supports it; any non-MLS participant forces Proteus.
pub fn select_protocol(config: &MigrationConfig, participants: &[Participant]) -> Protocol {
    match config.default_protocol {
        Protocol::Mls if participants.iter().all(|p| p.supports_mls) => Protocol::Mls,
        _ => Protocol::Proteus,
    }
}

/// Drives per-conversation protocol decisions and Proteus-to-MLS migration
pub struct ProtocolMigrationCoordinator<E, S, D>
where
    E: CryptoEngine,
    S: ProtocolStateStore,
    D: CommitDistributor,
{
    transactions: TransactionProvider<E>,
    store: Arc<S>,
    distributor: Arc<D>,
}

impl<E, S, D> ProtocolMigrationCoordinator<E, S, D>
where
    E: CryptoEngine,
    S: ProtocolStateStore,
    D: CommitDistributor,
{
    /// Create a coordinator over one store connection
    pub fn new(transactions: TransactionProvider<E>, store: Arc<S>, distributor: Arc<D>) -> Self {
        Self { transactions, store, distributor }
    }

    /// Consume policy-change events until the channel closes. Errors are
    /// logged and do not stop the loop; a later event retries the
    /// conversation.
    pub async fn run(&self, mut events: mpsc::Receiver<MigrationConfigChanged>) {
        while let Some(event) = events.recv().await {
            if let Err(error) = self
                .handle(&event.conversation, &event.config, &event.participants)
                .await
            {
                warn!(
                    conversation = %event.conversation,
                    %error,
                    "migration step failed; will retry on next policy change"
                );
            }
        }
        debug!("migration event channel closed");
    }

    /// Apply the current migration policy to one conversation.
    ///
    /// A conversation whose migration already completed is left untouched.
    /// A conversation stays `InProgress` (and on Proteus) until every
    /// participant supports MLS and the commit bundle was distributed.
    pub async fn handle(
        &self,
        conversation: &QualifiedId,
        config: &MigrationConfig,
        participants: &[Participant],
    ) -> CryptoResult<ConversationProtocolState> {
        let mut state = self
            .store
            .protocol_state(conversation)
            .await?
            .unwrap_or_else(|| ConversationProtocolState::initial(conversation.clone()));

        if state.migration == MigrationStatus::Completed {
            debug!(conversation = %conversation, "migration already completed");
            return Ok(state);
        }
        if !config.migration_enabled {
            return Ok(state);
        }

        if state.migration == MigrationStatus::NotStarted {
            state.migration = MigrationStatus::InProgress;
            self.store.set_protocol_state(state.clone()).await?;
            info!(conversation = %conversation, "migration started");
        }

        if !participants.iter().all(|p| p.supports_mls) {
            let missing = participants.iter().filter(|p| !p.supports_mls).count();
            info!(
                conversation = %conversation,
                missing,
                "migration waiting for participants without MLS support"
            );
            return Ok(state);
        }

        let group_id = self.establish_group(conversation, participants).await?;

        state.active_protocol = Protocol::Mls;
        state.migration = MigrationStatus::Completed;
        self.store.set_protocol_state(state.clone()).await?;
        record_counter("migration.conversations.completed", 1);
        info!(conversation = %conversation, group = %group_id, "migration completed");
        Ok(state)
    }

    /// Create the parallel MLS group and bring all participants in. The
    /// commit bundle is distributed between the staging and acceptance
    /// transactions, never inside one.
    async fn establish_group(
        &self,
        conversation: &QualifiedId,
        participants: &[Participant],
    ) -> CryptoResult<GroupId> {
        let group_id = match self.store.group_for_conversation(conversation).await? {
            Some(group_id) => group_id,
            None => {
                let group_id = GroupId::random();
                self.store
                    .set_group_for_conversation(conversation, &group_id)
                    .await?;
                group_id
            }
        };

        let key_packages: Vec<Vec<u8>> = participants
            .iter()
            .filter_map(|p| p.key_package.clone())
            .collect();

        let staging_group = group_id.clone();
        let bundle = self
            .transactions
            .mls_transaction("migration-establish", |mls| async move {
                if !mls.conversation_exists(&staging_group).await? {
                    mls.create_conversation(&staging_group).await?;
                }
                mls.add_members(&staging_group, &key_packages).await
            })
            .await?;

        if let Some(bundle) = bundle {
            if let Err(error) = self.distributor.distribute(&group_id, &bundle).await {
                // Staged state must not outlive a failed distribution
                let cleanup_group = group_id.clone();
                self.transactions
                    .mls_transaction("migration-clear", |mls| async move {
                        mls.clear_pending_commit(&cleanup_group).await
                    })
                    .await?;
                return Err(error);
            }

            let accept_group = group_id.clone();
            self.transactions
                .mls_transaction("migration-accept", |mls| async move {
                    mls.commit_accepted(&accept_group).await
                })
                .await?;
        }

        Ok(group_id)
    }
}
