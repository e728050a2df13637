//! MLS group management
//!
//! Owns the lifecycle of MLS groups: key packages, group creation, welcome
//! processing, commit staging and acceptance, pending proposals, epoch
//! tracking, and group wipe. Only reachable through an open transaction.
//!
//! Epoch ordering is enforced here, not in the engine: a commit at or below
//! the local epoch is a stale duplicate and is dropped; a commit skipping
//! past local+1 is a synchronization gap the caller must resolve with a full
//! re-join (see `join_by_external_commit`).

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core_crypto::engine::CryptoEngine;
use crate::core_crypto::errors::{CryptoError, CryptoResult};
use crate::core_crypto::types::{
    CommitBundle, CommitMessage, GroupId, MlsMessage, QualifiedClientId, WelcomeMessage,
};
use crate::metrics::record_counter;

/// What processing one inbound MLS message produced
#[derive(Debug)]
pub enum DecryptedMlsMessage {
    /// An application payload for the conversation
    Application(Vec<u8>),
    /// A remote commit was applied; the group moved to this epoch
    CommitApplied {
        /// Epoch after application
        new_epoch: u64,
    },
    /// A proposal was buffered for a later `commit_pending_proposals`
    ProposalBuffered,
}

/// Group sub-context of one open transaction
pub struct MlsGroupManager<E: CryptoEngine> {
    engine: Arc<Mutex<E>>,
}

impl<E: CryptoEngine> MlsGroupManager<E> {
    pub(crate) fn new(engine: Arc<Mutex<E>>) -> Self {
        Self { engine }
    }

    /// Generate key packages for peers who may add this client to a group
    pub async fn generate_key_packages(&self, amount: usize) -> CryptoResult<Vec<Vec<u8>>> {
        let packages = self.engine.lock().await.mls_generate_key_packages(amount).await?;
        record_counter("mls.key_packages.created", packages.len() as u64);
        Ok(packages)
    }

    /// Number of generated key packages not yet consumed by a welcome
    pub async fn valid_key_package_count(&self) -> CryptoResult<u64> {
        self.engine.lock().await.mls_valid_key_package_count().await
    }

    /// Create a group at epoch zero with only the local client as member
    pub async fn create_conversation(&self, group_id: &GroupId) -> CryptoResult<()> {
        self.engine.lock().await.mls_create_group(group_id).await?;
        record_counter("mls.groups.created", 1);
        info!(group = %group_id, "conversation created");
        Ok(())
    }

    /// Join a group from a welcome message, returning the embedded group id
    pub async fn process_welcome_message(
        &self,
        welcome: &WelcomeMessage,
    ) -> CryptoResult<GroupId> {
        let group_id = self.engine.lock().await.mls_process_welcome(welcome).await?;
        record_counter("mls.welcomes.processed", 1);
        info!(group = %group_id, epoch = welcome.epoch, "joined conversation from welcome");
        Ok(group_id)
    }

    /// Stage a commit adding the owners of the given key packages.
    ///
    /// Returns `None` for an empty key package list. The bundle must be
    /// distributed before the commit counts; the local epoch only advances
    /// on `commit_accepted`.
    pub async fn add_members(
        &self,
        group_id: &GroupId,
        key_packages: &[Vec<u8>],
    ) -> CryptoResult<Option<CommitBundle>> {
        if key_packages.is_empty() {
            return Ok(None);
        }
        let bundle = self.engine.lock().await.mls_stage_add(group_id, key_packages).await?;
        record_counter("mls.commits.staged", 1);
        debug!(group = %group_id, added = key_packages.len(), "staged add commit");
        Ok(Some(bundle))
    }

    /// Stage a commit removing the given members. Returns `None` for an
    /// empty member list.
    pub async fn remove_members(
        &self,
        group_id: &GroupId,
        members: &[QualifiedClientId],
    ) -> CryptoResult<Option<CommitBundle>> {
        if members.is_empty() {
            return Ok(None);
        }
        let bundle = self.engine.lock().await.mls_stage_remove(group_id, members).await?;
        record_counter("mls.commits.staged", 1);
        debug!(group = %group_id, removed = members.len(), "staged remove commit");
        Ok(Some(bundle))
    }

    /// Stage a proactive key-rotation commit
    pub async fn update_keying_material(&self, group_id: &GroupId) -> CryptoResult<CommitBundle> {
        let bundle = self.engine.lock().await.mls_stage_update(group_id).await?;
        record_counter("mls.commits.staged", 1);
        debug!(group = %group_id, "staged keying material update");
        Ok(bundle)
    }

    /// Fold all buffered proposals into one staged commit. Returns `None`
    /// when nothing is pending; that is not an error.
    pub async fn commit_pending_proposals(
        &self,
        group_id: &GroupId,
    ) -> CryptoResult<Option<CommitBundle>> {
        let mut engine = self.engine.lock().await;
        if engine.mls_pending_proposal_count(group_id).await? == 0 {
            return Ok(None);
        }
        let bundle = engine.mls_stage_pending_proposals(group_id).await?;
        record_counter("mls.commits.staged", 1);
        debug!(group = %group_id, "staged pending proposals");
        Ok(Some(bundle))
    }

    /// Mark the staged commit as accepted by the distribution service; the
    /// epoch advances by exactly one. Rejects when nothing is pending, which
    /// indicates a desynchronized caller.
    pub async fn commit_accepted(&self, group_id: &GroupId) -> CryptoResult<u64> {
        let epoch = self.engine.lock().await.mls_commit_accepted(group_id).await?;
        record_counter("mls.commits.accepted", 1);
        info!(group = %group_id, epoch, "commit accepted");
        Ok(epoch)
    }

    /// Discard the staged commit without advancing the epoch
    pub async fn clear_pending_commit(&self, group_id: &GroupId) -> CryptoResult<()> {
        self.engine.lock().await.mls_clear_pending_commit(group_id).await?;
        debug!(group = %group_id, "cleared pending commit");
        Ok(())
    }

    /// Apply a commit received from another member, under the ordering
    /// policy: stale duplicates are dropped, gaps surface as a resync
    /// condition.
    pub async fn process_incoming_commit(&self, commit: &CommitMessage) -> CryptoResult<u64> {
        let mut engine = self.engine.lock().await;
        let local = engine.mls_group_epoch(&commit.group_id).await?;
        if commit.epoch <= local {
            warn!(group = %commit.group_id, local, received = commit.epoch, "dropping stale commit");
            return Err(CryptoError::StaleEpochCommit { local, received: commit.epoch });
        }
        if commit.epoch > local + 1 {
            warn!(group = %commit.group_id, local, received = commit.epoch, "commit skips epochs");
            return Err(CryptoError::EpochGapDetected { local, received: commit.epoch });
        }
        let epoch = engine.mls_apply_commit(commit).await?;
        record_counter("mls.commits.applied", 1);
        debug!(group = %commit.group_id, epoch, "applied remote commit");
        Ok(epoch)
    }

    /// Seal an application message for the group, producing wire bytes
    pub async fn encrypt_message(
        &self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let message = self.engine.lock().await.mls_encrypt(group_id, plaintext).await?;
        record_counter("mls.messages.encrypted", 1);
        MlsMessage::Application(message).to_bytes()
    }

    /// Process one inbound MLS wire message: decrypt application payloads,
    /// apply commits under the ordering policy, buffer proposals.
    pub async fn decrypt_message(&self, bytes: &[u8]) -> CryptoResult<DecryptedMlsMessage> {
        match MlsMessage::from_bytes(bytes)? {
            MlsMessage::Application(message) => {
                let mut engine = self.engine.lock().await;
                let local = engine.mls_group_epoch(&message.group_id).await?;
                if message.epoch > local {
                    return Err(CryptoError::EpochGapDetected {
                        local,
                        received: message.epoch,
                    });
                }
                if message.epoch < local {
                    return Err(CryptoError::MalformedCiphertext(format!(
                        "message sealed under epoch {}, local epoch is {}",
                        message.epoch, local
                    )));
                }
                let plaintext = engine.mls_decrypt(&message.group_id, &message).await?;
                record_counter("mls.messages.decrypted", 1);
                Ok(DecryptedMlsMessage::Application(plaintext))
            }
            MlsMessage::Commit(commit) => {
                let new_epoch = self.process_incoming_commit(&commit).await?;
                Ok(DecryptedMlsMessage::CommitApplied { new_epoch })
            }
            MlsMessage::Proposal { group_id, epoch, payload } => {
                let mut engine = self.engine.lock().await;
                let local = engine.mls_group_epoch(&group_id).await?;
                if epoch < local {
                    return Err(CryptoError::StaleEpochCommit { local, received: epoch });
                }
                if epoch > local {
                    return Err(CryptoError::EpochGapDetected { local, received: epoch });
                }
                engine.mls_buffer_proposal(&group_id, &payload).await?;
                record_counter("mls.proposals.buffered", 1);
                Ok(DecryptedMlsMessage::ProposalBuffered)
            }
        }
    }

    /// Re-join a group from public group info after an orphaned welcome or
    /// a detected epoch gap
    pub async fn join_by_external_commit(
        &self,
        group_info: &[u8],
    ) -> CryptoResult<(GroupId, CommitBundle)> {
        let (group_id, bundle) =
            self.engine.lock().await.mls_join_by_external_commit(group_info).await?;
        record_counter("mls.external_joins", 1);
        info!(group = %group_id, "joined conversation by external commit");
        Ok((group_id, bundle))
    }

    /// Current epoch; pure read
    pub async fn conversation_epoch(&self, group_id: &GroupId) -> CryptoResult<u64> {
        self.engine.lock().await.mls_group_epoch(group_id).await
    }

    /// Whether the group exists locally; pure read
    pub async fn conversation_exists(&self, group_id: &GroupId) -> CryptoResult<bool> {
        self.engine.lock().await.mls_group_exists(group_id).await
    }

    /// Current membership; pure read
    pub async fn members(&self, group_id: &GroupId) -> CryptoResult<Vec<QualifiedClientId>> {
        self.engine.lock().await.mls_group_members(group_id).await
    }

    /// Irreversibly discard all cryptographic state for the group.
    /// Idempotent.
    pub async fn wipe_conversation(&self, group_id: &GroupId) -> CryptoResult<()> {
        self.engine.lock().await.mls_wipe_group(group_id).await?;
        info!(group = %group_id, "conversation wiped");
        Ok(())
    }

    /// Destroy all MLS state for all groups, for logout/reset. Irreversible.
    pub async fn clear_local_files(&self) -> CryptoResult<()> {
        self.engine.lock().await.mls_clear_all().await?;
        info!("all local group state cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crypto::engine::MemoryCryptoEngine;
    use crate::core_crypto::types::{ClientId, QualifiedId};

    fn client(name: &str) -> QualifiedClientId {
        QualifiedClientId::new(QualifiedId::random("example.com"), ClientId::new(name))
    }

    fn manager(name: &str) -> MlsGroupManager<MemoryCryptoEngine> {
        MlsGroupManager::new(Arc::new(Mutex::new(MemoryCryptoEngine::with_identity(client(
            name,
        )))))
    }

    async fn two_member_group(
        alice: &MlsGroupManager<MemoryCryptoEngine>,
        bob: &MlsGroupManager<MemoryCryptoEngine>,
    ) -> GroupId {
        let group = GroupId::random();
        alice.create_conversation(&group).await.unwrap();
        let kps = bob.generate_key_packages(1).await.unwrap();
        let bundle = alice.add_members(&group, &kps).await.unwrap().unwrap();
        alice.commit_accepted(&group).await.unwrap();
        bob.process_welcome_message(bundle.welcome.as_ref().unwrap()).await.unwrap();
        group
    }

    #[tokio::test]
    async fn test_create_conversation() {
        let alice = manager("alice");
        let group = GroupId::random();

        assert!(!alice.conversation_exists(&group).await.unwrap());
        alice.create_conversation(&group).await.unwrap();
        assert!(alice.conversation_exists(&group).await.unwrap());
        assert_eq!(alice.conversation_epoch(&group).await.unwrap(), 0);

        let result = alice.create_conversation(&group).await;
        assert!(matches!(result, Err(CryptoError::GroupAlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_add_members_advances_epoch_only_on_accept() {
        let alice = manager("alice");
        let bob = manager("bob");
        let group = GroupId::random();

        alice.create_conversation(&group).await.unwrap();
        let kps = bob.generate_key_packages(1).await.unwrap();
        let bundle = alice.add_members(&group, &kps).await.unwrap().unwrap();
        assert!(bundle.welcome.is_some());

        // Staged but not yet accepted
        assert_eq!(alice.conversation_epoch(&group).await.unwrap(), 0);
        let epoch = alice.commit_accepted(&group).await.unwrap();
        assert_eq!(epoch, 1);
        assert_eq!(alice.members(&group).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_members_empty_is_noop() {
        let alice = manager("alice");
        let group = GroupId::random();
        alice.create_conversation(&group).await.unwrap();

        let bundle = alice.add_members(&group, &[]).await.unwrap();
        assert!(bundle.is_none());
    }

    #[tokio::test]
    async fn test_commit_accepted_twice_fails() {
        let alice = manager("alice");
        let group = GroupId::random();
        alice.create_conversation(&group).await.unwrap();

        alice.update_keying_material(&group).await.unwrap();
        alice.commit_accepted(&group).await.unwrap();

        let result = alice.commit_accepted(&group).await;
        assert!(matches!(result, Err(CryptoError::NoPendingCommit(_))));
    }

    #[tokio::test]
    async fn test_clear_pending_commit_keeps_epoch() {
        let alice = manager("alice");
        let group = GroupId::random();
        alice.create_conversation(&group).await.unwrap();

        alice.update_keying_material(&group).await.unwrap();
        alice.clear_pending_commit(&group).await.unwrap();
        assert_eq!(alice.conversation_epoch(&group).await.unwrap(), 0);

        let result = alice.commit_accepted(&group).await;
        assert!(matches!(result, Err(CryptoError::NoPendingCommit(_))));
    }

    #[tokio::test]
    async fn test_stale_commit_dropped() {
        let alice = manager("alice");
        let bob = manager("bob");
        let group = two_member_group(&alice, &bob).await;

        // Bob stages and accepts a rotation; alice applies it
        let bundle = bob.update_keying_material(&group).await.unwrap();
        bob.commit_accepted(&group).await.unwrap();
        alice.process_incoming_commit(&bundle.commit).await.unwrap();
        assert_eq!(alice.conversation_epoch(&group).await.unwrap(), 2);

        // The same commit again is a stale duplicate
        let result = alice.process_incoming_commit(&bundle.commit).await;
        assert!(matches!(result, Err(CryptoError::StaleEpochCommit { local: 2, received: 2 })));
        assert_eq!(alice.conversation_epoch(&group).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_epoch_gap_detected() {
        let alice = manager("alice");
        let bob = manager("bob");
        let group = two_member_group(&alice, &bob).await;

        // Bob advances twice; alice only sees the second commit
        let first = bob.update_keying_material(&group).await.unwrap();
        bob.commit_accepted(&group).await.unwrap();
        let second = bob.update_keying_material(&group).await.unwrap();
        bob.commit_accepted(&group).await.unwrap();
        drop(first);

        let result = alice.process_incoming_commit(&second.commit).await;
        assert!(matches!(result, Err(CryptoError::EpochGapDetected { local: 1, received: 3 })));
        assert_eq!(alice.conversation_epoch(&group).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commit_exactly_next_epoch_applies() {
        let alice = manager("alice");
        let bob = manager("bob");
        let group = two_member_group(&alice, &bob).await;

        let before = alice.conversation_epoch(&group).await.unwrap();
        let bundle = bob.update_keying_material(&group).await.unwrap();
        bob.commit_accepted(&group).await.unwrap();

        let epoch = alice.process_incoming_commit(&bundle.commit).await.unwrap();
        assert_eq!(epoch, before + 1);
    }

    #[tokio::test]
    async fn test_application_message_roundtrip() {
        let alice = manager("alice");
        let bob = manager("bob");
        let group = two_member_group(&alice, &bob).await;

        let wire = alice.encrypt_message(&group, b"hello group").await.unwrap();
        let decrypted = bob.decrypt_message(&wire).await.unwrap();
        match decrypted {
            DecryptedMlsMessage::Application(plaintext) => assert_eq!(plaintext, b"hello group"),
            other => panic!("expected application message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_commit_pending_proposals_noop_when_empty() {
        let alice = manager("alice");
        let group = GroupId::random();
        alice.create_conversation(&group).await.unwrap();

        let bundle = alice.commit_pending_proposals(&group).await.unwrap();
        assert!(bundle.is_none());
    }

    #[tokio::test]
    async fn test_proposal_buffered_and_folded() {
        let alice = manager("alice");
        let bob = manager("bob");
        let carol = manager("carol");
        let group = two_member_group(&alice, &bob).await;

        // A remote member proposes adding carol
        let carol_kps = carol.generate_key_packages(1).await.unwrap();
        let proposal = MlsMessage::Proposal {
            group_id: group.clone(),
            epoch: alice.conversation_epoch(&group).await.unwrap(),
            payload: MemoryCryptoEngine::encode_add_proposal(&carol_kps[0]).unwrap(),
        };
        let result = alice.decrypt_message(&proposal.to_bytes().unwrap()).await.unwrap();
        assert!(matches!(result, DecryptedMlsMessage::ProposalBuffered));

        // Another proposes removing one of bob's devices
        let bob_member = alice
            .members(&group)
            .await
            .unwrap()
            .into_iter()
            .find(|member| member.client.as_str() == "bob")
            .unwrap();
        let removal = MlsMessage::Proposal {
            group_id: group.clone(),
            epoch: alice.conversation_epoch(&group).await.unwrap(),
            payload: MemoryCryptoEngine::encode_remove_proposal(&bob_member).unwrap(),
        };
        let result = alice.decrypt_message(&removal.to_bytes().unwrap()).await.unwrap();
        assert!(matches!(result, DecryptedMlsMessage::ProposalBuffered));

        let bundle = alice.commit_pending_proposals(&group).await.unwrap().unwrap();
        assert!(bundle.welcome.is_some());
        alice.commit_accepted(&group).await.unwrap();

        // Carol came in, bob went out
        let members = alice.members(&group).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(!members.contains(&bob_member));

        // Nothing left to fold afterwards
        let bundle = alice.commit_pending_proposals(&group).await.unwrap();
        assert!(bundle.is_none());
    }

    #[tokio::test]
    async fn test_external_join_after_gap() {
        let alice = manager("alice");
        let bob = manager("bob");
        let group = two_member_group(&alice, &bob).await;

        // Bob falls behind and resyncs from the latest group info
        let first = alice.update_keying_material(&group).await.unwrap();
        alice.commit_accepted(&group).await.unwrap();
        let second = alice.update_keying_material(&group).await.unwrap();
        alice.commit_accepted(&group).await.unwrap();
        drop(first);

        bob.wipe_conversation(&group).await.unwrap();
        let (joined, join_bundle) =
            bob.join_by_external_commit(&second.group_info).await.unwrap();
        assert_eq!(joined, group);

        alice.process_incoming_commit(&join_bundle.commit).await.unwrap();
        assert_eq!(
            alice.conversation_epoch(&group).await.unwrap(),
            bob.conversation_epoch(&group).await.unwrap()
        );

        let wire = bob.encrypt_message(&group, b"back in sync").await.unwrap();
        match alice.decrypt_message(&wire).await.unwrap() {
            DecryptedMlsMessage::Application(plaintext) => assert_eq!(plaintext, b"back in sync"),
            other => panic!("expected application message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wipe_and_clear() {
        let alice = manager("alice");
        let group = GroupId::random();
        alice.create_conversation(&group).await.unwrap();

        alice.wipe_conversation(&group).await.unwrap();
        assert!(!alice.conversation_exists(&group).await.unwrap());
        alice.wipe_conversation(&group).await.unwrap();

        let other = GroupId::random();
        alice.create_conversation(&other).await.unwrap();
        alice.generate_key_packages(3).await.unwrap();
        alice.clear_local_files().await.unwrap();
        assert!(!alice.conversation_exists(&other).await.unwrap());
        assert_eq!(alice.valid_key_package_count().await.unwrap(), 0);
    }
}
