//! Cryptographic engine abstraction
//!
//! The engine is the opaque, stateful collaborator holding private key
//! material, the pairwise-session table, and the MLS-group table. The
//! orchestration layer never touches key material directly; it drives the
//! engine through this trait and adds lifecycle, ordering, and transaction
//! discipline on top.
//!
//! `MemoryCryptoEngine` is a complete in-memory implementation used by tests
//! and embedders that do not need durable storage.

use async_trait::async_trait;

use super::errors::CryptoResult;
use super::types::{
    ApplicationMessage, CommitBundle, CommitMessage, GroupId, QualifiedClientId, WelcomeMessage,
};

mod memory;

pub use memory::MemoryCryptoEngine;

/// Primitive operations of the underlying cryptographic engine.
///
/// Implementations are not required to be safe under concurrent mutation;
/// the transaction layer serializes all access. `snapshot`/`restore` give
/// the transaction layer its all-or-nothing guarantee.
#[async_trait]
pub trait CryptoEngine: Send + Sync + 'static {
    /// Opaque rollback token capturing the full engine state
    type Snapshot: Send;

    /// Create the local identity if it does not exist yet
    async fn init_identity(&mut self) -> CryptoResult<()>;

    /// Whether a local identity exists
    async fn has_identity(&self) -> bool;

    // --- Proteus primitives ---

    /// Generate (or regenerate) the prekey with the given id, returning the
    /// encoded public bundle
    async fn proteus_new_prekey(&mut self, id: u16) -> CryptoResult<Vec<u8>>;

    /// Ids of all prekeys issued so far, last-resort included
    async fn proteus_issued_prekey_ids(&self) -> CryptoResult<Vec<u16>>;

    /// The reserved last-resort prekey; generated once, stable afterwards
    async fn proteus_last_resort_prekey(&mut self) -> CryptoResult<Vec<u8>>;

    /// Whether a session exists for the given id
    async fn proteus_session_exists(&self, session: &QualifiedClientId) -> CryptoResult<bool>;

    /// Establish a session from a peer's prekey bundle
    async fn proteus_session_from_prekey(
        &mut self,
        session: &QualifiedClientId,
        prekey: &[u8],
    ) -> CryptoResult<()>;

    /// Delete a session; missing sessions are ignored
    async fn proteus_session_delete(&mut self, session: &QualifiedClientId) -> CryptoResult<()>;

    /// Encrypt for an existing session, advancing the sending ratchet
    async fn proteus_encrypt(
        &mut self,
        session: &QualifiedClientId,
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>>;

    /// Decrypt, creating the session implicitly from an embedded prekey
    /// message when none exists.
    ///
    /// The receiving ratchet advances even when authentication fails after
    /// the chain was stepped; callers must not retry the same ciphertext.
    async fn proteus_decrypt(
        &mut self,
        session: &QualifiedClientId,
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>>;

    /// Fingerprint of the local identity key
    async fn proteus_local_fingerprint(&self) -> CryptoResult<String>;

    /// Fingerprint of the peer identity behind a session
    async fn proteus_remote_fingerprint(
        &self,
        session: &QualifiedClientId,
    ) -> CryptoResult<String>;

    /// Fingerprint of the identity key inside a prekey bundle
    async fn proteus_prekey_fingerprint(&self, prekey: &[u8]) -> CryptoResult<String>;

    // --- MLS primitives ---

    /// Generate key packages for distribution to peers
    async fn mls_generate_key_packages(&mut self, amount: usize) -> CryptoResult<Vec<Vec<u8>>>;

    /// Number of generated key packages not yet consumed by a welcome
    async fn mls_valid_key_package_count(&self) -> CryptoResult<u64>;

    /// Create a group at epoch zero with only the local client as member
    async fn mls_create_group(&mut self, group: &GroupId) -> CryptoResult<()>;

    /// Whether the group exists locally
    async fn mls_group_exists(&self, group: &GroupId) -> CryptoResult<bool>;

    /// Current epoch of the group
    async fn mls_group_epoch(&self, group: &GroupId) -> CryptoResult<u64>;

    /// Current members of the group
    async fn mls_group_members(
        &self,
        group: &GroupId,
    ) -> CryptoResult<Vec<QualifiedClientId>>;

    /// Stage a commit adding the given key packages' owners
    async fn mls_stage_add(
        &mut self,
        group: &GroupId,
        key_packages: &[Vec<u8>],
    ) -> CryptoResult<CommitBundle>;

    /// Stage a commit removing the given members
    async fn mls_stage_remove(
        &mut self,
        group: &GroupId,
        members: &[QualifiedClientId],
    ) -> CryptoResult<CommitBundle>;

    /// Stage a keying-material rotation commit
    async fn mls_stage_update(&mut self, group: &GroupId) -> CryptoResult<CommitBundle>;

    /// Buffer a proposal received from the network
    async fn mls_buffer_proposal(
        &mut self,
        group: &GroupId,
        payload: &[u8],
    ) -> CryptoResult<()>;

    /// Number of buffered proposals
    async fn mls_pending_proposal_count(&self, group: &GroupId) -> CryptoResult<usize>;

    /// Stage a commit folding all buffered proposals
    async fn mls_stage_pending_proposals(&mut self, group: &GroupId)
        -> CryptoResult<CommitBundle>;

    /// Whether a staged commit awaits acceptance
    async fn mls_has_pending_commit(&self, group: &GroupId) -> CryptoResult<bool>;

    /// Apply the staged commit, advancing the epoch by exactly one.
    /// Returns the new epoch.
    async fn mls_commit_accepted(&mut self, group: &GroupId) -> CryptoResult<u64>;

    /// Discard the staged commit without advancing the epoch
    async fn mls_clear_pending_commit(&mut self, group: &GroupId) -> CryptoResult<()>;

    /// Join a group from a welcome message, returning its id
    async fn mls_process_welcome(&mut self, welcome: &WelcomeMessage) -> CryptoResult<GroupId>;

    /// Join a group from public group info, producing the external commit to
    /// distribute
    async fn mls_join_by_external_commit(
        &mut self,
        group_info: &[u8],
    ) -> CryptoResult<(GroupId, CommitBundle)>;

    /// Apply a remote commit to local group state. Ordering is enforced by
    /// the caller; the engine applies the membership operations and advances
    /// the epoch by one.
    async fn mls_apply_commit(&mut self, commit: &CommitMessage) -> CryptoResult<u64>;

    /// Seal an application message under the current epoch
    async fn mls_encrypt(
        &mut self,
        group: &GroupId,
        plaintext: &[u8],
    ) -> CryptoResult<ApplicationMessage>;

    /// Open an application message sealed under the current epoch
    async fn mls_decrypt(
        &mut self,
        group: &GroupId,
        message: &ApplicationMessage,
    ) -> CryptoResult<Vec<u8>>;

    /// Irreversibly discard all state for one group; missing groups are
    /// ignored
    async fn mls_wipe_group(&mut self, group: &GroupId) -> CryptoResult<()>;

    /// Destroy all MLS state for all groups
    async fn mls_clear_all(&mut self) -> CryptoResult<()>;

    // --- Transaction support ---

    /// Capture the full engine state for rollback
    fn snapshot(&self) -> Self::Snapshot;

    /// Restore a previously captured state
    fn restore(&mut self, snapshot: Self::Snapshot);
}
