//! Error types for the crypto orchestration layer

use thiserror::Error;

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur in session, group, and transaction operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// No local identity has been created yet
    #[error("Identity missing: {0}")]
    IdentityMissing(String),

    /// No pairwise session exists for the given session id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A pairwise session already exists for the given session id
    #[error("Session already exists: {0}")]
    SessionAlreadyExists(String),

    /// Ciphertext could not be parsed or authenticated
    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    /// A message with this counter was already decrypted
    #[error("Duplicate message: {0}")]
    DuplicateMessage(String),

    /// A peer's prekey bundle could not be parsed
    #[error("Malformed prekey bundle: {0}")]
    MalformedPreKeyBundle(String),

    /// A peer's key package could not be parsed or verified
    #[error("Malformed key package: {0}")]
    MalformedKeyPackage(String),

    /// Commit for an epoch at or below the local epoch; drop it
    #[error("Stale commit: local epoch {local}, received {received}")]
    StaleEpochCommit { local: u64, received: u64 },

    /// Commit skips ahead of local+1; the group needs a full resync
    #[error("Epoch gap: local epoch {local}, received {received}")]
    EpochGapDetected { local: u64, received: u64 },

    /// Welcome references state this client cannot reconcile
    #[error("Orphan welcome: {0}")]
    OrphanWelcome(String),

    /// `commit_accepted` called with no pending commit outstanding
    #[error("No pending commit for group {0}")]
    NoPendingCommit(String),

    /// A new commit was staged while one is still pending
    #[error("Pending commit already exists for group {0}")]
    PendingCommitExists(String),

    /// MLS group not found
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// MLS group already exists
    #[error("Group already exists: {0}")]
    GroupAlreadyExists(String),

    /// Group member not found
    #[error("Member not found: {0}")]
    MemberNotFound(String),

    /// Underlying store I/O failure; aborts the whole transaction
    #[error("Store I/O failure: {0}")]
    StoreIo(String),

    /// A transaction was opened from inside another transaction
    #[error("Transaction already open on this store connection")]
    TransactionAlreadyOpen,

    /// Reported by network collaborators; retryable, never fatal here
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CryptoError {
    /// Whether this error must abort the surrounding transaction.
    ///
    /// Protocol-level failures (stale commits, malformed ciphertexts,
    /// orphan welcomes) are recoverable values the unit of work may handle;
    /// store and programming errors are not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CryptoError::StoreIo(_) | CryptoError::TransactionAlreadyOpen
        )
    }

    /// Whether the caller may retry the operation as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, CryptoError::NetworkUnreachable(_))
    }
}

impl From<bincode::Error> for CryptoError {
    fn from(e: bincode::Error) -> Self {
        CryptoError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        CryptoError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for CryptoError {
    fn from(e: std::io::Error) -> Self {
        CryptoError::StoreIo(e.to_string())
    }
}
