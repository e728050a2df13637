//! Type definitions shared across the crypto layer

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{CryptoError, CryptoResult};

/// Federation-qualified user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedId {
    /// User id, unique within its domain
    pub id: Uuid,
    /// Backend domain the user lives on
    pub domain: String,
}

impl QualifiedId {
    /// Create a new qualified id
    pub fn new(id: Uuid, domain: impl Into<String>) -> Self {
        Self { id, domain: domain.into() }
    }

    /// Generate a random id on the given domain
    pub fn random(domain: impl Into<String>) -> Self {
        Self { id: Uuid::new_v4(), domain: domain.into() }
    }
}

impl std::fmt::Display for QualifiedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.domain)
    }
}

/// Device-scoped client identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    /// Create a new client id
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies exactly one remote client: one pairwise session, or one MLS
/// group member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedClientId {
    /// Owning user
    pub user: QualifiedId,
    /// Device client of that user
    pub client: ClientId,
}

impl QualifiedClientId {
    /// Create a new qualified client id
    pub fn new(user: QualifiedId, client: ClientId) -> Self {
        Self { user, client }
    }

    /// Stable string key used by the session table
    pub fn store_key(&self) -> String {
        format!("{}_{}", self.user, self.client)
    }

    /// Parse the `store_key` encoding back into an id
    pub fn from_store_key(value: &str) -> Option<Self> {
        let (user, client) = value.rsplit_once('_')?;
        let (id, domain) = user.split_once('@')?;
        let id = Uuid::parse_str(id).ok()?;
        Some(Self {
            user: QualifiedId::new(id, domain),
            client: ClientId::new(client),
        })
    }
}

impl std::fmt::Display for QualifiedClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.store_key())
    }
}

/// A pre-published public key bundle enabling asynchronous session setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKey {
    /// Numeric id, unique per identity; `LAST_RESORT_PREKEY_ID` is reserved
    pub id: u16,
    /// Encoded public bundle, opaque to callers
    pub key: Vec<u8>,
}

/// Reserved id of the never-expiring last-resort prekey
pub const LAST_RESORT_PREKEY_ID: u16 = u16::MAX;

/// MLS group identifier (opaque bytes)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub Vec<u8>);

impl GroupId {
    /// Create a group ID from bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Generate a random group ID
    pub fn random() -> Self {
        use rand::Rng;
        let mut bytes = vec![0u8; 32];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Get the bytes of the group ID
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Convert to hex string for display
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for GroupId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A commit message on the wire. The header fields are readable by the
/// orchestration layer; `payload` only means something to the engine that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMessage {
    /// Group this commit mutates
    pub group_id: GroupId,
    /// Epoch the group will be at once this commit is accepted
    pub epoch: u64,
    /// Engine-opaque commit body
    pub payload: Vec<u8>,
}

impl CommitMessage {
    /// Serialize for transmission
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse from received bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| CryptoError::MalformedCiphertext(format!("commit: {e}")))
    }
}

/// A welcome message letting a newly added member join a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeMessage {
    /// Group the welcome admits into
    pub group_id: GroupId,
    /// Epoch the joiner will start at
    pub epoch: u64,
    /// Engine-opaque welcome body (sealed joiner secrets)
    pub payload: Vec<u8>,
}

impl WelcomeMessage {
    /// Serialize for transmission
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse from received bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        bincode::deserialize(bytes).map_err(|e| CryptoError::OrphanWelcome(format!("parse: {e}")))
    }
}

/// An encrypted application message within a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationMessage {
    /// Group the message belongs to
    pub group_id: GroupId,
    /// Epoch the message was sealed under
    pub epoch: u64,
    /// Engine-opaque sealed body
    pub payload: Vec<u8>,
}

/// Any inbound MLS wire message, dispatched by exhaustive matching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MlsMessage {
    /// Encrypted application payload
    Application(ApplicationMessage),
    /// Group-mutating commit
    Commit(CommitMessage),
    /// Buffered until folded by `commit_pending_proposals`
    Proposal {
        /// Target group
        group_id: GroupId,
        /// Epoch the proposal was made at
        epoch: u64,
        /// Engine-opaque proposal body
        payload: Vec<u8>,
    },
}

impl MlsMessage {
    /// Serialize for transmission
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse from received bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| CryptoError::MalformedCiphertext(format!("mls message: {e}")))
    }

    /// Group the message targets
    pub fn group_id(&self) -> &GroupId {
        match self {
            MlsMessage::Application(m) => &m.group_id,
            MlsMessage::Commit(c) => &c.group_id,
            MlsMessage::Proposal { group_id, .. } => group_id,
        }
    }
}

/// The output of any group-mutating operation. Handed to the network layer
/// for distribution, never persisted by this layer.
#[derive(Debug, Clone)]
pub struct CommitBundle {
    /// The commit itself
    pub commit: CommitMessage,
    /// Welcome for newly added members, if any were added
    pub welcome: Option<WelcomeMessage>,
    /// Public group info enabling external joins
    pub group_info: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key_roundtrip() {
        let id = QualifiedClientId::new(
            QualifiedId::random("example.com"),
            ClientId::new("device-1"),
        );
        let key = id.store_key();
        let parsed = QualifiedClientId::from_store_key(&key).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_group_id_display() {
        let group_id = GroupId::new(vec![1, 2, 3, 4]);
        assert_eq!(format!("{}", group_id), "01020304");
    }

    #[test]
    fn test_commit_message_roundtrip() {
        let commit = CommitMessage {
            group_id: GroupId::random(),
            epoch: 7,
            payload: vec![9, 9, 9],
        };
        let bytes = commit.to_bytes().unwrap();
        let parsed = CommitMessage::from_bytes(&bytes).unwrap();
        assert_eq!(commit, parsed);
    }

    #[test]
    fn test_malformed_commit_rejected() {
        let result = CommitMessage::from_bytes(&[0xff; 3]);
        assert!(matches!(result, Err(CryptoError::MalformedCiphertext(_))));
    }

    #[test]
    fn test_mls_message_dispatch() {
        let group_id = GroupId::random();
        let msg = MlsMessage::Proposal {
            group_id: group_id.clone(),
            epoch: 1,
            payload: vec![],
        };
        let bytes = msg.to_bytes().unwrap();
        let parsed = MlsMessage::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.group_id(), &group_id);
    }
}
