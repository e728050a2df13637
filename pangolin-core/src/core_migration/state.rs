//! Protocol and migration state types

use serde::{Deserialize, Serialize};

use crate::core_crypto::types::{QualifiedClientId, QualifiedId};

/// The messaging protocol driving a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Pairwise double-ratchet sessions
    Proteus,
    /// Tree-based group key agreement
    Mls,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Proteus => write!(f, "proteus"),
            Protocol::Mls => write!(f, "mls"),
        }
    }
}

/// Migration progress of one conversation. Transitions only forward and
/// never leaves `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// Migration has not been considered yet
    NotStarted,
    /// Migration began but the MLS group is not established for everyone
    InProgress,
    /// The conversation is fully on MLS
    Completed,
}

/// Which protocol is authoritative for a conversation, and how far its
/// migration has come
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationProtocolState {
    /// The conversation this state belongs to
    pub conversation: QualifiedId,
    /// Protocol currently in charge of the conversation
    pub active_protocol: Protocol,
    /// Migration progress
    pub migration: MigrationStatus,
}

impl ConversationProtocolState {
    /// Initial state for a conversation that has never been migrated
    pub fn initial(conversation: QualifiedId) -> Self {
        Self {
            conversation,
            active_protocol: Protocol::Proteus,
            migration: MigrationStatus::NotStarted,
        }
    }
}

/// Server-advertised migration policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Whether conversations should migrate off Proteus
    pub migration_enabled: bool,
    /// Protocol the server prefers for new conversations
    pub default_protocol: Protocol,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self { migration_enabled: false, default_protocol: Protocol::Proteus }
    }
}

/// One intended participant of a conversation, with the capabilities the
/// backend advertised for it
#[derive(Debug, Clone)]
pub struct Participant {
    /// The participant's client
    pub client: QualifiedClientId,
    /// Whether this client advertises MLS support
    pub supports_mls: bool,
    /// Key package fetched from the directory, when one was available
    pub key_package: Option<Vec<u8>>,
}

/// Event emitted when the server-advertised migration policy changes for a
/// conversation
#[derive(Debug, Clone)]
pub struct MigrationConfigChanged {
    /// Conversation the policy change applies to
    pub conversation: QualifiedId,
    /// The new policy
    pub config: MigrationConfig,
    /// Current conversation participants
    pub participants: Vec<Participant>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crypto::types::QualifiedId;

    #[test]
    fn test_initial_state() {
        let conversation = QualifiedId::random("example.com");
        let state = ConversationProtocolState::initial(conversation.clone());
        assert_eq!(state.conversation, conversation);
        assert_eq!(state.active_protocol, Protocol::Proteus);
        assert_eq!(state.migration, MigrationStatus::NotStarted);
    }

    #[test]
    fn test_state_serialization() {
        let state = ConversationProtocolState::initial(QualifiedId::random("example.com"));
        let json = serde_json::to_string(&state).unwrap();
        let parsed: ConversationProtocolState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, parsed);
    }
}
