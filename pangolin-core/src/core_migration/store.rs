//! Protocol state persistence contract
//!
//! The persistence layer behind migration is a plain get/set key-value
//! contract; nothing here knows about schemas.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core_crypto::errors::CryptoResult;
use crate::core_crypto::types::{GroupId, QualifiedId};

use super::state::ConversationProtocolState;

/// Supplies and persists per-conversation protocol state and the
/// conversation-to-group mapping
#[async_trait]
pub trait ProtocolStateStore: Send + Sync {
    /// Load the protocol state of a conversation, if any was recorded
    async fn protocol_state(
        &self,
        conversation: &QualifiedId,
    ) -> CryptoResult<Option<ConversationProtocolState>>;

    /// Persist the protocol state of a conversation
    async fn set_protocol_state(&self, state: ConversationProtocolState) -> CryptoResult<()>;

    /// The MLS group backing a conversation, once one was assigned
    async fn group_for_conversation(
        &self,
        conversation: &QualifiedId,
    ) -> CryptoResult<Option<GroupId>>;

    /// Record the MLS group backing a conversation
    async fn set_group_for_conversation(
        &self,
        conversation: &QualifiedId,
        group: &GroupId,
    ) -> CryptoResult<()>;
}

/// In-memory store for tests and embedders without durable persistence
#[derive(Default)]
pub struct MemoryProtocolStateStore {
    states: RwLock<HashMap<QualifiedId, ConversationProtocolState>>,
    groups: RwLock<HashMap<QualifiedId, GroupId>>,
}

impl MemoryProtocolStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProtocolStateStore for MemoryProtocolStateStore {
    async fn protocol_state(
        &self,
        conversation: &QualifiedId,
    ) -> CryptoResult<Option<ConversationProtocolState>> {
        Ok(self.states.read().await.get(conversation).cloned())
    }

    async fn set_protocol_state(&self, state: ConversationProtocolState) -> CryptoResult<()> {
        self.states.write().await.insert(state.conversation.clone(), state);
        Ok(())
    }

    async fn group_for_conversation(
        &self,
        conversation: &QualifiedId,
    ) -> CryptoResult<Option<GroupId>> {
        Ok(self.groups.read().await.get(conversation).cloned())
    }

    async fn set_group_for_conversation(
        &self,
        conversation: &QualifiedId,
        group: &GroupId,
    ) -> CryptoResult<()> {
        self.groups.write().await.insert(conversation.clone(), group.clone());
        Ok(())
    }
}
