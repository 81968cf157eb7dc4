//! Conversation persistence: in-memory (DashMap) or long-term Sled DB.
//!
//! Message lists are stored as JSON. Audio fragments are never persisted.

use crate::error::{VoiceError, VoiceResult};
use crate::message::Message;
use dashmap::DashMap;
use sled::Db;
use std::path::Path;
use tracing::debug;

/// Key-value collaborator holding finalized message lists per conversation.
pub trait ConversationStore: Send + Sync {
    /// Messages of `conversation_id`; empty when the conversation is new.
    fn load(&self, conversation_id: &str) -> VoiceResult<Vec<Message>>;

    fn save(&self, conversation_id: &str, messages: &[Message]) -> VoiceResult<()>;
}

fn conversation_key(conversation_id: &str) -> String {
    format!("conversation/{}", conversation_id)
}

/// Process-lifetime store. Default when no `store_path` is configured.
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    conversations: DashMap<String, Vec<Message>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for MemoryConversationStore {
    fn load(&self, conversation_id: &str) -> VoiceResult<Vec<Message>> {
        Ok(self
            .conversations
            .get(conversation_id)
            .map(|m| m.value().clone())
            .unwrap_or_default())
    }

    fn save(&self, conversation_id: &str, messages: &[Message]) -> VoiceResult<()> {
        self.conversations
            .insert(conversation_id.to_string(), messages.to_vec());
        Ok(())
    }
}

/// Sled-backed store; survives restarts.
pub struct SledConversationStore {
    db: Db,
}

impl SledConversationStore {
    /// Opens or creates a Sled database at the given path.
    pub fn open_path<P: AsRef<Path>>(path: P) -> VoiceResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl ConversationStore for SledConversationStore {
    fn load(&self, conversation_id: &str) -> VoiceResult<Vec<Message>> {
        match self.db.get(conversation_key(conversation_id).as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| VoiceError::Store(format!("corrupt conversation {}: {}", conversation_id, e))),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, conversation_id: &str, messages: &[Message]) -> VoiceResult<()> {
        let value = serde_json::to_vec(messages).map_err(|e| VoiceError::Store(e.to_string()))?;
        self.db
            .insert(conversation_key(conversation_id).as_bytes(), value)?;
        self.db.flush()?;
        debug!("saved {} messages to conversation {}", messages.len(), conversation_id);
        Ok(())
    }
}
