//! Conversation data model: messages, the in-memory log and turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque synthesized audio (WAV bytes as delivered by the server). Cheap to clone.
pub type AudioPayload = Arc<Vec<u8>>;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Assistant,
}

/// One bubble in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub sender: Sender,
    /// Grows by token concatenation until the message is finalized.
    pub text: String,
    /// Generation throughput reported at the end of the stream.
    #[serde(default)]
    pub metrics_per_second: Option<f64>,
    /// Fragments in arrival order. Kept for replay; never persisted.
    #[serde(skip)]
    pub audio_fragments: Vec<AudioPayload>,
    #[serde(default)]
    pub finalized: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            text: text.into(),
            metrics_per_second: None,
            audio_fragments: Vec::new(),
            finalized: true,
            created_at: Utc::now(),
        }
    }

    /// Empty assistant bubble that tokens stream into.
    pub fn assistant_placeholder() -> Self {
        Self {
            sender: Sender::Assistant,
            text: String::new(),
            metrics_per_second: None,
            audio_fragments: Vec::new(),
            finalized: false,
            created_at: Utc::now(),
        }
    }
}

/// Ordered message log for the open conversation.
///
/// Mutated only by the coordinator task, so it needs no locking.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push_user(&mut self, text: impl Into<String>) -> usize {
        self.messages.push(Message::user(text));
        self.messages.len() - 1
    }

    pub fn push_assistant_placeholder(&mut self) -> usize {
        self.messages.push(Message::assistant_placeholder());
        self.messages.len() - 1
    }

    /// Append streamed text. Returns false when the message is missing or already finalized.
    pub fn append_text(&mut self, index: usize, text: &str) -> bool {
        match self.messages.get_mut(index) {
            Some(m) if !m.finalized => {
                m.text.push_str(text);
                true
            }
            _ => false,
        }
    }

    pub fn set_metric(&mut self, index: usize, per_second: f64) -> bool {
        match self.messages.get_mut(index) {
            Some(m) => {
                m.metrics_per_second = Some(per_second);
                true
            }
            None => false,
        }
    }

    /// Trailing audio is accepted even after the text is finalized.
    pub fn attach_fragment(&mut self, index: usize, payload: AudioPayload) -> bool {
        match self.messages.get_mut(index) {
            Some(m) => {
                m.audio_fragments.push(payload);
                true
            }
            None => false,
        }
    }

    pub fn finalize(&mut self, index: usize) {
        if let Some(m) = self.messages.get_mut(index) {
            m.finalized = true;
        }
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Swap in another conversation and hand back the previous one.
    pub fn replace_all(&mut self, messages: Vec<Message>) -> Vec<Message> {
        std::mem::replace(&mut self.messages, messages)
    }
}

/// Identifier of a turn. Monotonic within one coordinator; never reused.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TurnId(pub u64);

impl TurnId {
    pub fn next(self) -> Self {
        TurnId(self.0 + 1)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn-{}", self.0)
    }
}

/// Lifecycle of the text side of a turn. Audio playback is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Submitted,
    Streaming,
    Completed,
    Failed,
}

/// One user utterance and the assistant message answering it.
#[derive(Debug, Clone)]
pub struct Turn {
    pub turn_id: TurnId,
    pub source_text: String,
    pub assistant_message_index: usize,
    pub phase: TurnPhase,
}
