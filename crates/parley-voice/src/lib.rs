//! # Parley Voice - Turn Coordination for Streaming Voice Conversations
//!
//! Turns a token-at-a-time chat stream plus an independent stream of synthesized
//! speech fragments into an interruptible, turn-based voice conversation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     VoiceTurnCoordinator (one task)              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────────┐ │
//! │  │  Mic + VAD   │→ │ Transcriber  │→ │ StreamingChatSession   │ │
//! │  │ (cpal/webrtc)│  │ (HTTP STT)   │  │ (SSE, one per turn)    │ │
//! │  └──────────────┘  └──────────────┘  └────────────────────────┘ │
//! │         ↑                                   ↓ tokens / fragments │
//! │         │ live mode          ┌────────────────────────┐          │
//! │         └──── Drained ───────│  AudioPlaybackQueue    │          │
//! │                              │  (rodio, FIFO)         │          │
//! │                              └────────────────────────┘          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod message;
pub mod playback;
pub mod session;
pub mod sse;
pub mod store;
pub mod transport;
pub mod vad;
pub mod voice_output;

pub use capture::{CaptureConfig, CaptureDevice, CaptureSignal, CapturedAudio, MicCapture};
pub use config::VoiceConfig;
pub use coordinator::{
    CoordinatorDeps, CoordinatorEvent, CoordinatorHandle, CoordinatorSnapshot, VoiceState,
    VoiceTurnCoordinator, DEFAULT_CONVERSATION,
};
pub use error::{ErrorKind, VoiceError, VoiceResult};
pub use event::StreamEvent;
pub use message::{AudioPayload, Message, MessageLog, Sender, Turn, TurnId, TurnPhase};
pub use playback::{AudioPlaybackQueue, FragmentPlayer, PlaybackEvent, PlaybackItem};
pub use session::{SessionHandler, SessionOutcome, StreamingChatSession};
pub use sse::{SseDecoder, SseFrame};
pub use store::{ConversationStore, MemoryConversationStore, SledConversationStore};
pub use transport::{
    ChatTransport, EventStream, HttpTransport, SpeechSynthesizer, Transcriber, Transcript,
};
pub use vad::{GateEvent, UtteranceGate, VadConfig, VadDetector};
pub use voice_output::RodioPlayer;
