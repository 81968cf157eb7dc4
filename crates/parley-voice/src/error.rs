//! Error types for the Parley voice core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while coordinating a voice conversation
#[derive(Error, Debug)]
pub enum VoiceError {
    /// The chat request could not be opened or the stream broke mid-turn.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server-reported error inside an otherwise healthy stream.
    #[error("Stream error: {0}")]
    Stream(String),

    /// Speech synthesis failed server-side (`tts_error` / `audio_error`).
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("VAD initialization failed: {0}")]
    VadInit(String),

    #[error("VAD processing error: {0}")]
    VadProcessing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Conversation store error: {0}")]
    Store(String),

    #[error("Channel closed: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification surfaced to the UI with `TurnError` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Stream,
    Synthesis,
    Playback,
    Transcription,
    Capture,
    Internal,
}

impl VoiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VoiceError::Transport(_) => ErrorKind::Transport,
            VoiceError::Stream(_) => ErrorKind::Stream,
            VoiceError::Synthesis(_) => ErrorKind::Synthesis,
            VoiceError::Playback(_) => ErrorKind::Playback,
            VoiceError::Transcription(_) => ErrorKind::Transcription,
            VoiceError::AudioDevice(_)
            | VoiceError::AudioStream(_)
            | VoiceError::VadInit(_)
            | VoiceError::VadProcessing(_) => ErrorKind::Capture,
            VoiceError::Config(_)
            | VoiceError::Store(_)
            | VoiceError::Channel(_)
            | VoiceError::Io(_) => ErrorKind::Internal,
        }
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<sled::Error> for VoiceError {
    fn from(err: sled::Error) -> Self {
        VoiceError::Store(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}
