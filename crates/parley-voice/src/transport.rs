//! **Transport** — the chat, transcription and synthesis endpoints the core talks to.
//!
//! The core only depends on the traits; `HttpTransport` implements them against the
//! conversation server (`/chat` SSE stream, `/api/stt/transcribe`, `/api/tts`, `/health`).

use crate::capture::CapturedAudio;
use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::event::StreamEvent;
use crate::message::AudioPayload;
use crate::sse::SseDecoder;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Events of one chat request. An `Err` item means the transport broke.
pub type EventStream = BoxStream<'static, VoiceResult<StreamEvent>>;

/// Opens one streaming chat request per turn.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, text: &str) -> VoiceResult<EventStream>;
}

/// Result of the transcription endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub confidence: f32,
}

/// Speech-to-text collaborator.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: CapturedAudio) -> VoiceResult<Transcript>;
}

/// One-shot text-to-speech, used to voice messages that arrived without audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> VoiceResult<AudioPayload>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
}

/// HTTP client for the conversation server.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// Base URL without trailing slash (e.g. http://127.0.0.1:3000).
    pub base_url: String,
    client: reqwest::Client,
    /// Whole-request bound for the one-shot calls. The chat stream has none.
    request_timeout: Duration,
}

impl HttpTransport {
    /// Create with an explicit base URL. `request_timeout` bounds connecting and, for
    /// transcription, synthesis and health checks, the whole request. Chat streams
    /// stay open as long as the server keeps them open.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            request_timeout,
        })
    }

    pub fn from_config(config: &VoiceConfig) -> VoiceResult<Self> {
        Self::new(config.server_url.clone(), config.request_timeout())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// True when the server answers `GET /health` with a success status.
    pub async fn health(&self) -> VoiceResult<bool> {
        let res = self
            .client
            .get(self.url("/health"))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| VoiceError::Transport(e.to_string()))?;
        Ok(res.status().is_success())
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, text: &str) -> VoiceResult<EventStream> {
        let res = self
            .client
            .post(self.url("/chat"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&ChatRequest { message: text })
            .send()
            .await
            .map_err(|e| VoiceError::Transport(format!("Request failed: {}", e)))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Transport(format!("Chat API error {}: {}", status, body)));
        }
        info!("💬 Chat stream opened");

        let mut bytes = Box::pin(res.bytes_stream());
        let events = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        for frame in decoder.push(&chunk) {
                            if let Some(event) = StreamEvent::from_frame(frame) {
                                yield Ok(event);
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(VoiceError::Transport(format!("Stream error: {}", e)));
                        return;
                    }
                }
            }
            if let Some(event) = decoder.finish().and_then(StreamEvent::from_frame) {
                yield Ok(event);
            }
            debug!("chat stream closed by server");
        };
        Ok(events.boxed())
    }
}

#[async_trait]
impl Transcriber for HttpTransport {
    async fn transcribe(&self, audio: CapturedAudio) -> VoiceResult<Transcript> {
        if audio.wav.is_empty() {
            return Ok(Transcript {
                text: String::new(),
                confidence: 0.0,
            });
        }
        let part = reqwest::multipart::Part::bytes(audio.wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("audio", part);
        let res = self
            .client
            .post(self.url("/api/stt/transcribe"))
            .timeout(self.request_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Transcription(format!(
                "STT API error {}: {}",
                status, body
            )));
        }
        res.json::<Transcript>()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpTransport {
    async fn synthesize(&self, text: &str) -> VoiceResult<AudioPayload> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Arc::new(Vec::new()));
        }
        let res = self
            .client
            .post(self.url("/api/tts"))
            .timeout(self.request_timeout)
            .json(&TtsRequest { text })
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(Arc::new(bytes.to_vec()))
    }
}
