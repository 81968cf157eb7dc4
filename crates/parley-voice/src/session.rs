//! **StreamingChatSession** — one streaming request per turn, demultiplexed into callbacks.
//!
//! Delivery rules:
//! - callbacks arrive in wire order;
//! - `on_metric` fires at most once;
//! - `on_error` is non-terminal;
//! - `on_complete` fires exactly once and is always last, including after cancellation.

use crate::error::VoiceError;
use crate::event::StreamEvent;
use crate::message::AudioPayload;
use crate::transport::ChatTransport;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// The server closed the stream normally.
    Finished,
    /// The caller aborted via the cancel token.
    Cancelled,
    /// The request could not be opened or the connection broke.
    Failed(String),
}

/// Receiver of a session's normalized callbacks.
pub trait SessionHandler: Send + 'static {
    fn on_token(&mut self, text: &str);
    fn on_metric(&mut self, per_second: f64);
    fn on_audio_fragment(&mut self, payload: AudioPayload);
    fn on_error(&mut self, message: &str);
    fn on_synthesis_error(&mut self, message: &str) {
        warn!("🔇 Synthesis error (text unaffected): {}", message);
    }
    fn on_text_done(&mut self) {}
    fn on_complete(&mut self, outcome: SessionOutcome);
}

/// Stateless across turns: build one per outstanding turn.
pub struct StreamingChatSession {
    transport: Arc<dyn ChatTransport>,
}

impl StreamingChatSession {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport }
    }

    /// Run the session on the runtime.
    pub fn spawn<H: SessionHandler>(
        self,
        text: String,
        handler: H,
        cancel: CancellationToken,
    ) -> JoinHandle<SessionOutcome> {
        tokio::spawn(async move { self.run(&text, handler, cancel).await })
    }

    /// Issue the request and drive callbacks until the stream ends or `cancel` fires.
    pub async fn run<H: SessionHandler>(
        &self,
        text: &str,
        mut handler: H,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        let outcome = self.pump(text, &mut handler, &cancel).await;
        match &outcome {
            SessionOutcome::Finished => info!("✅ Chat stream finished"),
            SessionOutcome::Cancelled => info!("⏹️ Chat stream cancelled"),
            SessionOutcome::Failed(e) => warn!("Chat stream failed: {}", e),
        }
        handler.on_complete(outcome.clone());
        outcome
    }

    async fn pump<H: SessionHandler>(
        &self,
        text: &str,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionOutcome::Cancelled,
            opened = self.transport.open(text) => opened,
        };
        let mut events = match opened {
            Ok(s) => s,
            Err(e) => return SessionOutcome::Failed(describe(e)),
        };

        let mut metric_seen = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionOutcome::Cancelled,
                next = events.next() => next,
            };
            let event = match next {
                None => return SessionOutcome::Finished,
                Some(Err(e)) => return SessionOutcome::Failed(describe(e)),
                Some(Ok(ev)) => ev,
            };

            match event {
                StreamEvent::Token(t) => handler.on_token(&t),
                StreamEvent::Metric(v) => {
                    if metric_seen {
                        debug!("dropping repeated throughput metric {}", v);
                    } else {
                        metric_seen = true;
                        handler.on_metric(v);
                    }
                }
                StreamEvent::AudioFragment(payload) => handler.on_audio_fragment(payload),
                StreamEvent::Error(msg) => handler.on_error(&msg),
                StreamEvent::SynthesisError(msg) => handler.on_synthesis_error(&msg),
                StreamEvent::Done => handler.on_text_done(),
            }
        }
    }
}

fn describe(err: VoiceError) -> String {
    match err {
        VoiceError::Transport(msg) => msg,
        other => other.to_string(),
    }
}
