//! Wire event taxonomy of the streaming chat endpoint.

use crate::message::AudioPayload;
use crate::sse::SseFrame;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use tracing::debug;

/// One normalized event of a chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text to append to the assistant message.
    Token(String),
    /// Generation throughput in tokens per second.
    Metric(f64),
    /// Decoded synthesized audio for the assistant message.
    AudioFragment(AudioPayload),
    /// Server-reported error. The stream keeps going.
    Error(String),
    /// Synthesis failed for some text. Logged only.
    SynthesisError(String),
    /// The text is complete; trailing audio may still follow.
    Done,
}

impl StreamEvent {
    /// Map an SSE frame to an event. Unknown event names yield `None`.
    pub fn from_frame(frame: SseFrame) -> Option<Self> {
        match frame.event.as_deref() {
            None | Some("message") => Some(StreamEvent::Token(frame.data)),
            Some("tps") => match frame.data.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => Some(StreamEvent::Metric(v)),
                _ => Some(StreamEvent::Error(format!(
                    "invalid throughput value: {:?}",
                    frame.data
                ))),
            },
            Some("audio_complete") => match BASE64.decode(frame.data.trim()) {
                Ok(bytes) => Some(StreamEvent::AudioFragment(Arc::new(bytes))),
                Err(e) => Some(StreamEvent::SynthesisError(format!(
                    "undecodable audio fragment: {}",
                    e
                ))),
            },
            Some("error") => Some(StreamEvent::Error(frame.data)),
            Some("tts_error") | Some("audio_error") => {
                Some(StreamEvent::SynthesisError(frame.data))
            }
            Some("done") => Some(StreamEvent::Done),
            Some(other) => {
                debug!("ignoring unknown stream event '{}'", other);
                None
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Token(_) => "token",
            StreamEvent::Metric(_) => "metric",
            StreamEvent::AudioFragment(_) => "audio_fragment",
            StreamEvent::Error(_) => "error",
            StreamEvent::SynthesisError(_) => "tts_error",
            StreamEvent::Done => "done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: Option<&str>, data: &str) -> SseFrame {
        SseFrame {
            event: event.map(str::to_string),
            data: data.to_string(),
        }
    }

    #[test]
    fn default_event_is_a_token() {
        assert_eq!(
            StreamEvent::from_frame(frame(None, " there")),
            Some(StreamEvent::Token(" there".into()))
        );
    }

    #[test]
    fn tps_parses_decimal() {
        assert_eq!(
            StreamEvent::from_frame(frame(Some("tps"), "23.75")),
            Some(StreamEvent::Metric(23.75))
        );
    }

    #[test]
    fn bad_tps_becomes_error() {
        let ev = StreamEvent::from_frame(frame(Some("tps"), "fast")).unwrap();
        assert_eq!(ev.kind(), "error");
    }

    #[test]
    fn audio_complete_is_base64_decoded() {
        let encoded = BASE64.encode(b"RIFF....WAVE");
        match StreamEvent::from_frame(frame(Some("audio_complete"), &encoded)) {
            Some(StreamEvent::AudioFragment(bytes)) => assert_eq!(bytes.as_slice(), b"RIFF....WAVE"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn invalid_base64_is_a_synthesis_error() {
        let ev = StreamEvent::from_frame(frame(Some("audio_complete"), "***")).unwrap();
        assert!(matches!(ev, StreamEvent::SynthesisError(_)));
    }

    #[test]
    fn synthesis_error_aliases() {
        for name in ["tts_error", "audio_error"] {
            let ev = StreamEvent::from_frame(frame(Some(name), "piper crashed")).unwrap();
            assert_eq!(ev, StreamEvent::SynthesisError("piper crashed".into()));
        }
    }

    #[test]
    fn unknown_events_are_skipped() {
        assert_eq!(StreamEvent::from_frame(frame(Some("ping"), "1")), None);
    }
}
