//! Voice Activity Detection using WebRTC VAD, plus the gap logic that turns
//! per-frame speech decisions into "utterance started / ended" edges.

use crate::error::{VoiceError, VoiceResult};
use std::time::Duration;
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Frame length fed to the detector. WebRTC VAD accepts 10, 20 or 30 ms.
pub const FRAME: Duration = Duration::from_millis(30);

/// Configuration for VAD detection
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz for WebRTC VAD)
    pub sample_rate: u32,

    /// Detection mode (0-3, where 3 is most aggressive)
    pub mode: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            mode: 2,
        }
    }
}

/// Voice Activity Detector using WebRTC VAD.
///
/// Not `Send`: build it on the thread that feeds it.
pub struct VadDetector {
    vad: Vad,
    chunk_size: usize,
}

impl VadDetector {
    pub fn new(config: VadConfig) -> VoiceResult<Self> {
        info!(
            "🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, mode: {})",
            config.sample_rate, config.mode
        );
        let vad = build_vad(&config)?;
        // 30ms at 16kHz = 480 samples
        let chunk_size = (config.sample_rate as u64 * FRAME.as_millis() as u64 / 1000) as usize;
        Ok(Self { vad, chunk_size })
    }

    /// Classify one frame of exactly `chunk_size()` samples.
    pub fn is_speech(&mut self, audio: &[f32]) -> VoiceResult<bool> {
        if audio.len() != self.chunk_size {
            return Err(VoiceError::VadProcessing(format!(
                "Expected {} samples, got {}",
                self.chunk_size,
                audio.len()
            )));
        }
        let audio_i16: Vec<i16> = audio.iter().map(|&s| to_i16(s)).collect();
        self.vad
            .is_voice_segment(&audio_i16)
            .map_err(|e| VoiceError::VadProcessing(format!("VAD processing failed: {:?}", e)))
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

}

fn build_vad(config: &VadConfig) -> VoiceResult<Vad> {
    let sample_rate = match config.sample_rate {
        8000 => SampleRate::Rate8kHz,
        16000 => SampleRate::Rate16kHz,
        32000 => SampleRate::Rate32kHz,
        48000 => SampleRate::Rate48kHz,
        other => {
            return Err(VoiceError::VadInit(format!(
                "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                other
            )))
        }
    };
    let mode = match config.mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        3 => VadMode::VeryAggressive,
        other => {
            return Err(VoiceError::VadInit(format!(
                "VAD mode must be 0-3, got {}",
                other
            )))
        }
    };
    let mut vad = Vad::new();
    vad.set_mode(mode);
    vad.set_sample_rate(sample_rate);
    Ok(vad)
}

pub(crate) fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Edge reported by [`UtteranceGate::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    /// Speech has lasted at least `min_speech`.
    SpeechStarted,
    /// `silence_gap` of silence followed confirmed speech.
    UtteranceEnded { speech: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    Speaking,
    SilenceDetected,
}

/// Gap logic over VAD decisions: Idle → Speaking → SilenceDetected → (commit) → Idle.
///
/// Time is counted in frames, so the gate is deterministic for a given decision sequence.
/// Bursts shorter than `min_speech` never produce `SpeechStarted` and are forgotten once
/// the gap elapses.
#[derive(Debug, Clone)]
pub struct UtteranceGate {
    frame: Duration,
    silence_gap: Duration,
    min_speech: Duration,
    state: GateState,
    speech: Duration,
    silence: Duration,
    confirmed: bool,
}

impl UtteranceGate {
    pub fn new(silence_gap: Duration, min_speech: Duration) -> Self {
        Self {
            frame: FRAME,
            silence_gap,
            min_speech,
            state: GateState::Idle,
            speech: Duration::ZERO,
            silence: Duration::ZERO,
            confirmed: false,
        }
    }

    /// Feed one frame decision.
    pub fn push(&mut self, is_speech: bool) -> Option<GateEvent> {
        match (self.state, is_speech) {
            (GateState::Idle, false) => None,
            (GateState::Idle, true) => {
                self.state = GateState::Speaking;
                self.speech = self.frame;
                self.silence = Duration::ZERO;
                self.confirm()
            }
            (GateState::Speaking, true) | (GateState::SilenceDetected, true) => {
                self.state = GateState::Speaking;
                self.speech += self.frame;
                self.silence = Duration::ZERO;
                self.confirm()
            }
            (GateState::Speaking, false) | (GateState::SilenceDetected, false) => {
                self.state = GateState::SilenceDetected;
                self.silence += self.frame;
                if self.silence < self.silence_gap {
                    return None;
                }
                let speech = self.speech;
                let confirmed = self.confirmed;
                self.reset();
                if confirmed {
                    info!("✅ Silence gap reached, utterance ended ({:?} speech)", speech);
                    Some(GateEvent::UtteranceEnded { speech })
                } else {
                    debug!("⏭️ Speech too short ({:?}), ignoring", speech);
                    None
                }
            }
        }
    }

    fn confirm(&mut self) -> Option<GateEvent> {
        if !self.confirmed && self.speech >= self.min_speech {
            self.confirmed = true;
            info!("🎤 Speech started");
            return Some(GateEvent::SpeechStarted);
        }
        None
    }

    pub fn reset(&mut self) {
        self.state = GateState::Idle;
        self.speech = Duration::ZERO;
        self.silence = Duration::ZERO;
        self.confirmed = false;
    }
}
