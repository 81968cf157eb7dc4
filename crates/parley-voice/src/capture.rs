//! Microphone capture for voice turns.
//!
//! `MicCapture` runs CPAL on a dedicated thread (the `Stream` is `!Send` on some
//! platforms), classifies 30ms frames with WebRTC VAD and reports speech edges on the
//! signal channel. Samples are buffered until `stop()` and handed back as 16-bit mono WAV.

use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::vad::{to_i16, GateEvent, UtteranceGate, VadConfig, VadDetector};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// One recorded utterance, ready for the transcription endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedAudio {
    /// 16-bit PCM mono WAV. Empty when nothing was recorded.
    pub wav: Vec<u8>,
    pub duration: Duration,
    pub sample_rate: u32,
}

impl CapturedAudio {
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        if samples.is_empty() || sample_rate == 0 {
            return Self::empty(sample_rate);
        }
        Self {
            wav: pcm_f32_to_wav(samples, sample_rate),
            duration: Duration::from_secs_f64(samples.len() as f64 / sample_rate as f64),
            sample_rate,
        }
    }

    pub fn empty(sample_rate: u32) -> Self {
        Self {
            wav: Vec::new(),
            duration: Duration::ZERO,
            sample_rate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wav.is_empty()
    }
}

/// Speech edges observed while listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSignal {
    SpeechStarted,
    /// End of utterance: the coordinator stops listening on this.
    UtteranceEnded,
}

/// A capture source the coordinator can start and stop.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Begin recording. Speech edges are sent on `signals` until stopped.
    async fn start(&self, signals: mpsc::UnboundedSender<CaptureSignal>) -> VoiceResult<()>;
    /// Finish recording and return what was captured. Empty when not recording.
    async fn stop(&self) -> VoiceResult<CapturedAudio>;
    /// Abandon the recording without producing audio.
    fn cancel(&self);
}

/// Encode f32 samples as a 16-bit PCM mono WAV file.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32; // 16-bit = 2 bytes per sample
    let mut buf = Vec::with_capacity(44 + data_len as usize);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &s in samples {
        buf.extend_from_slice(&to_i16(s).to_le_bytes());
    }
    buf
}

/// Settings for [`MicCapture`].
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub vad_mode: u8,
    pub silence_gap: Duration,
    pub min_speech: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            vad_mode: 2,
            silence_gap: Duration::from_millis(800),
            min_speech: Duration::from_millis(200),
        }
    }
}

impl From<&VoiceConfig> for CaptureConfig {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            vad_mode: config.vad_mode,
            silence_gap: Duration::from_millis(config.silence_gap_ms),
            min_speech: Duration::from_millis(config.min_speech_ms),
        }
    }
}

const RUNNING: u8 = 0;
const STOP: u8 = 1;
const CANCEL: u8 = 2;

/// How often the capture thread checks for stop/cancel while the mic is quiet.
const POLL: Duration = Duration::from_millis(50);

struct ActiveCapture {
    control: Arc<AtomicU8>,
    thread: thread::JoinHandle<Vec<f32>>,
}

/// Default microphone with local VAD.
pub struct MicCapture {
    config: CaptureConfig,
    active: Mutex<Option<ActiveCapture>>,
}

impl MicCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            active: Mutex::new(None),
        }
    }

    fn take_active(&self) -> VoiceResult<Option<ActiveCapture>> {
        self.active
            .lock()
            .map(|mut a| a.take())
            .map_err(|e| VoiceError::AudioStream(format!("capture lock poisoned: {}", e)))
    }
}

#[async_trait]
impl CaptureDevice for MicCapture {
    async fn start(&self, signals: mpsc::UnboundedSender<CaptureSignal>) -> VoiceResult<()> {
        if let Some(previous) = self.take_active()? {
            previous.control.store(CANCEL, Ordering::SeqCst);
        }

        let control = Arc::new(AtomicU8::new(RUNNING));
        let (ready_tx, ready_rx) = oneshot::channel();
        let config = self.config.clone();
        let thread_control = Arc::clone(&control);
        let thread = thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || run_capture(config, thread_control, signals, ready_tx))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(VoiceError::AudioStream(
                    "capture thread exited during startup".to_string(),
                ))
            }
        }

        let mut guard = self
            .active
            .lock()
            .map_err(|e| VoiceError::AudioStream(format!("capture lock poisoned: {}", e)))?;
        *guard = Some(ActiveCapture { control, thread });
        Ok(())
    }

    async fn stop(&self) -> VoiceResult<CapturedAudio> {
        let Some(active) = self.take_active()? else {
            return Ok(CapturedAudio::empty(self.config.sample_rate));
        };
        active.control.store(STOP, Ordering::SeqCst);
        let samples = tokio::task::spawn_blocking(move || active.thread.join())
            .await
            .map_err(|e| VoiceError::AudioStream(e.to_string()))?
            .map_err(|_| VoiceError::AudioStream("capture thread panicked".to_string()))?;
        info!(
            "🎙️ Captured {:.1}s of audio",
            samples.len() as f64 / self.config.sample_rate as f64
        );
        Ok(CapturedAudio::from_samples(&samples, self.config.sample_rate))
    }

    fn cancel(&self) {
        match self.take_active() {
            Ok(Some(active)) => {
                active.control.store(CANCEL, Ordering::SeqCst);
                debug!("capture cancelled");
            }
            Ok(None) => {}
            Err(e) => warn!("{}", e),
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn run_capture(
    config: CaptureConfig,
    control: Arc<AtomicU8>,
    signals: mpsc::UnboundedSender<CaptureSignal>,
    ready: oneshot::Sender<VoiceResult<()>>,
) -> Vec<f32> {
    let mut vad = match VadDetector::new(VadConfig {
        sample_rate: config.sample_rate,
        mode: config.vad_mode,
    }) {
        Ok(v) => v,
        Err(e) => {
            let _ = ready.send(Err(e));
            return Vec::new();
        }
    };
    let (chunk_tx, chunk_rx) = std_mpsc::channel::<Vec<f32>>();
    let stream = match open_input_stream(config.sample_rate, vad.chunk_size(), chunk_tx) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(e));
            return Vec::new();
        }
    };
    if ready.send(Ok(())).is_err() {
        return Vec::new();
    }

    info!(
        "Ear: listening (30ms chunks, {:?} gap)",
        config.silence_gap
    );
    let mut gate = UtteranceGate::new(config.silence_gap, config.min_speech);
    let mut samples: Vec<f32> = Vec::new();
    loop {
        match control.load(Ordering::SeqCst) {
            RUNNING => {}
            CANCEL => return Vec::new(),
            _ => break,
        }
        let chunk = match chunk_rx.recv_timeout(POLL) {
            Ok(chunk) => chunk,
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                warn!("Ear: audio stream closed");
                break;
            }
        };
        let is_speech = match vad.is_speech(&chunk) {
            Ok(s) => s,
            Err(e) => {
                debug!("Ear: {}", e);
                false
            }
        };
        samples.extend_from_slice(&chunk);
        let signal = match gate.push(is_speech) {
            Some(GateEvent::SpeechStarted) => CaptureSignal::SpeechStarted,
            Some(GateEvent::UtteranceEnded { .. }) => CaptureSignal::UtteranceEnded,
            None => continue,
        };
        if signals.send(signal).is_err() {
            debug!("Ear: signal receiver dropped");
        }
    }

    drop(stream);
    while let Ok(chunk) = chunk_rx.try_recv() {
        samples.extend_from_slice(&chunk);
    }
    samples
}

fn open_input_stream(
    sample_rate: u32,
    chunk_size: usize,
    chunk_tx: std_mpsc::Sender<Vec<f32>>,
) -> VoiceResult<Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
    info!(
        "📱 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut pending: Vec<f32> = Vec::with_capacity(chunk_size);
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                pending.push(sample);
                if pending.len() >= chunk_size {
                    let chunk = std::mem::replace(&mut pending, Vec::with_capacity(chunk_size));
                    if chunk_tx.send(chunk).is_err() {
                        return;
                    }
                }
            }
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )?;
    stream.play()?;
    info!("✅ Audio capture started");
    Ok(stream)
}
