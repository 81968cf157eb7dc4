//! Runtime configuration. Load from TOML or env.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | PARLEY_CONFIG | config/parley | Path of an optional TOML file. |
//! | PARLEY__SERVER_URL | http://127.0.0.1:3000 | Base URL of the chat/STT/TTS server. |
//! | PARLEY__REQUEST_TIMEOUT_SECS | 30 | Connect timeout; whole-request timeout for STT, TTS and health. |
//! | PARLEY__SETTLE_DELAY_MS | 100 | Pause between two audio fragments. |
//! | PARLEY__TRAILING_AUDIO_GRACE_MS | 8000 | How long to wait for trailing audio after text is done. |
//! | PARLEY__LIVE_MODE | false | Start in hands-free mode. |
//! | PARLEY__SAMPLE_RATE | 16000 | Capture rate: 8000, 16000, 32000 or 48000. |
//! | PARLEY__VAD_MODE | 2 | WebRTC VAD aggressiveness, 0-3. |
//! | PARLEY__SILENCE_GAP_MS | 800 | Silence after speech that ends an utterance. |
//! | PARLEY__MIN_SPEECH_MS | 200 | Shorter speech bursts are ignored. |
//! | PARLEY__STORE_PATH | unset | Sled directory for conversations; in-memory when unset. |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the voice core and its default collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Base URL without trailing slash.
    pub server_url: String,
    /// Bounds connecting, and the whole request for transcription, synthesis and health.
    pub request_timeout_secs: u64,
    /// Fixed pause after each fragment so speech keeps a natural cadence.
    pub settle_delay_ms: u64,
    /// Upper bound on waiting for the stream to close once the text is done.
    pub trailing_audio_grace_ms: u64,
    #[serde(default)]
    pub live_mode: bool,
    /// Capture sample rate. Must be one WebRTC VAD accepts (8000/16000/32000/48000).
    pub sample_rate: u32,
    /// WebRTC VAD aggressiveness, 0-3.
    pub vad_mode: u8,
    /// Silence after speech that ends an utterance in hands-free capture.
    pub silence_gap_ms: u64,
    /// Utterances shorter than this are discarded as noise.
    pub min_speech_ms: u64,
    #[serde(default)]
    pub store_path: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3000".to_string(),
            request_timeout_secs: 30,
            settle_delay_ms: 100,
            trailing_audio_grace_ms: 8000,
            live_mode: false,
            sample_rate: 16000,
            vad_mode: 2,
            silence_gap_ms: 800,
            min_speech_ms: 200,
            store_path: None,
        }
    }
}

impl VoiceConfig {
    /// Load config from file and environment. Precedence: env `PARLEY__*` > `PARLEY_CONFIG` file
    /// (or `config/parley.toml`) > defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| "config/parley".to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Same as [`VoiceConfig::load`] with an explicit file path. A missing file is not an error.
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("server_url", defaults.server_url)?
            .set_default("request_timeout_secs", defaults.request_timeout_secs as i64)?
            .set_default("settle_delay_ms", defaults.settle_delay_ms as i64)?
            .set_default("trailing_audio_grace_ms", defaults.trailing_audio_grace_ms as i64)?
            .set_default("live_mode", defaults.live_mode)?
            .set_default("sample_rate", defaults.sample_rate as i64)?
            .set_default("vad_mode", defaults.vad_mode as i64)?
            .set_default("silence_gap_ms", defaults.silence_gap_ms as i64)?
            .set_default("min_speech_ms", defaults.min_speech_ms as i64)?;

        let with_toml = path.with_extension("toml");
        let builder = if path.is_file() {
            builder.add_source(config::File::from(path))
        } else if with_toml.is_file() {
            builder.add_source(config::File::from(with_toml.as_path()))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("PARLEY").separator("__"))
            .build()?;

        let cfg: Self = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the capture and playback layers cannot work with.
    pub fn validate(&self) -> VoiceResult<()> {
        if !matches!(self.sample_rate, 8000 | 16000 | 32000 | 48000) {
            return Err(VoiceError::Config(format!(
                "sample_rate must be 8000, 16000, 32000 or 48000, got {}",
                self.sample_rate
            )));
        }
        if self.vad_mode > 3 {
            return Err(VoiceError::Config(format!(
                "vad_mode must be 0-3, got {}",
                self.vad_mode
            )));
        }
        if self.server_url.trim().is_empty() {
            return Err(VoiceError::Config("server_url is empty".to_string()));
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn trailing_audio_grace(&self) -> Duration {
        Duration::from_millis(self.trailing_audio_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
