//! **VoiceOutput** — speaker playback of synthesized fragments via rodio.
//!
//! The rodio `OutputStream` is not `Send` on every platform, so it lives on a dedicated
//! output thread for the lifetime of the player. Fragments are played through a `Sink`
//! built from the stream handle; `halt()` stops the sink and swaps in a fresh one.

use crate::error::{VoiceError, VoiceResult};
use crate::message::AudioPayload;
use crate::playback::FragmentPlayer;
use async_trait::async_trait;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use tracing::{info, warn};

/// Speaker output for the playback queue.
pub struct RodioPlayer {
    handle: OutputStreamHandle,
    sink: Mutex<Arc<Sink>>,
    // Dropping this ends the output thread (and the stream with it).
    _shutdown: std_mpsc::Sender<()>,
}

impl RodioPlayer {
    /// Open the default output device.
    pub fn new() -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<OutputStreamHandle>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("parley-output".to_string())
            .spawn(move || {
                let (stream, handle): (OutputStream, OutputStreamHandle) =
                    match OutputStream::try_default() {
                        Ok(pair) => pair,
                        Err(e) => {
                            let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                            return;
                        }
                    };
                if ready_tx.send(Ok(handle)).is_err() {
                    return;
                }
                // Blocks until the player is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
            })?;

        let handle = ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("output thread exited".to_string()))??;
        let sink = Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        info!("🔊 Output ready for fragment playback");

        Ok(Self {
            handle,
            sink: Mutex::new(Arc::new(sink)),
            _shutdown: shutdown_tx,
        })
    }

    fn current_sink(&self) -> VoiceResult<Arc<Sink>> {
        self.sink
            .lock()
            .map(|s| Arc::clone(&s))
            .map_err(|e| VoiceError::Playback(format!("sink lock poisoned: {}", e)))
    }
}

#[async_trait]
impl FragmentPlayer for RodioPlayer {
    async fn play(&self, payload: &AudioPayload) -> VoiceResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let source = Decoder::new(Cursor::new(payload.to_vec()))
            .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
        let sink = self.current_sink()?;
        sink.append(source.convert_samples::<f32>());

        tokio::task::spawn_blocking(move || sink.sleep_until_end())
            .await
            .map_err(|e| VoiceError::Playback(e.to_string()))
    }

    fn halt(&self) {
        let mut guard = match self.sink.lock() {
            Ok(g) => g,
            Err(e) => {
                warn!("VoiceOutput: sink lock poisoned: {}", e);
                return;
            }
        };
        guard.stop();
        match Sink::try_new(&self.handle) {
            Ok(fresh) => *guard = Arc::new(fresh),
            Err(e) => warn!("VoiceOutput: could not rebuild sink: {}", e),
        }
        info!("VoiceOutput: stopped (interruption or manual)");
    }
}
