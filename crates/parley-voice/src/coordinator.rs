//! **VoiceTurnCoordinator** — capture → transcription → chat turn → playback → (live) re-listen.
//!
//! One task owns every piece of conversation state: the message log, the active turn,
//! the voice state and the playback queue handle. User commands, session callbacks,
//! playback notifications, transcription results and timers all arrive as messages,
//! so "is this still the active turn?" is a field read at the moment each message is
//! handled.
//!
//! State machine: `Idle → Listening → Transcribing → AwaitingResponse → Speaking → (Idle | Listening)`.

use crate::capture::{CaptureDevice, CaptureSignal};
use crate::config::VoiceConfig;
use crate::error::{ErrorKind, VoiceError, VoiceResult};
use crate::message::{AudioPayload, Message, MessageLog, Turn, TurnId, TurnPhase};
use crate::playback::{AudioPlaybackQueue, FragmentPlayer, PlaybackEvent};
use crate::session::{SessionHandler, SessionOutcome, StreamingChatSession};
use crate::store::ConversationStore;
use crate::transport::{ChatTransport, SpeechSynthesizer, Transcriber, Transcript};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_CONVERSATION: &str = "default";

/// Conversation-level voice state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    Idle,
    Listening,
    Transcribing,
    AwaitingResponse,
    Speaking,
}

/// Observations for the UI layer.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    StateChanged(VoiceState),
    MessageUpdated { index: usize, message: Message },
    PlaybackStateChanged { playing: bool },
    /// `turn_id` is `None` for errors outside a chat turn (capture, transcription, replay).
    TurnError {
        turn_id: Option<TurnId>,
        kind: ErrorKind,
        message: String,
    },
    Transcribed(Transcript),
    ConversationSwitched {
        conversation_id: String,
        message_count: usize,
    },
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSnapshot {
    pub state: VoiceState,
    pub live_mode: bool,
    pub capture_enabled: bool,
    pub playing: bool,
    pub conversation_id: String,
    pub active_turn: Option<Turn>,
    pub messages: Vec<Message>,
}

/// External collaborators.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub chat: Arc<dyn ChatTransport>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub capture: Arc<dyn CaptureDevice>,
    pub player: Arc<dyn FragmentPlayer>,
    pub store: Arc<dyn ConversationStore>,
}

enum Command {
    StartTurn(String),
    StartListening,
    StopListening,
    StopSpeaking,
    LiveMode(bool),
    CaptureEnabled(bool),
    Stop,
    Replay(usize),
    Switch(String),
    Snapshot(oneshot::Sender<CoordinatorSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap to clone; every clone talks to the same coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    fn send(&self, cmd: Command) -> VoiceResult<()> {
        self.tx
            .send(cmd)
            .map_err(|_| VoiceError::Channel("coordinator stopped".to_string()))
    }

    /// Submit a typed (or already transcribed) user message.
    pub fn start_turn(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.send(Command::StartTurn(text.into()))
    }

    /// Begin capturing. Interrupts a turn in flight.
    pub fn start_listening(&self) -> VoiceResult<()> {
        self.send(Command::StartListening)
    }

    /// Stop capturing and transcribe. No-op unless listening.
    pub fn stop_listening(&self) -> VoiceResult<()> {
        self.send(Command::StopListening)
    }

    /// Silence the assistant; text keeps streaming.
    pub fn stop_speaking(&self) -> VoiceResult<()> {
        self.send(Command::StopSpeaking)
    }

    pub fn enable_live_mode(&self, enabled: bool) -> VoiceResult<()> {
        self.send(Command::LiveMode(enabled))
    }

    /// Gate for the capture device (mic toggle in the UI).
    pub fn set_capture_enabled(&self, enabled: bool) -> VoiceResult<()> {
        self.send(Command::CaptureEnabled(enabled))
    }

    /// Abort everything and return to `Idle`.
    pub fn stop(&self) -> VoiceResult<()> {
        self.send(Command::Stop)
    }

    /// Play a message's audio again, synthesizing it if none was received.
    pub fn replay(&self, message_index: usize) -> VoiceResult<()> {
        self.send(Command::Replay(message_index))
    }

    pub fn switch_conversation(&self, conversation_id: impl Into<String>) -> VoiceResult<()> {
        self.send(Command::Switch(conversation_id.into()))
    }

    pub async fn snapshot(&self) -> VoiceResult<CoordinatorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await
            .map_err(|_| VoiceError::Channel("coordinator stopped".to_string()))
    }

    /// Interrupt whatever is in flight, save the conversation and stop the task.
    /// Resolves once the final save has happened.
    pub async fn shutdown(&self) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await
            .map_err(|_| VoiceError::Channel("coordinator stopped".to_string()))
    }
}

/// Session callbacks, forwarded as data.
enum SessionEvent {
    Token(String),
    Metric(f64),
    Audio(AudioPayload),
    Error(String),
    SynthesisError(String),
    TextDone,
    Complete(SessionOutcome),
}

impl SessionEvent {
    fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Token(_) => "token",
            SessionEvent::Metric(_) => "metric",
            SessionEvent::Audio(_) => "audio fragment",
            SessionEvent::Error(_) => "error",
            SessionEvent::SynthesisError(_) => "synthesis error",
            SessionEvent::TextDone => "done",
            SessionEvent::Complete(_) => "completion",
        }
    }
}

enum Internal {
    Session { turn_id: TurnId, event: SessionEvent },
    Capture { epoch: u64, signal: CaptureSignal },
    Transcription { epoch: u64, result: VoiceResult<Transcript> },
    GraceElapsed { turn_id: TurnId },
    Synthesized {
        epoch: u64,
        message_index: usize,
        result: VoiceResult<AudioPayload>,
    },
}

/// Tags every callback of one session with its turn id.
struct TurnForwarder {
    turn_id: TurnId,
    tx: mpsc::UnboundedSender<Internal>,
}

impl TurnForwarder {
    fn forward(&self, event: SessionEvent) {
        let msg = Internal::Session {
            turn_id: self.turn_id,
            event,
        };
        if self.tx.send(msg).is_err() {
            debug!("{}: coordinator gone, dropping session event", self.turn_id);
        }
    }
}

impl SessionHandler for TurnForwarder {
    fn on_token(&mut self, text: &str) {
        self.forward(SessionEvent::Token(text.to_string()));
    }
    fn on_metric(&mut self, per_second: f64) {
        self.forward(SessionEvent::Metric(per_second));
    }
    fn on_audio_fragment(&mut self, payload: AudioPayload) {
        self.forward(SessionEvent::Audio(payload));
    }
    fn on_error(&mut self, message: &str) {
        self.forward(SessionEvent::Error(message.to_string()));
    }
    fn on_synthesis_error(&mut self, message: &str) {
        self.forward(SessionEvent::SynthesisError(message.to_string()));
    }
    fn on_text_done(&mut self) {
        self.forward(SessionEvent::TextDone);
    }
    fn on_complete(&mut self, outcome: SessionOutcome) {
        self.forward(SessionEvent::Complete(outcome));
    }
}

struct ActiveTurn {
    turn: Turn,
    cancel: CancellationToken,
    text_done: bool,
    complete: bool,
    /// `stop_speaking` was called: fragments are kept on the message but not played.
    muted: bool,
    /// Last sequence number handed to the queue for this turn.
    last_seq: Option<u64>,
    audio_drained: bool,
    grace: Option<JoinHandle<()>>,
}

impl ActiveTurn {
    fn new(turn: Turn, cancel: CancellationToken) -> Self {
        Self {
            turn,
            cancel,
            text_done: false,
            complete: false,
            muted: false,
            last_seq: None,
            audio_drained: true,
            grace: None,
        }
    }

    fn note_enqueued(&mut self, seq: u64) {
        self.last_seq = Some(seq);
        self.audio_drained = false;
    }

    /// Only a drain that played this turn's last fragment counts.
    fn note_drained(&mut self, last_seq: u64) {
        if self.last_seq == Some(last_seq) {
            self.audio_drained = true;
        }
    }

    fn is_finished(&self) -> bool {
        self.complete && self.audio_drained
    }

    fn abort_grace(&mut self) {
        if let Some(timer) = self.grace.take() {
            timer.abort();
        }
    }
}

/// Entry point; see the module docs.
pub struct VoiceTurnCoordinator {
    deps: CoordinatorDeps,
    queue: AudioPlaybackQueue,
    internal_tx: mpsc::UnboundedSender<Internal>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    trailing_audio_grace: Duration,

    state: VoiceState,
    live_mode: bool,
    capture_enabled: bool,
    playing: bool,
    conversation_id: String,
    log: MessageLog,
    last_turn: TurnId,
    active: Option<ActiveTurn>,
    /// Bumped whenever a capture starts or is abandoned; stale results are dropped.
    listen_epoch: u64,
    /// Bumped whenever replay audio is invalidated.
    replay_epoch: u64,
}

impl VoiceTurnCoordinator {
    /// Spawn the coordinator for conversation `"default"`, loading its history from the store.
    pub fn spawn(
        deps: CoordinatorDeps,
        config: &VoiceConfig,
    ) -> (CoordinatorHandle, mpsc::UnboundedReceiver<CoordinatorEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (queue, playback_rx) =
            AudioPlaybackQueue::new(Arc::clone(&deps.player), config.settle_delay());

        let history = match deps.store.load(DEFAULT_CONVERSATION) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("could not load conversation '{}': {}", DEFAULT_CONVERSATION, e);
                Vec::new()
            }
        };

        let coordinator = Self {
            deps,
            queue,
            internal_tx,
            events: event_tx,
            trailing_audio_grace: config.trailing_audio_grace(),
            state: VoiceState::Idle,
            live_mode: config.live_mode,
            capture_enabled: true,
            playing: false,
            conversation_id: DEFAULT_CONVERSATION.to_string(),
            log: MessageLog::from_messages(history),
            last_turn: TurnId::default(),
            active: None,
            listen_epoch: 0,
            replay_epoch: 0,
        };
        tokio::spawn(coordinator.run(cmd_rx, internal_rx, playback_rx));
        info!("🧭 Voice turn coordinator started (live mode: {})", config.live_mode);

        (CoordinatorHandle { tx: cmd_tx }, event_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut playback: mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        let ack = loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown(ack)) => break Some(ack),
                    None => break None,
                    Some(cmd) => self.on_command(cmd).await,
                },
                Some(msg) = internal.recv() => self.on_internal(msg).await,
                Some(ev) = playback.recv() => self.on_playback(ev).await,
            }
        };
        self.interrupt();
        self.set_state(VoiceState::Idle);
        self.persist();
        info!("🧭 Voice turn coordinator stopped");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartTurn(text) => self.start_turn(text),
            Command::StartListening => self.start_listening().await,
            Command::StopListening => self.stop_listening(),
            Command::StopSpeaking => self.stop_speaking().await,
            Command::LiveMode(enabled) => {
                self.live_mode = enabled;
                info!("Live mode {}", if enabled { "on" } else { "off" });
                if enabled && self.state == VoiceState::Idle && self.capture_enabled {
                    self.start_listening().await;
                }
            }
            Command::CaptureEnabled(enabled) => {
                self.capture_enabled = enabled;
                if !enabled && self.state == VoiceState::Listening {
                    self.abandon_capture();
                    self.set_state(VoiceState::Idle);
                }
            }
            Command::Stop => {
                info!("⏹️ Stop requested");
                self.interrupt();
                self.set_state(VoiceState::Idle);
            }
            Command::Replay(index) => self.replay(index),
            Command::Switch(id) => self.switch_conversation(id),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown(_) => {}
        }
    }

    async fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Session { turn_id, event } => self.on_session(turn_id, event).await,
            Internal::Capture { epoch, signal } => {
                if epoch != self.listen_epoch || self.state != VoiceState::Listening {
                    debug!("dropping stale capture signal {:?}", signal);
                    return;
                }
                match signal {
                    CaptureSignal::SpeechStarted => debug!("🎤 speech detected"),
                    CaptureSignal::UtteranceEnded => self.stop_listening(),
                }
            }
            Internal::Transcription { epoch, result } => {
                if epoch != self.listen_epoch || self.state != VoiceState::Transcribing {
                    debug!("dropping stale transcription result");
                    return;
                }
                self.on_transcription(result).await;
            }
            Internal::GraceElapsed { turn_id } => {
                if let Some(active) = self.active.as_mut() {
                    if active.turn.turn_id == turn_id && !active.complete {
                        warn!(
                            "{}: no stream close {:?} after text was done, giving up on trailing audio",
                            turn_id, self.trailing_audio_grace
                        );
                        active.grace = None;
                        active.cancel.cancel();
                    }
                }
            }
            Internal::Synthesized {
                epoch,
                message_index,
                result,
            } => {
                if epoch != self.replay_epoch {
                    debug!("dropping stale synthesized audio for message {}", message_index);
                    return;
                }
                match result {
                    Ok(payload) if payload.is_empty() => {}
                    Ok(payload) => {
                        self.log.attach_fragment(message_index, Arc::clone(&payload));
                        if let Err(e) = self.queue.enqueue(message_index, payload) {
                            warn!("replay enqueue failed: {}", e);
                        }
                    }
                    Err(e) => self.report_error(None, &e),
                }
            }
        }
    }

    // ---- turns ----

    fn start_turn(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            debug!("ignoring empty turn");
            return;
        }
        self.interrupt();

        let user_index = self.log.push_user(text.clone());
        self.emit_message(user_index);
        let assistant_index = self.log.push_assistant_placeholder();
        self.emit_message(assistant_index);

        let turn_id = self.last_turn.next();
        self.last_turn = turn_id;
        let cancel = CancellationToken::new();
        let turn = Turn {
            turn_id,
            source_text: text.clone(),
            assistant_message_index: assistant_index,
            phase: TurnPhase::Submitted,
        };
        info!("💬 {} submitted ({} chars)", turn_id, text.len());

        let forwarder = TurnForwarder {
            turn_id,
            tx: self.internal_tx.clone(),
        };
        StreamingChatSession::new(Arc::clone(&self.deps.chat)).spawn(
            text,
            forwarder,
            cancel.clone(),
        );

        self.active = Some(ActiveTurn::new(turn, cancel));
        self.set_state(VoiceState::AwaitingResponse);
    }

    async fn on_session(&mut self, turn_id: TurnId, event: SessionEvent) {
        let is_active = self
            .active
            .as_ref()
            .map_or(false, |a| a.turn.turn_id == turn_id);
        if !is_active {
            debug!("dropping {} from stale {}", event.kind(), turn_id);
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let index = active.turn.assistant_message_index;
        if active.turn.phase == TurnPhase::Submitted {
            active.turn.phase = TurnPhase::Streaming;
        }

        match event {
            SessionEvent::Token(token) => {
                if self.log.append_text(index, &token) {
                    self.emit_message(index);
                } else {
                    debug!("{}: token after text done, dropped", turn_id);
                }
            }
            SessionEvent::Metric(per_second) => {
                if self.log.set_metric(index, per_second) {
                    self.emit_message(index);
                }
            }
            SessionEvent::Audio(payload) => {
                self.log.attach_fragment(index, Arc::clone(&payload));
                if active.muted {
                    debug!("{}: muted, fragment kept for replay only", turn_id);
                    return;
                }
                match self.queue.enqueue(index, payload) {
                    Ok(seq) => active.note_enqueued(seq),
                    Err(e) => warn!("{}: {}", turn_id, e),
                }
            }
            SessionEvent::Error(message) => {
                warn!("{}: server error mid-stream: {}", turn_id, message);
                if self.log.append_text(index, &format!("\n[error] {}", message)) {
                    self.emit_message(index);
                }
                self.emit(CoordinatorEvent::TurnError {
                    turn_id: Some(turn_id),
                    kind: ErrorKind::Stream,
                    message,
                });
            }
            SessionEvent::SynthesisError(message) => {
                warn!("🔇 {}: synthesis error (text unaffected): {}", turn_id, message);
            }
            SessionEvent::TextDone => {
                if active.text_done {
                    return;
                }
                active.text_done = true;
                let tx = self.internal_tx.clone();
                let grace = self.trailing_audio_grace;
                active.grace = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = tx.send(Internal::GraceElapsed { turn_id });
                }));
                self.log.finalize(index);
                self.emit_message(index);
            }
            SessionEvent::Complete(outcome) => {
                active.complete = true;
                active.abort_grace();
                let failure = match outcome {
                    SessionOutcome::Finished | SessionOutcome::Cancelled => None,
                    SessionOutcome::Failed(message) => Some(message),
                };
                match &failure {
                    None => active.turn.phase = TurnPhase::Completed,
                    Some(message) => {
                        active.turn.phase = TurnPhase::Failed;
                        self.log
                            .append_text(index, &format!("\n[connection lost] {}", message));
                    }
                }
                self.log.finalize(index);
                self.emit_message(index);
                if let Some(message) = failure {
                    self.report_error(Some(turn_id), &VoiceError::Transport(message));
                }
                self.persist();
                if self.state == VoiceState::AwaitingResponse {
                    self.set_state(VoiceState::Speaking);
                }
                self.maybe_finish_turn().await;
            }
        }
    }

    /// Ends the active turn once the stream is closed and its audio has drained.
    async fn maybe_finish_turn(&mut self) {
        let done = self
            .active
            .as_ref()
            .map_or(false, ActiveTurn::is_finished);
        if !done {
            return;
        }
        if let Some(mut finished) = self.active.take() {
            finished.abort_grace();
            info!(
                "🏁 {} finished ({:?})",
                finished.turn.turn_id, finished.turn.phase
            );
        }
        self.idle_or_listen().await;
    }

    async fn idle_or_listen(&mut self) {
        if self.live_mode && self.capture_enabled {
            self.start_listening().await;
        } else {
            self.set_state(VoiceState::Idle);
        }
    }

    /// Supersede whatever is in flight: capture, transcription, chat turn and audio.
    fn interrupt(&mut self) {
        if self.state == VoiceState::Listening || self.state == VoiceState::Transcribing {
            self.abandon_capture();
        }
        self.replay_epoch += 1;
        self.queue.stop();
        if let Some(mut superseded) = self.active.take() {
            superseded.abort_grace();
            superseded.cancel.cancel();
            let index = superseded.turn.assistant_message_index;
            self.log.finalize(index);
            self.emit_message(index);
            self.persist();
            info!("⚡ {} superseded", superseded.turn.turn_id);
        }
    }

    async fn stop_speaking(&mut self) {
        self.replay_epoch += 1;
        self.queue.stop();
        if let Some(active) = self.active.as_mut() {
            active.muted = true;
            active.audio_drained = true;
            info!("🔇 {} muted", active.turn.turn_id);
        }
        self.maybe_finish_turn().await;
    }

    // ---- capture ----

    async fn start_listening(&mut self) {
        if !self.capture_enabled {
            self.emit(CoordinatorEvent::TurnError {
                turn_id: None,
                kind: ErrorKind::Capture,
                message: "capture is disabled".to_string(),
            });
            return;
        }
        if self.state == VoiceState::Listening {
            return;
        }
        // Barge-in: the user talking over the assistant ends the assistant's turn.
        self.interrupt();

        self.listen_epoch += 1;
        let epoch = self.listen_epoch;
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                if internal_tx.send(Internal::Capture { epoch, signal }).is_err() {
                    break;
                }
            }
        });

        match self.deps.capture.start(signal_tx).await {
            Ok(()) => {
                info!("🎙️ Listening");
                self.set_state(VoiceState::Listening);
            }
            Err(e) => {
                self.report_error(None, &e);
                self.set_state(VoiceState::Idle);
            }
        }
    }

    fn stop_listening(&mut self) {
        if self.state != VoiceState::Listening {
            debug!("stop_listening while {:?}, ignored", self.state);
            return;
        }
        self.set_state(VoiceState::Transcribing);

        let epoch = self.listen_epoch;
        let capture = Arc::clone(&self.deps.capture);
        let transcriber = Arc::clone(&self.deps.transcriber);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match capture.stop().await {
                Ok(audio) if audio.is_empty() => Ok(Transcript {
                    text: String::new(),
                    confidence: 0.0,
                }),
                Ok(audio) => transcriber.transcribe(audio).await,
                Err(e) => Err(e),
            };
            let _ = tx.send(Internal::Transcription { epoch, result });
        });
    }

    fn abandon_capture(&mut self) {
        self.listen_epoch += 1;
        self.deps.capture.cancel();
    }

    async fn on_transcription(&mut self, result: VoiceResult<Transcript>) {
        match result {
            Ok(transcript) => {
                let text = transcript.text.trim().to_string();
                info!("📝 Transcribed: {:?}", text);
                self.emit(CoordinatorEvent::Transcribed(transcript));
                if text.is_empty() {
                    self.idle_or_listen().await;
                } else {
                    self.start_turn(text);
                }
            }
            Err(e) => {
                self.report_error(None, &e);
                self.idle_or_listen().await;
            }
        }
    }

    // ---- playback ----

    async fn on_playback(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Started { .. } => self.set_playing(true),
            PlaybackEvent::Finished { seq, ok: false, .. } => {
                debug!("fragment #{} skipped after playback error", seq);
            }
            PlaybackEvent::Finished { .. } => {}
            PlaybackEvent::Drained { last_seq, .. } => {
                self.set_playing(false);
                if let Some(active) = self.active.as_mut() {
                    active.note_drained(last_seq);
                }
                self.maybe_finish_turn().await;
            }
            PlaybackEvent::Stopped => self.set_playing(false),
        }
    }

    fn replay(&mut self, index: usize) {
        if self.active.is_some() || self.state != VoiceState::Idle {
            warn!("replay ignored while {:?}", self.state);
            return;
        }
        let Some(message) = self.log.get(index) else {
            self.emit(CoordinatorEvent::TurnError {
                turn_id: None,
                kind: ErrorKind::Internal,
                message: format!("no message at index {}", index),
            });
            return;
        };
        let fragments = message.audio_fragments.clone();
        let text = message.text.clone();

        self.replay_epoch += 1;
        self.queue.stop();
        if !fragments.is_empty() {
            for payload in fragments {
                if let Err(e) = self.queue.enqueue(index, payload) {
                    warn!("replay enqueue failed: {}", e);
                }
            }
            return;
        }
        if text.trim().is_empty() {
            return;
        }

        let epoch = self.replay_epoch;
        let synthesizer = Arc::clone(&self.deps.synthesizer);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = synthesizer.synthesize(&text).await;
            let _ = tx.send(Internal::Synthesized {
                epoch,
                message_index: index,
                result,
            });
        });
    }

    // ---- conversations ----

    fn switch_conversation(&mut self, conversation_id: String) {
        self.interrupt();
        self.set_state(VoiceState::Idle);
        self.persist();

        let messages = match self.deps.store.load(&conversation_id) {
            Ok(m) => m,
            Err(e) => {
                self.report_error(None, &e);
                return;
            }
        };
        info!(
            "📂 Switched to conversation '{}' ({} messages)",
            conversation_id,
            messages.len()
        );
        let message_count = messages.len();
        self.log.replace_all(messages);
        self.conversation_id = conversation_id.clone();
        self.emit(CoordinatorEvent::ConversationSwitched {
            conversation_id,
            message_count,
        });
    }

    fn persist(&self) {
        if let Err(e) = self.deps.store.save(&self.conversation_id, self.log.messages()) {
            self.report_error(None, &e);
        }
    }

    // ---- notifications ----

    fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            state: self.state,
            live_mode: self.live_mode,
            capture_enabled: self.capture_enabled,
            playing: self.playing,
            conversation_id: self.conversation_id.clone(),
            active_turn: self.active.as_ref().map(|a| a.turn.clone()),
            messages: self.log.messages().to_vec(),
        }
    }

    fn set_state(&mut self, state: VoiceState) {
        if self.state == state {
            return;
        }
        debug!("state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.emit(CoordinatorEvent::StateChanged(state));
    }

    fn set_playing(&mut self, playing: bool) {
        if self.playing == playing {
            return;
        }
        self.playing = playing;
        self.emit(CoordinatorEvent::PlaybackStateChanged { playing });
    }

    fn emit_message(&self, index: usize) {
        if let Some(message) = self.log.get(index) {
            self.emit(CoordinatorEvent::MessageUpdated {
                index,
                message: message.clone(),
            });
        }
    }

    fn report_error(&self, turn_id: Option<TurnId>, err: &VoiceError) {
        warn!("{}", err);
        self.emit(CoordinatorEvent::TurnError {
            turn_id,
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn emit(&self, event: CoordinatorEvent) {
        if self.events.send(event).is_err() {
            debug!("no event listener");
        }
    }
}
