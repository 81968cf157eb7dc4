//! **AudioPlaybackQueue** — back-to-back playback of synthesized fragments.
//!
//! A single drain task owns the queue and the player. It pops the head, plays it to
//! completion, waits the settle delay, and moves on; when the queue empties it reports
//! `Drained` once. Commands (`enqueue`, `stop`) are handled while a fragment plays, so
//! `stop` takes effect immediately and nothing queued before it is ever played.

use crate::error::{VoiceError, VoiceResult};
use crate::message::AudioPayload;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Output device for one fragment at a time.
#[async_trait]
pub trait FragmentPlayer: Send + Sync + 'static {
    /// Play `payload`, resolving at its natural end (or on a decode/playback error).
    async fn play(&self, payload: &AudioPayload) -> VoiceResult<()>;
    /// Silence whatever is currently audible.
    fn halt(&self);
}

/// An audio payload and the message it belongs to.
#[derive(Debug, Clone)]
pub struct PlaybackItem {
    /// Position in enqueue order, assigned by the queue.
    pub seq: u64,
    pub message_index: usize,
    pub payload: AudioPayload,
}

/// Notifications from the drain loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started { seq: u64, message_index: usize },
    Finished { seq: u64, message_index: usize, ok: bool },
    /// The queue ran empty after playing `last_seq`. Once per drain episode.
    Drained { last_seq: u64, message_index: usize },
    /// `stop()` discarded in-flight and queued audio.
    Stopped,
}

enum QueueCommand {
    Enqueue(PlaybackItem),
    Stop,
}

/// Handle to the playback queue. Cheap to clone; all clones feed the same drain task.
#[derive(Clone)]
pub struct AudioPlaybackQueue {
    cmd_tx: mpsc::UnboundedSender<QueueCommand>,
    next_seq: Arc<AtomicU64>,
}

impl AudioPlaybackQueue {
    /// Spawn the drain task. Returns the handle and the event receiver.
    pub fn new(
        player: Arc<dyn FragmentPlayer>,
        settle_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let drain = DrainLoop {
            player,
            settle_delay,
            queue: VecDeque::new(),
            cmd_rx,
            event_tx,
        };
        tokio::spawn(drain.run());

        (
            Self {
                cmd_tx,
                next_seq: Arc::new(AtomicU64::new(1)),
            },
            event_rx,
        )
    }

    /// Append to the tail; playback starts immediately when idle. Returns the item's sequence number.
    pub fn enqueue(&self, message_index: usize, payload: AudioPayload) -> VoiceResult<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.cmd_tx
            .send(QueueCommand::Enqueue(PlaybackItem {
                seq,
                message_index,
                payload,
            }))
            .map_err(|_| VoiceError::Channel("playback queue closed".to_string()))?;
        Ok(seq)
    }

    /// Halt in-flight playback and discard everything queued. Safe in any state.
    pub fn stop(&self) {
        if self.cmd_tx.send(QueueCommand::Stop).is_err() {
            debug!("stop on closed playback queue");
        }
    }
}

struct DrainLoop {
    player: Arc<dyn FragmentPlayer>,
    settle_delay: Duration,
    queue: VecDeque<PlaybackItem>,
    cmd_rx: mpsc::UnboundedReceiver<QueueCommand>,
    event_tx: mpsc::UnboundedSender<PlaybackEvent>,
}

/// What interrupted a wait inside the drain loop.
enum Interrupt {
    Completed,
    Stopped,
    Closed,
}

impl DrainLoop {
    async fn run(mut self) {
        loop {
            // Idle: block until something arrives.
            let Some(cmd) = self.cmd_rx.recv().await else {
                break;
            };
            match cmd {
                QueueCommand::Enqueue(item) => self.queue.push_back(item),
                QueueCommand::Stop => {
                    self.emit(PlaybackEvent::Stopped);
                    continue;
                }
            }

            if let Interrupt::Closed = self.drain().await {
                break;
            }
        }
        self.player.halt();
        debug!("playback drain loop exited");
    }

    /// Play until the queue is empty or a stop arrives.
    async fn drain(&mut self) -> Interrupt {
        let mut last: Option<(u64, usize)> = None;

        while let Some(item) = self.queue.pop_front() {
            self.emit(PlaybackEvent::Started {
                seq: item.seq,
                message_index: item.message_index,
            });

            let player = Arc::clone(&self.player);
            let payload = Arc::clone(&item.payload);
            let mut result: Option<VoiceResult<()>> = None;
            let play = async move { player.play(&payload).await };
            match self.wait_for(play, &mut result).await {
                Interrupt::Completed => {}
                other => {
                    self.player.halt();
                    self.queue.clear();
                    if let Interrupt::Stopped = other {
                        info!("⏹️ Playback stopped");
                        self.emit(PlaybackEvent::Stopped);
                    }
                    return other;
                }
            }

            let ok = match result {
                Some(Ok(())) => true,
                Some(Err(e)) => {
                    warn!("Skipping fragment {} (message {}): {}", item.seq, item.message_index, e);
                    false
                }
                None => false,
            };
            self.emit(PlaybackEvent::Finished {
                seq: item.seq,
                message_index: item.message_index,
                ok,
            });
            last = Some((item.seq, item.message_index));

            let settle = self.settle_delay;
            let mut unit = None;
            match self.wait_for(tokio::time::sleep(settle), &mut unit).await {
                Interrupt::Completed => {}
                other => {
                    self.queue.clear();
                    if let Interrupt::Stopped = other {
                        self.emit(PlaybackEvent::Stopped);
                    }
                    return other;
                }
            }
        }

        if let Some((last_seq, message_index)) = last {
            debug!("playback drained after seq {}", last_seq);
            self.emit(PlaybackEvent::Drained {
                last_seq,
                message_index,
            });
        }
        Interrupt::Completed
    }

    /// Await `fut` while servicing commands. Enqueues are appended; a stop aborts the wait.
    async fn wait_for<F, T>(&mut self, fut: F, out: &mut Option<T>) -> Interrupt
    where
        F: std::future::Future<Output = T>,
    {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(QueueCommand::Enqueue(item)) => self.queue.push_back(item),
                    Some(QueueCommand::Stop) => return Interrupt::Stopped,
                    None => return Interrupt::Closed,
                },
                value = &mut fut => {
                    *out = Some(value);
                    return Interrupt::Completed;
                }
            }
        }
    }

    fn emit(&self, event: PlaybackEvent) {
        // Receiver gone means nobody is listening any more; playback itself continues.
        let _ = self.event_tx.send(event);
    }
}
