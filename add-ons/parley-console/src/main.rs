//! Parley Console
//!
//! Terminal front end for the voice turn coordinator. Typed lines become chat turns;
//! slash commands drive the microphone, live mode, playback and conversations.

use anyhow::Context;
use parley_voice::{
    CaptureConfig, ConversationStore, CoordinatorDeps, CoordinatorEvent, CoordinatorHandle,
    HttpTransport, MemoryConversationStore, MicCapture, RodioPlayer, Sender,
    SledConversationStore, VoiceConfig, VoiceState, VoiceTurnCoordinator,
};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "\
  <text>        send a message
  /listen       start recording (push-to-talk)
  /send         stop recording and send what was said
  /live on|off  hands-free mode
  /mute         stop the assistant speaking
  /stop         abort the current turn
  /replay N     play message N again
  /switch ID    open conversation ID
  /health       check the server
  /quit         exit";

#[derive(Debug, PartialEq)]
enum ConsoleCommand {
    Say(String),
    Listen,
    Send,
    Live(bool),
    Mute,
    Stop,
    Replay(usize),
    Switch(String),
    Health,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(ConsoleCommand::Say(line.to_string())));
    }
    let mut parts = line.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).unwrap_or_default();
    let cmd = match name {
        "/listen" => ConsoleCommand::Listen,
        "/send" => ConsoleCommand::Send,
        "/live" => match arg {
            "on" => ConsoleCommand::Live(true),
            "off" => ConsoleCommand::Live(false),
            _ => return Err("usage: /live on|off".to_string()),
        },
        "/mute" => ConsoleCommand::Mute,
        "/stop" => ConsoleCommand::Stop,
        "/replay" => {
            let index = arg
                .parse::<usize>()
                .map_err(|_| "usage: /replay N".to_string())?;
            ConsoleCommand::Replay(index)
        }
        "/switch" if !arg.is_empty() => ConsoleCommand::Switch(arg.to_string()),
        "/switch" => return Err("usage: /switch ID".to_string()),
        "/health" => ConsoleCommand::Health,
        "/help" => ConsoleCommand::Help,
        "/quit" | "/exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command {} (try /help)", other)),
    };
    Ok(Some(cmd))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[parley-console] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = VoiceConfig::load().context("load VoiceConfig")?;
    let transport = Arc::new(HttpTransport::from_config(&config)?);
    match transport.health().await {
        Ok(true) => tracing::info!(server = %transport.base_url, "Server healthy"),
        Ok(false) => tracing::warn!(server = %transport.base_url, "Server reports unhealthy"),
        Err(e) => tracing::warn!(server = %transport.base_url, error = %e, "Server unreachable"),
    }

    let store: Arc<dyn ConversationStore> = match &config.store_path {
        Some(path) => Arc::new(
            SledConversationStore::open_path(path)
                .with_context(|| format!("open conversation store at {}", path))?,
        ),
        None => Arc::new(MemoryConversationStore::new()),
    };
    let player = Arc::new(RodioPlayer::new().context("open audio output")?);
    let capture = Arc::new(MicCapture::new(CaptureConfig::from(&config)));

    let deps = CoordinatorDeps {
        chat: transport.clone(),
        transcriber: transport.clone(),
        synthesizer: transport.clone(),
        capture,
        player,
        store,
    };
    let (handle, events) = VoiceTurnCoordinator::spawn(deps, &config);
    if config.live_mode {
        handle.enable_live_mode(true)?;
    }
    tokio::spawn(print_events(events));

    println!("Parley console. Type a message or /help.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(cmd)) => {
                        if let Err(e) = dispatch(&handle, &transport, cmd).await {
                            tracing::warn!(error = %e, "command failed");
                        }
                    }
                    Ok(None) => {}
                    Err(usage) => println!("{}", usage),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                break;
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

async fn dispatch(
    handle: &CoordinatorHandle,
    transport: &HttpTransport,
    cmd: ConsoleCommand,
) -> anyhow::Result<()> {
    match cmd {
        ConsoleCommand::Say(text) => handle.start_turn(text)?,
        ConsoleCommand::Listen => handle.start_listening()?,
        ConsoleCommand::Send => handle.stop_listening()?,
        ConsoleCommand::Live(on) => handle.enable_live_mode(on)?,
        ConsoleCommand::Mute => handle.stop_speaking()?,
        ConsoleCommand::Stop => handle.stop()?,
        ConsoleCommand::Replay(index) => handle.replay(index)?,
        ConsoleCommand::Switch(id) => handle.switch_conversation(id)?,
        ConsoleCommand::Health => {
            let healthy = transport.health().await?;
            println!("{} is {}", transport.base_url, if healthy { "healthy" } else { "unhealthy" });
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

/// Streams assistant text as it grows; one line per state change or error.
async fn print_events(mut events: mpsc::UnboundedReceiver<CoordinatorEvent>) {
    let mut printed: HashMap<usize, usize> = HashMap::new();
    let mut done: HashSet<usize> = HashSet::new();
    while let Some(event) = events.recv().await {
        match event {
            CoordinatorEvent::MessageUpdated { index, message } => {
                if done.contains(&index) {
                    continue;
                }
                if message.sender == Sender::User {
                    println!("[{}] you: {}", index, message.text);
                    done.insert(index);
                    continue;
                }
                let shown = printed.entry(index).or_insert_with(|| {
                    print!("[{}] assistant: ", index);
                    0
                });
                if message.text.len() > *shown && message.text.is_char_boundary(*shown) {
                    print!("{}", &message.text[*shown..]);
                    *shown = message.text.len();
                }
                if message.finalized {
                    match message.metrics_per_second {
                        Some(tps) => println!("  ({:.1} tok/s)", tps),
                        None => println!(),
                    }
                    done.insert(index);
                }
                let _ = std::io::stdout().flush();
            }
            CoordinatorEvent::StateChanged(state) => {
                let label = match state {
                    VoiceState::Idle => "idle",
                    VoiceState::Listening => "🎙️ listening (/send when done)",
                    VoiceState::Transcribing => "transcribing…",
                    VoiceState::AwaitingResponse => "thinking…",
                    VoiceState::Speaking => "🔊 speaking",
                };
                tracing::debug!(state = label, "state changed");
                if matches!(state, VoiceState::Listening | VoiceState::Transcribing) {
                    println!("-- {}", label);
                }
            }
            CoordinatorEvent::PlaybackStateChanged { playing } => {
                tracing::debug!(playing, "playback");
            }
            CoordinatorEvent::TurnError { turn_id, kind, message } => match turn_id {
                Some(id) => println!("!! {} {:?}: {}", id, kind, message),
                None => println!("!! {:?}: {}", kind, message),
            },
            CoordinatorEvent::Transcribed(t) => {
                tracing::info!(confidence = t.confidence, "heard {:?}", t.text);
            }
            CoordinatorEvent::ConversationSwitched {
                conversation_id,
                message_count,
            } => {
                printed.clear();
                done.clear();
                println!("-- conversation '{}' ({} messages)", conversation_id, message_count);
            }
        }
    }
}
