//! Hearth Talk - spoken conversation from the terminal.
//!
//! Press Enter to start talking; the turn is sent after a pause (or press
//! Enter again to send right away). Any other line is sent as typed text.
//! Commands start with `/`, see `/help`.

mod store;

use anyhow::Context;
use hearth_voice::{
    synthesizer_from_config, ChatCompletionsPipeline, ChatTurn, Collaborators, ControllerConfig,
    ControllerHandle, Conversation, HearthConfig, OpenAiCompatibleStt, RodioOutput,
    SpeechSynthesizer, TurnController, TurnState, VadRecognizer, VoiceCatalog, VoiceUpdate,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use store::SessionStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_STORE_PATH: &str = "data/hearth-sessions.json";

const HELP: &str = "\
  <Enter>      start talking / send now
  <text>       send typed text
  /greet       let the assistant open the conversation
  /cancel      stop whatever is happening
  /pause       disable the microphone
  /resume      enable the microphone
  /voice [id]  list voices or switch voice
  /new         start a new conversation
  /list        show saved conversations
  /open <n>    switch to conversation n from /list
  /delete <n>  delete conversation n from /list
  /quit        save and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Toggle,
    Say(String),
    Greet,
    Cancel,
    Pause,
    Resume,
    Voice(Option<String>),
    New,
    List,
    /// 1-based position in `/list`; `None` when missing or not a number.
    Open(Option<usize>),
    Delete(Option<usize>),
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Toggle;
        }
        if !line.starts_with('/') && line != "?" {
            return Command::Say(line.to_string());
        }
        let mut parts = line.split_whitespace();
        let head = parts.next().unwrap_or_default();
        match head {
            "/greet" => Command::Greet,
            "/cancel" | "/stop" => Command::Cancel,
            "/pause" => Command::Pause,
            "/resume" => Command::Resume,
            "/voice" => Command::Voice(parts.next().map(str::to_string)),
            "/new" => Command::New,
            "/list" => Command::List,
            "/open" => Command::Open(parts.next().and_then(|n| n.parse().ok())),
            "/delete" => Command::Delete(parts.next().and_then(|n| n.parse().ok())),
            "/help" | "?" => Command::Help,
            "/quit" | "/exit" => Command::Quit,
            other => Command::Unknown(other.to_string()),
        }
    }
}

/// A running controller and the ends of its channels.
struct Session {
    handle: ControllerHandle,
    updates: mpsc::UnboundedReceiver<VoiceUpdate>,
    task: JoinHandle<Vec<ChatTurn>>,
    streaming: bool,
}

impl Session {
    fn spawn(config: ControllerConfig, collaborators: Collaborators, history: Vec<ChatTurn>) -> Self {
        let (controller, handle, updates) = TurnController::new(config, collaborators);
        let task = tokio::spawn(controller.with_history(history).run());
        Self {
            handle,
            updates,
            task,
            streaming: false,
        }
    }

    async fn finish(self) -> anyhow::Result<Vec<ChatTurn>> {
        // Already stopped is fine: the task still holds the history.
        let _ = self.handle.shutdown();
        self.task.await.context("controller task panicked")
    }

    fn render(&mut self, update: &VoiceUpdate) {
        match update {
            VoiceUpdate::State(state) => {
                match state {
                    TurnState::Listening => println!("🎤 listening..."),
                    TurnState::AwaitingReply => println!("💭 thinking..."),
                    TurnState::Speaking => println!("🔊 speaking (Enter to interrupt)"),
                    TurnState::Idle => println!("⏸  idle (Enter to talk)"),
                    TurnState::Committing => {}
                }
            }
            VoiceUpdate::Transcript { committed, interim } => {
                let text = format!("{committed}{interim}");
                if !text.trim().is_empty() {
                    println!("   … {}", text.trim());
                }
            }
            VoiceUpdate::TurnCommitted(text) => println!("you: {text}"),
            VoiceUpdate::ReplyDelta(text) => {
                if !self.streaming {
                    print!("assistant: ");
                    self.streaming = true;
                }
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            VoiceUpdate::Reply(text) => {
                if self.streaming {
                    println!();
                    self.streaming = false;
                } else {
                    println!("assistant: {text}");
                }
            }
            VoiceUpdate::Error(message) => {
                if self.streaming {
                    println!();
                    self.streaming = false;
                }
                println!("⚠️  {message}");
            }
            VoiceUpdate::History(_) => {}
        }
    }
}

fn build_collaborators(config: &HearthConfig) -> anyhow::Result<Collaborators> {
    let stt = OpenAiCompatibleStt::from_config(&config.recognizer, &config.turn.locale)
        .context("speech-to-text")?;
    let pipeline =
        ChatCompletionsPipeline::from_config(config.pipeline.clone()).context("reply service")?;
    let synthesizer: Arc<dyn SpeechSynthesizer> =
        Arc::from(synthesizer_from_config(&config.synthesis).context("speech synthesis")?);

    Ok(Collaborators {
        recognizer: Arc::new(VadRecognizer::new(config.recognizer.clone(), Arc::new(stt))),
        pipeline: Arc::new(pipeline),
        synthesizer,
        output: Arc::new(RodioOutput::new()),
    })
}

/// The conversation at 1-based position `n` of `/list`.
fn pick(store: &SessionStore, n: Option<usize>) -> Option<Conversation> {
    let index = n?.checked_sub(1)?;
    store.conversations().get(index).cloned()
}

fn persist(store: &mut SessionStore, conversation: &mut Conversation, history: Vec<ChatTurn>) {
    conversation.update_messages(history);
    if let Err(e) = store.save(conversation) {
        tracing::warn!(error = %e, "could not save conversation");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[hearth-talk] .env not loaded: {} (using system environment)", e);
    }

    // Logs go to stderr so they don't interleave with the conversation.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn,hearth_voice=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = HearthConfig::load().context("loading configuration")?;

    let store_path = std::env::var("HEARTH_SESSIONS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORE_PATH));
    let mut store = SessionStore::open(store_path)?;
    if let Some(voice) = store.voice().filter(|v| VoiceCatalog::is_known(v)) {
        config.turn.voice = voice.to_string();
    }
    config.turn.validate()?;

    let collaborators = build_collaborators(&config)?;
    let mut conversation = store.active_or_new();
    tracing::info!(
        conversation = %conversation.id,
        turns = conversation.messages.len(),
        sessions = %store.path().display(),
        "🔥 hearth-talk started"
    );
    if !conversation.messages.is_empty() {
        println!("Resuming \"{}\"", conversation.title);
    }
    println!("{HELP}");

    let mut session = Session::spawn(
        config.turn.clone(),
        collaborators.clone(),
        conversation.messages.clone(),
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match Command::parse(&line) {
                    Command::Toggle => session.handle.toggle()?,
                    Command::Say(text) => session.handle.submit_text(text)?,
                    Command::Greet => session.handle.greet()?,
                    Command::Cancel => session.handle.cancel_turn()?,
                    Command::Pause => session.handle.set_enabled(false)?,
                    Command::Resume => session.handle.set_enabled(true)?,
                    Command::Voice(None) => {
                        for id in VoiceCatalog::selectors() {
                            let mark = if id == config.turn.voice { "*" } else { " " };
                            println!(" {mark} {id}");
                        }
                    }
                    Command::Voice(Some(id)) => {
                        if !VoiceCatalog::is_known(&id) {
                            println!("unknown voice {id:?}; try /voice");
                            continue;
                        }
                        store.set_voice(&id)?;
                        config.turn.voice = id;
                        let history = session.finish().await?;
                        persist(&mut store, &mut conversation, history.clone());
                        session = Session::spawn(config.turn.clone(), collaborators.clone(), history);
                        println!("voice set to {}", config.turn.voice);
                    }
                    Command::New => {
                        let history = session.finish().await?;
                        persist(&mut store, &mut conversation, history);
                        conversation = Conversation::new();
                        session = Session::spawn(config.turn.clone(), collaborators.clone(), Vec::new());
                        println!("new conversation");
                    }
                    Command::List => {
                        for (i, c) in store.conversations().iter().enumerate() {
                            let mark = if c.id == conversation.id { "*" } else { " " };
                            println!(" {mark} {:>2}. {}  {}", i + 1, c.updated_at.format("%Y-%m-%d %H:%M"), c.title);
                        }
                    }
                    Command::Open(n) => {
                        let Some(chosen) = pick(&store, n) else {
                            println!("usage: /open <n> (see /list)");
                            continue;
                        };
                        if chosen.id == conversation.id {
                            continue;
                        }
                        let history = session.finish().await?;
                        persist(&mut store, &mut conversation, history);
                        store.set_active(&chosen.id)?;
                        session = Session::spawn(config.turn.clone(), collaborators.clone(), chosen.messages.clone());
                        println!("opened \"{}\"", chosen.title);
                        conversation = chosen;
                    }
                    Command::Delete(n) => {
                        let Some(chosen) = pick(&store, n) else {
                            println!("usage: /delete <n> (see /list)");
                            continue;
                        };
                        if chosen.id == conversation.id {
                            // Its history dies with it; nothing to persist.
                            session.finish().await?;
                            conversation = Conversation::new();
                            session = Session::spawn(config.turn.clone(), collaborators.clone(), Vec::new());
                        }
                        store.delete(&chosen.id)?;
                        println!("deleted \"{}\"", chosen.title);
                    }
                    Command::Help => println!("{HELP}"),
                    Command::Quit => break,
                    Command::Unknown(cmd) => println!("unknown command {cmd}; try /help"),
                }
            }
            update = session.updates.recv() => {
                let Some(update) = update else { break };
                session.render(&update);
                if let VoiceUpdate::History(turns) = update {
                    persist(&mut store, &mut conversation, turns);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                break;
            }
        }
    }

    let history = session.finish().await?;
    persist(&mut store, &mut conversation, history);
    // The transcription client is blocking; it has to be dropped off the runtime.
    let _ = tokio::task::spawn_blocking(move || drop(collaborators)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_toggles() {
        assert_eq!(Command::parse(""), Command::Toggle);
        assert_eq!(Command::parse("   "), Command::Toggle);
    }

    #[test]
    fn plain_lines_are_typed_text() {
        assert_eq!(
            Command::parse("  how was your day? "),
            Command::Say("how was your day?".to_string())
        );
        assert_eq!(Command::parse("?"), Command::Help);
    }

    #[test]
    fn open_and_delete_take_a_list_position() {
        assert_eq!(Command::parse("/open 2"), Command::Open(Some(2)));
        assert_eq!(Command::parse("/open"), Command::Open(None));
        assert_eq!(Command::parse("/delete x"), Command::Delete(None));
    }

    #[test]
    fn pick_counts_from_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::open(dir.path().join("s.json")).unwrap();
        let mut c = Conversation::new();
        c.update_messages(vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")]);
        store.save(&c).unwrap();

        assert_eq!(pick(&store, Some(1)).map(|p| p.id), Some(c.id));
        assert!(pick(&store, Some(0)).is_none());
        assert!(pick(&store, Some(2)).is_none());
        assert!(pick(&store, None).is_none());
    }

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("/greet"), Command::Greet);
        assert_eq!(Command::parse("/stop"), Command::Cancel);
        assert_eq!(Command::parse("/voice"), Command::Voice(None));
        assert_eq!(
            Command::parse("/voice maria"),
            Command::Voice(Some("maria".to_string()))
        );
        assert_eq!(Command::parse(" /quit "), Command::Quit);
        assert_eq!(
            Command::parse("/dance"),
            Command::Unknown("/dance".to_string())
        );
    }
}
