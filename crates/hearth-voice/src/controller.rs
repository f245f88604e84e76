//! Turn controller: the half-duplex state machine.
//!
//! One task owns every piece of turn state and drains a single queue.
//! Recognizer callbacks, timers, reply and synthesis completions, playback
//! completions and user signals all arrive as [`ControllerEvent`]s, and each
//! is handled to completion before the next is looked at. Anything that
//! outlives a transition (a capture run, a deadline, a reply request, a clip)
//! carries an id, and messages tagged with a superseded id are dropped.
//!
//! At every point between two messages at most one of {capture run,
//! playback} is live.

use crate::capture::{CaptureEvent, CaptureSession, CaptureUpdate, EndReason, Recognizer, RecognizerOptions, UtteranceBuffer};
use crate::config::ControllerConfig;
use crate::endpoint::Endpointer;
use crate::error::{VoiceError, VoiceResult};
use crate::history::ChatTurn;
use crate::pipeline::{ReplySink, ResponsePipeline};
use crate::playback::{AudioClip, AudioOutput, PlaybackGate, PlaybackOutcome};
use crate::supervisor::{SessionSupervisor, SupervisorAction};
use crate::synth::SpeechSynthesizer;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type EventSender = mpsc::UnboundedSender<ControllerEvent>;

/// Everything the controller reacts to.
#[derive(Debug)]
pub enum ControllerEvent {
    Signal(Signal),
    Capture { run_id: u64, event: CaptureEvent },
    SilenceElapsed { generation: u64 },
    RestartDue { ticket: u64 },
    ReplyDelta { turn_id: u64, text: String },
    ReplyFinished { turn_id: u64, result: VoiceResult<String> },
    SynthesisFinished { turn_id: u64, result: VoiceResult<AudioClip> },
    PlaybackFinished { playback_id: u64, outcome: PlaybackOutcome },
}

/// User intent and external control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Start listening (tap-to-talk); interrupts a reply being spoken.
    BeginTurn,
    /// One button: "send now" while listening, otherwise `BeginTurn`.
    Toggle,
    /// A typed message, sent as the user's turn.
    SubmitText(String),
    /// Drop the current turn without sending anything.
    CancelTurn,
    /// "Send now": commit whatever has been heard.
    ForceCommit,
    /// Ask for an opening line with no new user turn.
    Greet,
    SetEnabled(bool),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Listening,
    Committing,
    AwaitingReply,
    Speaking,
}

impl TurnState {
    pub fn is_listening(&self) -> bool {
        matches!(self, TurnState::Listening)
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self, TurnState::Speaking)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::Committing => "committing",
            TurnState::AwaitingReply => "awaiting-reply",
            TurnState::Speaking => "speaking",
        };
        f.write_str(s)
    }
}

/// What the surrounding application can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceUpdate {
    State(TurnState),
    /// The utterance buffer as it stands: finalized text and the open hypothesis.
    Transcript { committed: String, interim: String },
    /// Text handed to the response pipeline for this turn.
    TurnCommitted(String),
    ReplyDelta(String),
    /// The complete reply about to be spoken.
    Reply(String),
    /// Something the user should know about.
    Error(String),
    History(Vec<ChatTurn>),
}

/// The external collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub recognizer: Arc<dyn Recognizer>,
    pub pipeline: Arc<dyn ResponsePipeline>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub output: Arc<dyn AudioOutput>,
}

/// Cloneable signal surface for the application.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: EventSender,
}

impl ControllerHandle {
    fn signal(&self, signal: Signal) -> VoiceResult<()> {
        self.tx
            .send(ControllerEvent::Signal(signal))
            .map_err(|_| VoiceError::ChannelSend("turn controller has stopped".to_string()))
    }

    pub fn begin_turn(&self) -> VoiceResult<()> {
        self.signal(Signal::BeginTurn)
    }

    /// Resolved against the controller's own state, not the last one rendered.
    pub fn toggle(&self) -> VoiceResult<()> {
        self.signal(Signal::Toggle)
    }

    pub fn submit_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.signal(Signal::SubmitText(text.into()))
    }

    pub fn cancel_turn(&self) -> VoiceResult<()> {
        self.signal(Signal::CancelTurn)
    }

    pub fn force_commit(&self) -> VoiceResult<()> {
        self.signal(Signal::ForceCommit)
    }

    pub fn greet(&self) -> VoiceResult<()> {
        self.signal(Signal::Greet)
    }

    pub fn set_enabled(&self, enabled: bool) -> VoiceResult<()> {
        self.signal(Signal::SetEnabled(enabled))
    }

    pub fn shutdown(&self) -> VoiceResult<()> {
        self.signal(Signal::Shutdown)
    }
}

pub struct TurnController {
    config: ControllerConfig,
    state: TurnState,
    enabled: bool,
    supervisor: SessionSupervisor,
    endpointer: Endpointer,
    playback: PlaybackGate,
    pipeline: Arc<dyn ResponsePipeline>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    history: Vec<ChatTurn>,
    /// Bumped for every reply request and every cancel.
    turn_id: u64,
    /// The pending reply request is an opening line, not an answer.
    greeting: bool,
    reply_task: Option<JoinHandle<()>>,
    synth_task: Option<JoinHandle<()>>,
    tx: EventSender,
    rx: mpsc::UnboundedReceiver<ControllerEvent>,
    updates: mpsc::UnboundedSender<VoiceUpdate>,
}

impl TurnController {
    pub fn new(
        config: ControllerConfig,
        collaborators: Collaborators,
    ) -> (Self, ControllerHandle, mpsc::UnboundedReceiver<VoiceUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();

        let options = RecognizerOptions {
            locale: config.locale.clone(),
            mode: config.capture_mode(),
            interim_results: true,
        };
        let session = CaptureSession::new(collaborators.recognizer, options, tx.clone());
        let supervisor = SessionSupervisor::new(session, config.restart_backoff(), tx.clone());
        let endpointer = Endpointer::new(config.silence_timeout(), tx.clone());
        let playback = PlaybackGate::new(collaborators.output, tx.clone());

        let controller = Self {
            config,
            state: TurnState::Idle,
            enabled: true,
            supervisor,
            endpointer,
            playback,
            pipeline: collaborators.pipeline,
            synthesizer: collaborators.synthesizer,
            history: Vec::new(),
            turn_id: 0,
            greeting: false,
            reply_task: None,
            synth_task: None,
            tx: tx.clone(),
            rx,
            updates,
        };
        (controller, ControllerHandle { tx }, updates_rx)
    }

    /// Resume an existing conversation.
    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    /// Process events until `Shutdown`; returns the conversation as it stands.
    pub async fn run(mut self) -> Vec<ChatTurn> {
        info!(
            silence_ms = self.config.silence_timeout_ms,
            auto_resume = self.config.auto_resume,
            "turn controller running"
        );
        while let Some(event) = self.rx.recv().await {
            if !self.dispatch(event) {
                break;
            }
        }
        self.cancel_all();
        info!(turns = self.history.len(), "turn controller stopped");
        std::mem::take(&mut self.history)
    }

    /// Handle one event. Returns false when the controller should stop.
    fn dispatch(&mut self, event: ControllerEvent) -> bool {
        match event {
            ControllerEvent::Signal(Signal::Shutdown) => return false,
            ControllerEvent::Signal(signal) => self.on_signal(signal),
            ControllerEvent::Capture { run_id, event } => self.on_capture(run_id, event),
            ControllerEvent::SilenceElapsed { generation } => self.on_silence(generation),
            ControllerEvent::RestartDue { ticket } => {
                let action = self.supervisor.on_restart_due(ticket);
                self.on_supervisor(action);
            }
            ControllerEvent::ReplyDelta { turn_id, text } => {
                if turn_id == self.turn_id && self.state == TurnState::AwaitingReply {
                    self.emit(VoiceUpdate::ReplyDelta(text));
                }
            }
            ControllerEvent::ReplyFinished { turn_id, result } => self.on_reply(turn_id, result),
            ControllerEvent::SynthesisFinished { turn_id, result } => {
                self.on_synthesis(turn_id, result)
            }
            ControllerEvent::PlaybackFinished {
                playback_id,
                outcome,
            } => self.on_playback(playback_id, outcome),
        }
        true
    }

    fn on_signal(&mut self, signal: Signal) {
        debug!(?signal, state = %self.state, "signal");
        match signal {
            Signal::BeginTurn => {
                if !self.enabled {
                    debug!("begin_turn ignored while disabled");
                    return;
                }
                match self.state {
                    TurnState::Idle | TurnState::Speaking => self.start_listening(),
                    TurnState::Listening => {}
                    TurnState::Committing | TurnState::AwaitingReply => {
                        debug!(state = %self.state, "begin_turn ignored while a reply is pending");
                    }
                }
            }
            Signal::Toggle => {
                let next = if self.state == TurnState::Listening {
                    Signal::ForceCommit
                } else {
                    Signal::BeginTurn
                };
                self.on_signal(next);
            }
            Signal::SubmitText(text) => self.submit_text(text),
            Signal::CancelTurn => {
                self.cancel_all();
                self.set_state(TurnState::Idle);
            }
            Signal::ForceCommit => {
                if self.state != TurnState::Listening {
                    return;
                }
                self.endpointer.cancel();
                let buffer = self.supervisor.stop();
                self.commit_or_idle(buffer);
            }
            Signal::Greet => {
                if !self.enabled || self.state != TurnState::Idle {
                    debug!(state = %self.state, enabled = self.enabled, "greet ignored");
                    return;
                }
                self.request_reply(true);
            }
            Signal::SetEnabled(enabled) => {
                self.enabled = enabled;
                info!(enabled, "controller enabled changed");
                if !enabled && self.state == TurnState::Listening {
                    self.endpointer.cancel();
                    self.supervisor.stop();
                    self.set_state(TurnState::Idle);
                }
            }
            Signal::Shutdown => {}
        }
    }

    fn on_capture(&mut self, run_id: u64, event: CaptureEvent) {
        let Some(update) = self.supervisor.apply(run_id, event) else {
            return;
        };
        match update {
            CaptureUpdate::Transcript { buffer, activity } => {
                self.emit_transcript(&buffer);
                if activity {
                    self.endpointer.on_activity();
                }
            }
            CaptureUpdate::Activity => self.endpointer.on_activity(),
            CaptureUpdate::Ended { run, buffer } => {
                let reason = run.termination.unwrap_or(EndReason::UpstreamEnded);
                debug!(run_id = run.run_id, %reason, "capture run terminated");
                let action = self.supervisor.on_run_ended(reason, buffer);
                self.on_supervisor(action);
            }
        }
    }

    fn on_supervisor(&mut self, action: SupervisorAction) {
        match action {
            SupervisorAction::Restarted { buffer, .. } => {
                // Interim text did not survive the restart; show what did.
                self.emit_transcript(&buffer);
            }
            SupervisorAction::RestartScheduled { after } => {
                debug!(after_ms = after.as_millis() as u64, "capture restart scheduled");
                let buffer = self.supervisor.current_buffer();
                self.emit_transcript(&buffer);
            }
            SupervisorAction::Finalize { buffer } => {
                if self.state == TurnState::Listening {
                    self.endpointer.cancel();
                    self.commit_or_idle(buffer);
                }
            }
            SupervisorAction::Fatal { error } => self.fail_hard(error),
            SupervisorAction::StartFailed { error, buffer } => {
                self.endpointer.cancel();
                if buffer.is_empty() {
                    self.emit(VoiceUpdate::Error(error.user_message()));
                    self.set_state(TurnState::Idle);
                } else {
                    warn!(error = %error, "capture could not restart; sending what was heard");
                    self.commit(buffer.text());
                }
            }
            SupervisorAction::Ignored => {}
        }
    }

    fn on_silence(&mut self, generation: u64) {
        if !self.endpointer.take_elapsed(generation) || self.state != TurnState::Listening {
            return;
        }
        if self.supervisor.current_buffer().is_empty() {
            debug!("silence with nothing heard; still listening");
            return;
        }
        let buffer = self.supervisor.stop();
        info!(
            silence_ms = self.endpointer.silence().as_millis() as u64,
            "end of utterance"
        );
        self.commit_or_idle(buffer);
    }

    fn on_reply(&mut self, turn_id: u64, result: VoiceResult<String>) {
        if turn_id != self.turn_id || self.state != TurnState::AwaitingReply {
            debug!(turn_id, "dropping stale reply");
            return;
        }
        self.reply_task = None;
        match result {
            Err(error) if self.greeting && !self.config.greeting_fallback.trim().is_empty() => {
                warn!(turn_id, error = %error, "greeting failed; using the stock welcome");
                let welcome = self.config.greeting_fallback.trim().to_string();
                self.history.push(ChatTurn::assistant(welcome.clone()));
                self.emit(VoiceUpdate::Reply(welcome));
                self.emit(VoiceUpdate::History(self.history.clone()));
                self.after_speaking();
            }
            Err(error) => {
                warn!(turn_id, error = %error, "reply failed");
                self.emit(VoiceUpdate::Error(error.user_message()));
                self.set_state(TurnState::Idle);
            }
            Ok(reply) if reply.trim().is_empty() => {
                warn!(turn_id, "empty reply; nothing to speak");
                self.after_speaking();
            }
            Ok(reply) => {
                let reply = reply.trim().to_string();
                self.history.push(ChatTurn::assistant(reply.clone()));
                self.emit(VoiceUpdate::Reply(reply.clone()));
                self.emit(VoiceUpdate::History(self.history.clone()));

                let synthesizer = self.synthesizer.clone();
                let voice = self.config.voice.clone();
                let tx = self.tx.clone();
                self.synth_task = Some(tokio::spawn(async move {
                    let result = synthesizer.synthesize(&reply, &voice).await;
                    let _ = tx.send(ControllerEvent::SynthesisFinished { turn_id, result });
                }));
            }
        }
    }

    fn on_synthesis(&mut self, turn_id: u64, result: VoiceResult<AudioClip>) {
        if turn_id != self.turn_id || self.state != TurnState::AwaitingReply {
            debug!(turn_id, "dropping stale synthesis");
            return;
        }
        self.synth_task = None;
        match result {
            Err(error) => {
                warn!(turn_id, error = %error, "synthesis failed");
                self.emit(VoiceUpdate::Error(error.user_message()));
                self.set_state(TurnState::Idle);
            }
            Ok(clip) => self.start_speaking(clip),
        }
    }

    fn on_playback(&mut self, playback_id: u64, outcome: PlaybackOutcome) {
        let Some(outcome) = self.playback.finish(playback_id, outcome) else {
            return;
        };
        if let PlaybackOutcome::Failed(ref reason) = outcome {
            warn!(playback_id, %reason, "playback failed; continuing the conversation");
        }
        if self.state == TurnState::Speaking {
            self.after_speaking();
        }
    }

    fn start_listening(&mut self) {
        self.playback.stop();
        self.endpointer.cancel();
        match self.supervisor.begin() {
            Ok(run_id) => {
                debug!(run_id, "listening");
                self.set_state(TurnState::Listening);
                self.emit_transcript(&UtteranceBuffer::new());
            }
            Err(error) => {
                warn!(error = %error, "could not start listening");
                self.emit(VoiceUpdate::Error(error.user_message()));
                self.set_state(TurnState::Idle);
            }
        }
    }

    fn start_speaking(&mut self, clip: AudioClip) {
        // The microphone must be released before the speaker is taken.
        self.endpointer.cancel();
        self.supervisor.stop();
        match self.playback.play(clip) {
            Ok(_) => self.set_state(TurnState::Speaking),
            Err(error) => {
                warn!(error = %error, "playback could not start");
                self.after_speaking();
            }
        }
    }

    fn after_speaking(&mut self) {
        if self.config.auto_resume && self.enabled {
            self.start_listening();
        } else {
            self.set_state(TurnState::Idle);
        }
    }

    fn commit_or_idle(&mut self, buffer: UtteranceBuffer) {
        if buffer.is_empty() {
            self.set_state(TurnState::Idle);
        } else {
            self.commit(buffer.text());
        }
    }

    fn commit(&mut self, text: String) {
        self.set_state(TurnState::Committing);
        info!(chars = text.len(), "📝 turn committed");
        self.emit(VoiceUpdate::TurnCommitted(text.clone()));
        self.history.push(ChatTurn::user(text));
        self.emit(VoiceUpdate::History(self.history.clone()));
        self.request_reply(false);
    }

    /// Typed text is a turn of its own. Anything already heard goes first.
    fn submit_text(&mut self, text: String) {
        let typed = text.trim();
        if typed.is_empty() || !self.enabled {
            debug!(enabled = self.enabled, "typed text ignored");
            return;
        }
        match self.state {
            TurnState::Idle => self.commit(typed.to_string()),
            TurnState::Speaking => {
                self.playback.stop();
                self.commit(typed.to_string());
            }
            TurnState::Listening => {
                self.endpointer.cancel();
                let heard = self.supervisor.stop();
                let text = if heard.is_empty() {
                    typed.to_string()
                } else {
                    format!("{} {typed}", heard.text())
                };
                self.commit(text);
            }
            TurnState::Committing | TurnState::AwaitingReply => {
                debug!(state = %self.state, "typed text ignored while a reply is pending");
            }
        }
    }

    fn request_reply(&mut self, greeting: bool) {
        self.turn_id += 1;
        self.greeting = greeting;
        let turn_id = self.turn_id;
        self.set_state(TurnState::AwaitingReply);

        let pipeline = self.pipeline.clone();
        let history = self.history.clone();
        let tx = self.tx.clone();
        let sink = ReplySink::new(turn_id, tx.clone());
        self.reply_task = Some(tokio::spawn(async move {
            let result = pipeline.respond(&history, sink).await;
            let _ = tx.send(ControllerEvent::ReplyFinished { turn_id, result });
        }));
    }

    fn fail_hard(&mut self, error: VoiceError) {
        warn!(error = %error, "fatal capture error");
        self.cancel_all();
        self.emit(VoiceUpdate::Error(error.user_message()));
        self.set_state(TurnState::Idle);
    }

    /// Abort everything in flight. Safe to call from any state, any number of times.
    fn cancel_all(&mut self) {
        self.endpointer.cancel();
        self.supervisor.stop();
        if let Some(task) = self.reply_task.take() {
            task.abort();
        }
        if let Some(task) = self.synth_task.take() {
            task.abort();
        }
        self.playback.stop();
        self.turn_id += 1;
    }

    fn set_state(&mut self, next: TurnState) {
        if self.state == next {
            return;
        }
        info!(from = %self.state, to = %next, "turn state");
        self.state = next;
        self.emit(VoiceUpdate::State(next));
    }

    fn emit_transcript(&self, buffer: &UtteranceBuffer) {
        self.emit(VoiceUpdate::Transcript {
            committed: buffer.committed().to_string(),
            interim: buffer.pending().to_string(),
        });
    }

    fn emit(&self, update: VoiceUpdate) {
        let _ = self.updates.send(update);
    }
}
