//! Capture session: one continuous speech-recognition run at a time.
//!
//! A [`Recognizer`] is the native primitive. It starts a run, reports interim
//! and final text through a [`CaptureSink`], and ends the run whenever it likes
//! (silence, a platform hiccup, a permission prompt). [`CaptureSession`] owns
//! the live run and the utterance buffer that run is filling.

use crate::controller::{ControllerEvent, EventSender};
use crate::error::VoiceResult;
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How the recognizer segments speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Keep one run open across many phrases.
    Continuous,
    /// End the run after each phrase; the supervisor restarts it.
    SinglePhrase,
}

impl CaptureMode {
    /// Mobile recognizers are more reliable one phrase at a time.
    pub fn for_platform() -> Self {
        if cfg!(any(target_os = "android", target_os = "ios")) {
            CaptureMode::SinglePhrase
        } else {
            CaptureMode::Continuous
        }
    }
}

/// Options every run is started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizerOptions {
    pub locale: String,
    pub mode: CaptureMode,
    pub interim_results: bool,
}

/// Why a capture run terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The platform heard only silence and gave up.
    NoSpeech,
    /// Microphone access was refused.
    PermissionDenied,
    /// We asked for it (user stop, commit, cancel).
    Aborted,
    /// The platform ended the run without saying why.
    UpstreamEnded,
    /// Anything else the recognizer reported.
    Other(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::NoSpeech => write!(f, "no-speech"),
            EndReason::PermissionDenied => write!(f, "permission-denied"),
            EndReason::Aborted => write!(f, "aborted"),
            EndReason::UpstreamEnded => write!(f, "upstream-ended"),
            EndReason::Other(detail) => write!(f, "other: {detail}"),
        }
    }
}

/// Events a run reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Best current hypothesis for the open segment; may be superseded.
    Partial(String),
    /// One finalized segment; never retracted.
    Final(String),
    /// Speech is being heard but there is no new text for it yet.
    Activity,
    /// The run is over, requested or not.
    Ended(EndReason),
}

/// Where a recognizer delivers the events of one run.
///
/// Events are tagged with the run id so the controller can drop anything a
/// superseded run says after it was replaced.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    run_id: u64,
    tx: EventSender,
}

impl CaptureSink {
    pub(crate) fn new(run_id: u64, tx: EventSender) -> Self {
        Self { run_id, tx }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn partial(&self, text: impl Into<String>) {
        self.send(CaptureEvent::Partial(text.into()));
    }

    pub fn final_segment(&self, text: impl Into<String>) {
        self.send(CaptureEvent::Final(text.into()));
    }

    pub fn activity(&self) {
        self.send(CaptureEvent::Activity);
    }

    pub fn ended(&self, reason: EndReason) {
        self.send(CaptureEvent::Ended(reason));
    }

    fn send(&self, event: CaptureEvent) {
        // A closed channel means the controller is gone; nobody is listening.
        let _ = self.tx.send(ControllerEvent::Capture {
            run_id: self.run_id,
            event,
        });
    }
}

/// The native speech-recognition primitive.
pub trait Recognizer: Send + Sync {
    /// Acquire the microphone and start a run. Events for the run go to `sink`
    /// until it reports `Ended`. Errors here mean the run never started.
    fn start(
        &self,
        options: &RecognizerOptions,
        sink: CaptureSink,
    ) -> VoiceResult<Box<dyn RecognizerRun>>;
}

/// Control handle for one live run.
pub trait RecognizerRun: Send {
    /// Stop the run and release the microphone before returning. No `Ended`
    /// event is expected afterwards.
    fn abort(&mut self);
}

/// Accumulated transcript for the current turn.
///
/// `committed` only grows within a turn; `pending` is always replaceable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtteranceBuffer {
    committed: String,
    pending: String,
}

impl UtteranceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> &str {
        &self.committed
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Append one finalized segment; the open hypothesis it replaces is gone.
    pub fn push_final(&mut self, segment: &str) {
        self.committed.push_str(segment);
        self.pending.clear();
    }

    pub fn set_pending(&mut self, hypothesis: &str) {
        self.pending.clear();
        self.pending.push_str(hypothesis);
    }

    /// Whitespace alone doesn't count as something to send.
    pub fn is_empty(&self) -> bool {
        self.committed.trim().is_empty() && self.pending.trim().is_empty()
    }

    /// Copy holding only the finalized part, used to seed a restarted run.
    pub fn finalized(&self) -> UtteranceBuffer {
        UtteranceBuffer {
            committed: self.committed.clone(),
            pending: String::new(),
        }
    }

    /// Finalized text plus the open hypothesis, trimmed, as it would be sent.
    pub fn text(&self) -> String {
        format!("{}{}", self.committed, self.pending).trim().to_string()
    }
}

/// Bookkeeping for one capture run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRun {
    pub run_id: u64,
    pub started_at: Instant,
    pub termination: Option<EndReason>,
}

/// What applying a recognizer event did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureUpdate {
    /// The buffer changed. `activity` is true when the event carried text.
    Transcript {
        buffer: UtteranceBuffer,
        activity: bool,
    },
    /// Speech was heard; the buffer is unchanged.
    Activity,
    /// The run terminated; the session no longer has a live run.
    Ended {
        run: CaptureRun,
        buffer: UtteranceBuffer,
    },
}

struct LiveRun {
    run: CaptureRun,
    handle: Box<dyn RecognizerRun>,
    buffer: UtteranceBuffer,
}

/// Owns at most one live run and the buffer it fills.
pub struct CaptureSession {
    recognizer: std::sync::Arc<dyn Recognizer>,
    options: RecognizerOptions,
    events: EventSender,
    next_run_id: u64,
    live: Option<LiveRun>,
}

impl CaptureSession {
    pub fn new(
        recognizer: std::sync::Arc<dyn Recognizer>,
        options: RecognizerOptions,
        events: EventSender,
    ) -> Self {
        Self {
            recognizer,
            options,
            events,
            next_run_id: 0,
            live: None,
        }
    }

    pub fn options(&self) -> &RecognizerOptions {
        &self.options
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn live_run_id(&self) -> Option<u64> {
        self.live.as_ref().map(|l| l.run.run_id)
    }

    pub fn buffer(&self) -> Option<&UtteranceBuffer> {
        self.live.as_ref().map(|l| &l.buffer)
    }

    /// Start a new run whose buffer begins as `seed`. Any live run is aborted
    /// first so two runs never hold the microphone at once.
    pub fn start(&mut self, seed: UtteranceBuffer) -> VoiceResult<u64> {
        if let Some(previous) = self.stop(EndReason::Aborted) {
            warn!(
                run_id = previous.0.run_id,
                "capture run still live at start; aborted it first"
            );
        }

        self.next_run_id += 1;
        let run_id = self.next_run_id;
        let sink = CaptureSink::new(run_id, self.events.clone());
        let handle = self.recognizer.start(&self.options, sink)?;

        info!(run_id, mode = ?self.options.mode, locale = %self.options.locale, "🎤 capture run started");
        self.live = Some(LiveRun {
            run: CaptureRun {
                run_id,
                started_at: Instant::now(),
                termination: None,
            },
            handle,
            buffer: seed,
        });
        Ok(run_id)
    }

    /// Fold one recognizer event into the live run. Events from any run other
    /// than the live one are stale and return `None`.
    pub fn apply(&mut self, run_id: u64, event: CaptureEvent) -> Option<CaptureUpdate> {
        let live = match self.live.as_mut() {
            Some(live) if live.run.run_id == run_id => live,
            _ => {
                debug!(run_id, ?event, "dropping event from stale capture run");
                return None;
            }
        };

        match event {
            CaptureEvent::Partial(text) => {
                live.buffer.set_pending(&text);
                Some(CaptureUpdate::Transcript {
                    buffer: live.buffer.clone(),
                    activity: !text.trim().is_empty(),
                })
            }
            CaptureEvent::Final(text) => {
                live.buffer.push_final(&text);
                Some(CaptureUpdate::Transcript {
                    buffer: live.buffer.clone(),
                    activity: !text.trim().is_empty(),
                })
            }
            CaptureEvent::Activity => Some(CaptureUpdate::Activity),
            CaptureEvent::Ended(reason) => {
                let mut ended = self.live.take()?;
                debug!(run_id, %reason, "capture run ended");
                ended.run.termination = Some(reason);
                Some(CaptureUpdate::Ended {
                    run: ended.run,
                    buffer: ended.buffer,
                })
            }
        }
    }

    /// Abort the live run, if any, and hand back its record and buffer.
    pub fn stop(&mut self, reason: EndReason) -> Option<(CaptureRun, UtteranceBuffer)> {
        let mut live = self.live.take()?;
        live.handle.abort();
        info!(run_id = live.run.run_id, %reason, "capture run stopped");
        live.run.termination = Some(reason);
        Some((live.run, live.buffer))
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(mut live) = self.live.take() {
            live.handle.abort();
        }
    }
}
