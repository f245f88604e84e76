//! Session supervisor: keeps listening alive across capture runs that end on
//! their own, without losing finalized text.
//!
//! The supervisor is the only owner of the capture session and of the
//! "a run is starting" state, so two termination events can never produce two
//! new runs.

use crate::capture::{
    CaptureEvent, CaptureSession, CaptureUpdate, EndReason, UtteranceBuffer,
};
use crate::controller::{ControllerEvent, EventSender};
use crate::error::VoiceError;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the controller should do after the supervisor reacted to a run ending.
#[derive(Debug)]
pub enum SupervisorAction {
    /// A new run is live, seeded with the finalized text of the last one.
    Restarted { run_id: u64, buffer: UtteranceBuffer },
    /// A restart will be attempted after the backoff.
    RestartScheduled { after: Duration },
    /// Listening is over; here is what was heard.
    Finalize { buffer: UtteranceBuffer },
    /// Hard stop: permission or hardware failure.
    Fatal { error: VoiceError },
    /// The replacement run refused to start; `buffer` is what survives.
    StartFailed {
        error: VoiceError,
        buffer: UtteranceBuffer,
    },
    /// Nothing to do (a restart is already under way, or the ticket is stale).
    Ignored,
}

struct PendingRestart {
    ticket: u64,
    timer: JoinHandle<()>,
}

pub struct SessionSupervisor {
    session: CaptureSession,
    events: EventSender,
    backoff: Duration,
    desired: bool,
    carried: UtteranceBuffer,
    next_ticket: u64,
    restart: Option<PendingRestart>,
}

impl SessionSupervisor {
    pub fn new(session: CaptureSession, backoff: Duration, events: EventSender) -> Self {
        Self {
            session,
            events,
            backoff,
            desired: false,
            carried: UtteranceBuffer::new(),
            next_ticket: 0,
            restart: None,
        }
    }

    pub fn is_listening_desired(&self) -> bool {
        self.desired
    }

    pub fn is_capture_live(&self) -> bool {
        self.session.is_live()
    }

    pub fn is_restart_pending(&self) -> bool {
        self.restart.is_some()
    }

    /// The buffer as the user currently sees it: the live run's, or the
    /// carried text while a restart is pending.
    pub fn current_buffer(&self) -> UtteranceBuffer {
        self.session
            .buffer()
            .cloned()
            .unwrap_or_else(|| self.carried.clone())
    }

    /// Start listening for a fresh turn.
    pub fn begin(&mut self) -> Result<u64, VoiceError> {
        self.cancel_restart();
        self.carried = UtteranceBuffer::new();
        self.desired = true;
        match self.session.start(UtteranceBuffer::new()) {
            Ok(run_id) => Ok(run_id),
            Err(e) => {
                self.desired = false;
                Err(e)
            }
        }
    }

    /// Stop listening: abort the live run and any pending restart, and return
    /// whatever buffer was being filled.
    pub fn stop(&mut self) -> UtteranceBuffer {
        self.desired = false;
        self.cancel_restart();
        let buffer = match self.session.stop(EndReason::Aborted) {
            Some((_, buffer)) => buffer,
            None => self.carried.clone(),
        };
        self.carried = UtteranceBuffer::new();
        buffer
    }

    /// Fold a recognizer event into the live run.
    pub fn apply(&mut self, run_id: u64, event: CaptureEvent) -> Option<CaptureUpdate> {
        self.session.apply(run_id, event)
    }

    /// React to a run having terminated.
    pub fn on_run_ended(&mut self, reason: EndReason, snapshot: UtteranceBuffer) -> SupervisorAction {
        if self.session.is_live() || self.restart.is_some() {
            debug!(%reason, "run ended while a replacement is already under way");
            return SupervisorAction::Ignored;
        }

        match reason {
            EndReason::PermissionDenied => {
                warn!("microphone permission denied; listening stopped");
                self.desired = false;
                SupervisorAction::Fatal {
                    error: VoiceError::PermissionDenied("recognizer reported not-allowed".into()),
                }
            }
            _ if !self.desired => SupervisorAction::Finalize { buffer: snapshot },
            EndReason::Aborted => {
                self.desired = false;
                SupervisorAction::Finalize { buffer: snapshot }
            }
            EndReason::NoSpeech => {
                debug!("no-speech from recognizer; restarting silently");
                self.restart_now(snapshot.finalized())
            }
            EndReason::UpstreamEnded | EndReason::Other(_) => {
                if let EndReason::Other(ref detail) = reason {
                    warn!(detail = %detail, "capture run failed; restarting after backoff");
                }
                self.carried = snapshot.finalized();
                self.schedule_restart()
            }
        }
    }

    /// A backoff timer fired.
    pub fn on_restart_due(&mut self, ticket: u64) -> SupervisorAction {
        if self.restart.as_ref().map(|p| p.ticket) != Some(ticket) {
            return SupervisorAction::Ignored;
        }
        self.restart = None;
        if !self.desired || self.session.is_live() {
            return SupervisorAction::Ignored;
        }
        let seed = self.carried.clone();
        self.restart_now(seed)
    }

    fn restart_now(&mut self, seed: UtteranceBuffer) -> SupervisorAction {
        self.carried = seed.clone();
        match self.session.start(seed.clone()) {
            Ok(run_id) => {
                info!(run_id, carried = seed.committed().len(), "capture restarted");
                SupervisorAction::Restarted {
                    run_id,
                    buffer: seed,
                }
            }
            Err(error) if error.is_fatal_for_capture() => {
                self.desired = false;
                SupervisorAction::Fatal { error }
            }
            Err(error) => {
                warn!(error = %error, "capture restart failed");
                self.desired = false;
                SupervisorAction::StartFailed {
                    error,
                    buffer: seed,
                }
            }
        }
    }

    fn schedule_restart(&mut self) -> SupervisorAction {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let after = self.backoff;
        let events = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(ControllerEvent::RestartDue { ticket });
        });
        self.restart = Some(PendingRestart { ticket, timer });
        SupervisorAction::RestartScheduled { after }
    }

    fn cancel_restart(&mut self) {
        if let Some(pending) = self.restart.take() {
            pending.timer.abort();
        }
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        self.cancel_restart();
    }
}
