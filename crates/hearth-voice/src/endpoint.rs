//! Endpointing: decide from measured silence that an utterance is done.
//!
//! A capture run ending is not evidence that the speaker is finished, so
//! silence is timed here, independently of run liveness. Every speech
//! activity re-arms the single deadline; the deadline posts
//! `SilenceElapsed` into the controller's queue when it expires.

use crate::controller::{ControllerEvent, EventSender};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

struct Armed {
    generation: u64,
    timer: JoinHandle<()>,
}

/// Owns the one silence deadline for the current turn.
pub struct Endpointer {
    silence: Duration,
    events: EventSender,
    generation: u64,
    armed: Option<Armed>,
}

impl Endpointer {
    pub fn new(silence: Duration, events: EventSender) -> Self {
        Self {
            silence,
            events,
            generation: 0,
            armed: None,
        }
    }

    pub fn silence(&self) -> Duration {
        self.silence
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Speech happened: cancel any armed deadline and arm a fresh one.
    pub fn on_activity(&mut self) {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let silence = self.silence;
        let events = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(silence).await;
            let _ = events.send(ControllerEvent::SilenceElapsed { generation });
        });
        self.armed = Some(Armed { generation, timer });
    }

    /// Clear the armed deadline, if any.
    pub fn cancel(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.timer.abort();
            debug!(generation = armed.generation, "silence deadline cancelled");
        }
    }

    /// Called when a `SilenceElapsed` message is dequeued. Returns true only for
    /// the currently armed deadline, which is consumed; anything older was
    /// superseded while the message sat in the queue.
    pub fn take_elapsed(&mut self, generation: u64) -> bool {
        if self.armed.as_ref().map(|a| a.generation) != Some(generation) {
            return false;
        }
        self.armed = None;
        true
    }
}

impl Drop for Endpointer {
    fn drop(&mut self) {
        self.cancel();
    }
}
