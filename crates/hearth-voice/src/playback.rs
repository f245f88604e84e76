//! Playback gate: the one audible reply.
//!
//! Starting a new clip stops the old one. Every clip gets a fresh id, and a
//! completion is honoured only when it carries the id of the clip the gate
//! is currently playing; a stopped clip's late "finished" is discarded.

use crate::controller::{ControllerEvent, EventSender};
use crate::error::VoiceResult;
use tracing::{debug, info};

/// Synthesized audio, encoded (usually `audio/mpeg`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            bytes,
            mime: mime.into(),
        }
    }

    pub fn mpeg(bytes: Vec<u8>) -> Self {
        Self::new(bytes, "audio/mpeg")
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// How a clip stopped playing on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Failed(String),
}

/// Handed to the audio output with each clip; consumed when the clip ends.
#[derive(Debug)]
pub struct PlaybackCompletion {
    playback_id: u64,
    events: EventSender,
}

impl PlaybackCompletion {
    pub(crate) fn new(playback_id: u64, events: EventSender) -> Self {
        Self {
            playback_id,
            events,
        }
    }

    pub fn playback_id(&self) -> u64 {
        self.playback_id
    }

    pub fn complete(self, outcome: PlaybackOutcome) {
        let _ = self.events.send(ControllerEvent::PlaybackFinished {
            playback_id: self.playback_id,
            outcome,
        });
    }
}

/// Something that can make a clip audible.
pub trait AudioOutput: Send + Sync {
    /// Begin playing. `completion` must be fired exactly once when the clip
    /// finishes or fails on its own; it may be dropped unfired after `stop`.
    fn start(
        &self,
        clip: AudioClip,
        completion: PlaybackCompletion,
    ) -> VoiceResult<Box<dyn PlaybackHandle>>;
}

pub trait PlaybackHandle: Send {
    /// Silence the clip immediately.
    fn stop(&mut self);
}

struct Active {
    playback_id: u64,
    handle: Box<dyn PlaybackHandle>,
}

pub struct PlaybackGate {
    output: std::sync::Arc<dyn AudioOutput>,
    events: EventSender,
    next_id: u64,
    active: Option<Active>,
}

impl PlaybackGate {
    pub fn new(output: std::sync::Arc<dyn AudioOutput>, events: EventSender) -> Self {
        Self {
            output,
            events,
            next_id: 0,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_id(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.playback_id)
    }

    /// Stop whatever is playing and start `clip`.
    pub fn play(&mut self, clip: AudioClip) -> VoiceResult<u64> {
        self.stop();
        self.next_id += 1;
        let playback_id = self.next_id;
        let bytes = clip.bytes.len();
        let handle = self
            .output
            .start(clip, PlaybackCompletion::new(playback_id, self.events.clone()))?;
        info!(playback_id, bytes, "🔊 playback started");
        self.active = Some(Active {
            playback_id,
            handle,
        });
        Ok(playback_id)
    }

    /// Silence the active clip. Its completion, if one still arrives, is stale.
    pub fn stop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.handle.stop();
            debug!(playback_id = active.playback_id, "playback stopped");
        }
    }

    /// A completion was dequeued. Returns the outcome only if it belongs to the
    /// active clip, which is then released.
    pub fn finish(&mut self, playback_id: u64, outcome: PlaybackOutcome) -> Option<PlaybackOutcome> {
        if self.active_id() != Some(playback_id) {
            debug!(playback_id, "dropping completion from stale playback");
            return None;
        }
        self.active = None;
        Some(outcome)
    }
}

impl Drop for PlaybackGate {
    fn drop(&mut self) {
        self.stop();
    }
}
