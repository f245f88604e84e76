//! # Hearth Voice - turn-taking voice controller
//!
//! Spoken, turn-based conversation with a remote language model: listen,
//! transcribe, send, speak the reply, listen again. The microphone and the
//! speaker are never live at the same time, and words spoken just before a
//! recognizer quietly gives up are never lost.
//!
//! ## Architecture
//!
//! ```text
//!  user signals ─┐
//!                ▼
//!  ┌─────────────────────────────── TurnController (one task, one queue) ─┐
//!  │  Idle → Listening → Committing → AwaitingReply → Speaking → ...      │
//!  │                                                                      │
//!  │  SessionSupervisor ── CaptureSession ── Recognizer (mic/VAD/STT)     │
//!  │  Endpointer (silence deadline)                                       │
//!  │  ResponsePipeline (chat completions)  SpeechSynthesizer (TTS)        │
//!  │  PlaybackGate ── AudioOutput (rodio)                                 │
//!  └──────────────────────────────────────────────────────────────────────┘
//!                │
//!                ▼ VoiceUpdate (state, transcript, reply, errors, history)
//! ```
//!
//! Every callback, timer and network completion is a message on the
//! controller's queue; stale messages are recognised by their id and dropped.

pub mod audio;
pub mod capture;
pub mod config;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod playback;
pub mod recognizer;
pub mod segment;
pub mod stt;
pub mod supervisor;
pub mod synth;
pub mod vad;

pub use audio::{MicCapture, RodioOutput};
pub use capture::{
    CaptureEvent, CaptureMode, CaptureSession, CaptureSink, EndReason, Recognizer,
    RecognizerOptions, RecognizerRun, UtteranceBuffer,
};
pub use config::{
    CaptureModeSetting, ControllerConfig, HearthConfig, PipelineConfig, RecognizerConfig,
    SynthesisConfig, SynthesisProvider,
};
pub use controller::{
    Collaborators, ControllerEvent, ControllerHandle, Signal, TurnController, TurnState,
    VoiceUpdate,
};
pub use endpoint::Endpointer;
pub use error::{VoiceError, VoiceResult};
pub use history::{ChatTurn, Conversation, Role};
pub use pipeline::{ChatCompletionsPipeline, ReplySink, ResponsePipeline, SseDecoder, SseEvent};
pub use playback::{
    AudioClip, AudioOutput, PlaybackCompletion, PlaybackGate, PlaybackHandle, PlaybackOutcome,
};
pub use recognizer::VadRecognizer;
pub use segment::{Segment, SegmentStep, Segmenter, SegmenterConfig};
pub use stt::{OpenAiCompatibleStt, SttBackend};
pub use supervisor::{SessionSupervisor, SupervisorAction};
pub use synth::{
    synthesizer_from_config, ElevenLabsSynthesizer, SpeechApiSynthesizer, SpeechSynthesizer,
    VoiceCatalog,
};
pub use vad::VadDetector;
