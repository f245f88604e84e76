//! Smoke tests against real audio devices.
//!
//! Note: These tests require a microphone and a speaker and will not work in
//! CI environments. Run them with `--ignored`.

use async_trait::async_trait;
use hearth_voice::{
    AudioClip, ChatTurn, Collaborators, ControllerConfig, RecognizerConfig, ReplySink,
    ResponsePipeline, RodioOutput, SpeechSynthesizer, SttBackend, TurnController, TurnState,
    VadRecognizer, VoiceResult, VoiceUpdate,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

struct EchoStt;

impl SttBackend for EchoStt {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String> {
        Ok(format!(
            "{} ms of speech",
            samples.len() as u64 * 1000 / sample_rate as u64
        ))
    }
}

struct SilentPipeline;

#[async_trait]
impl ResponsePipeline for SilentPipeline {
    async fn respond(&self, _history: &[ChatTurn], _deltas: ReplySink) -> VoiceResult<String> {
        Ok(String::new())
    }
}

struct NoSynth;

#[async_trait]
impl SpeechSynthesizer for NoSynth {
    async fn synthesize(&self, _text: &str, _voice: &str) -> VoiceResult<AudioClip> {
        Ok(AudioClip::mpeg(Vec::new()))
    }
}

#[tokio::test]
#[ignore] // Ignore by default since it requires audio hardware
async fn test_listen_then_cancel_releases_microphone() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (controller, handle, mut updates) = TurnController::new(
        ControllerConfig::default(),
        Collaborators {
            recognizer: Arc::new(VadRecognizer::new(
                RecognizerConfig::default(),
                Arc::new(EchoStt),
            )),
            pipeline: Arc::new(SilentPipeline),
            synthesizer: Arc::new(NoSynth),
            output: Arc::new(RodioOutput::new()),
        },
    );
    let task = tokio::spawn(controller.run());

    handle.begin_turn().expect("controller running");
    let first = timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("no update within 5s")
        .expect("controller stopped");
    assert_eq!(first, VoiceUpdate::State(TurnState::Listening));

    // Speak now if you want to see transcripts in the log.
    tokio::time::sleep(Duration::from_secs(3)).await;

    handle.cancel_turn().expect("controller running");
    handle.shutdown().expect("controller running");
    timeout(Duration::from_secs(5), task)
        .await
        .expect("controller did not stop")
        .expect("controller task panicked");
}
