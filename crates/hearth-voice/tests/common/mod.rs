//! Scripted stand-ins for the microphone, the reply service, the speech
//! service and the speaker, plus a harness that runs a real controller
//! against them.

#![allow(dead_code)]

use async_trait::async_trait;
use hearth_voice::{
    AudioClip, AudioOutput, CaptureSink, ChatTurn, Collaborators, ControllerConfig,
    ControllerHandle, EndReason, PlaybackCompletion, PlaybackHandle, PlaybackOutcome, Recognizer,
    RecognizerOptions, RecognizerRun, ReplySink, ResponsePipeline, SpeechSynthesizer,
    TurnController, TurnState, VoiceError, VoiceResult, VoiceUpdate,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Counts who holds the microphone and the speaker, and every moment both
/// were held at once.
#[derive(Default)]
pub struct Devices {
    pub mic: AtomicUsize,
    pub speaker: AtomicUsize,
    pub violations: AtomicUsize,
}

impl Devices {
    pub fn mic_live(&self) -> usize {
        self.mic.load(Ordering::SeqCst)
    }

    pub fn speaker_live(&self) -> usize {
        self.speaker.load(Ordering::SeqCst)
    }

    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    fn acquire_mic(&self) {
        if self.speaker_live() > 0 || self.mic_live() > 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.mic.fetch_add(1, Ordering::SeqCst);
    }

    fn acquire_speaker(&self) {
        if self.mic_live() > 0 || self.speaker_live() > 0 {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.speaker.fetch_add(1, Ordering::SeqCst);
    }
}

/// Releases its counter exactly once, however many times it is asked.
struct Lease {
    released: AtomicBool,
    counter: fn(&Devices) -> &AtomicUsize,
    devices: Arc<Devices>,
}

fn mic_counter(devices: &Devices) -> &AtomicUsize {
    &devices.mic
}

fn speaker_counter(devices: &Devices) -> &AtomicUsize {
    &devices.speaker
}

impl Lease {
    fn new(devices: Arc<Devices>, counter: fn(&Devices) -> &AtomicUsize) -> Arc<Self> {
        Arc::new(Self {
            released: AtomicBool::new(false),
            counter,
            devices,
        })
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            (self.counter)(&self.devices).fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct ScriptedRecognizer {
    devices: Arc<Devices>,
    runs: Mutex<Vec<(CaptureSink, Arc<Lease>)>>,
    refuse: Mutex<Option<VoiceError>>,
}

struct ScriptedRun {
    lease: Arc<Lease>,
}

impl RecognizerRun for ScriptedRun {
    fn abort(&mut self) {
        self.lease.release();
    }
}

impl Recognizer for ScriptedRecognizer {
    fn start(
        &self,
        _options: &RecognizerOptions,
        sink: CaptureSink,
    ) -> VoiceResult<Box<dyn RecognizerRun>> {
        if let Some(error) = self.refuse.lock().unwrap().take() {
            return Err(error);
        }
        self.devices.acquire_mic();
        let lease = Lease::new(self.devices.clone(), mic_counter);
        self.runs.lock().unwrap().push((sink, lease.clone()));
        Ok(Box::new(ScriptedRun { lease }))
    }
}

impl ScriptedRecognizer {
    fn new(devices: Arc<Devices>) -> Self {
        Self {
            devices,
            runs: Mutex::new(Vec::new()),
            refuse: Mutex::new(None),
        }
    }

    pub fn starts(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn refuse_next(&self, error: VoiceError) {
        *self.refuse.lock().unwrap() = Some(error);
    }

    fn latest(&self) -> Option<(CaptureSink, Arc<Lease>)> {
        self.runs.lock().unwrap().last().cloned()
    }

    pub fn partial(&self, text: &str) {
        if let Some((sink, _)) = self.latest() {
            sink.partial(text);
        }
    }

    pub fn final_segment(&self, text: &str) {
        if let Some((sink, _)) = self.latest() {
            sink.final_segment(text);
        }
    }

    /// Voice heard with no text for it yet.
    pub fn activity(&self) {
        if let Some((sink, _)) = self.latest() {
            sink.activity();
        }
    }

    /// The latest run ends on its own, releasing the microphone first.
    pub fn end(&self, reason: EndReason) {
        if let Some((sink, lease)) = self.latest() {
            lease.release();
            sink.ended(reason);
        }
    }
}

pub struct ScriptedPipeline {
    replies: Mutex<VecDeque<Result<String, String>>>,
    pub calls: Mutex<Vec<Vec<ChatTurn>>>,
    delay: Mutex<Duration>,
}

impl ScriptedPipeline {
    fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn reply(&self, text: &str) {
        self.replies.lock().unwrap().push_back(Ok(text.to_string()));
    }

    pub fn fail(&self, detail: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(detail.to_string()));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_call(&self) -> Option<Vec<ChatTurn>> {
        self.calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ResponsePipeline for ScriptedPipeline {
    async fn respond(&self, history: &[ChatTurn], deltas: ReplySink) -> VoiceResult<String> {
        self.calls.lock().unwrap().push(history.to_vec());
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Tell me more.".to_string()));
        match next {
            Ok(text) => {
                deltas.delta(&text);
                Ok(text)
            }
            Err(detail) => Err(VoiceError::Pipeline(detail)),
        }
    }
}

#[derive(Default)]
pub struct ScriptedSynth {
    pub calls: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl ScriptedSynth {
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynth {
    async fn synthesize(&self, text: &str, _voice: &str) -> VoiceResult<AudioClip> {
        self.calls.lock().unwrap().push(text.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::Tts("scripted failure".to_string()));
        }
        Ok(AudioClip::mpeg(text.as_bytes().to_vec()))
    }
}

/// A speaker whose clips finish only when the test says so.
pub struct ManualOutput {
    devices: Arc<Devices>,
    clips: Mutex<Vec<(Option<PlaybackCompletion>, Arc<Lease>)>>,
}

struct ManualHandle {
    lease: Arc<Lease>,
}

impl PlaybackHandle for ManualHandle {
    fn stop(&mut self) {
        self.lease.release();
    }
}

impl AudioOutput for ManualOutput {
    fn start(
        &self,
        _clip: AudioClip,
        completion: PlaybackCompletion,
    ) -> VoiceResult<Box<dyn PlaybackHandle>> {
        self.devices.acquire_speaker();
        let lease = Lease::new(self.devices.clone(), speaker_counter);
        self.clips
            .lock()
            .unwrap()
            .push((Some(completion), lease.clone()));
        Ok(Box::new(ManualHandle { lease }))
    }
}

impl ManualOutput {
    fn new(devices: Arc<Devices>) -> Self {
        Self {
            devices,
            clips: Mutex::new(Vec::new()),
        }
    }

    pub fn started(&self) -> usize {
        self.clips.lock().unwrap().len()
    }

    /// The most recent clip finishes on its own (even if it was stopped).
    pub fn finish_latest(&self, outcome: PlaybackOutcome) {
        let taken = {
            let mut clips = self.clips.lock().unwrap();
            clips
                .last_mut()
                .and_then(|(completion, lease)| completion.take().map(|c| (c, lease.clone())))
        };
        if let Some((completion, lease)) = taken {
            lease.release();
            completion.complete(outcome);
        }
    }
}

pub struct Harness {
    pub handle: ControllerHandle,
    pub updates: mpsc::UnboundedReceiver<VoiceUpdate>,
    pub seen: Vec<VoiceUpdate>,
    pub devices: Arc<Devices>,
    pub recognizer: Arc<ScriptedRecognizer>,
    pub pipeline: Arc<ScriptedPipeline>,
    pub synth: Arc<ScriptedSynth>,
    pub output: Arc<ManualOutput>,
    pub task: JoinHandle<Vec<ChatTurn>>,
}

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        silence_timeout_ms: 1800,
        auto_resume: false,
        restart_backoff_ms: 300,
        ..ControllerConfig::default()
    }
}

impl Harness {
    pub fn start(config: ControllerConfig) -> Self {
        Self::start_with_history(config, Vec::new())
    }

    pub fn start_with_history(config: ControllerConfig, history: Vec<ChatTurn>) -> Self {
        init_tracing();
        let devices = Arc::new(Devices::default());
        let recognizer = Arc::new(ScriptedRecognizer::new(devices.clone()));
        let pipeline = Arc::new(ScriptedPipeline::new());
        let synth = Arc::new(ScriptedSynth::default());
        let output = Arc::new(ManualOutput::new(devices.clone()));

        let (controller, handle, updates) = TurnController::new(
            config,
            Collaborators {
                recognizer: recognizer.clone(),
                pipeline: pipeline.clone(),
                synthesizer: synth.clone(),
                output: output.clone(),
            },
        );
        let task = tokio::spawn(controller.with_history(history).run());

        Self {
            handle,
            updates,
            seen: Vec::new(),
            devices,
            recognizer,
            pipeline,
            synth,
            output,
            task,
        }
    }

    /// Let the controller and its spawned tasks drain without moving the clock.
    pub async fn settle(&mut self) {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
        while let Ok(update) = self.updates.try_recv() {
            self.seen.push(update);
        }
    }

    /// Wait (letting paused time auto-advance) for an update matching `pred`.
    pub async fn wait_for(&mut self, pred: impl Fn(&VoiceUpdate) -> bool) -> VoiceUpdate {
        loop {
            let next = tokio::time::timeout(Duration::from_secs(120), self.updates.recv())
                .await
                .expect("timed out waiting for update")
                .expect("controller stopped");
            self.seen.push(next.clone());
            if pred(&next) {
                return next;
            }
        }
    }

    pub async fn wait_for_state(&mut self, state: TurnState) {
        self.wait_for(|u| *u == VoiceUpdate::State(state)).await;
    }

    pub async fn wait_for_commit(&mut self) -> String {
        match self
            .wait_for(|u| matches!(u, VoiceUpdate::TurnCommitted(_)))
            .await
        {
            VoiceUpdate::TurnCommitted(text) => text,
            _ => unreachable!(),
        }
    }

    /// Latest state announced so far.
    pub fn state(&self) -> TurnState {
        self.seen
            .iter()
            .rev()
            .find_map(|u| match u {
                VoiceUpdate::State(s) => Some(*s),
                _ => None,
            })
            .unwrap_or(TurnState::Idle)
    }

    pub fn states(&self) -> Vec<TurnState> {
        self.seen
            .iter()
            .filter_map(|u| match u {
                VoiceUpdate::State(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn commits(&self) -> Vec<String> {
        self.seen
            .iter()
            .filter_map(|u| match u {
                VoiceUpdate::TurnCommitted(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.seen
            .iter()
            .filter_map(|u| match u {
                VoiceUpdate::Error(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn shutdown(self) -> Vec<ChatTurn> {
        self.handle.shutdown().expect("controller already stopped");
        self.task.await.expect("controller task panicked")
    }
}
