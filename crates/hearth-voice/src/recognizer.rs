//! VAD-driven recognizer: microphone → WebRTC VAD → segmenter → STT.
//!
//! Behaves like a platform speech recognizer, quirks included: it gives up
//! with `no-speech` after a stretch of silence, and in single-phrase mode it
//! ends itself after every finalized segment. The session supervisor is what
//! turns that into continuous listening.

use crate::audio::MicCapture;
use crate::capture::{CaptureMode, CaptureSink, EndReason, Recognizer, RecognizerOptions, RecognizerRun};
use crate::config::RecognizerConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::segment::{SegmentStep, Segmenter, SegmenterConfig};
use crate::stt::SttBackend;
use crate::vad::{VadDetector, FRAME_MS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct VadRecognizer {
    config: RecognizerConfig,
    stt: Arc<dyn SttBackend>,
}

impl VadRecognizer {
    pub fn new(config: RecognizerConfig, stt: Arc<dyn SttBackend>) -> Self {
        Self { config, stt }
    }

    fn frame_len(&self) -> usize {
        (self.config.sample_rate as u64 * FRAME_MS / 1000) as usize
    }
}

impl Recognizer for VadRecognizer {
    fn start(
        &self,
        options: &RecognizerOptions,
        sink: CaptureSink,
    ) -> VoiceResult<Box<dyn RecognizerRun>> {
        let sample_rate = self.config.sample_rate;
        let frame_len = self.frame_len();
        let failed = Arc::new(AtomicBool::new(false));
        let control = Arc::new(RunControl::new(failed.clone()));
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<VoiceResult<()>>();

        let capture_control = control.clone();
        let capture = thread::Builder::new()
            .name("hearth-mic".to_string())
            .spawn(move || {
                let stream = match MicCapture::new(sample_rate, frame_len)
                    .and_then(|mic| mic.open(frames_tx, failed))
                {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while !capture_control.should_release() {
                    thread::park_timeout(Duration::from_millis(50));
                }
                drop(stream);
                debug!("microphone released");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = capture.join();
                return Err(e);
            }
            Err(_) => {
                let _ = capture.join();
                return Err(VoiceError::Capture("microphone thread exited".to_string()));
            }
        }
        control.set_capture(capture);

        let processor = FrameProcessor::new(&self.config, options, self.stt.clone(), sink);
        let vad_mode = self.config.vad_mode;
        let process_control = control.clone();
        let spawned = thread::Builder::new()
            .name("hearth-vad".to_string())
            .spawn(move || process(frames_rx, processor, process_control, sample_rate, vad_mode));
        if let Err(e) = spawned {
            control.release();
            return Err(e.into());
        }

        info!(mode = ?options.mode, "VAD recognizer listening");
        Ok(Box::new(VadRun { control }))
    }
}

/// Shared between the run handle, the microphone thread and the VAD thread.
struct RunControl {
    stop: AtomicBool,
    failed: Arc<AtomicBool>,
    capture: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RunControl {
    fn new(failed: Arc<AtomicBool>) -> Self {
        Self {
            stop: AtomicBool::new(false),
            failed,
            capture: Mutex::new(None),
        }
    }

    fn set_capture(&self, handle: thread::JoinHandle<()>) {
        if let Ok(mut guard) = self.capture.lock() {
            *guard = Some(handle);
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn should_release(&self) -> bool {
        self.stopped() || self.failed.load(Ordering::SeqCst)
    }

    /// Stop the run and block until the microphone is closed. The lock is
    /// held across the join so a concurrent caller also waits for it.
    fn release(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.capture.lock() {
            if let Some(handle) = guard.take() {
                handle.thread().unpark();
                let _ = handle.join();
            }
        }
    }
}

struct VadRun {
    control: Arc<RunControl>,
}

impl RecognizerRun for VadRun {
    fn abort(&mut self) {
        self.control.release();
    }
}

impl Drop for VadRun {
    fn drop(&mut self) {
        self.control.release();
    }
}

fn process(
    mut frames: mpsc::UnboundedReceiver<Vec<f32>>,
    mut processor: FrameProcessor,
    control: Arc<RunControl>,
    sample_rate: u32,
    vad_mode: u8,
) {
    let mut vad = match VadDetector::new(sample_rate, vad_mode) {
        Ok(vad) => vad,
        Err(e) => {
            control.release();
            processor.sink.ended(EndReason::Other(e.to_string()));
            return;
        }
    };

    while let Some(frame) = frames.blocking_recv() {
        if control.stopped() {
            return;
        }
        let is_speech = match vad.is_speech(&frame) {
            Ok(speech) => speech,
            Err(e) => {
                debug!(error = %e, "skipping frame");
                continue;
            }
        };
        if let Some(reason) = processor.frame(is_speech, &frame) {
            // Release the microphone before anyone hears that the run is over.
            control.release();
            processor.sink.ended(reason);
            return;
        }
    }

    if control.stopped() {
        return;
    }
    warn!("input stream closed unexpectedly");
    processor.flush();
    control.release();
    processor
        .sink
        .ended(EndReason::Other("audio stream closed".to_string()));
}

/// Per-run frame logic, free of any device so it can be driven directly.
struct FrameProcessor {
    segmenter: Segmenter,
    stt: Arc<dyn SttBackend>,
    sink: CaptureSink,
    sample_rate: u32,
    single_phrase: bool,
    interim: bool,
    heard_speech: bool,
    silent_ms: u64,
    no_speech_ms: u64,
    first_interim_ms: u64,
    interim_every_ms: u64,
    next_interim_ms: u64,
    /// Frame clock for this run.
    clock_ms: u64,
    activity_every_ms: u64,
    last_activity_ms: Option<u64>,
}

impl FrameProcessor {
    fn new(
        config: &RecognizerConfig,
        options: &RecognizerOptions,
        stt: Arc<dyn SttBackend>,
        sink: CaptureSink,
    ) -> Self {
        Self {
            segmenter: Segmenter::new(SegmenterConfig {
                frame_ms: FRAME_MS,
                gap_ms: config.segment_gap_ms,
                min_speech_ms: config.min_speech_ms,
                max_segment_ms: config.max_segment_ms,
            }),
            stt,
            sink,
            sample_rate: config.sample_rate,
            single_phrase: options.mode == CaptureMode::SinglePhrase,
            interim: options.interim_results,
            heard_speech: false,
            silent_ms: 0,
            no_speech_ms: config.no_speech_timeout_ms,
            first_interim_ms: config.min_speech_ms,
            interim_every_ms: config.interim_every_ms,
            next_interim_ms: config.min_speech_ms,
            clock_ms: 0,
            activity_every_ms: config.activity_every_ms,
            last_activity_ms: None,
        }
    }

    fn open_ms(&self) -> u64 {
        self.segmenter.open_samples().len() as u64 * 1000 / self.sample_rate.max(1) as u64
    }

    /// Feed one frame. `Some` means the run is over.
    fn frame(&mut self, is_speech: bool, frame: &[f32]) -> Option<EndReason> {
        self.clock_ms += FRAME_MS;
        if is_speech {
            self.silent_ms = 0;
        } else {
            self.silent_ms += FRAME_MS;
        }

        match self.segmenter.push(is_speech, frame) {
            SegmentStep::Silent => {}
            SegmentStep::SpeechStarted => {
                self.heard_speech = true;
                self.next_interim_ms = self.first_interim_ms;
                self.report_activity();
            }
            SegmentStep::Continuing => {
                if is_speech {
                    self.report_activity();
                }
                if self.interim && self.open_ms() >= self.next_interim_ms {
                    self.next_interim_ms = self.open_ms() + self.interim_every_ms;
                    self.transcribe_interim();
                }
            }
            SegmentStep::Committed(segment) => {
                match self.stt.transcribe(&segment.samples, self.sample_rate) {
                    Ok(text) if !text.is_empty() => {
                        self.sink.final_segment(format!(" {text}"));
                        if self.single_phrase {
                            return Some(EndReason::UpstreamEnded);
                        }
                    }
                    Ok(_) => self.sink.partial(""),
                    Err(e) => {
                        warn!(error = %e, "segment transcription failed");
                        return Some(EndReason::Other(e.to_string()));
                    }
                }
            }
            SegmentStep::Dropped => self.sink.partial(""),
        }

        if !self.segmenter.in_segment() && self.silent_ms >= self.no_speech_ms {
            return Some(if self.heard_speech {
                EndReason::UpstreamEnded
            } else {
                EndReason::NoSpeech
            });
        }
        None
    }

    /// Voiced audio keeps the turn open even when transcription has nothing
    /// to show for it yet.
    fn report_activity(&mut self) {
        let due = self
            .last_activity_ms
            .map_or(true, |last| self.clock_ms - last >= self.activity_every_ms);
        if due {
            self.last_activity_ms = Some(self.clock_ms);
            self.sink.activity();
        }
    }

    fn transcribe_interim(&self) {
        match self
            .stt
            .transcribe(self.segmenter.open_samples(), self.sample_rate)
        {
            Ok(text) if !text.is_empty() => self.sink.partial(format!(" {text}")),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "interim transcription failed"),
        }
    }

    /// Finalize speech still open when the stream dies.
    fn flush(&mut self) {
        if let Some(segment) = self.segmenter.flush() {
            if let Ok(text) = self.stt.transcribe(&segment.samples, self.sample_rate) {
                if !text.is_empty() {
                    self.sink.final_segment(format!(" {text}"));
                }
            }
        }
    }
}
