//! Microphone capture (cpal) and speaker output (rodio).
//!
//! Both device handles are `!Send` on some platforms, so each lives on the
//! thread that created it.

use crate::error::{VoiceError, VoiceResult};
use crate::playback::{AudioClip, AudioOutput, PlaybackCompletion, PlaybackHandle, PlaybackOutcome};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default input device, delivering fixed-size mono frames.
pub struct MicCapture {
    device: Device,
    stream_config: StreamConfig,
    frame_len: usize,
}

impl MicCapture {
    pub fn new(sample_rate: u32, frame_len: usize) -> VoiceResult<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::MicrophoneUnavailable("no input device".to_string()))?;
        // Probing the default config surfaces permission/device errors early.
        let default_config = device.default_input_config()?;
        debug!(?default_config, "input device default config");
        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate,
            "🎤 microphone selected"
        );

        Ok(Self {
            device,
            stream_config: StreamConfig {
                channels: 1,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            },
            frame_len,
        })
    }

    /// Start the stream. Frames of exactly `frame_len` samples go to `frames`;
    /// a stream error raises `failed`. Dropping the returned stream releases
    /// the microphone.
    pub fn open(
        self,
        frames: mpsc::UnboundedSender<Vec<f32>>,
        failed: Arc<AtomicBool>,
    ) -> VoiceResult<Stream> {
        let frame_len = self.frame_len;
        let mut pending = Vec::with_capacity(frame_len);

        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push(sample);
                    if pending.len() == frame_len {
                        let frame = std::mem::replace(&mut pending, Vec::with_capacity(frame_len));
                        if frames.send(frame).is_err() {
                            return;
                        }
                    }
                }
            },
            move |err| {
                warn!(error = %err, "input stream error");
                failed.store(true, Ordering::SeqCst);
            },
            None,
        )?;
        stream.play()?;
        Ok(stream)
    }

    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

/// Plays each clip on its own thread through the default output device.
#[derive(Debug, Default)]
pub struct RodioOutput;

impl RodioOutput {
    pub fn new() -> Self {
        Self
    }
}

struct RodioPlayback {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PlaybackHandle for RodioPlayback {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            t.thread().unpark();
            // Wait until the sink is really silent.
            let _ = t.join();
        }
    }
}

impl Drop for RodioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn play_clip(clip: AudioClip, stop: &AtomicBool) -> Result<bool, String> {
    let (_stream, handle) = rodio::OutputStream::try_default().map_err(|e| e.to_string())?;
    let sink = rodio::Sink::try_new(&handle).map_err(|e| e.to_string())?;
    let source = rodio::Decoder::new(Cursor::new(clip.bytes))
        .map_err(|e| format!("decode failed: {e}"))?;
    sink.append(source);

    while !sink.empty() {
        if stop.load(Ordering::SeqCst) {
            sink.stop();
            return Ok(false);
        }
        thread::park_timeout(Duration::from_millis(20));
    }
    Ok(true)
}

impl AudioOutput for RodioOutput {
    fn start(
        &self,
        clip: AudioClip,
        completion: PlaybackCompletion,
    ) -> VoiceResult<Box<dyn PlaybackHandle>> {
        if clip.is_empty() {
            return Err(VoiceError::Playback("empty audio clip".to_string()));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name("hearth-playback".to_string())
            .spawn(move || match play_clip(clip, &thread_stop) {
                Ok(true) => completion.complete(PlaybackOutcome::Completed),
                // Stopped on request: nobody is waiting for this clip.
                Ok(false) => {}
                Err(reason) => {
                    if !thread_stop.load(Ordering::SeqCst) {
                        completion.complete(PlaybackOutcome::Failed(reason));
                    }
                }
            })?;
        Ok(Box::new(RodioPlayback {
            stop,
            thread: Some(thread),
        }))
    }
}
