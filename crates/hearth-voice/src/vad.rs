//! WebRTC voice activity detection over fixed 30 ms frames.

use crate::error::{VoiceError, VoiceResult};
use tracing::info;
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Frame length the detector is fed, in milliseconds.
pub const FRAME_MS: u64 = 30;

/// Per-frame speech/silence decisions.
///
/// Not `Send`: build it on the thread that uses it.
pub struct VadDetector {
    vad: Vad,
    sample_rate: u32,
    frame_len: usize,
    scratch: Vec<i16>,
}

impl VadDetector {
    /// `mode` is the aggressiveness, 0 (permissive) to 3 (strict).
    pub fn new(sample_rate: u32, mode: u8) -> VoiceResult<Self> {
        let rate = match sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => {
                return Err(VoiceError::VadInit(format!(
                    "WebRTC VAD supports 8000, 16000, 32000 or 48000 Hz, got {other}"
                )))
            }
        };
        let vad_mode = match mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => {
                return Err(VoiceError::VadInit(format!("VAD mode must be 0-3, got {other}")))
            }
        };

        let mut vad = Vad::new();
        vad.set_mode(vad_mode);
        vad.set_sample_rate(rate);

        let frame_len = (sample_rate as u64 * FRAME_MS / 1000) as usize;
        info!(sample_rate, mode, frame_len, "🎙️ VAD ready");
        Ok(Self {
            vad,
            sample_rate,
            frame_len,
            scratch: Vec::with_capacity(frame_len),
        })
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Whether one frame of exactly `frame_len()` samples contains speech.
    pub fn is_speech(&mut self, frame: &[f32]) -> VoiceResult<bool> {
        if frame.len() != self.frame_len {
            return Err(VoiceError::VadProcessing(format!(
                "expected {} samples, got {}",
                self.frame_len,
                frame.len()
            )));
        }
        self.scratch.clear();
        self.scratch
            .extend(frame.iter().map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16));
        self.vad
            .is_voice_segment(&self.scratch)
            .map_err(|_| VoiceError::VadProcessing("invalid frame length".to_string()))
    }
}
