//! Configuration for the controller and its adapters.
//!
//! Precedence: environment (`HEARTH_<SECTION>__<KEY>`) > TOML file
//! (`HEARTH_CONFIG` path, default `config/hearth.toml`) > built-in defaults.
//! API keys never live here; adapters read them from the environment.

use crate::capture::CaptureMode;
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Everything the talk front end needs, one section per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HearthConfig {
    #[serde(default)]
    pub turn: ControllerConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
}

impl HearthConfig {
    /// Load from file and environment.
    pub fn load() -> VoiceResult<Self> {
        let path =
            std::env::var("HEARTH_CONFIG").unwrap_or_else(|_| "config/hearth.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load with an explicit file path; a missing file falls back to defaults.
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("HEARTH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: HearthConfig = built.try_deserialize()?;
        config.turn.validate()?;
        Ok(config)
    }
}

/// Whether the capture mode follows the platform or is pinned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureModeSetting {
    /// Single-phrase on mobile targets, continuous elsewhere.
    #[default]
    Auto,
    Continuous,
    SinglePhrase,
}

/// Turn controller knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Silence after the last speech activity before the utterance is committed.
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,

    #[serde(default)]
    pub capture_mode: CaptureModeSetting,

    /// Go straight back to listening once a reply has been spoken.
    #[serde(default = "default_auto_resume")]
    pub auto_resume: bool,

    #[serde(default = "default_locale")]
    pub locale: String,

    /// Delay before restarting a capture run the platform ended on its own.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// Voice selector passed to the synthesis service.
    #[serde(default = "default_voice")]
    pub voice: String,

    /// Shown as the opening line when the greeting request fails. Empty
    /// means a failed greeting is reported like any other reply error.
    #[serde(default = "default_greeting_fallback")]
    pub greeting_fallback: String,
}

fn default_silence_timeout_ms() -> u64 {
    1800
}

fn default_auto_resume() -> bool {
    true
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_restart_backoff_ms() -> u64 {
    300
}

fn default_voice() -> String {
    "dr-lauren".to_string()
}

fn default_greeting_fallback() -> String {
    "Hey! Welcome. I'm glad you're here. How's your day going so far?".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: default_silence_timeout_ms(),
            capture_mode: CaptureModeSetting::default(),
            auto_resume: default_auto_resume(),
            locale: default_locale(),
            restart_backoff_ms: default_restart_backoff_ms(),
            voice: default_voice(),
            greeting_fallback: default_greeting_fallback(),
        }
    }
}

impl ControllerConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    /// Resolve `auto` against the compile target.
    pub fn capture_mode(&self) -> CaptureMode {
        match self.capture_mode {
            CaptureModeSetting::Auto => CaptureMode::for_platform(),
            CaptureModeSetting::Continuous => CaptureMode::Continuous,
            CaptureModeSetting::SinglePhrase => CaptureMode::SinglePhrase,
        }
    }

    pub fn validate(&self) -> VoiceResult<()> {
        if self.silence_timeout_ms == 0 {
            return Err(VoiceError::Config(
                "turn.silence_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.locale.trim().is_empty() {
            return Err(VoiceError::Config("turn.locale must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Microphone, VAD segmentation and transcription settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerConfig {
    /// 8000, 16000, 32000 or 48000 (WebRTC VAD rates).
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// WebRTC VAD aggressiveness, 0-3.
    #[serde(default = "default_vad_mode")]
    pub vad_mode: u8,
    /// Silence that closes one speech segment (shorter than the turn silence timeout).
    #[serde(default = "default_segment_gap_ms")]
    pub segment_gap_ms: u64,
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,
    #[serde(default = "default_max_segment_ms")]
    pub max_segment_ms: u64,
    /// How long a run waits without speech before giving up.
    #[serde(default = "default_no_speech_timeout_ms")]
    pub no_speech_timeout_ms: u64,
    /// Interval between interim transcriptions while speech is ongoing.
    #[serde(default = "default_interim_every_ms")]
    pub interim_every_ms: u64,
    /// While speech is heard, the longest stretch without an activity report.
    #[serde(default = "default_activity_every_ms")]
    pub activity_every_ms: u64,
    #[serde(default = "default_stt_base_url")]
    pub stt_base_url: String,
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_vad_mode() -> u8 {
    2
}

fn default_segment_gap_ms() -> u64 {
    700
}

fn default_min_speech_ms() -> u64 {
    200
}

fn default_max_segment_ms() -> u64 {
    15_000
}

fn default_no_speech_timeout_ms() -> u64 {
    8000
}

fn default_interim_every_ms() -> u64 {
    1200
}

fn default_activity_every_ms() -> u64 {
    250
}

fn default_stt_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            vad_mode: default_vad_mode(),
            segment_gap_ms: default_segment_gap_ms(),
            min_speech_ms: default_min_speech_ms(),
            max_segment_ms: default_max_segment_ms(),
            no_speech_timeout_ms: default_no_speech_timeout_ms(),
            interim_every_ms: default_interim_every_ms(),
            activity_every_ms: default_activity_every_ms(),
            stt_base_url: default_stt_base_url(),
            stt_model: default_stt_model(),
        }
    }
}

/// Reply generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_base_url")]
    pub base_url: String,
    #[serde(default = "default_pipeline_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Sent in place of an empty history to get an opening line.
    #[serde(default = "default_greeting_prompt")]
    pub greeting_prompt: String,
    /// Appended when the history ends on an assistant turn, e.g. a greeting
    /// for a resumed conversation.
    #[serde(default = "default_resume_prompt")]
    pub resume_prompt: String,
    #[serde(default = "default_pipeline_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_pipeline_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_pipeline_model() -> String {
    "anthropic/claude-sonnet-4.5".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_system_prompt() -> String {
    "You are a warm, curious conversational partner talking with someone by voice. \
     Keep replies short and natural to listen to: a few sentences, no lists, no markdown. \
     Ask one open question at a time and follow where the person takes the conversation."
        .to_string()
}

fn default_greeting_prompt() -> String {
    "Hi, I just arrived. Please greet me warmly and start the conversation.".to_string()
}

fn default_resume_prompt() -> String {
    "I'm back. Please welcome me back and pick up where we left off.".to_string()
}

fn default_pipeline_timeout_secs() -> u64 {
    60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: default_pipeline_base_url(),
            model: default_pipeline_model(),
            max_tokens: default_max_tokens(),
            system_prompt: default_system_prompt(),
            greeting_prompt: default_greeting_prompt(),
            resume_prompt: default_resume_prompt(),
            timeout_secs: default_pipeline_timeout_secs(),
        }
    }
}

/// Which synthesis service speaks the replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisProvider {
    #[default]
    Elevenlabs,
    /// OpenAI-compatible `/audio/speech`.
    SpeechApi,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default)]
    pub provider: SynthesisProvider,
    /// Overrides the provider's default base URL.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Overrides the provider's default model.
    #[serde(default)]
    pub model: Option<String>,
}
