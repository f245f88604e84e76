//! Error types for the hearth voice controller

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur anywhere between the microphone and the speaker
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Microphone unavailable: {0}")]
    MicrophoneUnavailable(String),

    #[error("Audio capture error: {0}")]
    Capture(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("VAD initialization failed: {0}")]
    VadInit(String),

    #[error("VAD processing error: {0}")]
    VadProcessing(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("Response pipeline error: {0}")]
    Pipeline(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Permission and hardware failures end the turn; anything else a capture
    /// start can throw is worth another attempt.
    pub fn is_fatal_for_capture(&self) -> bool {
        matches!(
            self,
            VoiceError::PermissionDenied(_) | VoiceError::MicrophoneUnavailable(_)
        )
    }

    /// Text shown to the person talking, as opposed to the log line.
    pub fn user_message(&self) -> String {
        match self {
            VoiceError::PermissionDenied(_) => {
                "Please allow microphone access to use voice input.".to_string()
            }
            VoiceError::MicrophoneUnavailable(_) => {
                "No microphone is available. Connect one and try again.".to_string()
            }
            VoiceError::Pipeline(_) | VoiceError::Http(_) => {
                "Couldn't get a reply. Please try again.".to_string()
            }
            VoiceError::Tts(_) => "Couldn't read the reply aloud. Please try again.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::MicrophoneUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::MicrophoneUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::MicrophoneUnavailable(err.to_string())
            }
            cpal::BuildStreamError::BackendSpecific { err: ref inner }
                if inner.description.to_ascii_lowercase().contains("permission") =>
            {
                VoiceError::PermissionDenied(inner.description.clone())
            }
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}
