//! Speech synthesis: reply text plus a voice selector in, playable audio out.

use crate::config::{SynthesisConfig, SynthesisProvider};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::AudioClip;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

const ELEVENLABS_BASE: &str = "https://api.elevenlabs.io";
const ELEVENLABS_MODEL: &str = "eleven_multilingual_v2";
const SPEECH_API_BASE: &str = "https://api.openai.com/v1";
const SPEECH_API_MODEL: &str = "tts-1";

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> VoiceResult<AudioClip>;
}

/// App voice selectors and what each provider calls them.
pub struct VoiceCatalog;

impl VoiceCatalog {
    pub const DEFAULT: &'static str = "dr-lauren";

    /// (selector, ElevenLabs voice id, `/audio/speech` voice)
    const VOICES: [(&'static str, &'static str, &'static str); 4] = [
        ("dr-lauren", "0G7xjh2pNSLRvJSpklE4", "shimmer"),
        ("maria", "5GR0JTHRVmv00OeaRI9u", "nova"),
        ("jerry-b", "zKb9yQZzbyTOE2hxatpu", "onyx"),
        ("matthew", "gscOrkdeRphuXV3NcHOp", "echo"),
    ];

    pub fn selectors() -> impl Iterator<Item = &'static str> {
        Self::VOICES.iter().map(|v| v.0)
    }

    pub fn is_known(selector: &str) -> bool {
        Self::VOICES.iter().any(|v| v.0 == selector)
    }

    fn lookup(selector: &str) -> (&'static str, &'static str, &'static str) {
        Self::VOICES
            .iter()
            .find(|v| v.0 == selector)
            .copied()
            .unwrap_or(Self::VOICES[0])
    }

    /// Unknown selectors get the default voice.
    pub fn elevenlabs_id(selector: &str) -> &'static str {
        Self::lookup(selector).1
    }

    pub fn speech_api_voice(selector: &str) -> &'static str {
        Self::lookup(selector).2
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn require_text(text: &str) -> VoiceResult<()> {
    if text.trim().is_empty() {
        return Err(VoiceError::Tts("text is required".to_string()));
    }
    Ok(())
}

fn env_key(name: &str) -> VoiceResult<String> {
    std::env::var(name)
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| VoiceError::Config(format!("{name} is not set")))
}

#[derive(Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    style: f32,
    speed: f32,
}

#[derive(Serialize)]
struct ElevenLabsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl ElevenLabsSynthesizer {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: http_client(),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| ELEVENLABS_BASE.to_string()),
            model: model.unwrap_or_else(|| ELEVENLABS_MODEL.to_string()),
        }
    }

    fn url(&self, selector: &str) -> String {
        format!(
            "{}/v1/text-to-speech/{}",
            self.base_url.trim_end_matches('/'),
            VoiceCatalog::elevenlabs_id(selector)
        )
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> VoiceResult<AudioClip> {
        require_text(text)?;
        let body = ElevenLabsRequest {
            text,
            model_id: &self.model,
            voice_settings: VoiceSettings {
                stability: 0.5,
                similarity_boost: 0.75,
                style: 0.0,
                speed: 1.0,
            },
        };
        let response = self
            .client
            .post(self.url(voice))
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(%status, %detail, "ElevenLabs synthesis failed");
            return Err(VoiceError::Tts(format!("ElevenLabs HTTP {status}")));
        }
        let bytes = response.bytes().await?.to_vec();
        info!(voice, bytes = bytes.len(), "🗣️ speech synthesized");
        Ok(AudioClip::mpeg(bytes))
    }
}

#[derive(Serialize)]
struct SpeechApiRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

/// OpenAI-compatible `/audio/speech`.
pub struct SpeechApiSynthesizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl SpeechApiSynthesizer {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: http_client(),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| SPEECH_API_BASE.to_string()),
            model: model.unwrap_or_else(|| SPEECH_API_MODEL.to_string()),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for SpeechApiSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> VoiceResult<AudioClip> {
        require_text(text)?;
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = SpeechApiRequest {
            model: &self.model,
            input: text,
            voice: VoiceCatalog::speech_api_voice(voice),
            response_format: "mp3",
        };
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(%status, %detail, "speech API synthesis failed");
            return Err(VoiceError::Tts(format!("speech API HTTP {status}")));
        }
        let bytes = response.bytes().await?.to_vec();
        info!(voice, bytes = bytes.len(), "🗣️ speech synthesized");
        Ok(AudioClip::mpeg(bytes))
    }
}

/// Build the configured provider, keys from `ELEVENLABS_API_KEY` or `TTS_API_KEY`.
pub fn synthesizer_from_config(config: &SynthesisConfig) -> VoiceResult<Box<dyn SpeechSynthesizer>> {
    match config.provider {
        SynthesisProvider::Elevenlabs => Ok(Box::new(ElevenLabsSynthesizer::new(
            env_key("ELEVENLABS_API_KEY")?,
            config.base_url.clone(),
            config.model.clone(),
        ))),
        SynthesisProvider::SpeechApi => Ok(Box::new(SpeechApiSynthesizer::new(
            env_key("TTS_API_KEY")?,
            config.base_url.clone(),
            config.model.clone(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_maps_known_voices() {
        assert_eq!(VoiceCatalog::elevenlabs_id("maria"), "5GR0JTHRVmv00OeaRI9u");
        assert_eq!(VoiceCatalog::speech_api_voice("jerry-b"), "onyx");
        assert!(VoiceCatalog::is_known("matthew"));
        assert_eq!(VoiceCatalog::selectors().count(), 4);
    }

    #[test]
    fn unknown_voice_falls_back_to_default() {
        assert_eq!(
            VoiceCatalog::elevenlabs_id("nobody"),
            VoiceCatalog::elevenlabs_id(VoiceCatalog::DEFAULT)
        );
        assert_eq!(VoiceCatalog::speech_api_voice(""), "shimmer");
    }

    #[test]
    fn elevenlabs_url_uses_provider_voice_id() {
        let synth = ElevenLabsSynthesizer::new("k", Some("http://localhost:9/".into()), None);
        assert_eq!(
            synth.url("matthew"),
            "http://localhost:9/v1/text-to-speech/gscOrkdeRphuXV3NcHOp"
        );
    }

    #[tokio::test]
    async fn blank_text_is_rejected_before_any_request() {
        // Unroutable base URL: reaching the network would fail differently.
        let synth = SpeechApiSynthesizer::new("k", Some("http://127.0.0.1:9".into()), None);
        let err = synth.synthesize("   ", "maria").await.unwrap_err();
        assert!(matches!(err, VoiceError::Tts(_)));
    }

    #[test]
    fn elevenlabs_body_shape() {
        let body = ElevenLabsRequest {
            text: "hi",
            model_id: ELEVENLABS_MODEL,
            voice_settings: VoiceSettings {
                stability: 0.5,
                similarity_boost: 0.75,
                style: 0.0,
                speed: 1.0,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model_id"], "eleven_multilingual_v2");
        assert_eq!(json["voice_settings"]["similarity_boost"], 0.75);
    }
}
