//! Speech-to-text for finished speech segments.
//!
//! The VAD recognizer cuts the microphone stream into segments and hands each
//! one here; the text that comes back becomes a `final` capture event.

use crate::config::RecognizerConfig;
use crate::error::{VoiceError, VoiceResult};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

/// Turns one segment of mono f32 PCM into text.
pub trait SttBackend: Send + Sync {
    /// Empty string when nothing intelligible was said.
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String>;
}

/// 16-bit mono WAV, the lowest common denominator for upload.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut buf = Vec::with_capacity(44 + data_len as usize);

    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());

    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &s in samples {
        let i = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        buf.extend_from_slice(&i.to_le_bytes());
    }
    buf
}

/// `en-US` → `en`; the transcription API wants ISO-639-1.
fn language_of(locale: &str) -> Option<String> {
    let lang = locale.split(['-', '_']).next()?.trim().to_lowercase();
    (lang.len() == 2).then_some(lang)
}

/// OpenAI-compatible `/audio/transcriptions` (Whisper and friends).
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleStt {
    base_url: String,
    api_key: String,
    model: String,
    language: Option<String>,
    /// Built on first use, on the recognizer's worker thread: a blocking
    /// client must not be created or dropped inside the async runtime.
    client: OnceLock<reqwest::blocking::Client>,
}

impl OpenAiCompatibleStt {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        locale: &str,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            language: language_of(locale),
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> VoiceResult<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let built = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(self.client.get_or_init(|| built))
    }

    /// Endpoint and model from config, key from `STT_API_KEY`.
    pub fn from_config(config: &RecognizerConfig, locale: &str) -> VoiceResult<Self> {
        let api_key = std::env::var("STT_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| VoiceError::Config("STT_API_KEY is not set".to_string()))?;
        Ok(Self::new(&config.stt_base_url, api_key, &config.stt_model, locale))
    }
}

impl SttBackend for OpenAiCompatibleStt {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_f32_to_wav(samples, sample_rate);
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("segment.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let mut form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(ref lang) = self.language {
            form = form.text("language", lang.clone());
        }

        let res = self
            .client()?
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Stt(format!("transcription API error {status}: {body}")));
        }
        let json: serde_json::Value = res.json().map_err(|e| VoiceError::Stt(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        debug!(samples = samples.len(), chars = text.len(), "segment transcribed");
        Ok(text)
    }
}
