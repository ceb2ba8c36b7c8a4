//! Text-to-speech client.
//!
//! The backend answers with base64 audio; a reply is only handed back once
//! it has been fully received and decoded.

use super::retry::{with_retry, RetryPolicy};
use super::{BackendError, Synthesizer};
use crate::config::TtsConfig;
use crate::models::VoiceProfile;
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    audio: TtsAudio<'a>,
    request: TtsText<'a>,
}

#[derive(Debug, Serialize)]
struct TtsAudio<'a> {
    voice_type: &'a str,
    encoding: &'a str,
    speed_ratio: f32,
}

#[derive(Debug, Serialize)]
struct TtsText<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct TtsResponse {
    #[serde(default)]
    data: String,
}

pub struct SpeechClient {
    http: Client,
    config: TtsConfig,
    policy: RetryPolicy,
}

impl SpeechClient {
    pub fn new(http: Client, config: TtsConfig) -> Self {
        let policy = RetryPolicy::from(&config.backend);
        Self { http, config, policy }
    }

    fn endpoint(&self) -> String {
        format!("{}/voice/tts", self.config.base_url.trim_end_matches('/'))
    }

    async fn request_once(&self, body: &TtsRequest<'_>) -> Result<Vec<u8>, BackendError> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .timeout(self.policy.timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status: status.as_u16(), body: text });
        }

        let parsed: TtsResponse = response.json().await?;
        decode_audio(&parsed.data)
    }
}

/// Cut `text` to at most `max_chars` characters, marking the cut with "...".
pub fn truncate_for_speech(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

fn decode_audio(data: &str) -> Result<Vec<u8>, BackendError> {
    if data.is_empty() {
        return Err(BackendError::Protocol("synthesis returned no audio".to_string()));
    }
    let audio = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| BackendError::Protocol(format!("invalid base64 audio: {}", e)))?;
    if audio.is_empty() {
        return Err(BackendError::Protocol("synthesis returned no audio".to_string()));
    }
    Ok(audio)
}

#[async_trait]
impl Synthesizer for SpeechClient {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Result<Vec<u8>, BackendError> {
        if self.config.api_key.is_empty() {
            return Err(BackendError::NotConfigured("tts"));
        }

        let text = truncate_for_speech(text, self.config.max_chars);
        let body = TtsRequest {
            audio: TtsAudio {
                voice_type: &voice.voice_type,
                encoding: &self.config.encoding,
                speed_ratio: voice.speed_ratio,
            },
            request: TtsText { text: &text },
        };
        debug!(voice = %voice.voice_type, chars = text.chars().count(), "requesting synthesis");

        let audio = with_retry("tts", &self.policy, || self.request_once(&body)).await?;
        info!(bytes = audio.len(), "synthesis complete");
        Ok(audio)
    }
}
