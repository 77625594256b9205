//! Deepgram text-to-speech over HTTP.
//!
//! `POST /v1/speak` answers with the encoded audio as a chunked body; each
//! body chunk is handed on as one audio chunk as soon as it arrives, so
//! playback can start before synthesis is finished.

use crate::config::SynthesisConfig;
use crate::error::SynthesisError;
use crate::services::{AudioStream, SpeechSynthesizer, VoiceConfig};
use async_trait::async_trait;
use futures_util::{future, stream, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct SpeakRequest<'a> {
    text: &'a str,
}

pub struct DeepgramSpeechClient {
    http: reqwest::Client,
    api_key: String,
    url: String,
}

impl DeepgramSpeechClient {
    pub fn new(config: &SynthesisConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            url: config.url.clone(),
        })
    }
}

/// Query string selecting the voice and output format.
pub fn speak_query(voice: &VoiceConfig) -> [(&'static str, String); 3] {
    [
        ("model", voice.model.clone()),
        ("encoding", voice.encoding.clone()),
        ("sample_rate", voice.sample_rate.to_string()),
    ]
}

#[async_trait]
impl SpeechSynthesizer for DeepgramSpeechClient {
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<AudioStream, SynthesisError> {
        if text.trim().is_empty() {
            return Ok(stream::empty().boxed());
        }
        if self.api_key.is_empty() {
            return Err(SynthesisError::NotConfigured("DEEPGRAM_API_KEY is not set".into()));
        }

        debug!(model = %voice.model, chars = text.chars().count(), "requesting speech");
        let response = self
            .http
            .post(&self.url)
            .query(&speak_query(voice))
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&SpeakRequest { text })
            .send()
            .await
            .map_err(|e| SynthesisError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| SynthesisError::Stream(e.to_string()))
            })
            .filter(|chunk| future::ready(!matches!(chunk, Ok(bytes) if bytes.is_empty())))
            .boxed())
    }
}
