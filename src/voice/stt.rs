//! Speech-to-Text (STT) Module
//!
//! Transcribes finished utterances through an OpenAI-compatible
//! `/v1/audio/transcriptions` endpoint (faster-whisper-server, whisper.cpp
//! server or a hosted API).

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SttConfig;
use crate::error::SpeechError;
use crate::voice::audio::encode_wav;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe mono `samples` recorded at `sample_rate`
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String, SpeechError>;
}

/// Whisper over HTTP
pub struct WhisperApiStt {
    client: reqwest::Client,
    url: String,
    model: String,
    language: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

impl WhisperApiStt {
    pub fn from_config(config: &SttConfig) -> Result<Self, SpeechError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: transcription_url(&config.base_url),
            model: config.model.clone(),
            language: config.language.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn transcription_url(base_url: &str) -> String {
    format!("{}/v1/audio/transcriptions", base_url.trim_end_matches('/'))
}

fn parse_transcription(body: &str) -> Result<String, SpeechError> {
    let response: TranscriptionResponse =
        serde_json::from_str(body).map_err(|e| SpeechError::Endpoint {
            status: 200,
            message: format!("unparseable transcription: {}", e),
        })?;
    Ok(response.text.trim().to_string())
}

#[async_trait]
impl SpeechToText for WhisperApiStt {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String, SpeechError> {
        if samples.is_empty() {
            return Ok(String::new());
        }

        debug!(
            "Transcribing {} samples ({:.1}s of audio)",
            samples.len(),
            samples.len() as f64 / sample_rate as f64
        );

        let wav = encode_wav(samples, sample_rate)?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("speech.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("response_format", "json");

        let mut req = self.client.post(&self.url).multipart(form);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SpeechError::Endpoint {
                status: status.as_u16(),
                message: body,
            });
        }

        let text = parse_transcription(&body)?;
        info!("Transcribed: \"{}\"", text);
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcription_url() {
        assert_eq!(
            transcription_url("http://127.0.0.1:8000/"),
            "http://127.0.0.1:8000/v1/audio/transcriptions"
        );
    }

    #[test]
    fn test_parse_transcription() {
        assert_eq!(parse_transcription(r#"{"text": "  hello world \n"}"#).unwrap(), "hello world");
        assert_eq!(parse_transcription("{}").unwrap(), "");
        assert!(parse_transcription("not json").is_err());
    }

    #[tokio::test]
    async fn test_empty_audio_skips_request() {
        let config = SttConfig {
            // Nothing listens here; a request would fail
            base_url: "http://127.0.0.1:9".to_string(),
            ..SttConfig::default()
        };
        let stt = WhisperApiStt::from_config(&config).unwrap();
        assert_eq!(stt.transcribe(&[], 16000).await.unwrap(), "");
    }

    #[test]
    fn test_blank_api_key_ignored() {
        let config = SttConfig {
            api_key: Some(String::new()),
            ..SttConfig::default()
        };
        let stt = WhisperApiStt::from_config(&config).unwrap();
        assert!(stt.api_key.is_none());
    }
}
