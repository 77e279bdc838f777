//! Text-to-Speech (TTS) Module
//!
//! Converts text to speech with a cloud synthesis backend and plays the
//! result on the local output device.
//!
//! # Architecture
//!
//! ```text
//! Text → TtsAdapter → SynthesisBackend (Cloud TTS, LINEAR16)
//!            ↓
//!      temporary WAV → AudioSink (default output device)
//! ```
//!
//! No caching and no retries: every failure goes straight back to the caller.
//! The adapter keeps no state between calls apart from the backend handle,
//! which is stateless per request and safe to share.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::TtsConfig;
use crate::error::{PlaybackError, SpeakError, SynthesisError};
use crate::voice::audio::AudioSink;

/// Encoding requested from the backend. LINEAR16 comes back as a WAV file,
/// which the sink can decode without extra codecs.
pub const AUDIO_ENCODING: &str = "LINEAR16";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One synthesis call
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub language: String,
    pub voice: String,
    pub speaking_rate: f32,
}

impl SynthesisRequest {
    /// Reject requests the backend would refuse anyway
    pub fn validate(&self) -> Result<(), SynthesisError> {
        if self.text.trim().is_empty() {
            return Err(SynthesisError::EmptyText);
        }
        if !self.speaking_rate.is_finite() || self.speaking_rate <= 0.0 {
            return Err(SynthesisError::InvalidSpeakingRate(self.speaking_rate));
        }
        Ok(())
    }
}

/// A speech synthesis service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Return the raw audio payload for `request`
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, SynthesisError>;
}

enum GoogleAuth {
    ApiKey(String),
    Bearer(String),
}

/// Cloud Text-to-Speech REST client (`v1/text:synthesize`)
pub struct GoogleTtsClient {
    client: reqwest::Client,
    endpoint: String,
    auth: GoogleAuth,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeSpeechRequest<'a> {
    input: SynthesisInput<'a>,
    voice: VoiceSelectionParams<'a>,
    audio_config: AudioConfigParams,
}

#[derive(Debug, Serialize)]
struct SynthesisInput<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceSelectionParams<'a> {
    language_code: &'a str,
    name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioConfigParams {
    audio_encoding: &'static str,
    speaking_rate: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeSpeechResponse {
    #[serde(default)]
    audio_content: String,
}

impl GoogleTtsClient {
    /// Build a client from configuration. An access token takes precedence
    /// over an API key.
    pub fn from_config(config: &TtsConfig) -> Result<Self, SynthesisError> {
        let auth = match (&config.access_token, &config.api_key) {
            (Some(token), _) if !token.is_empty() => GoogleAuth::Bearer(token.clone()),
            (_, Some(key)) if !key.is_empty() => GoogleAuth::ApiKey(key.clone()),
            _ => {
                return Err(SynthesisError::NotConfigured(
                    "set GOOGLE_API_KEY or GOOGLE_TTS_ACCESS_TOKEN".to_string(),
                ))
            }
        };

        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            auth,
        })
    }
}

fn request_body(request: &SynthesisRequest) -> SynthesizeSpeechRequest<'_> {
    SynthesizeSpeechRequest {
        input: SynthesisInput { text: &request.text },
        voice: VoiceSelectionParams {
            language_code: &request.language,
            name: &request.voice,
        },
        audio_config: AudioConfigParams {
            audio_encoding: AUDIO_ENCODING,
            speaking_rate: request.speaking_rate,
        },
    }
}

/// Map an unsuccessful HTTP status to the error taxonomy
fn classify_status(status: u16, message: String) -> SynthesisError {
    match status {
        401 | 403 => SynthesisError::Auth { status, message },
        429 => SynthesisError::Quota(message),
        400..=499 => SynthesisError::Rejected { status, message },
        _ => SynthesisError::Backend { status, message },
    }
}

fn decode_audio(body: &str) -> Result<Vec<u8>, SynthesisError> {
    let response: SynthesizeSpeechResponse =
        serde_json::from_str(body).map_err(|e| SynthesisError::InvalidResponse(e.to_string()))?;
    base64::engine::general_purpose::STANDARD
        .decode(response.audio_content.as_bytes())
        .map_err(|e| SynthesisError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl SynthesisBackend for GoogleTtsClient {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, SynthesisError> {
        let mut req = self.client.post(&self.endpoint);
        req = match &self.auth {
            GoogleAuth::ApiKey(key) => req.query(&[("key", key.as_str())]),
            GoogleAuth::Bearer(token) => req.bearer_auth(token),
        };

        let response = req.json(&request_body(request)).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), body));
        }

        decode_audio(&body)
    }
}

/// Default voice parameters used by [`TtsAdapter::play`]
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceDefaults {
    pub language: String,
    pub voice: String,
    pub speaking_rate: f32,
}

impl Default for VoiceDefaults {
    fn default() -> Self {
        Self::from(&TtsConfig::default())
    }
}

impl From<&TtsConfig> for VoiceDefaults {
    fn from(config: &TtsConfig) -> Self {
        Self {
            language: config.language.clone(),
            voice: config.voice.clone(),
            speaking_rate: config.speaking_rate,
        }
    }
}

/// Synthesis-and-playback adapter
#[derive(Clone)]
pub struct TtsAdapter {
    backend: Arc<dyn SynthesisBackend>,
    sink: Arc<dyn AudioSink>,
    defaults: VoiceDefaults,
    temp_dir: Option<PathBuf>,
}

impl TtsAdapter {
    pub fn new(backend: Arc<dyn SynthesisBackend>, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            backend,
            sink,
            defaults: VoiceDefaults::default(),
            temp_dir: None,
        }
    }

    /// Override the voice used by `play`
    pub fn with_defaults(mut self, defaults: VoiceDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Create temporary audio files in `dir` instead of the system temp dir
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn defaults(&self) -> &VoiceDefaults {
        &self.defaults
    }

    /// Synthesize `text` and return the raw audio payload.
    ///
    /// Never returns an empty buffer: an empty payload is a `SynthesisError`.
    pub async fn synthesize(
        &self,
        text: &str,
        language: &str,
        voice: &str,
        speaking_rate: f32,
    ) -> Result<Vec<u8>, SynthesisError> {
        let request = SynthesisRequest {
            text: text.to_string(),
            language: language.to_string(),
            voice: voice.to_string(),
            speaking_rate,
        };
        request.validate()?;

        debug!("Synthesizing {} chars with voice {}", text.len(), voice);
        let audio = self.backend.synthesize(&request).await?;
        if audio.is_empty() {
            return Err(SynthesisError::EmptyAudio);
        }
        Ok(audio)
    }

    /// Synthesize `text` with the default voice and play it to completion.
    ///
    /// Blocks the calling task for the whole playback. The temporary file is
    /// removed on every exit path.
    pub async fn play(&self, text: &str) -> Result<(), SpeakError> {
        let audio = self
            .synthesize(
                text,
                &self.defaults.language,
                &self.defaults.voice,
                self.defaults.speaking_rate,
            )
            .await?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("tts-").suffix(".wav");
        let mut file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(PlaybackError::TempFile)?;

        file.write_all(&audio)
            .and_then(|_| file.flush())
            .map_err(PlaybackError::TempFile)?;

        let played = self.sink.play_file(file.path());
        let removed = file.close();
        played?;
        removed.map_err(PlaybackError::TempFile)?;

        info!("Played {} bytes of synthesized audio", audio.len());
        Ok(())
    }
}
