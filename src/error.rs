//! Error taxonomy
//!
//! Every failure is propagated to the worker, which owns job-level retry and
//! logging. Nothing in the voice pipeline retries on its own.

use std::path::PathBuf;
use thiserror::Error;

/// Failure of the external speech synthesis backend.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("cannot synthesize empty text")]
    EmptyText,

    #[error("speaking rate must be positive, got {0}")]
    InvalidSpeakingRate(f32),

    #[error("synthesis backend is not configured: {0}")]
    NotConfigured(String),

    #[error("synthesis request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("synthesis backend rejected credentials ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("synthesis quota exhausted: {0}")]
    Quota(String),

    #[error("synthesis request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("synthesis backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    #[error("invalid synthesis response: {0}")]
    InvalidResponse(String),

    #[error("synthesis backend returned no audio")]
    EmptyAudio,
}

/// Failure of local playback (temporary file or output device).
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("temporary audio file error: {0}")]
    TempFile(#[source] std::io::Error),

    #[error("failed to open audio output device: {0}")]
    Device(String),

    #[error("failed to decode audio file {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("audio playback is unavailable in this build")]
    Unavailable,
}

/// Failure of the `play` operation: either stage can fail.
#[derive(Debug, Error)]
pub enum SpeakError {
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),
}

/// Failure to build or load the retrieval index.
#[derive(Debug, Error)]
pub enum IndexBuildError {
    #[error("cannot read source documents in {path}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no documents found in {0}")]
    NoDocuments(PathBuf),

    #[error("persisted index at {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("failed to persist index to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index was built with embedding model '{persisted}', configured model is '{configured}'")]
    EmbeddingMismatch { persisted: String, configured: String },

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// Failure of the embedding model.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("embedding endpoint error ({status}): {message}")]
    Endpoint { status: u16, message: String },

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

/// Failure to join the room or to observe its participants.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("room service is not configured: {0}")]
    NotConfigured(String),

    #[error("room {room} is unreachable: {message}")]
    Unreachable { room: String, message: String },

    #[error("failed to mint access token: {0}")]
    Token(String),

    #[error("room {0} closed before a participant joined")]
    Closed(String),
}

/// Failure of speech recognition or audio capture.
#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("transcription request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("transcription endpoint error ({status}): {message}")]
    Endpoint { status: u16, message: String },

    #[error("failed to encode audio: {0}")]
    Encode(String),

    #[error("audio capture failed: {0}")]
    Capture(String),

    #[error("VAD model unavailable: {0}")]
    VadModel(String),
}

/// Failure of the language model endpoint.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("language model request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("language model endpoint error ({status}): {message}")]
    Endpoint { status: u16, message: String },

    #[error("invalid language model response: {0}")]
    InvalidResponse(String),

    #[error("context retrieval failed: {0}")]
    Retrieval(#[from] EmbeddingError),
}

/// Configuration file could not be read or parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to determine configuration directory")]
    NoProjectDirs,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Anything that terminates a job. The worker logs it and applies its own
/// backoff; the job itself never recovers.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Speech(#[from] SpeechError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Index(#[from] IndexBuildError),

    #[error("job is not connected to a room")]
    NotConnected,

    #[error("session is not started")]
    SessionNotStarted,
}

impl From<SpeakError> for JobError {
    fn from(err: SpeakError) -> Self {
        match err {
            SpeakError::Synthesis(e) => JobError::Synthesis(e),
            SpeakError::Playback(e) => JobError::Playback(e),
        }
    }
}
