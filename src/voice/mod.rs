//! Voice Module
//!
//! The speech pipeline of the assistant:
//! - Audio I/O (microphone input, speaker output)
//! - Noise cancellation for room input
//! - VAD (Voice Activity Detection)
//! - Turn detection
//! - STT (Speech-to-Text) over an OpenAI-compatible transcription endpoint
//! - TTS (Text-to-Speech) with cloud synthesis and local playback
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voice_assistant::config::TtsConfig;
//! use voice_assistant::voice::audio::RodioSink;
//! use voice_assistant::voice::tts::{GoogleTtsClient, TtsAdapter};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let backend = GoogleTtsClient::from_config(&TtsConfig::default())?;
//! let tts = TtsAdapter::new(Arc::new(backend), Arc::new(RodioSink::new()));
//! tts.play("Hello from the assistant").await?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod noise;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod vad;

pub use audio::{AudioFrame, AudioSink, AudioSource, RodioSink, ScriptedSource};
pub use noise::NoiseSuppressor;
pub use stt::{SpeechToText, WhisperApiStt};
pub use tts::{GoogleTtsClient, SynthesisBackend, TtsAdapter, VoiceDefaults};
pub use turn::TurnDetector;
pub use vad::{SpeechSegment, VadEvent, VadModel, VadStream};
