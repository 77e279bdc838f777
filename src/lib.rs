//! Voice Assistant Library
//!
//! A voice agent that joins a room, listens to a participant and answers
//! with a retrieval-augmented chat model:
//! - Cloud TTS synthesis with local playback
//! - Energy VAD, noise suppression and turn detection
//! - Whisper-compatible STT
//! - Persisted vector index over a folder of documents
//! - Worker runtime with prewarm and per-job entrypoint
//!
//! # Example
//!
//! ```ignore
//! use voice_assistant::assistant::{AssistantResources, VoiceAssistant};
//! use voice_assistant::config::Config;
//! use voice_assistant::worker::{LiveKitConnector, Worker};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let connector = LiveKitConnector::new(config.room.clone())?;
//!     let resources = AssistantResources::from_config(&config).await?;
//!     let room = config.room.room_name.clone();
//!     let options = VoiceAssistant::worker_options(config, resources);
//!     let worker = Worker::new(options, std::sync::Arc::new(connector));
//!     worker.run_forever(&room).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod voice;
pub mod index;
pub mod agent;
pub mod worker;
pub mod assistant;
pub mod cli;

pub use assistant::{AssistantResources, VoiceAssistant};
pub use config::Config;
pub use voice::tts::TtsAdapter;
pub use worker::{Worker, WorkerOptions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
