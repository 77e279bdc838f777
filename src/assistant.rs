//! Voice assistant composition
//!
//! Resolves the retrieval index, builds the shared clients, and provides the
//! two worker callbacks: `prewarm` loads the VAD once per process, and
//! [`VoiceAssistant`] is the per-job entrypoint that connects, waits for a
//! participant, starts a session and greets the user.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::{ChatModel, ContextChatEngine, OllamaClient};
use crate::config::{Config, VadBackend, VadSettings};
use crate::error::JobError;
use crate::index::{self, Embedder, IndexOrigin, VectorIndex};
use crate::voice::audio::{AudioSink, RodioSink};
use crate::voice::stt::{SpeechToText, WhisperApiStt};
use crate::voice::tts::{GoogleTtsClient, SynthesisBackend, TtsAdapter, VoiceDefaults};
use crate::voice::turn::TurnDetector;
use crate::voice::vad::VadModel;
use crate::worker::{
    Agent, AgentSession, AutoSubscribe, Entrypoint, JobContext, PrewarmFn, ProcessState,
    RoomInputOptions, SessionComponents, WorkerOptions,
};

/// Prewarm callback: load the VAD model into process-wide state. The
/// Silero model file is fetched beforehand by [`AssistantResources::from_config`].
pub fn prewarm(settings: VadSettings) -> PrewarmFn {
    Box::new(move || ProcessState {
        vad: Arc::new(VadModel::load(&settings)),
    })
}

/// Process-wide clients shared by every job
#[derive(Clone)]
pub struct AssistantResources {
    pub index: Arc<VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub chat_model: Arc<dyn ChatModel>,
    pub stt: Arc<dyn SpeechToText>,
    pub synthesis: Arc<dyn SynthesisBackend>,
    pub sink: Arc<dyn AudioSink>,
}

impl AssistantResources {
    /// Resolve the index (building it if absent) and create the clients.
    /// Runs once, before the worker accepts jobs.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let embedder =
            index::embeddings::from_config(config).context("Failed to create embedding client")?;

        let (index, origin) = index::resolve_index(&config.index, embedder.as_ref())
            .await
            .context("Failed to resolve retrieval index")?;
        match origin {
            IndexOrigin::Built => info!("Built index at {}", config.index.persist_dir.display()),
            IndexOrigin::Loaded => {
                info!("Loaded index from {}", config.index.persist_dir.display())
            }
        }

        if config.vad.backend == VadBackend::Silero {
            fetch_vad_model().await;
        }

        let chat_model =
            OllamaClient::from_config(&config.llm).context("Failed to create LLM client")?;
        let stt = WhisperApiStt::from_config(&config.stt).context("Failed to create STT client")?;
        let synthesis =
            GoogleTtsClient::from_config(&config.tts).context("Failed to create TTS client")?;

        Ok(Self {
            index: Arc::new(index),
            embedder,
            chat_model: Arc::new(chat_model),
            stt: Arc::new(stt),
            synthesis: Arc::new(synthesis),
            sink: Arc::new(RodioSink::new()),
        })
    }
}

#[cfg(feature = "voice")]
async fn fetch_vad_model() {
    if let Err(e) = crate::voice::vad::ensure_silero_model().await {
        warn!("Could not fetch the Silero VAD model: {}", e);
    }
}

#[cfg(not(feature = "voice"))]
async fn fetch_vad_model() {
    warn!("Silero VAD needs the voice feature");
}

/// The per-job entrypoint
pub struct VoiceAssistant {
    config: Config,
    resources: AssistantResources,
}

impl VoiceAssistant {
    pub fn new(config: Config, resources: AssistantResources) -> Self {
        Self { config, resources }
    }

    /// Callbacks to register with the worker
    pub fn worker_options(config: Config, resources: AssistantResources) -> WorkerOptions {
        WorkerOptions {
            prewarm: prewarm(config.vad),
            entrypoint: Arc::new(Self::new(config, resources)),
        }
    }

    pub fn tts(&self) -> TtsAdapter {
        TtsAdapter::new(self.resources.synthesis.clone(), self.resources.sink.clone())
            .with_defaults(VoiceDefaults::from(&self.config.tts))
    }

    fn build_session(&self, vad: Arc<VadModel>) -> AgentSession {
        let llm = ContextChatEngine::new(
            self.resources.index.clone(),
            self.resources.embedder.clone(),
            self.resources.chat_model.clone(),
            self.config.index.similarity_top_k,
        )
        .with_history_limit(self.config.llm.history_limit);

        AgentSession::new(SessionComponents {
            vad,
            stt: self.resources.stt.clone(),
            llm,
            tts: self.tts(),
            turn_detection: TurnDetector::from(self.config.turn_detection),
        })
    }
}

#[async_trait]
impl Entrypoint for VoiceAssistant {
    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        info!("Connecting to room {}", ctx.room_name());
        ctx.connect(AutoSubscribe::AudioOnly).await?;

        let participant = ctx.wait_for_participant().await?;
        info!("Starting voice assistant for participant {}", participant.identity);

        let mut session = self.build_session(ctx.process().vad.clone());
        session
            .start(
                ctx.room_mut()?,
                Agent::new(self.config.agent.instructions.clone()),
                RoomInputOptions {
                    noise_cancellation: self.config.agent.noise_cancellation,
                },
            )
            .await?;
        ctx.mark_session_active();

        session.say(&self.config.agent.greeting, true).await?;
        session.run().await?;
        Ok(())
    }
}
