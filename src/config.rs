//! Configuration management
//!
//! Worker configuration lives in a TOML file under the platform config
//! directory. Credentials and endpoints can be overridden from the process
//! environment; missing credentials are reported by the client that needs
//! them, not here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Chat model endpoint
    #[serde(default)]
    pub llm: LlmConfig,
    /// Embedding model used by the retrieval index
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    /// Retrieval index locations and chunking
    #[serde(default)]
    pub index: IndexConfig,
    /// Speech synthesis parameters
    #[serde(default)]
    pub tts: TtsConfig,
    /// Speech recognition endpoint
    #[serde(default)]
    pub stt: SttConfig,
    /// Room service connection
    #[serde(default)]
    pub room: RoomConfig,
    /// Persona and greeting
    #[serde(default)]
    pub agent: AgentConfig,
    /// Voice activity detection tuning
    #[serde(default)]
    pub vad: VadSettings,
    /// End-of-turn tuning
    #[serde(default)]
    pub turn_detection: TurnSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Maximum number of past messages kept in the chat history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_llm_base_url() -> String {
    "http://127.0.0.1:11435".to_string()
}

fn default_llm_model() -> String {
    "gemma".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_history_limit() -> usize {
    20
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            request_timeout_secs: default_request_timeout(),
            history_limit: default_history_limit(),
        }
    }
}

/// Which embedding backend builds the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Ollama `/api/embed`
    Ollama,
    /// Deterministic token hashing, no model required
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default = "default_embedding_provider")]
    pub provider: EmbeddingProviderKind,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Defaults to the LLM base URL when empty
    #[serde(default)]
    pub base_url: String,
    /// Dimension used by the hash provider
    #[serde(default = "default_embedding_dim")]
    pub dimension: usize,
}

fn default_embedding_provider() -> EmbeddingProviderKind {
    EmbeddingProviderKind::Ollama
}

fn default_embedding_model() -> String {
    "bge-small-en-v1.5".to_string()
}

fn default_embedding_dim() -> usize {
    384
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            base_url: String::new(),
            dimension: default_embedding_dim(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_persist_dir")]
    pub persist_dir: PathBuf,
    #[serde(default = "default_docs_dir")]
    pub docs_dir: PathBuf,
    /// Chunk size in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_top_k")]
    pub similarity_top_k: usize,
}

fn default_persist_dir() -> PathBuf {
    PathBuf::from("./chat-engine-storage")
}

fn default_docs_dir() -> PathBuf {
    PathBuf::from("docs")
}

fn default_chunk_size() -> usize {
    1024
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_top_k() -> usize {
    2
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            persist_dir: default_persist_dir(),
            docs_dir: default_docs_dir(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            similarity_top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_speaking_rate")]
    pub speaking_rate: f32,
    /// API key, normally supplied through `GOOGLE_API_KEY`
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// OAuth access token, normally supplied through `GOOGLE_TTS_ACCESS_TOKEN`
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,
}

fn default_tts_endpoint() -> String {
    "https://texttospeech.googleapis.com/v1/text:synthesize".to_string()
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_voice() -> String {
    "en-US-Wavenet-D".to_string()
}

fn default_speaking_rate() -> f32 {
    1.0
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: default_tts_endpoint(),
            language: default_language(),
            voice: default_voice(),
            speaking_rate: default_speaking_rate(),
            api_key: None,
            access_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// OpenAI-compatible server exposing `/v1/audio/transcriptions`
    #[serde(default = "default_stt_base_url")]
    pub base_url: String,
    #[serde(default = "default_stt_model")]
    pub model: String,
    #[serde(default = "default_stt_language")]
    pub language: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

fn default_stt_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

fn default_stt_language() -> String {
    "en".to_string()
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            base_url: default_stt_base_url(),
            model: default_stt_model(),
            language: default_stt_language(),
            api_key: None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing)]
    pub api_secret: String,
    /// Room serviced by `start`
    #[serde(default = "default_room_name")]
    pub room_name: String,
    #[serde(default = "default_agent_identity")]
    pub agent_identity: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// Delay before the worker re-dispatches a failed job
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

fn default_room_name() -> String {
    "voice-assistant".to_string()
}

fn default_agent_identity() -> String {
    "agent-voice-assistant".to_string()
}

fn default_token_ttl() -> u64 {
    3600
}

fn default_retry_backoff() -> u64 {
    5
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            room_name: default_room_name(),
            agent_identity: default_agent_identity(),
            token_ttl_secs: default_token_ttl(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

impl std::fmt::Debug for RoomConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("room_name", &self.room_name)
            .field("agent_identity", &self.agent_identity)
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("retry_backoff_secs", &self.retry_backoff_secs)
            .finish()
    }
}

/// Default persona
pub const DEFAULT_INSTRUCTIONS: &str = "You are a funny, witty assistant. Respond with short and concise answers. Avoid punctuation that is hard to pronounce or emojis.";

/// Default opening line
pub const DEFAULT_GREETING: &str = "Hey there! How can I help you today?";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_instructions")]
    pub instructions: String,
    #[serde(default = "default_greeting")]
    pub greeting: String,
    #[serde(default = "default_true")]
    pub noise_cancellation: bool,
}

fn default_instructions() -> String {
    DEFAULT_INSTRUCTIONS.to_string()
}

fn default_greeting() -> String {
    DEFAULT_GREETING.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instructions: default_instructions(),
            greeting: default_greeting(),
            noise_cancellation: true,
        }
    }
}

/// Which speech detector the VAD runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadBackend {
    /// Silero ONNX model, falling back to `energy` when it cannot be loaded
    #[default]
    Silero,
    Energy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VadSettings {
    #[serde(default)]
    pub backend: VadBackend,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Silero speech probability that counts as speech
    #[serde(default = "default_speech_probability")]
    pub speech_probability: f32,
    /// Energy above the noise floor that counts as speech, in dB
    #[serde(default = "default_vad_threshold_db")]
    pub threshold_db: f32,
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u32,
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_ms: u32,
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_speech_probability() -> f32 {
    0.5
}

fn default_vad_threshold_db() -> f32 {
    12.0
}

fn default_min_speech_ms() -> u32 {
    100
}

fn default_min_silence_ms() -> u32 {
    550
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            backend: VadBackend::default(),
            sample_rate: default_sample_rate(),
            speech_probability: default_speech_probability(),
            threshold_db: default_vad_threshold_db(),
            min_speech_ms: default_min_speech_ms(),
            min_silence_ms: default_min_silence_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TurnSettings {
    #[serde(default = "default_min_endpointing_ms")]
    pub min_endpointing_delay_ms: u64,
    #[serde(default = "default_max_endpointing_ms")]
    pub max_endpointing_delay_ms: u64,
}

fn default_min_endpointing_ms() -> u64 {
    500
}

fn default_max_endpointing_ms() -> u64 {
    6000
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            min_endpointing_delay_ms: default_min_endpointing_ms(),
            max_endpointing_delay_ms: default_max_endpointing_ms(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to
    /// defaults when no file exists, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Config::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Write the configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from environment variables
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = get("LIVEKIT_URL") {
            self.room.url = url;
        }
        if let Some(key) = get("LIVEKIT_API_KEY") {
            self.room.api_key = key;
        }
        if let Some(secret) = get("LIVEKIT_API_SECRET") {
            self.room.api_secret = secret;
        }
        if let Some(url) = get("OLLAMA_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = get("OLLAMA_MODEL") {
            self.llm.model = model;
        }
        if let Some(key) = get("GOOGLE_API_KEY") {
            self.tts.api_key = Some(key);
        }
        if let Some(token) = get("GOOGLE_TTS_ACCESS_TOKEN") {
            self.tts.access_token = Some(token);
        }
        if let Some(url) = get("STT_BASE_URL") {
            self.stt.base_url = url;
        }
        if let Some(key) = get("STT_API_KEY") {
            self.stt.api_key = Some(key);
        }
    }

    /// Base URL used by the embedding client
    pub fn embedding_base_url(&self) -> &str {
        if self.embedding.base_url.is_empty() {
            &self.llm.base_url
        } else {
            &self.embedding.base_url
        }
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let base = directories::ProjectDirs::from("com", "voice-assistant", "voice-assistant")
        .ok_or(ConfigError::NoProjectDirs)?;
    Ok(base.config_dir().join("config.toml"))
}

/// Data directory for downloaded models
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let base = directories::ProjectDirs::from("com", "voice-assistant", "voice-assistant")
        .ok_or(ConfigError::NoProjectDirs)?;
    Ok(base.data_dir().to_path_buf())
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    toml::to_string_pretty(&Config::default())
        .unwrap_or_else(|_| "# Default configuration\n".to_string())
}
