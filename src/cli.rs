//! CLI interface for voice-assistant

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::assistant::{AssistantResources, VoiceAssistant};
use crate::config::{self, Config};
use crate::index;
use crate::voice::audio::{self, RodioSink};
use crate::voice::tts::{GoogleTtsClient, TtsAdapter, VoiceDefaults};
use crate::worker::room::{join_grants, mint_participant_token, LiveKitConnector, RoomConnector};
use crate::worker::{AutoSubscribe, JobState, Worker};

#[derive(Parser)]
#[command(name = "voice-assistant")]
#[command(about = "Voice assistant agent with retrieval-augmented answers", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker, serving the configured room until Ctrl+C
    Start,
    /// Run a single job against a room
    Connect {
        /// Room name (defaults to the configured room)
        #[arg(short, long)]
        room: Option<String>,
    },
    /// Talk to the agent through the local microphone and speaker
    Console,
    /// Build the retrieval index, or load it if already persisted
    BuildIndex {
        /// Rebuild from source documents even if an index exists
        #[arg(long)]
        rebuild: bool,
    },
    /// Synthesize text and play it on the default output device
    Say {
        text: String,
        /// Voice name (e.g. en-US-Wavenet-D)
        #[arg(long)]
        voice: Option<String>,
        /// Language code (e.g. en-US)
        #[arg(long)]
        language: Option<String>,
        /// Speaking rate, 1.0 is normal speed
        #[arg(long)]
        rate: Option<f32>,
    },
    /// Mint a join token for a human participant
    Token {
        /// Participant identity
        identity: String,
        /// Room name (defaults to the configured room)
        #[arg(short, long)]
        room: Option<String>,
        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Show the default audio devices
    Devices,
    /// Show or initialise the configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
        /// Write a default configuration file
        #[arg(long)]
        init: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    config.context("Failed to load configuration")
}

fn room_connector(config: &Config) -> Result<Arc<dyn RoomConnector>> {
    let connector =
        LiveKitConnector::new(config.room.clone()).context("Room service is not configured")?;
    Ok(Arc::new(connector))
}

#[cfg(feature = "voice")]
fn console_connector() -> Result<Arc<dyn RoomConnector>> {
    Ok(Arc::new(crate::worker::room::LocalConnector))
}

#[cfg(not(feature = "voice"))]
fn console_connector() -> Result<Arc<dyn RoomConnector>> {
    anyhow::bail!("Console mode requires the voice feature")
}

async fn build_worker(config: Config, connector: Arc<dyn RoomConnector>) -> Result<Worker> {
    let resources = AssistantResources::from_config(&config).await?;
    let backoff = std::time::Duration::from_secs(config.room.retry_backoff_secs);
    let options = VoiceAssistant::worker_options(config, resources);
    Ok(Worker::new(options, connector).with_backoff(backoff))
}

async fn run_single_job(worker: &Worker, room: &str) -> Result<()> {
    let outcome = worker.run_job(room).await;
    println!("Job {} {}", outcome.job_id, outcome.final_state);
    if outcome.final_state == JobState::Failed {
        if let Some(e) = outcome.error {
            return Err(e).context("Job failed");
        }
    }
    Ok(())
}

/// Run the CLI
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            println!("Starting voice agent...");
            let config = load_config(cli.config.as_ref())?;
            let room = config.room.room_name.clone();
            let connector = room_connector(&config)?;
            let worker = build_worker(config, connector).await?;
            worker.run_forever(&room).await?;
        }
        Commands::Connect { room } => {
            let config = load_config(cli.config.as_ref())?;
            let room = room.unwrap_or_else(|| config.room.room_name.clone());
            let connector = room_connector(&config)?;
            let worker = build_worker(config, connector).await?;
            run_single_job(&worker, &room).await?;
        }
        Commands::Console => {
            let config = load_config(cli.config.as_ref())?;
            let worker = build_worker(config, console_connector()?).await?;
            println!("Speak into the microphone, Ctrl+C to quit");
            run_single_job(&worker, "console").await?;
        }
        Commands::BuildIndex { rebuild } => {
            let config = load_config(cli.config.as_ref())?;
            let embedder = index::embeddings::from_config(&config)?;
            let index = if rebuild {
                index::rebuild_index(&config.index, embedder.as_ref()).await?
            } else {
                let (index, origin) = index::resolve_index(&config.index, embedder.as_ref()).await?;
                if origin == index::IndexOrigin::Loaded {
                    println!("Index already exists (use --rebuild to rebuild)");
                }
                index
            };
            let meta = index.metadata();
            println!("Index: {}", config.index.persist_dir.display());
            println!("  Documents: {}", meta.document_count);
            println!("  Nodes:     {}", index.len());
            println!("  Model:     {} ({} dimensions)", meta.embed_model, meta.dimension);
            println!("  Created:   {}", meta.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        Commands::Say { text, voice, language, rate } => {
            let config = load_config(cli.config.as_ref())?;
            let backend = GoogleTtsClient::from_config(&config.tts)?;
            let defaults = VoiceDefaults {
                language: language.unwrap_or_else(|| config.tts.language.clone()),
                voice: voice.unwrap_or_else(|| config.tts.voice.clone()),
                speaking_rate: rate.unwrap_or(config.tts.speaking_rate),
            };
            let tts = TtsAdapter::new(Arc::new(backend), Arc::new(RodioSink::new()))
                .with_defaults(defaults);
            tts.play(&text).await?;
        }
        Commands::Token { identity, room, name } => {
            let config = load_config(cli.config.as_ref())?;
            let room = room.unwrap_or_else(|| config.room.room_name.clone());
            let name = name.unwrap_or_else(|| identity.clone());
            let grants = join_grants(&room, AutoSubscribe::SubscribeAll);
            let token = mint_participant_token(&config.room, &identity, &name, grants)?;
            println!("{}", token);
        }
        Commands::Devices => {
            println!("Input:  {}", audio::default_input_info());
            println!("Output: {}", audio::default_output_info());
        }
        Commands::Config { show, init } => {
            let path = match &cli.config {
                Some(path) => path.clone(),
                None => config::config_path()?,
            };
            if init {
                if path.exists() {
                    println!("Configuration already exists at {}", path.display());
                } else {
                    Config::default().save_to(&path)?;
                    println!("Wrote default configuration to {}", path.display());
                }
            } else if show {
                let config = load_config(Some(&path))?;
                println!("# {}", path.display());
                println!("{}", toml::to_string_pretty(&config)?);
            } else {
                println!("Configuration file: {}", path.display());
                println!();
                println!("Default configuration:");
                println!("{}", config::default_config_toml());
            }
        }
    }

    Ok(())
}
