//! Voice Assistant - voice agent with retrieval-augmented answers

use voice_assistant::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Rustls 0.23+ needs a process-wide crypto provider for HTTPS
    let _ = rustls::crypto::ring::default_provider().install_default();

    // INFO for this crate by default, override with RUST_LOG
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("voice_assistant=info,warn")
            }),
        )
        .init();

    cli::run().await
}
