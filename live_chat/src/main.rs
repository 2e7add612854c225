use anyhow::Result;
use clap::Parser;
use live_chat::{api, config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();
    let cfg = config::Config::load(&cli)?;
    let level = if cfg.logging_enabled {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    // RUST_LOG, when set, takes over from the logging switch.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    if cfg.generated_secret {
        tracing::warn!("no JWT secret configured; tokens will not survive a restart");
    }
    match &cfg.database_path {
        Some(path) => tracing::info!(path = %path.display(), "using database file"),
        None => tracing::warn!("running with an in-memory database"),
    }
    api::run_http_server(cfg).await
}
