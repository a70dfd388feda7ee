//! Rettelse CLI entry point.

use anyhow::Result;
use clap::Parser;
use rettelse::cli::{commands, Cli, Commands};
use rettelse::config::Settings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("rettelse={}", log_level)),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let config_path = cli
        .config
        .as_deref()
        .map(Settings::expand_path)
        .unwrap_or_else(Settings::default_config_path);
    let settings = Settings::load_from(Some(&config_path))?;

    // Ensure the data directory and the database's parent exist
    std::fs::create_dir_all(settings.data_dir())?;
    if let Some(parent) = settings.sqlite_path().parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Execute command
    match &cli.command {
        Commands::Doctor => {
            commands::run_doctor(&settings, &config_path)?;
        }

        Commands::Serve { host, port, no_worker } => {
            commands::run_serve(host.clone(), *port, *no_worker, settings).await?;
        }

        Commands::Import { manifest, enqueue } => {
            commands::run_import(manifest, *enqueue, settings)?;
        }

        Commands::Enqueue { video_ids } => {
            commands::run_enqueue(video_ids, settings)?;
        }

        Commands::Status { video } => {
            commands::run_status(video.as_deref(), settings)?;
        }

        Commands::Retry { video_id } => {
            commands::run_retry(video_id, settings)?;
        }

        Commands::Process => {
            commands::run_process(settings).await?;
        }

        Commands::Reclaim => {
            commands::run_reclaim(settings)?;
        }

        Commands::Jobs { video_id } => {
            commands::run_jobs(video_id, settings)?;
        }

        Commands::Chunk { chunk_id, json } => {
            commands::run_chunk(*chunk_id, *json, settings)?;
        }

        Commands::Lock { action } => {
            commands::run_lock(action, settings)?;
        }

        Commands::Review { chunk_id, user, state } => {
            commands::run_review(*chunk_id, user, state, settings)?;
        }

        Commands::Config { action } => {
            commands::run_config(action, settings, &config_path)?;
        }
    }

    Ok(())
}
