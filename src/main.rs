//! VoiceScribe
//!
//! A Discord bot that records every participant of a voice channel on a
//! separate track, mixes the tracks into one synchronized file and serves it
//! through expiring download links.

mod audio;
mod bot;
mod commands;
mod config;
mod database;
mod download;
mod notify;
mod server;
mod session;
mod tokens;
mod voice;

#[cfg(test)]
mod test_support;

use config::Config;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,voice_scribe=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("VoiceScribe starting...");

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Please ensure DISCORD_TOKEN is set in .env file");
            std::process::exit(1);
        }
    };

    info!("Configuration loaded successfully");
    if let Some(guild_id) = config.guild_id {
        info!("Development mode: Commands will be registered to guild {}", guild_id);
    }

    // Create working directories
    let database_dir = config
        .database_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty());
    for dir in [
        Some(config.temp_audio_dir.as_path()),
        Some(config.recordings_path.as_path()),
        database_dir,
    ]
    .into_iter()
    .flatten()
    {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!("Failed to create directory {:?}: {}", dir, e);
            std::process::exit(1);
        }
    }

    // Run the bot
    if let Err(e) = bot::run(config).await {
        error!("Bot error: {}", e);
        std::process::exit(1);
    }
}
