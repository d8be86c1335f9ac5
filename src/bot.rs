//! Discord Bot event handler and service wiring

use crate::audio::tools::tool_available;
use crate::audio::{CaptureFormat, MixdownPipeline, MixdownSettings, SystemRunner};
use crate::commands;
use crate::config::Config;
use crate::database::Database;
use crate::download::DownloadService;
use crate::notify::DiscordNotifier;
use crate::server;
use crate::session::{SessionError, SessionManager, SessionSettings};
use crate::tokens::TokenBroker;
use crate::voice::{GatewayEvent, SongbirdGateway};
use serenity::all::{
    Client, Context, EventHandler, GatewayIntents, GuildId, Http, Interaction, Ready, VoiceState,
};
use serenity::async_trait;
use songbird::driver::DecodeMode;
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Bot state shared across handlers
pub struct BotState {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub session_manager: Arc<SessionManager>,
    pub downloads: Arc<DownloadService>,
}

/// Main event handler for the bot
pub struct Handler {
    pub state: Arc<BotState>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("Logged in as {}", ready.user.name);

        // Register commands
        let commands = vec![commands::record::register(), commands::library::register()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();

        // If guild ID is set, register to specific guild (faster for dev)
        if let Some(guild_id) = self.state.config.guild_id {
            let guild = GuildId::new(guild_id);
            match guild.set_commands(&ctx.http, commands).await {
                Ok(cmds) => info!("Registered {} guild commands", cmds.len()),
                Err(e) => error!("Failed to register guild commands: {}", e),
            }
        } else {
            // Register globally
            match serenity::all::Command::set_global_commands(&ctx.http, commands).await {
                Ok(cmds) => info!("Registered {} global commands", cmds.len()),
                Err(e) => error!("Failed to register global commands: {}", e),
            }
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            let sessions = self.state.session_manager.clone();
            let result = match command.data.name.as_str() {
                "join" => commands::record::handle_join(&ctx, &command, sessions).await,
                "stop" => commands::record::handle_stop(&ctx, &command, sessions).await,
                "status" => commands::record::handle_status(&ctx, &command, sessions).await,
                "recordings" => {
                    commands::library::handle_recordings(&ctx, &command, self.state.db.clone())
                        .await
                }
                "download" => {
                    commands::library::handle_download(
                        &ctx,
                        &command,
                        self.state.downloads.clone(),
                    )
                    .await
                }
                _ => Ok(()),
            };

            if let Err(e) = result {
                error!("Command error: {}", e);
            }
        }
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        let sessions = &self.state.session_manager;
        let Some(recorded) = sessions.recorded_channel(guild_id).await else {
            return;
        };

        // The bot itself was disconnected from voice
        let bot_id = ctx.cache.current_user().id;
        if new.user_id == bot_id {
            if new.channel_id.is_none() {
                warn!("Bot left voice in guild {}, stopping recording", guild_id);
                match sessions.force_stop(guild_id).await {
                    Ok(_) | Err(SessionError::NotRecording) => {}
                    Err(e) => error!("Recording in guild {} failed: {}", guild_id, e),
                }
            }
            return;
        }

        let old_channel = old.and_then(|vs| vs.channel_id);
        if old_channel == Some(recorded) || new.channel_id == Some(recorded) {
            let participants = commands::voice_participants(&ctx, guild_id, recorded);
            sessions.update_participants(guild_id, participants).await;
        }
    }
}

/// Create and run the Discord bot
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(config);

    // Initialize database
    let db = Arc::new(Database::open(&config.database_path)?);
    let interrupted = db.fail_interrupted_recordings()?;
    if interrupted > 0 {
        warn!("Marked {} interrupted recording(s) as failed", interrupted);
    }

    for tool in [&config.ffmpeg_path, &config.ffprobe_path] {
        if !tool_available(tool) {
            warn!("{} not found; recordings cannot be processed until it is installed", tool);
        }
    }

    // Voice: decode incoming Opus so the capture receives PCM
    let songbird = Songbird::serenity_from_config(
        songbird::Config::default().decode_mode(DecodeMode::Decode),
    );
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let gateway = Arc::new(SongbirdGateway::new(songbird.clone(), event_tx));
    let notifier = Arc::new(DiscordNotifier::new(Arc::new(Http::new(
        &config.discord_token,
    ))));

    let pipeline = Arc::new(MixdownPipeline::new(
        Arc::new(SystemRunner),
        MixdownSettings {
            recordings_root: config.recordings_path.clone(),
            format: config.audio_format,
            bitrate: config.audio_quality.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
            tool_timeout: config.tool_timeout,
            ffmpeg: config.ffmpeg_path.clone(),
            ffprobe: config.ffprobe_path.clone(),
        },
    ));

    let session_manager = Arc::new(SessionManager::new(
        SessionSettings {
            temp_root: config.temp_audio_dir.clone(),
            capture_format: CaptureFormat {
                sample_rate: config.sample_rate,
                channels: config.channels,
            },
            shutdown_timeout: config.shutdown_timeout,
            max_duration: config.max_recording_duration,
        },
        db.clone(),
        gateway,
        pipeline,
        notifier,
    ));

    // Downloads
    let broker = Arc::new(TokenBroker::new(
        &config.recordings_path,
        config.single_use_downloads,
    )?);
    let downloads = Arc::new(DownloadService::new(
        db.clone(),
        broker,
        &config.public_base_url,
        chrono::Duration::from_std(config.download_ttl)?,
    ));
    downloads
        .clone()
        .spawn_cleanup_task(config.token_cleanup_interval);

    let app = server::router(downloads.clone());
    let addr = config.web_bind_addr();
    tokio::spawn(async move {
        if let Err(e) = server::serve(&addr, app).await {
            error!("Download server error: {}", e);
        }
    });

    // Voice driver disconnects end the recording
    let forwarder = session_manager.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                GatewayEvent::Disconnected(guild_id) => {
                    let sessions = forwarder.clone();
                    tokio::spawn(async move {
                        match sessions.force_stop(guild_id).await {
                            Ok(_) | Err(SessionError::NotRecording) => {}
                            Err(e) => error!("Recording in guild {} failed: {}", guild_id, e),
                        }
                    });
                }
            }
        }
    });

    // Create bot state
    let state = Arc::new(BotState {
        config: config.clone(),
        db,
        session_manager: session_manager.clone(),
        downloads,
    });

    // Create handler
    let handler = Handler { state };

    // Create client with voice support
    let intents = GatewayIntents::non_privileged() | GatewayIntents::GUILD_VOICE_STATES;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Finish live recordings before the shards go away
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutting down...");
        session_manager.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    // Start the client
    info!("Starting bot...");
    client.start().await?;

    Ok(())
}
