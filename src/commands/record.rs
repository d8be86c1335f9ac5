//! Recording commands: /join, /stop, /status

use serenity::all::{
    Colour, CommandInteraction, Context, CreateCommand, CreateEmbed, CreateInteractionResponse,
    CreateInteractionResponseMessage,
};
use std::sync::Arc;
use tracing::{error, info};

use super::{channel_name, edit_embed, edit_text, respond, voice_participants};
use crate::notify::{format_duration, format_participants};
use crate::session::{Requester, SessionError, SessionManager, SessionState, StartRequest};

/// Register recording commands
pub fn register() -> Vec<CreateCommand> {
    vec![
        CreateCommand::new("join").description("Join your voice channel and start recording"),
        CreateCommand::new("stop").description("Stop the current recording"),
        CreateCommand::new("status").description("Check current recording status"),
    ]
}

/// Handle /join command
pub async fn handle_join(
    ctx: &Context,
    command: &CommandInteraction,
    session_manager: Arc<SessionManager>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let guild_id = command.guild_id.ok_or("Must be used in a guild")?;

    // Get user's voice channel from guild cache
    let voice_channel_id = ctx
        .cache
        .guild(guild_id)
        .and_then(|guild| {
            guild
                .voice_states
                .get(&command.user.id)
                .and_then(|vs| vs.channel_id)
        });
    let Some(voice_channel_id) = voice_channel_id else {
        respond(
            ctx,
            command,
            "❌ You need to be in a voice channel to start recording.",
            true,
        )
        .await?;
        return Ok(());
    };

    command.defer(&ctx.http).await?;

    let channel_name = channel_name(ctx, guild_id, voice_channel_id);
    let participants = voice_participants(ctx, guild_id, voice_channel_id);
    let started_by_name = command
        .member
        .as_ref()
        .map(|m| m.display_name().to_string())
        .unwrap_or_else(|| command.user.name.clone());

    let request = StartRequest {
        guild_id,
        voice_channel_id,
        text_channel_id: command.channel_id,
        channel_name: channel_name.clone(),
        started_by: command.user.id,
        started_by_name: started_by_name.clone(),
        participants: participants.clone(),
    };

    match session_manager.start_session(request).await {
        Ok(recording_id) => {
            let embed = CreateEmbed::new()
                .title("🎙️ Recording Started")
                .description(format!("Recording conversation in **{}**", channel_name))
                .colour(Colour::DARK_GREEN)
                .field("Recording ID", recording_id.to_string(), true)
                .field("Participants", format_participants(&participants), true)
                .field("Started by", started_by_name, true)
                .field("Stop Recording", "Use `/stop` to end recording", false);
            edit_embed(ctx, command, embed).await?;
            info!(
                "Started recording {} in guild {} channel {}",
                recording_id, guild_id, voice_channel_id
            );
        }
        Err(SessionError::AlreadyRecording) => {
            let mut embed = CreateEmbed::new()
                .title("Already Recording")
                .colour(Colour::ORANGE);
            if let Some(live) = session_manager.status(guild_id).await {
                embed = embed
                    .description(format!("Already recording in <#{}>", live.voice_channel_id))
                    .field("Recording ID", live.id.to_string(), true)
                    .field("Started by", format!("<@{}>", live.started_by), true);
            }
            edit_embed(ctx, command, embed).await?;
        }
        Err(e) => {
            error!("Failed to start recording in guild {}: {}", guild_id, e);
            edit_text(ctx, command, "❌ Failed to start recording. Please try again.").await?;
        }
    }

    Ok(())
}

/// Handle /stop command
pub async fn handle_stop(
    ctx: &Context,
    command: &CommandInteraction,
    session_manager: Arc<SessionManager>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let guild_id = command.guild_id.ok_or("Must be used in a guild")?;

    let requester = Requester {
        user_id: command.user.id,
        elevated: command
            .member
            .as_ref()
            .and_then(|m| m.permissions)
            .map(|p| p.manage_messages())
            .unwrap_or(false),
    };

    // Answer permission problems before anything is touched
    let Some(live) = session_manager.status(guild_id).await else {
        respond(ctx, command, "❌ No active recording in this server.", true).await?;
        return Ok(());
    };
    if live.state != SessionState::Recording {
        respond(
            ctx,
            command,
            &format!("ℹ️ Recording #{} is already being processed.", live.id),
            true,
        )
        .await?;
        return Ok(());
    }
    if live.started_by != requester.user_id && !requester.elevated {
        respond(
            ctx,
            command,
            "❌ You can only stop recordings you started, or you need 'Manage Messages' permission.",
            true,
        )
        .await?;
        return Ok(());
    }

    let embed = CreateEmbed::new()
        .title("🛑 Stopping Recording")
        .description(format!(
            "Recording #{} is being stopped and processed...",
            live.id
        ))
        .colour(Colour::ORANGE);
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().embed(embed),
            ),
        )
        .await?;

    // The notifier reports the outcome in the channel
    match session_manager.stop_session(guild_id, &requester).await {
        Ok(mix) => info!(
            "Stopped recording {} in guild {} ({:.1}s)",
            live.id, guild_id, mix.duration_seconds
        ),
        Err(SessionError::NotRecording) => {
            edit_text(ctx, command, "ℹ️ The recording was already stopped.").await?;
        }
        Err(SessionError::Forbidden) => {
            edit_text(ctx, command, "❌ You are not allowed to stop this recording.").await?;
        }
        Err(e) => error!("Recording {} in guild {} failed: {}", live.id, guild_id, e),
    }

    Ok(())
}

/// Handle /status command
pub async fn handle_status(
    ctx: &Context,
    command: &CommandInteraction,
    session_manager: Arc<SessionManager>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let guild_id = command.guild_id.ok_or("Must be used in a guild")?;

    let Some(live) = session_manager.status(guild_id).await else {
        respond(ctx, command, "ℹ️ No active recording in this server.", true).await?;
        return Ok(());
    };

    let elapsed = (chrono::Utc::now() - live.started_at).num_seconds() as f64;
    let mut embed = CreateEmbed::new()
        .title("🎙️ Recording Status")
        .description(format!(
            "Recording #{} in **{}** is {}",
            live.id,
            live.channel_name,
            live.state.as_str()
        ))
        .colour(Colour::DARK_GREEN)
        .field("Duration", format_duration(elapsed), true)
        .field("Channel", format!("<#{}>", live.voice_channel_id), true)
        .field("Started by", live.started_by_name.clone(), true)
        .field(
            "Current Participants",
            format_participants(&live.participants),
            false,
        );
    if live.track_count > 0 {
        embed = embed.field("Tracks", live.track_count.to_string(), true);
    }

    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .embed(embed)
                    .ephemeral(true),
            ),
        )
        .await?;

    Ok(())
}
