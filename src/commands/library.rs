//! Recording library commands: /recordings, /download

use serenity::all::{
    Colour, CommandInteraction, CommandOptionType, Context, CreateCommand, CreateCommandOption,
    CreateEmbed, CreateEmbedFooter, ResolvedValue,
};
use std::sync::Arc;
use tracing::{error, info};

use super::{edit_embed, edit_text};
use crate::database::{Database, RecordingStatus};
use crate::download::{DownloadError, DownloadService};
use crate::notify::{format_duration, format_participants, format_size};

const PAGE_SIZE: u32 = 10;

/// Register library commands
pub fn register() -> Vec<CreateCommand> {
    vec![
        CreateCommand::new("recordings")
            .description("List all recordings for this server")
            .add_option(
                CreateCommandOption::new(CommandOptionType::Integer, "page", "Page number")
                    .required(false)
                    .min_int_value(1),
            ),
        CreateCommand::new("download")
            .description("Get download link for a recording")
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::Integer,
                    "recording_id",
                    "Recording ID from /recordings",
                )
                .required(true)
                .min_int_value(1),
            ),
    ]
}

fn integer_option(command: &CommandInteraction, name: &str) -> Option<i64> {
    command
        .data
        .options()
        .into_iter()
        .find(|o| o.name == name)
        .and_then(|o| match o.value {
            ResolvedValue::Integer(value) => Some(value),
            _ => None,
        })
}

/// Handle /recordings command
pub async fn handle_recordings(
    ctx: &Context,
    command: &CommandInteraction,
    db: Arc<Database>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let guild_id = command.guild_id.ok_or("Must be used in a guild")?;
    let page = integer_option(command, "page").unwrap_or(1).max(1) as u32;

    command.defer(&ctx.http).await?;

    let recordings = match db.list_by_guild(guild_id.get(), PAGE_SIZE, (page - 1) * PAGE_SIZE) {
        Ok(recordings) => recordings,
        Err(e) => {
            error!("Failed to list recordings for guild {}: {}", guild_id, e);
            edit_text(ctx, command, "❌ Failed to list recordings. Please try again.").await?;
            return Ok(());
        }
    };

    if recordings.is_empty() {
        let embed = CreateEmbed::new()
            .title("📼 No Recordings")
            .description("No recordings found for this server.")
            .colour(Colour::BLUE);
        edit_embed(ctx, command, embed).await?;
        return Ok(());
    }

    let mut embed = CreateEmbed::new()
        .title("📼 Server Recordings")
        .description(format!(
            "Page {} • Showing {} recordings",
            page,
            recordings.len()
        ))
        .colour(Colour::BLUE);

    for recording in &recordings {
        let status = match recording.status {
            RecordingStatus::Completed => "✅",
            RecordingStatus::Failed => "❌",
            RecordingStatus::Recording | RecordingStatus::Processing => "🔄",
        };
        let size = recording
            .file_size
            .filter(|s| *s > 0)
            .map(format_size)
            .unwrap_or_else(|| "N/A".to_string());

        embed = embed.field(
            format!("{} Recording #{}", status, recording.id),
            format!(
                "**Channel:** {}\n**Started by:** {}\n**Duration:** {}\n**Size:** {}\n**Participants:** {}\n**Date:** {}",
                recording.channel_name,
                recording.started_by_name,
                format_duration(recording.duration.unwrap_or(0) as f64),
                size,
                format_participants(&recording.participants),
                recording.start_time.format("%Y-%m-%d"),
            ),
            false,
        );
    }

    embed = embed.field(
        "📥 How to Download",
        "Use `/download <recording_id>` to get a download link for a specific recording.",
        false,
    );
    edit_embed(ctx, command, embed).await?;

    Ok(())
}

/// Handle /download command
pub async fn handle_download(
    ctx: &Context,
    command: &CommandInteraction,
    downloads: Arc<DownloadService>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let guild_id = command.guild_id.ok_or("Must be used in a guild")?;
    let recording_id = integer_option(command, "recording_id").ok_or("Missing recording_id")?;

    command.defer_ephemeral(&ctx.http).await?;

    let link = match downloads.request_link(recording_id, guild_id.get(), command.user.id.get()) {
        Ok(link) => link,
        Err(e) => {
            let message = match e {
                DownloadError::RecordingNotFound => "❌ Recording not found.",
                DownloadError::Forbidden => {
                    "❌ You don't have permission to download this recording."
                }
                DownloadError::NotCompleted => {
                    "❌ Recording is not yet completed. Please wait for processing to finish."
                }
                DownloadError::FileMissing => {
                    "❌ Recording file not found. It may have been deleted."
                }
                DownloadError::Database(ref err) => {
                    error!("Failed to issue download link: {}", err);
                    "❌ Failed to generate download link. Please try again."
                }
            };
            edit_text(ctx, command, message).await?;
            return Ok(());
        }
    };

    let embed = CreateEmbed::new()
        .title("📥 Download Link")
        .description(format!("Download link for Recording #{}", link.recording_id))
        .colour(Colour::DARK_GREEN)
        .field("Download URL", link.url.clone(), false)
        .field("Expires", format!("<t:{}:R>", link.expires_at.timestamp()), true)
        .field(
            "File Size",
            link.file_size.map(format_size).unwrap_or_else(|| "N/A".to_string()),
            true,
        )
        .field(
            "Duration",
            format_duration(link.duration_seconds.unwrap_or(0) as f64),
            true,
        )
        .footer(CreateEmbedFooter::new(
            "⚠️ Do not share this link. It expires automatically.",
        ));
    edit_embed(ctx, command, embed).await?;

    info!(
        "Issued download link for recording {} to user {}",
        recording_id, command.user.id
    );
    Ok(())
}
