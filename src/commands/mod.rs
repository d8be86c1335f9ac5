//! Slash commands
//!
//! - `record`: /join, /stop, /status
//! - `library`: /recordings, /download

pub mod library;
pub mod record;

use serenity::all::{
    ChannelId, CommandInteraction, Context, CreateEmbed, CreateInteractionResponse,
    CreateInteractionResponseMessage, EditInteractionResponse, GuildId,
};

/// Display names of the non-bot members in a voice channel, from the cache
pub fn voice_participants(ctx: &Context, guild_id: GuildId, channel_id: ChannelId) -> Vec<String> {
    let Some(guild) = ctx.cache.guild(guild_id) else {
        return Vec::new();
    };

    let mut names: Vec<String> = guild
        .voice_states
        .iter()
        .filter(|(_, vs)| vs.channel_id == Some(channel_id))
        .filter_map(|(user_id, vs)| vs.member.as_ref().or_else(|| guild.members.get(user_id)))
        .filter(|member| !member.user.bot)
        .map(|member| member.display_name().to_string())
        .collect();
    names.sort();
    names
}

/// Name of a guild channel, from the cache
pub fn channel_name(ctx: &Context, guild_id: GuildId, channel_id: ChannelId) -> String {
    ctx.cache
        .guild(guild_id)
        .and_then(|g| g.channels.get(&channel_id).map(|c| c.name.clone()))
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Helper to send a plain response
async fn respond(
    ctx: &Context,
    command: &CommandInteraction,
    content: &str,
    ephemeral: bool,
) -> Result<(), serenity::Error> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await
}

/// Replace a deferred response with an embed
async fn edit_embed(
    ctx: &Context,
    command: &CommandInteraction,
    embed: CreateEmbed,
) -> Result<(), serenity::Error> {
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
        .await
        .map(|_| ())
}

/// Replace a deferred response with text
async fn edit_text(
    ctx: &Context,
    command: &CommandInteraction,
    content: &str,
) -> Result<(), serenity::Error> {
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await
        .map(|_| ())
}
