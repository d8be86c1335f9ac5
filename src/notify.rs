//! Recording outcome notifications

use async_trait::async_trait;
use serenity::all::{ChannelId, Colour, CreateEmbed, CreateMessage, Http};
use std::sync::Arc;
use tracing::{error, info};

/// A recording finished processing
#[derive(Debug, Clone)]
pub struct CompletedNotice {
    pub recording_id: i64,
    pub text_channel_id: ChannelId,
    pub participants: Vec<String>,
    pub duration_seconds: f64,
    pub file_size_bytes: u64,
}

/// A recording could not be processed. Carries no diagnostics.
#[derive(Debug, Clone)]
pub struct FailedNotice {
    pub recording_id: i64,
    pub text_channel_id: ChannelId,
}

/// Reports recording outcomes to users
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn recording_completed(&self, notice: &CompletedNotice);
    async fn recording_failed(&self, notice: &FailedNotice);
}

/// Posts outcomes to the text channel the recording was started from
pub struct DiscordNotifier {
    http: Arc<Http>,
}

impl DiscordNotifier {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn recording_completed(&self, notice: &CompletedNotice) {
        let embed = CreateEmbed::new()
            .title("Recording Complete")
            .description(format!(
                "Recording #{} has been processed successfully!",
                notice.recording_id
            ))
            .colour(Colour::DARK_GREEN)
            .field("Duration", format_duration(notice.duration_seconds), true)
            .field("Participants", format_participants(&notice.participants), true)
            .field("File Size", format_size(notice.file_size_bytes), true)
            .field(
                "Download",
                format!("Use `/download {}` to get a download link", notice.recording_id),
                false,
            );

        match notice
            .text_channel_id
            .send_message(&self.http, CreateMessage::new().embed(embed))
            .await
        {
            Ok(_) => info!("Recording {} completed and users notified", notice.recording_id),
            Err(e) => error!(
                "Failed to post completion for recording {}: {}",
                notice.recording_id, e
            ),
        }
    }

    async fn recording_failed(&self, notice: &FailedNotice) {
        let embed = CreateEmbed::new()
            .title("Recording Error")
            .description(format!(
                "Failed to process recording #{}. Please try again.",
                notice.recording_id
            ))
            .colour(Colour::RED);

        if let Err(e) = notice
            .text_channel_id
            .send_message(&self.http, CreateMessage::new().embed(embed))
            .await
        {
            error!(
                "Failed to post failure for recording {}: {}",
                notice.recording_id, e
            );
        }
    }
}

/// `m:ss`
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{}:{:02}", total / 60, total % 60)
}

/// Size in megabytes with one decimal
pub fn format_size(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
}

pub fn format_participants(participants: &[String]) -> String {
    if participants.is_empty() {
        "None".to_string()
    } else {
        participants.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatting() {
        assert_eq!(format_duration(90.0), "1:30");
        assert_eq!(format_duration(59.6), "1:00");
        assert_eq!(format_duration(-3.0), "0:00");
        assert_eq!(format_size(3 * 1024 * 1024 / 2), "1.5 MB");
        assert_eq!(format_participants(&[]), "None");
        assert_eq!(
            format_participants(&["Ann".to_string(), "Bo".to_string()]),
            "Ann, Bo"
        );
    }
}
