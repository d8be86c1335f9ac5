//! Voice gateway: joining channels and feeding received audio into a capture

use crate::audio::TrackCapture;
use async_trait::async_trait;
use parking_lot::RwLock;
use serenity::all::{ChannelId, GuildId, UserId};
use songbird::error::JoinError;
use songbird::events::{Event, EventContext, EventHandler as VoiceEventHandler};
use songbird::{CoreEvent, Songbird};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Failed to join voice channel: {0}")]
    Join(String),
    #[error("Failed to leave voice channel: {0}")]
    Leave(String),
}

/// Events the gateway reports back to the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEvent {
    /// The voice connection for a guild dropped without being asked to
    Disconnected(GuildId),
}

/// Voice connection collaborator used by the session manager
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Join `channel_id` and route received audio into `capture`
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        capture: Arc<TrackCapture>,
    ) -> Result<(), GatewayError>;

    /// Leave the guild's voice channel
    async fn disconnect(&self, guild_id: GuildId) -> Result<(), GatewayError>;
}

/// Songbird-backed gateway
pub struct SongbirdGateway {
    songbird: Arc<Songbird>,
    events: mpsc::UnboundedSender<GatewayEvent>,
}

impl SongbirdGateway {
    pub fn new(songbird: Arc<Songbird>, events: mpsc::UnboundedSender<GatewayEvent>) -> Self {
        Self { songbird, events }
    }
}

#[async_trait]
impl VoiceGateway for SongbirdGateway {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        capture: Arc<TrackCapture>,
    ) -> Result<(), GatewayError> {
        let call = self
            .songbird
            .join(guild_id, channel_id)
            .await
            .map_err(|e| GatewayError::Join(e.to_string()))?;

        let mut handler = call.lock().await;
        handler.remove_all_global_events();

        let receiver = VoiceReceiver::new(capture);
        handler.add_global_event(CoreEvent::SpeakingStateUpdate.into(), receiver.clone());
        handler.add_global_event(CoreEvent::VoiceTick.into(), receiver);
        handler.add_global_event(
            CoreEvent::DriverDisconnect.into(),
            DisconnectWatcher {
                guild_id,
                events: self.events.clone(),
            },
        );

        info!("Joined voice channel {} in guild {}", channel_id, guild_id);
        Ok(())
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), GatewayError> {
        match self.songbird.remove(guild_id).await {
            Ok(()) | Err(JoinError::NoCall) => {
                info!("Left voice channel in guild {}", guild_id);
                Ok(())
            }
            Err(e) => Err(GatewayError::Leave(e.to_string())),
        }
    }
}

/// Voice receive event handler
///
/// Maps SSRCs to users and forwards every 20ms tick to the capture, writing
/// silence for known participants who were quiet during the tick.
#[derive(Clone)]
pub struct VoiceReceiver {
    capture: Arc<TrackCapture>,
    ssrc_users: Arc<RwLock<HashMap<u32, UserId>>>,
}

impl VoiceReceiver {
    pub fn new(capture: Arc<TrackCapture>) -> Self {
        Self {
            capture,
            ssrc_users: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn participant(&self, ssrc: u32) -> UserId {
        self.ssrc_users
            .read()
            .get(&ssrc)
            .copied()
            // Use SSRC as temporary User ID until the speaking update arrives
            .unwrap_or_else(|| UserId::new(u64::from(ssrc).max(1)))
    }
}

#[async_trait]
impl VoiceEventHandler for VoiceReceiver {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::SpeakingStateUpdate(speaking) => {
                if let Some(user) = speaking.user_id {
                    if user.0 != 0 {
                        debug!("SSRC {} belongs to user {}", speaking.ssrc, user.0);
                        self.ssrc_users
                            .write()
                            .insert(speaking.ssrc, UserId::new(user.0));
                    }
                }
            }
            EventContext::VoiceTick(tick) => {
                let tick_samples = self.capture.tick_samples();
                for (ssrc, data) in &tick.speaking {
                    let participant = self.participant(*ssrc);
                    match &data.decoded_voice {
                        Some(pcm) => self.capture.push_frame(participant, pcm),
                        None => self.capture.push_silence(participant, tick_samples),
                    }
                }
                for ssrc in &tick.silent {
                    self.capture
                        .push_silence(self.participant(*ssrc), tick_samples);
                }
            }
            _ => {}
        }

        None
    }
}

/// Reports driver disconnects to the session layer
struct DisconnectWatcher {
    guild_id: GuildId,
    events: mpsc::UnboundedSender<GatewayEvent>,
}

#[async_trait]
impl VoiceEventHandler for DisconnectWatcher {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::DriverDisconnect(_) = ctx {
            warn!("Voice driver disconnected in guild {}", self.guild_id);
            let _ = self.events.send(GatewayEvent::Disconnected(self.guild_id));
        }
        None
    }
}
