//! Session management for guild recording sessions
//!
//! One live recording per guild. Each guild owns a slot guarded by an async
//! mutex; the lock is held only while a session changes state, never while
//! the mixdown runs.

use crate::audio::{
    CaptureError, CaptureFormat, MixdownPipeline, MixdownResult, PipelineError, TrackCapture,
    TrackSet, WorkDir,
};
use crate::database::{Database, DatabaseError, NewRecording, RecordingStatus};
use crate::notify::{CompletedNotice, FailedNotice, Notifier};
use crate::voice::{GatewayError, VoiceGateway};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serenity::all::{ChannelId, GuildId, UserId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Already recording in this server")]
    AlreadyRecording,
    #[error("Not currently recording")]
    NotRecording,
    #[error("Only the user who started the recording or moderators can stop it")]
    Forbidden,
    #[error("Processing failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("Voice error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timed out waiting for the session to finish")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Recording,
    Stopping,
    Processing,
    Completed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Recording => "recording",
            SessionState::Stopping => "stopping",
            SessionState::Processing => "processing",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        }
    }
}

/// A live recording in a guild
pub struct Session {
    /// Recording row ID
    pub id: i64,
    pub guild_id: GuildId,
    pub voice_channel_id: ChannelId,
    /// Channel outcome notices are posted to
    pub text_channel_id: ChannelId,
    pub channel_name: String,
    pub started_by: UserId,
    pub started_by_name: String,
    pub started_at: DateTime<Utc>,
    /// Display names of the people in the channel
    pub participants: Vec<String>,
    pub state: SessionState,
    /// Filled once capture has ended
    pub track_paths: TrackSet,
    capture: Arc<TrackCapture>,
    /// Dropping the session removes the working directory
    workdir: WorkDir,
}

/// Everything needed to begin a recording
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub guild_id: GuildId,
    pub voice_channel_id: ChannelId,
    pub text_channel_id: ChannelId,
    pub channel_name: String,
    pub started_by: UserId,
    pub started_by_name: String,
    pub participants: Vec<String>,
}

/// Who is asking to stop a recording
#[derive(Debug, Clone, Copy)]
pub struct Requester {
    pub user_id: UserId,
    /// Holds a moderation permission in the guild
    pub elevated: bool,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub temp_root: PathBuf,
    pub capture_format: CaptureFormat,
    pub shutdown_timeout: Duration,
    pub max_duration: Option<Duration>,
}

/// Read-only view of a live session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: i64,
    pub voice_channel_id: ChannelId,
    pub channel_name: String,
    pub started_by: UserId,
    pub started_by_name: String,
    pub started_at: DateTime<Utc>,
    pub participants: Vec<String>,
    pub state: SessionState,
    pub track_count: usize,
}

/// What ended a session
#[derive(Debug, Clone, Copy)]
enum Trigger<'a> {
    User(&'a Requester),
    Forced,
    TimeLimit(i64),
}

type Slot = Arc<Mutex<Option<Session>>>;

/// Session manager for all guilds
pub struct SessionManager {
    sessions: DashMap<GuildId, Slot>,
    settings: SessionSettings,
    db: Arc<Database>,
    gateway: Arc<dyn VoiceGateway>,
    pipeline: Arc<MixdownPipeline>,
    notifier: Arc<dyn Notifier>,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        db: Arc<Database>,
        gateway: Arc<dyn VoiceGateway>,
        pipeline: Arc<MixdownPipeline>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            settings,
            db,
            gateway,
            pipeline,
            notifier,
        }
    }

    /// The guild's slot. Slots are created on demand and never removed.
    fn slot(&self, guild_id: GuildId) -> Slot {
        self.sessions.entry(guild_id).or_default().value().clone()
    }

    fn existing_slot(&self, guild_id: GuildId) -> Option<Slot> {
        self.sessions.get(&guild_id).map(|s| s.value().clone())
    }

    /// Begin recording. Returns the new recording ID.
    pub async fn start_session(self: &Arc<Self>, request: StartRequest) -> Result<i64, SessionError> {
        let guild_id = request.guild_id;
        let slot = self.slot(guild_id);
        let mut guard = slot.lock().await;
        if guard.is_some() {
            return Err(SessionError::AlreadyRecording);
        }

        let started_at = Utc::now();
        let id = self.db.create_recording(&NewRecording {
            guild_id: guild_id.get(),
            channel_id: request.voice_channel_id.get(),
            channel_name: request.channel_name.clone(),
            started_by: request.started_by.get(),
            started_by_name: request.started_by_name.clone(),
            started_at,
        })?;

        let (workdir, capture) = match self.begin_capture(id, &request).await {
            Ok(started) => started,
            Err(e) => {
                error!("Failed to start recording {} in guild {}: {}", id, guild_id, e);
                self.mark_failed(id, &request.participants);
                return Err(e);
            }
        };

        *guard = Some(Session {
            id,
            guild_id,
            voice_channel_id: request.voice_channel_id,
            text_channel_id: request.text_channel_id,
            channel_name: request.channel_name,
            started_by: request.started_by,
            started_by_name: request.started_by_name,
            started_at,
            participants: request.participants,
            state: SessionState::Recording,
            track_paths: TrackSet::new(),
            capture,
            workdir,
        });
        drop(guard);

        if let Some(limit) = self.settings.max_duration {
            self.spawn_time_limit(guild_id, id, limit);
        }

        info!("Started recording {} in guild {}", id, guild_id);
        Ok(id)
    }

    /// Working directory, capture actor and voice connection, in that order.
    /// Anything created before a failure is released on return.
    async fn begin_capture(
        &self,
        id: i64,
        request: &StartRequest,
    ) -> Result<(WorkDir, Arc<TrackCapture>), SessionError> {
        let workdir = WorkDir::create(&self.settings.temp_root, id)?;
        let capture = Arc::new(TrackCapture::start(
            workdir.capture_dir(),
            self.settings.capture_format,
        )?);
        self.gateway
            .connect(request.guild_id, request.voice_channel_id, capture.clone())
            .await?;
        Ok((workdir, capture))
    }

    fn spawn_time_limit(self: &Arc<Self>, guild_id: GuildId, id: i64, limit: Duration) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            match manager.finish(guild_id, Trigger::TimeLimit(id)).await {
                Ok(_) => info!("Recording {} stopped at the time limit", id),
                Err(SessionError::NotRecording) => {}
                Err(e) => warn!("Recording {} failed after the time limit: {}", id, e),
            }
        });
    }

    /// Replace the participant list of the guild's live recording
    pub async fn update_participants(&self, guild_id: GuildId, participants: Vec<String>) {
        let Some(slot) = self.existing_slot(guild_id) else {
            return;
        };
        let mut guard = slot.lock().await;
        if let Some(session) = guard.as_mut() {
            if session.state == SessionState::Recording {
                debug!(
                    "Recording {} participants: {}",
                    session.id,
                    participants.join(", ")
                );
                session.participants = participants;
            }
        }
    }

    /// Stop on behalf of a user and produce the mixdown
    pub async fn stop_session(
        &self,
        guild_id: GuildId,
        requester: &Requester,
    ) -> Result<MixdownResult, SessionError> {
        self.finish(guild_id, Trigger::User(requester)).await
    }

    /// Stop without a permission check (voice disconnects, time limit)
    pub async fn force_stop(&self, guild_id: GuildId) -> Result<MixdownResult, SessionError> {
        self.finish(guild_id, Trigger::Forced).await
    }

    async fn finish(
        &self,
        guild_id: GuildId,
        trigger: Trigger<'_>,
    ) -> Result<MixdownResult, SessionError> {
        let slot = self
            .existing_slot(guild_id)
            .ok_or(SessionError::NotRecording)?;

        let (id, capture, work_path) = {
            let mut guard = slot.lock().await;
            let session = guard.as_mut().ok_or(SessionError::NotRecording)?;
            if session.state != SessionState::Recording {
                return Err(SessionError::NotRecording);
            }
            match trigger {
                Trigger::User(requester) => {
                    if requester.user_id != session.started_by && !requester.elevated {
                        return Err(SessionError::Forbidden);
                    }
                }
                Trigger::TimeLimit(id) if id != session.id => {
                    return Err(SessionError::NotRecording);
                }
                _ => {}
            }
            session.state = SessionState::Stopping;
            (
                session.id,
                session.capture.clone(),
                session.workdir.path().to_path_buf(),
            )
        };
        info!("Stopping recording {} in guild {} ({:?})", id, guild_id, trigger);

        let result = self
            .capture_and_mix(&slot, id, guild_id, &capture, &work_path)
            .await;

        let session = {
            let mut guard = slot.lock().await;
            if guard.as_ref().map(|s| s.id) == Some(id) {
                guard.take()
            } else {
                None
            }
        };
        let Some(mut session) = session else {
            warn!("Recording {} was abandoned while processing", id);
            if let Ok(mix) = &result {
                discard_output(&mix.output_path).await;
            }
            return Err(SessionError::Timeout);
        };

        let result = match result {
            Ok(mix) => self
                .db
                .complete_recording(
                    id,
                    &mix.output_path,
                    mix.file_size_bytes,
                    &session.participants,
                    mix.duration_seconds.round() as i64,
                )
                .map(|()| mix)
                .map_err(SessionError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(mix) => {
                session.state = SessionState::Completed;
                self.notifier
                    .recording_completed(&CompletedNotice {
                        recording_id: id,
                        text_channel_id: session.text_channel_id,
                        participants: session.participants.clone(),
                        duration_seconds: mix.duration_seconds,
                        file_size_bytes: mix.file_size_bytes,
                    })
                    .await;
                Ok(mix)
            }
            Err(e) => {
                session.state = SessionState::Failed;
                error!("Recording {} failed: {}", id, e);
                discard_output(&self.pipeline.settings().output_path(id)).await;
                self.mark_failed(id, &session.participants);
                self.notifier
                    .recording_failed(&FailedNotice {
                        recording_id: id,
                        text_channel_id: session.text_channel_id,
                    })
                    .await;
                Err(e)
            }
        }
        // `session` drops here and takes the working directory with it
    }

    /// Disconnect, collect the tracks and run the mixdown
    async fn capture_and_mix(
        &self,
        slot: &Slot,
        id: i64,
        guild_id: GuildId,
        capture: &TrackCapture,
        work_path: &Path,
    ) -> Result<MixdownResult, SessionError> {
        if let Err(e) = self.gateway.disconnect(guild_id).await {
            warn!("Failed to leave voice in guild {}: {}", guild_id, e);
        }

        let tracks = capture.finish().await?;
        {
            let mut guard = slot.lock().await;
            if let Some(session) = guard.as_mut().filter(|s| s.id == id) {
                session.state = SessionState::Processing;
                session.track_paths = tracks.clone();
            }
        }
        self.db.set_status(id, RecordingStatus::Processing)?;

        Ok(self.pipeline.mixdown(id, &tracks, work_path).await?)
    }

    /// Stop the guild's session within the shutdown timeout.
    ///
    /// If it does not finish in time the in-flight work is dropped, which
    /// kills running tools, and the session is recorded as failed.
    pub async fn cancel(&self, guild_id: GuildId) -> Result<(), SessionError> {
        let stop = async {
            match self.force_stop(guild_id).await {
                Ok(_) => Ok(()),
                // Someone else is already stopping it
                Err(SessionError::NotRecording) => {
                    self.wait_idle(guild_id).await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        match tokio::time::timeout(self.settings.shutdown_timeout, stop).await {
            Ok(result) => result,
            Err(_) => {
                self.abandon(guild_id).await;
                Err(SessionError::Timeout)
            }
        }
    }

    async fn wait_idle(&self, guild_id: GuildId) {
        let Some(slot) = self.existing_slot(guild_id) else {
            return;
        };
        while slot.lock().await.is_some() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Evict the session and record it as failed without processing
    async fn abandon(&self, guild_id: GuildId) {
        let Some(slot) = self.existing_slot(guild_id) else {
            return;
        };
        let Some(mut session) = slot.lock().await.take() else {
            return;
        };
        session.state = SessionState::Failed;
        error!("Abandoned recording {} in guild {}", session.id, guild_id);

        if let Err(e) = self.gateway.disconnect(guild_id).await {
            warn!("Failed to leave voice in guild {}: {}", guild_id, e);
        }
        discard_output(&self.pipeline.settings().output_path(session.id)).await;
        self.mark_failed(session.id, &session.participants);
        self.notifier
            .recording_failed(&FailedNotice {
                recording_id: session.id,
                text_channel_id: session.text_channel_id,
            })
            .await;
    }

    /// Cancel every live session concurrently
    pub async fn shutdown(self: &Arc<Self>) {
        let guilds = self.live_guilds().await;
        if guilds.is_empty() {
            return;
        }
        info!("Stopping {} active recording(s)", guilds.len());

        let mut tasks = JoinSet::new();
        for guild_id in guilds {
            let manager = self.clone();
            tasks.spawn(async move { (guild_id, manager.cancel(guild_id).await) });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((guild_id, Err(e))) => warn!("Recording in guild {} ended with: {}", guild_id, e),
                Ok(_) => {}
                Err(e) => error!("Shutdown task panicked: {}", e),
            }
        }
    }

    pub async fn status(&self, guild_id: GuildId) -> Option<SessionSnapshot> {
        let slot = self.existing_slot(guild_id)?;
        let guard = slot.lock().await;
        guard.as_ref().map(|s| SessionSnapshot {
            id: s.id,
            voice_channel_id: s.voice_channel_id,
            channel_name: s.channel_name.clone(),
            started_by: s.started_by,
            started_by_name: s.started_by_name.clone(),
            started_at: s.started_at,
            participants: s.participants.clone(),
            state: s.state,
            track_count: s.track_paths.len(),
        })
    }

    /// Voice channel of the guild's live recording
    pub async fn recorded_channel(&self, guild_id: GuildId) -> Option<ChannelId> {
        self.status(guild_id).await.map(|s| s.voice_channel_id)
    }

    /// Guilds with a session in any non-terminal state
    pub async fn live_guilds(&self) -> Vec<GuildId> {
        let slots: Vec<(GuildId, Slot)> = self
            .sessions
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut live = Vec::new();
        for (guild_id, slot) in slots {
            if slot.lock().await.is_some() {
                live.push(guild_id);
            }
        }
        live
    }

    fn mark_failed(&self, id: i64, participants: &[String]) {
        if let Err(e) = self.db.fail_recording(id, participants) {
            error!("Failed to mark recording {} as failed: {}", id, e);
        }
    }
}

async fn discard_output(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed output {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove output {:?}: {}", path, e),
    }
}
