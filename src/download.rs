//! Download link issuing and redemption
//!
//! Glues the token broker to the recordings table: access checks happen when
//! a link is requested, path checks happen when it is redeemed.

use crate::database::{Database, DatabaseError, RecordingStatus};
use crate::tokens::{ResolvedToken, TokenBroker, TokenError};
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Recording not found")]
    RecordingNotFound,
    #[error("Recording belongs to another server")]
    Forbidden,
    #[error("Recording is not completed")]
    NotCompleted,
    #[error("Recording file is missing")]
    FileMissing,
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone)]
pub struct DownloadLink {
    pub recording_id: i64,
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub file_size: Option<u64>,
    pub duration_seconds: Option<i64>,
}

pub struct DownloadService {
    db: Arc<Database>,
    broker: Arc<TokenBroker>,
    base_url: String,
    ttl: Duration,
}

impl DownloadService {
    pub fn new(db: Arc<Database>, broker: Arc<TokenBroker>, base_url: &str, ttl: Duration) -> Self {
        Self {
            db,
            broker,
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl,
        }
    }

    /// Issue a link for `recording_id`.
    ///
    /// The requester must be in the recording's guild or have started it.
    pub fn request_link(
        &self,
        recording_id: i64,
        guild_id: u64,
        requester_id: u64,
    ) -> Result<DownloadLink, DownloadError> {
        let recording = self
            .db
            .get_recording(recording_id)?
            .ok_or(DownloadError::RecordingNotFound)?;

        if recording.guild_id != guild_id && recording.started_by != requester_id {
            return Err(DownloadError::Forbidden);
        }
        if recording.status != RecordingStatus::Completed {
            return Err(DownloadError::NotCompleted);
        }

        let file_path = recording
            .file_path
            .map(PathBuf::from)
            .filter(|p| p.is_file())
            .ok_or(DownloadError::FileMissing)?;

        let token = self
            .broker
            .issue(recording_id, file_path, requester_id, self.ttl);
        self.db.create_token(&token)?;

        Ok(DownloadLink {
            recording_id,
            url: format!("{}/download/{}", self.base_url, token.token),
            expires_at: token.expires_at,
            file_size: recording.file_size,
            duration_seconds: recording.duration,
        })
    }

    /// Redeem a token for the file it grants
    pub async fn redeem(&self, token: &str) -> Result<ResolvedToken, TokenError> {
        let resolved = self.broker.resolve(token).await?;
        if let Err(e) = self.db.mark_token_used(token, Utc::now()) {
            warn!("Failed to record token use: {}", e);
        }
        debug!("Redeemed token for recording {}", resolved.recording_id);
        Ok(resolved)
    }

    /// Purge expired tokens from memory and storage
    pub fn purge_expired(&self) -> usize {
        let purged = self.broker.purge_expired();
        debug!("{} download token(s) still active", self.broker.len());
        if let Err(e) = self.db.purge_expired_tokens(Utc::now()) {
            warn!("Failed to purge stored tokens: {}", e);
        }
        purged
    }

    /// Periodically purge expired tokens
    pub fn spawn_cleanup_task(self: Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    info!("Cleaned up {} expired download token(s)", purged);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::NewRecording;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _temp: TempDir,
        db: Arc<Database>,
        service: DownloadService,
        root: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().unwrap();
        let root = temp.path().join("recordings");
        let db = Arc::new(Database::open(":memory:").unwrap());
        let broker = Arc::new(TokenBroker::new(&root, false).unwrap());
        let service = DownloadService::new(
            db.clone(),
            broker,
            "https://rec.example.com/",
            Duration::hours(1),
        );
        Fixture {
            _temp: temp,
            db,
            service,
            root,
        }
    }

    fn recording(db: &Database, guild_id: u64, started_by: u64) -> i64 {
        db.create_recording(&NewRecording {
            guild_id,
            channel_id: 5,
            channel_name: "voice".to_string(),
            started_by,
            started_by_name: "Ann".to_string(),
            started_at: Utc::now(),
        })
        .unwrap()
    }

    fn complete(db: &Database, id: i64, path: &Path) {
        db.complete_recording(id, path, 8, &["Ann".to_string()], 30)
            .unwrap();
    }

    #[tokio::test]
    async fn test_link_round_trip() {
        let f = fixture();
        let id = recording(&f.db, 10, 1);
        let file = f.root.join(format!("recording_{}.mp3", id));
        std::fs::write(&file, b"mp3 data").unwrap();
        complete(&f.db, id, &file);

        let link = f.service.request_link(id, 10, 2).unwrap();
        let token = link
            .url
            .strip_prefix("https://rec.example.com/download/")
            .unwrap();
        assert_eq!(token.len(), 43);

        let resolved = f.service.redeem(token).await.unwrap();
        assert_eq!(resolved.recording_id, id);
        assert!(f.db.token_used_at(token).is_some());
    }

    #[test]
    fn test_access_checks() {
        let f = fixture();

        assert!(matches!(
            f.service.request_link(999, 10, 1),
            Err(DownloadError::RecordingNotFound)
        ));

        let id = recording(&f.db, 10, 1);
        let file = f.root.join("recording_x.mp3");

        // Another guild, not the initiator
        assert!(matches!(
            f.service.request_link(id, 11, 2),
            Err(DownloadError::Forbidden)
        ));
        // Initiator from anywhere gets past the guild check
        assert!(matches!(
            f.service.request_link(id, 11, 1),
            Err(DownloadError::NotCompleted)
        ));

        complete(&f.db, id, &file);
        assert!(matches!(
            f.service.request_link(id, 10, 2),
            Err(DownloadError::FileMissing)
        ));

        std::fs::write(&file, b"mp3 data").unwrap();
        assert!(f.service.request_link(id, 10, 2).is_ok());
    }

    #[test]
    fn test_failed_recording_not_downloadable() {
        let f = fixture();
        let id = recording(&f.db, 10, 1);
        f.db.fail_recording(id, &[]).unwrap();

        assert!(matches!(
            f.service.request_link(id, 10, 1),
            Err(DownloadError::NotCompleted)
        ));
    }
}
