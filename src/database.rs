//! Database management for recording metadata and download tokens
//!
//! Uses SQLite to persist recordings across restarts

use crate::tokens::DownloadToken;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Lock error")]
    LockError,
}

/// Durable status of a recording row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingStatus {
    Recording,
    Processing,
    Completed,
    Failed,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingStatus::Recording => "recording",
            RecordingStatus::Processing => "processing",
            RecordingStatus::Completed => "completed",
            RecordingStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "recording" => Some(RecordingStatus::Recording),
            "processing" => Some(RecordingStatus::Processing),
            "completed" => Some(RecordingStatus::Completed),
            "failed" => Some(RecordingStatus::Failed),
            _ => None,
        }
    }
}

/// Metadata captured when a recording starts
#[derive(Debug, Clone)]
pub struct NewRecording {
    pub guild_id: u64,
    pub channel_id: u64,
    pub channel_name: String,
    pub started_by: u64,
    pub started_by_name: String,
    pub started_at: DateTime<Utc>,
}

/// A recording row
#[derive(Debug, Clone)]
pub struct RecordingRecord {
    pub id: i64,
    pub guild_id: u64,
    pub channel_id: u64,
    pub channel_name: String,
    pub started_by: u64,
    pub started_by_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    pub participants: Vec<String>,
    pub status: RecordingStatus,
}

const RECORDING_COLUMNS: &str = "id, guild_id, channel_id, channel_name, started_by, started_by_name, \
     start_time, end_time, duration, file_path, file_size, participants, status";

impl RecordingRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let participants: Option<String> = row.get(11)?;
        let status: String = row.get(12)?;
        Ok(Self {
            id: row.get(0)?,
            guild_id: row.get(1)?,
            channel_id: row.get(2)?,
            channel_name: row.get(3)?,
            started_by: row.get(4)?,
            started_by_name: row.get(5)?,
            start_time: row.get(6)?,
            end_time: row.get(7)?,
            duration: row.get(8)?,
            file_path: row.get(9)?,
            file_size: row.get(10)?,
            participants: participants
                .and_then(|p| serde_json::from_str(&p).ok())
                .unwrap_or_default(),
            status: RecordingStatus::from_str(&status).unwrap_or(RecordingStatus::Failed),
        })
    }
}

/// Database connection wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Initialize database tables
    fn init(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS recordings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                guild_id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                channel_name TEXT NOT NULL,
                started_by INTEGER NOT NULL,
                started_by_name TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration INTEGER,
                file_path TEXT,
                file_size INTEGER,
                participants TEXT,
                status TEXT NOT NULL DEFAULT 'recording',
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_recordings_guild
                ON recordings (guild_id, start_time DESC);
            CREATE TABLE IF NOT EXISTS download_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT UNIQUE NOT NULL,
                recording_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                expires_at TEXT NOT NULL,
                used_at TEXT,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (recording_id) REFERENCES recordings (id)
            );",
        )?;
        Ok(())
    }

    /// Insert a new recording (status = recording) and return its ID
    pub fn create_recording(&self, meta: &NewRecording) -> Result<i64, DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute(
            "INSERT INTO recordings (guild_id, channel_id, channel_name, started_by,
                                     started_by_name, start_time, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                meta.guild_id,
                meta.channel_id,
                meta.channel_name,
                meta.started_by,
                meta.started_by_name,
                meta.started_at,
                RecordingStatus::Recording.as_str(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(
            "Created recording {} in guild {}, channel {}",
            id, meta.guild_id, meta.channel_id
        );
        Ok(id)
    }

    pub fn set_status(&self, id: i64, status: RecordingStatus) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute(
            "UPDATE recordings SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Write the completion fields in a single statement
    pub fn complete_recording(
        &self,
        id: i64,
        file_path: &Path,
        file_size: u64,
        participants: &[String],
        duration_seconds: i64,
    ) -> Result<(), DatabaseError> {
        let participants = serde_json::to_string(participants).unwrap_or_else(|_| "[]".into());
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute(
            "UPDATE recordings
             SET end_time = ?1, file_path = ?2, file_size = ?3, participants = ?4,
                 duration = ?5, status = ?6, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?7",
            params![
                Utc::now(),
                file_path.to_string_lossy(),
                file_size,
                participants,
                duration_seconds,
                RecordingStatus::Completed.as_str(),
                id,
            ],
        )?;
        info!("Recording {} finished successfully", id);
        Ok(())
    }

    /// Mark a recording as failed. Completion fields stay empty.
    pub fn fail_recording(&self, id: i64, participants: &[String]) -> Result<(), DatabaseError> {
        let participants = serde_json::to_string(participants).unwrap_or_else(|_| "[]".into());
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute(
            "UPDATE recordings
             SET end_time = ?1, participants = ?2, status = ?3,
                 file_path = NULL, file_size = NULL, duration = NULL,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?4",
            params![
                Utc::now(),
                participants,
                RecordingStatus::Failed.as_str(),
                id
            ],
        )?;
        Ok(())
    }

    /// Fail rows left mid-flight by a previous process
    pub fn fail_interrupted_recordings(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        let count = conn.execute(
            "UPDATE recordings SET status = ?1, updated_at = CURRENT_TIMESTAMP
             WHERE status IN (?2, ?3)",
            params![
                RecordingStatus::Failed.as_str(),
                RecordingStatus::Recording.as_str(),
                RecordingStatus::Processing.as_str(),
            ],
        )?;
        Ok(count)
    }

    /// Get recording by ID
    pub fn get_recording(&self, id: i64) -> Result<Option<RecordingRecord>, DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM recordings WHERE id = ?1", RECORDING_COLUMNS),
                [id],
                RecordingRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Recordings for a guild, newest first
    pub fn list_by_guild(
        &self,
        guild_id: u64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RecordingRecord>, DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM recordings WHERE guild_id = ?1
             ORDER BY start_time DESC, id DESC LIMIT ?2 OFFSET ?3",
            RECORDING_COLUMNS
        ))?;
        let rows = stmt.query_map(params![guild_id, limit, offset], RecordingRecord::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Persist an issued download token
    pub fn create_token(&self, token: &DownloadToken) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute(
            "INSERT INTO download_tokens (token, recording_id, user_id, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                token.token,
                token.recording_id,
                token.requester_id,
                token.expires_at,
                token.issued_at,
            ],
        )?;
        info!(
            "Created download token for recording {}, user {}",
            token.recording_id, token.requester_id
        );
        Ok(())
    }

    /// Record the first successful use of a token
    pub fn mark_token_used(&self, token: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        conn.execute(
            "UPDATE download_tokens SET used_at = ?1 WHERE token = ?2 AND used_at IS NULL",
            params![at, token],
        )?;
        Ok(())
    }

    /// Remove expired download tokens
    pub fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockError)?;
        let count = conn.execute("DELETE FROM download_tokens WHERE expires_at < ?1", [now])?;
        Ok(count)
    }

    #[cfg(test)]
    pub(crate) fn token_used_at(&self, token: &str) -> Option<DateTime<Utc>> {
        let conn = self.conn.lock().ok()?;
        conn.query_row(
            "SELECT used_at FROM download_tokens WHERE token = ?1",
            [token],
            |row| row.get(0),
        )
        .ok()
        .flatten()
    }
}
