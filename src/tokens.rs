//! Download token broker
//!
//! Issues short-lived opaque tokens that map to a finished recording file.
//! Tokens live in memory; the database only keeps an audit copy.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Random bytes per token (256 bits)
const TOKEN_BYTES: usize = 32;

/// Every resolution failure looks the same to the caller
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("Not found")]
    NotFound,
}

#[derive(Debug, Clone)]
pub struct DownloadToken {
    pub token: String,
    pub recording_id: i64,
    pub requester_id: u64,
    pub file_path: PathBuf,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl DownloadToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// A token that passed every check
#[derive(Debug, Clone)]
pub struct ResolvedToken {
    pub recording_id: i64,
    /// Canonical path, guaranteed to be a regular file under the recordings root
    pub file_path: PathBuf,
}

pub struct TokenBroker {
    root: PathBuf,
    tokens: DashMap<String, DownloadToken>,
    single_use: bool,
}

impl TokenBroker {
    /// Create a broker serving files under `root`. The directory is created
    /// if needed so it can be canonicalized.
    pub fn new<P: AsRef<Path>>(root: P, single_use: bool) -> io::Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        Ok(Self {
            root,
            tokens: DashMap::new(),
            single_use,
        })
    }

    pub fn issue(
        &self,
        recording_id: i64,
        file_path: PathBuf,
        requester_id: u64,
        ttl: Duration,
    ) -> DownloadToken {
        self.issue_at(recording_id, file_path, requester_id, ttl, Utc::now())
    }

    pub fn issue_at(
        &self,
        recording_id: i64,
        file_path: PathBuf,
        requester_id: u64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> DownloadToken {
        let token = loop {
            let candidate = generate_token();
            if !self.tokens.contains_key(&candidate) {
                break candidate;
            }
        };

        let issued = DownloadToken {
            token: token.clone(),
            recording_id,
            requester_id,
            file_path,
            issued_at: now,
            expires_at: now + ttl,
            used_at: None,
        };
        self.tokens.insert(token, issued.clone());

        info!(
            "Issued download token for recording {} to user {} (expires {})",
            recording_id, requester_id, issued.expires_at
        );
        issued
    }

    pub async fn resolve(&self, token: &str) -> Result<ResolvedToken, TokenError> {
        self.resolve_at(token, Utc::now()).await
    }

    pub async fn resolve_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<ResolvedToken, TokenError> {
        // Clone out of the map; no shard lock may be held across an await.
        let entry = self
            .tokens
            .get(token)
            .map(|t| t.value().clone())
            .ok_or(TokenError::NotFound)?;

        if entry.is_expired_at(now) {
            self.tokens.remove_if(token, |_, t| t.is_expired_at(now));
            debug!("Evicted expired token for recording {}", entry.recording_id);
            return Err(TokenError::NotFound);
        }

        let canonical = tokio::fs::canonicalize(&entry.file_path)
            .await
            .map_err(|_| TokenError::NotFound)?;
        if !canonical.starts_with(&self.root) {
            warn!(
                "Rejected token for recording {}: {:?} is outside the recordings root",
                entry.recording_id, canonical
            );
            return Err(TokenError::NotFound);
        }

        match tokio::fs::metadata(&canonical).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(TokenError::NotFound),
        }

        if self.single_use {
            // Losing a race with another resolver means the token is spent.
            self.tokens.remove(token).ok_or(TokenError::NotFound)?;
        } else if let Some(mut live) = self.tokens.get_mut(token) {
            if live.used_at.is_none() {
                live.used_at = Some(now);
            }
        }

        Ok(ResolvedToken {
            recording_id: entry.recording_id,
            file_path: canonical,
        })
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    /// Remove every token with `expires_at < now`
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut purged = 0;
        self.tokens.retain(|_, t| {
            let keep = !t.is_expired_at(now);
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[cfg(test)]
    fn get(&self, token: &str) -> Option<DownloadToken> {
        self.tokens.get(token).map(|t| t.value().clone())
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::{tempdir, TempDir};

    fn setup(single_use: bool) -> (TempDir, TokenBroker, PathBuf) {
        let temp = tempdir().unwrap();
        let root = temp.path().join("recordings");
        let broker = TokenBroker::new(&root, single_use).unwrap();
        let file = root.join("recording_1.mp3");
        std::fs::write(&file, b"mp3 data").unwrap();
        (temp, broker, file)
    }

    #[tokio::test]
    async fn test_resolve_valid_token() {
        let (_temp, broker, file) = setup(false);
        let now = Utc::now();
        let issued = broker.issue_at(1, file.clone(), 42, Duration::hours(1), now);

        assert_eq!(issued.token.len(), 43);
        assert!(!issued.token.contains('='));
        assert_eq!(issued.expires_at, now + Duration::hours(1));

        let resolved = broker.resolve_at(&issued.token, now).await.unwrap();
        assert_eq!(resolved.recording_id, 1);
        assert_eq!(resolved.file_path, std::fs::canonicalize(&file).unwrap());
        assert_eq!(broker.get(&issued.token).unwrap().used_at, Some(now));

        // Reusable until expiry; used_at keeps the first use.
        let later = now + Duration::minutes(5);
        broker.resolve_at(&issued.token, later).await.unwrap();
        assert_eq!(broker.get(&issued.token).unwrap().used_at, Some(now));
    }

    #[tokio::test]
    async fn test_failures_are_indistinguishable() {
        let (temp, broker, file) = setup(false);
        let now = Utc::now();

        let unknown = broker.resolve_at("no-such-token", now).await.unwrap_err();

        let stale = broker.issue_at(1, file, 42, Duration::seconds(10), now);
        let expired = broker
            .resolve_at(&stale.token, now + Duration::seconds(11))
            .await
            .unwrap_err();
        // Lazily evicted
        assert!(broker.get(&stale.token).is_none());

        let outside = temp.path().join("secret.txt");
        std::fs::write(&outside, b"secret").unwrap();
        let escape = broker.issue_at(
            1,
            temp.path().join("recordings").join("..").join("secret.txt"),
            42,
            Duration::hours(1),
            now,
        );
        let traversal = broker.resolve_at(&escape.token, now).await.unwrap_err();

        assert_eq!(unknown, TokenError::NotFound);
        assert_eq!(expired, unknown);
        assert_eq!(traversal, unknown);
        assert_eq!(expired.to_string(), traversal.to_string());
    }

    #[tokio::test]
    async fn test_expiry_is_strict() {
        let (_temp, broker, file) = setup(false);
        let now = Utc::now();
        let issued = broker.issue_at(1, file, 42, Duration::seconds(10), now);

        assert!(broker
            .resolve_at(&issued.token, now + Duration::seconds(10))
            .await
            .is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let (temp, broker, _file) = setup(false);
        let outside = temp.path().join("outside.mp3");
        std::fs::write(&outside, b"not yours").unwrap();
        let link = temp.path().join("recordings").join("recording_2.mp3");
        std::os::unix::fs::symlink(&outside, &link).unwrap();

        let issued = broker.issue(2, link, 42, Duration::hours(1));
        assert_eq!(
            broker.resolve(&issued.token).await.unwrap_err(),
            TokenError::NotFound
        );
    }

    #[tokio::test]
    async fn test_missing_file_and_directory_rejected() {
        let (temp, broker, _file) = setup(false);
        let root = temp.path().join("recordings");

        let gone = broker.issue(3, root.join("recording_3.mp3"), 42, Duration::hours(1));
        assert!(broker.resolve(&gone.token).await.is_err());

        std::fs::create_dir_all(root.join("nested")).unwrap();
        let dir = broker.issue(4, root.join("nested"), 42, Duration::hours(1));
        assert!(broker.resolve(&dir.token).await.is_err());
    }

    #[tokio::test]
    async fn test_single_use() {
        let (_temp, broker, file) = setup(true);
        let issued = broker.issue(1, file, 42, Duration::hours(1));

        assert!(broker.resolve(&issued.token).await.is_ok());
        assert_eq!(
            broker.resolve(&issued.token).await.unwrap_err(),
            TokenError::NotFound
        );
        assert_eq!(broker.len(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (_temp, broker, file) = setup(false);
        let now = Utc::now();
        broker.issue_at(1, file.clone(), 1, Duration::seconds(5), now);
        broker.issue_at(1, file.clone(), 2, Duration::seconds(5), now);
        let live = broker.issue_at(1, file, 3, Duration::hours(1), now);

        assert_eq!(broker.purge_expired_at(now + Duration::seconds(5)), 0);
        assert_eq!(broker.purge_expired_at(now + Duration::seconds(6)), 2);
        assert_eq!(broker.len(), 1);
        assert!(broker.get(&live.token).is_some());
        assert_eq!(broker.purge_expired_at(now + Duration::seconds(6)), 0);
    }

    #[test]
    fn test_tokens_are_unique() {
        let tokens: HashSet<String> = (0..256).map(|_| generate_token()).collect();
        assert_eq!(tokens.len(), 256);
    }
}
