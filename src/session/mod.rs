//! One-time download sessions
//!
//! A converted file is registered here and handed out exactly once through an
//! opaque token. Sessions that nobody picks up expire after a fixed TTL; they
//! are purged (file included) whenever a new session is added, so there is no
//! background timer to manage.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// How long a converted file waits for its download
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("Download expired")]
    SessionExpired,

    #[error("Download not found or already retrieved")]
    SessionNotFound,

    #[error("File missing on server: {}", .0.display())]
    FileMissingOnRetrieval(PathBuf),
}

/// A file waiting to be downloaded once
#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub token: String,
    pub file_path: PathBuf,
    pub content_type: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Directory created just for this file, removed along with it
    pub scratch_dir: Option<PathBuf>,
}

impl DownloadSession {
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        // A session from the future (clock went backwards) is not expired
        (now - self.created_at)
            .to_std()
            .is_ok_and(|age| age > ttl)
    }

    /// Name the file should be offered under
    pub fn file_name(&self) -> Option<&str> {
        self.file_path.file_name().and_then(|n| n.to_str())
    }

    /// Delete the backing file and scratch directory. Best-effort, errors are
    /// only logged.
    pub fn discard(&self) {
        discard_file(&self.file_path, self.scratch_dir.as_deref());
    }
}

/// Best-effort removal of a session file and its scratch directory
pub fn discard_file(file_path: &Path, scratch_dir: Option<&Path>) {
    match std::fs::remove_file(file_path) {
        Ok(()) => debug!(path = %file_path.display(), "Removed session file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %file_path.display(), error = %e, "Failed to remove session file"),
    }

    if let Some(dir) = scratch_dir {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dir.display(), error = %e, "Failed to remove scratch directory");
            }
        }
    }
}

/// What gets registered in a store
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub file_path: PathBuf,
    pub content_type: Option<String>,
    pub scratch_dir: Option<PathBuf>,
}

impl SessionEntry {
    pub fn new(file_path: impl Into<PathBuf>, content_type: Option<String>) -> Self {
        Self {
            file_path: file_path.into(),
            content_type,
            scratch_dir: None,
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }
}

/// Storage for download sessions.
///
/// The in-memory store only works for a single instance; a deployment with
/// several instances needs an implementation backed by a shared store with
/// native expiry.
pub trait SessionStore: Send + Sync {
    /// Register a file and return its one-time token
    fn add_entry(&self, entry: SessionEntry) -> String;

    /// Remove the session for `token`. Expired sessions are removed too, with
    /// their file, and reported as [`SessionError::SessionExpired`].
    fn take(&self, token: &str) -> Result<DownloadSession, SessionError>;

    fn add(&self, file_path: PathBuf, content_type: Option<String>) -> String {
        self.add_entry(SessionEntry::new(file_path, content_type))
    }

    /// Like [`SessionStore::take`], but a miss is just `None`
    fn try_take(&self, token: &str) -> Option<DownloadSession> {
        self.take(token).ok()
    }
}

/// Generate an unguessable token: 128 bits from the thread-local CSPRNG
pub fn generate_token() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

/// Process-wide session map behind a single lock
#[derive(Debug)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, DownloadSession>>,
    ttl: Duration,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DownloadSession>> {
        // Every mutation is a single map operation, so a poisoned map is still consistent
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn add_entry_at(&self, entry: SessionEntry, now: DateTime<Utc>) -> String {
        let mut sessions = self.lock();

        let token = loop {
            let token = generate_token();
            if !sessions.contains_key(&token) {
                break token;
            }
        };

        info!(path = %entry.file_path.display(), "Registering download session");
        sessions.insert(
            token.clone(),
            DownloadSession {
                token: token.clone(),
                file_path: entry.file_path,
                content_type: entry.content_type,
                created_at: now,
                scratch_dir: entry.scratch_dir,
            },
        );

        let purged = Self::sweep_expired(&mut sessions, self.ttl, now);
        if purged > 0 {
            info!(purged, "Purged expired download sessions");
        }

        token
    }

    pub(crate) fn take_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<DownloadSession, SessionError> {
        let mut sessions = self.lock();

        let Some(session) = sessions.remove(token) else {
            trace!("Unknown or already consumed download token");
            return Err(SessionError::SessionNotFound);
        };

        if session.is_expired(self.ttl, now) {
            debug!(path = %session.file_path.display(), "Download session expired");
            session.discard();
            return Err(SessionError::SessionExpired);
        }

        Ok(session)
    }

    /// Drop every expired session and its file. Must be called with the lock held.
    fn sweep_expired(
        sessions: &mut HashMap<String, DownloadSession>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> usize {
        let before = sessions.len();
        sessions.retain(|_, session| {
            if session.is_expired(ttl, now) {
                session.discard();
                false
            } else {
                true
            }
        });
        before - sessions.len()
    }
}

impl SessionStore for MemorySessionStore {
    fn add_entry(&self, entry: SessionEntry) -> String {
        self.add_entry_at(entry, Utc::now())
    }

    fn take(&self, token: &str) -> Result<DownloadSession, SessionError> {
        self.take_at(token, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn audio_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"ID3").unwrap();
        path
    }

    fn ago(d: Duration) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::from_std(d).unwrap()
    }

    #[test]
    fn test_token_shape() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_take_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = audio_file(dir.path(), "song.mp3");
        let store = MemorySessionStore::default();

        let token = store.add(file.clone(), Some("audio/mpeg".to_string()));

        let session = store.try_take(&token).expect("first take should succeed");
        assert_eq!(session.file_path, file);
        assert_eq!(session.content_type.as_deref(), Some("audio/mpeg"));
        assert_eq!(session.file_name(), Some("song.mp3"));

        assert!(store.try_take(&token).is_none());
        assert_eq!(store.take(&token).unwrap_err(), SessionError::SessionNotFound);
        // Handing out the session doesn't delete the file, the consumer does
        assert!(file.exists());
    }

    #[test]
    fn test_unknown_token() {
        let store = MemorySessionStore::default();
        assert!(store.try_take("deadbeef").is_none());
        assert!(store.try_take("").is_none());
    }

    #[test]
    fn test_expired_take_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = audio_file(dir.path(), "old.mp3");
        let store = MemorySessionStore::default();

        let token = store.add_entry_at(
            SessionEntry::new(file.clone(), None),
            ago(DEFAULT_SESSION_TTL + Duration::from_secs(1)),
        );

        assert_eq!(store.take(&token).unwrap_err(), SessionError::SessionExpired);
        assert!(!file.exists());
        assert!(store.is_empty());
        // and it stays gone
        assert_eq!(store.take(&token).unwrap_err(), SessionError::SessionNotFound);
    }

    #[test]
    fn test_expired_take_with_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemorySessionStore::default();

        let token = store.add_entry_at(
            SessionEntry::new(dir.path().join("never-written.mp3"), None),
            ago(DEFAULT_SESSION_TTL * 2),
        );

        assert!(store.try_take(&token).is_none());
    }

    #[test]
    fn test_session_right_at_ttl_is_alive() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        assert_eq!(store.ttl(), Duration::from_secs(60));
        let now = Utc::now();
        let token = store.add_entry_at(SessionEntry::new("/tmp/x.mp3", None), now);

        let later = now + chrono::Duration::seconds(60);
        assert!(store.take_at(&token, later).is_ok());
    }

    #[test]
    fn test_add_sweeps_expired_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let stale = audio_file(dir.path(), "stale.mp3");
        let scratch = dir.path().join("scratch");
        std::fs::create_dir(&scratch).unwrap();
        let stale_in_scratch = audio_file(&scratch, "stale2.mp3");
        let fresh = audio_file(dir.path(), "fresh.mp3");
        let store = MemorySessionStore::default();

        let long_ago = ago(DEFAULT_SESSION_TTL + Duration::from_secs(30));
        let stale_token = store.add_entry_at(SessionEntry::new(stale.clone(), None), long_ago);
        store.add_entry_at(
            SessionEntry::new(stale_in_scratch.clone(), None).with_scratch_dir(&scratch),
            long_ago,
        );
        assert_eq!(store.len(), 2, "nothing was expired when these were added");

        let fresh_token = store.add(fresh.clone(), None);

        assert_eq!(store.len(), 1);
        assert!(!stale.exists());
        assert!(!scratch.exists());
        assert!(fresh.exists());
        assert_eq!(
            store.take(&stale_token).unwrap_err(),
            SessionError::SessionNotFound
        );
        assert_eq!(store.try_take(&fresh_token).unwrap().file_path, fresh);
    }

    #[test]
    fn test_concurrent_take_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let file = audio_file(dir.path(), "race.mp3");
        let store = Arc::new(MemorySessionStore::default());
        let token = store.add(file, None);

        let winners = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..32)
                .map(|_| {
                    let store = Arc::clone(&store);
                    let token = token.clone();
                    scope.spawn(move || store.try_take(&token).is_some())
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|found| *found)
                .count()
        });

        assert_eq!(winners, 1);
    }

    #[test]
    fn test_discard_removes_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("01JABCDEF");
        std::fs::create_dir(&scratch).unwrap();
        let file = audio_file(&scratch, "a.mp3");

        discard_file(&file, Some(&scratch));
        assert!(!scratch.exists());

        // Nothing left, still fine
        discard_file(&file, Some(&scratch));
    }
}
