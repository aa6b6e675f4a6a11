//! Append-only per-session fragment log.
//!
//! Appends are idempotent by fragment id: the first write wins, a repeat is a
//! no-op. This is what lets a replacement worker re-send fragments it never saw
//! acknowledged without duplicating them in the donation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;

use crate::bridge::protocol::{Fragment, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("session {0} is not open")]
    UnknownSession(SessionId),

    #[error("session log is sealed")]
    Sealed,

    #[error("store i/o error: {0}")]
    Io(String),

    #[error("corrupt store entry: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// A fragment with this id already exists; nothing was written.
    Duplicate,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create the session log, or load it if it already exists.
    async fn open(&self, session: SessionId, study_id: &str) -> Result<(), StoreError>;

    async fn append(
        &self,
        session: SessionId,
        fragment: Fragment,
    ) -> Result<AppendOutcome, StoreError>;

    /// Fragments in append order.
    async fn snapshot(&self, session: SessionId) -> Result<Vec<Fragment>, StoreError>;

    /// Freeze the log. Further appends fail with [`StoreError::Sealed`].
    async fn seal(&self, session: SessionId) -> Result<(), StoreError>;

    /// Drop the log and everything in it. Unknown sessions are not an error.
    async fn discard(&self, session: SessionId) -> Result<(), StoreError>;

    async fn is_sealed(&self, session: SessionId) -> Result<bool, StoreError>;
}

/// In-memory log shared by both store implementations.
#[derive(Debug, Default)]
struct FragmentLog {
    fragments: Vec<Fragment>,
    index: HashMap<String, usize>,
    sealed: bool,
}

impl FragmentLog {
    /// Whether `fragment` would be a new entry.
    fn check(&self, session: SessionId, fragment: &Fragment) -> Result<AppendOutcome, StoreError> {
        if self.sealed {
            return Err(StoreError::Sealed);
        }
        match self.index.get(&fragment.id) {
            None => Ok(AppendOutcome::Appended),
            Some(&pos) => {
                if self.fragments[pos].data != fragment.data {
                    tracing::warn!(
                        session_id = %session,
                        fragment_id = %fragment.id,
                        "Fragment re-sent with a different body, keeping the first"
                    );
                }
                Ok(AppendOutcome::Duplicate)
            }
        }
    }

    fn push(&mut self, fragment: Fragment) {
        self.index.insert(fragment.id.clone(), self.fragments.len());
        self.fragments.push(fragment);
    }

    fn append(
        &mut self,
        session: SessionId,
        fragment: Fragment,
    ) -> Result<AppendOutcome, StoreError> {
        let outcome = self.check(session, &fragment)?;
        if outcome == AppendOutcome::Appended {
            self.push(fragment);
        }
        Ok(outcome)
    }
}

fn read_log(lock: &RwLock<FragmentLog>) -> std::sync::RwLockReadGuard<'_, FragmentLog> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_log(lock: &RwLock<FragmentLog>) -> std::sync::RwLockWriteGuard<'_, FragmentLog> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Volatile store. Sessions do not survive a host restart.
#[derive(Default)]
pub struct MemoryStore {
    logs: DashMap<SessionId, Arc<RwLock<FragmentLog>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, session: SessionId) -> Result<Arc<RwLock<FragmentLog>>, StoreError> {
        self.logs
            .get(&session)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StoreError::UnknownSession(session))
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn open(&self, session: SessionId, _study_id: &str) -> Result<(), StoreError> {
        self.logs.entry(session).or_default();
        Ok(())
    }

    async fn append(
        &self,
        session: SessionId,
        fragment: Fragment,
    ) -> Result<AppendOutcome, StoreError> {
        let log = self.log(session)?;
        let mut log = write_log(&log);
        log.append(session, fragment)
    }

    async fn snapshot(&self, session: SessionId) -> Result<Vec<Fragment>, StoreError> {
        let log = self.log(session)?;
        let log = read_log(&log);
        Ok(log.fragments.clone())
    }

    async fn seal(&self, session: SessionId) -> Result<(), StoreError> {
        let log = self.log(session)?;
        write_log(&log).sealed = true;
        Ok(())
    }

    async fn discard(&self, session: SessionId) -> Result<(), StoreError> {
        self.logs.remove(&session);
        Ok(())
    }

    async fn is_sealed(&self, session: SessionId) -> Result<bool, StoreError> {
        let log = self.log(session)?;
        let sealed = read_log(&log).sealed;
        Ok(sealed)
    }
}

/// Durable store: one JSON-lines file per session plus a `.sealed` marker.
///
/// Reopening a session that already has a file reloads its fragments, so a
/// flow can resume after the host itself restarted. A torn trailing line
/// (crash mid-write) is skipped.
pub struct FileStore {
    root: PathBuf,
    logs: DashMap<SessionId, Arc<tokio::sync::Mutex<FileLog>>>,
}

struct FileLog {
    log: FragmentLog,
    file: tokio::fs::File,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            logs: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_path(&self, session: SessionId) -> PathBuf {
        self.root.join(format!("{session}.jsonl"))
    }

    fn sealed_path(&self, session: SessionId) -> PathBuf {
        self.root.join(format!("{session}.sealed"))
    }

    fn log(&self, session: SessionId) -> Result<Arc<tokio::sync::Mutex<FileLog>>, StoreError> {
        self.logs
            .get(&session)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StoreError::UnknownSession(session))
    }

    /// Load an existing log. The second value is the length to truncate the
    /// file to when it ends in a torn line.
    async fn load(&self, session: SessionId) -> Result<(FragmentLog, Option<u64>), StoreError> {
        let mut log = FragmentLog::default();
        let mut truncate_to = None;
        let path = self.log_path(session);

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let lines: Vec<&str> = contents.lines().collect();
                let last = lines.len().saturating_sub(1);
                for (n, line) in lines.iter().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Fragment>(line) {
                        Ok(fragment) => {
                            if log.check(session, &fragment)? == AppendOutcome::Appended {
                                log.push(fragment);
                            }
                        }
                        Err(e) if n == last && !contents.ends_with('\n') => {
                            tracing::warn!(
                                session_id = %session,
                                path = %path.display(),
                                error = %e,
                                "Ignoring torn trailing line in session log"
                            );
                            truncate_to = Some(contents.rfind('\n').map_or(0, |i| i + 1) as u64);
                        }
                        Err(e) => {
                            return Err(StoreError::Corrupt(format!(
                                "{}:{}: {e}",
                                path.display(),
                                n + 1
                            )));
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        log.sealed = tokio::fs::try_exists(self.sealed_path(session)).await?;
        Ok((log, truncate_to))
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn open(&self, session: SessionId, study_id: &str) -> Result<(), StoreError> {
        if self.logs.contains_key(&session) {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.root).await?;

        let (log, truncate_to) = self.load(session).await?;
        let path = self.log_path(session);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if let Some(len) = truncate_to {
            file.set_len(len).await?;
        }

        tracing::debug!(
            session_id = %session,
            study_id,
            path = %path.display(),
            fragments = log.fragments.len(),
            sealed = log.sealed,
            "Opened session log"
        );

        self.logs
            .entry(session)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(FileLog { log, file })));
        Ok(())
    }

    async fn append(
        &self,
        session: SessionId,
        fragment: Fragment,
    ) -> Result<AppendOutcome, StoreError> {
        let entry = self.log(session)?;
        let mut entry = entry.lock().await;

        if entry.log.check(session, &fragment)? == AppendOutcome::Duplicate {
            return Ok(AppendOutcome::Duplicate);
        }

        let mut line =
            serde_json::to_vec(&fragment).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        line.push(b'\n');
        entry.file.write_all(&line).await?;
        entry.file.sync_data().await?;

        entry.log.push(fragment);
        Ok(AppendOutcome::Appended)
    }

    async fn snapshot(&self, session: SessionId) -> Result<Vec<Fragment>, StoreError> {
        let entry = self.log(session)?;
        let entry = entry.lock().await;
        Ok(entry.log.fragments.clone())
    }

    async fn seal(&self, session: SessionId) -> Result<(), StoreError> {
        let entry = self.log(session)?;
        let mut entry = entry.lock().await;
        if !entry.log.sealed {
            tokio::fs::write(self.sealed_path(session), b"").await?;
            entry.log.sealed = true;
        }
        Ok(())
    }

    async fn discard(&self, session: SessionId) -> Result<(), StoreError> {
        if let Some((_, entry)) = self.logs.remove(&session) {
            // Wait for any in-flight append before deleting the file.
            drop(entry.lock().await);
        }
        for path in [self.log_path(session), self.sealed_path(session)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn is_sealed(&self, session: SessionId) -> Result<bool, StoreError> {
        let entry = self.log(session)?;
        let sealed = entry.lock().await.log.sealed;
        Ok(sealed)
    }
}
