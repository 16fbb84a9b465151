//! Upload Session Manager
//!
//! Owns every in-flight upload session:
//! - Session table behind an `RwLock`, held only for lookups and inserts
//! - Per-session mutex guarding chunk accounting and state transitions
//! - Version sealing while a finalize is running
//! - Idle expiry with scratch folder cleanup
//!
//! Sessions are process-local and do not survive a restart.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::chunk_store::ChunkStore;
use super::types::{
    ChunkUploadResponse, NewSession, SessionProgress, SessionSnapshot, SessionState, UploadError,
};

// ============================================================================
// Session Record
// ============================================================================

/// Identifies one version of one backup set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionKey {
    pub client_id: String,
    pub backup_name: String,
    pub version: i64,
}

/// One in-flight file transfer
#[derive(Debug)]
pub struct UploadSession {
    pub id: Uuid,
    pub client_id: String,
    pub backup_name: String,
    pub file_path: String,
    /// Declared size, verified at assembly
    pub file_size: u64,
    pub total_chunks: u32,
    pub version: i64,
    pub backup_id: i64,
    /// Declared whole-file checksum, verified at assembly
    pub checksum: Option<String>,
    pub temp_folder: PathBuf,
    pub created_at: DateTime<Utc>,
    progress: Mutex<SessionProgress>,
}

impl UploadSession {
    pub fn version_key(&self) -> VersionKey {
        VersionKey {
            client_id: self.client_id.clone(),
            backup_name: self.backup_name.clone(),
            version: self.version,
        }
    }

    pub async fn state(&self) -> SessionState {
        self.progress.lock().await.state
    }

    pub async fn uploaded_chunks(&self) -> usize {
        self.progress.lock().await.uploaded_chunks()
    }
}

/// A session removed by the expiry sweep
#[derive(Debug, Clone)]
pub struct ExpiredSession {
    pub id: Uuid,
    pub key: VersionKey,
    pub backup_id: i64,
    pub file_path: String,
    pub uploaded_chunks: usize,
    pub total_chunks: u32,
    pub missing_chunks: Vec<u32>,
}

impl ExpiredSession {
    fn incomplete(&self) -> UploadError {
        UploadError::IncompleteUpload {
            file_path: self.file_path.clone(),
            uploaded: self.uploaded_chunks,
            total: self.total_chunks,
            missing: self.missing_chunks.clone(),
        }
    }
}

// ============================================================================
// Session Manager
// ============================================================================

/// Manages upload sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    table: RwLock<SessionTable>,

    /// Chunk storage for every session's scratch folder
    chunk_store: ChunkStore,

    /// Idle window before a session may be collected
    idle_timeout: Duration,
}

#[derive(Default)]
struct SessionTable {
    /// Active sessions indexed by ID
    sessions: HashMap<Uuid, Arc<UploadSession>>,

    /// Versions with a finalize in progress; no session may join them
    sealed: HashSet<VersionKey>,

    /// Files whose session expired, by version and file path. A version
    /// with lost files cannot be finalized until they are uploaded again.
    lost: HashMap<VersionKey, BTreeMap<String, ExpiredSession>>,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(chunk_store: ChunkStore, idle_timeout: std::time::Duration) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                table: RwLock::new(SessionTable::default()),
                chunk_store,
                idle_timeout: Duration::from_std(idle_timeout).unwrap_or(Duration::MAX),
            }),
        }
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.inner.chunk_store
    }

    fn is_idle(&self, progress: &SessionProgress, now: DateTime<Utc>) -> bool {
        now - progress.last_activity > self.inner.idle_timeout
    }

    fn expires_at(&self, progress: &SessionProgress) -> DateTime<Utc> {
        progress
            .last_activity
            .checked_add_signed(self.inner.idle_timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Register a new session for an already allocated version
    pub async fn create_session(
        &self,
        request: &NewSession,
        version: i64,
        backup_id: i64,
    ) -> Result<Arc<UploadSession>, UploadError> {
        let id = Uuid::new_v4();
        let temp_folder = self.inner.chunk_store.create_session_dir(id).await?;
        let now = Utc::now();

        let session = Arc::new(UploadSession {
            id,
            client_id: request.client_id.clone(),
            backup_name: request.backup_name.clone(),
            file_path: request.file_path.clone(),
            file_size: request.file_size,
            total_chunks: request.total_chunks,
            version,
            backup_id,
            checksum: request.checksum.clone(),
            temp_folder,
            created_at: now,
            progress: Mutex::new(SessionProgress::new(now)),
        });
        let key = session.version_key();

        let rejected = {
            let mut table = self.inner.table.write().await;
            if table.sealed.contains(&key) {
                Some(UploadError::Validation(format!(
                    "version {} of {:?} is being finalized",
                    version, request.backup_name
                )))
            } else if table
                .sessions
                .values()
                .any(|s| s.version_key() == key && s.file_path == session.file_path)
            {
                Some(UploadError::Validation(format!(
                    "{:?} is already being uploaded to version {}",
                    session.file_path, version
                )))
            } else {
                if let Some(files) = table.lost.get_mut(&key) {
                    files.remove(&session.file_path);
                    if files.is_empty() {
                        table.lost.remove(&key);
                    }
                }
                table.sessions.insert(id, session.clone());
                None
            }
        };

        if let Some(err) = rejected {
            let _ = self.inner.chunk_store.delete_session_chunks(id).await;
            return Err(err);
        }

        tracing::info!(
            session_id = %id,
            client_id = %session.client_id,
            backup_name = %session.backup_name,
            version = version,
            file_path = %session.file_path,
            file_size = session.file_size,
            chunks = session.total_chunks,
            "Created upload session"
        );

        Ok(session)
    }

    /// Look up a live session owned by `client_id`
    pub async fn get_session(
        &self,
        client_id: &str,
        id: Uuid,
    ) -> Result<Arc<UploadSession>, UploadError> {
        let table = self.inner.table.read().await;
        table
            .sessions
            .get(&id)
            .filter(|s| s.client_id == client_id)
            .cloned()
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))
    }

    /// Persist one chunk and account for it exactly once per index
    pub async fn receive_chunk(
        &self,
        client_id: &str,
        id: Uuid,
        chunk_index: u32,
        data: &[u8],
        expected_checksum: Option<&str>,
    ) -> Result<ChunkUploadResponse, UploadError> {
        let session = self.get_session(client_id, id).await?;

        if chunk_index >= session.total_chunks {
            return Err(UploadError::ChunkIndexOutOfBounds {
                index: chunk_index,
                total: session.total_chunks,
            });
        }

        {
            let progress = session.progress.lock().await;
            self.ensure_writable(&session, &progress)?;
        }

        // Disk write happens without any lock held.
        let staged = self
            .inner
            .chunk_store
            .stage_chunk(id, chunk_index, data)
            .await?;

        if let Some(expected) = expected_checksum {
            if !staged.checksum.matches(expected) {
                let actual = staged.checksum.digest.clone();
                self.inner.chunk_store.discard_chunk(staged).await;
                tracing::warn!(
                    session_id = %id,
                    chunk_index = chunk_index,
                    expected = %expected,
                    actual = %actual,
                    "Chunk checksum mismatch, chunk rejected"
                );
                return Err(UploadError::ChunkChecksumMismatch {
                    index: chunk_index,
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let mut progress = session.progress.lock().await;
        if let Err(e) = self.ensure_writable(&session, &progress) {
            drop(progress);
            self.inner.chunk_store.discard_chunk(staged).await;
            return Err(e);
        }

        let metadata = self.inner.chunk_store.commit_chunk(staged).await?;
        let newly_received =
            progress.mark_chunk_received(chunk_index, session.total_chunks, Utc::now());

        tracing::debug!(
            session_id = %id,
            chunk_index = chunk_index,
            size = metadata.size,
            checksum = %metadata.checksum,
            resend = !newly_received,
            uploaded_chunks = progress.uploaded_chunks(),
            total_chunks = session.total_chunks,
            "Chunk stored"
        );

        Ok(ChunkUploadResponse {
            chunk_index,
            uploaded_chunks: progress.uploaded_chunks(),
            total_chunks: session.total_chunks,
            complete: progress.state == SessionState::Complete,
        })
    }

    fn ensure_writable(
        &self,
        session: &UploadSession,
        progress: &SessionProgress,
    ) -> Result<(), UploadError> {
        match progress.state {
            SessionState::Finalizing => Err(UploadError::SessionBusy(format!(
                "session {} is being finalized",
                session.id
            ))),
            state if state.is_terminal() => Err(UploadError::SessionNotFound(session.id.to_string())),
            _ if self.is_idle(progress, Utc::now()) => {
                Err(UploadError::SessionNotFound(session.id.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Point-in-time status of a session
    pub async fn snapshot(&self, client_id: &str, id: Uuid) -> Result<SessionSnapshot, UploadError> {
        let session = self.get_session(client_id, id).await?;
        let progress = session.progress.lock().await;

        Ok(SessionSnapshot {
            session_id: session.id,
            client_id: session.client_id.clone(),
            backup_name: session.backup_name.clone(),
            file_path: session.file_path.clone(),
            version: session.version,
            backup_id: session.backup_id,
            file_size: session.file_size,
            total_chunks: session.total_chunks,
            uploaded_chunks: progress.uploaded_chunks(),
            missing_chunks: progress.missing_chunks(session.total_chunks),
            state: progress.state,
            created_at: session.created_at,
            last_activity: progress.last_activity,
            expires_at: self.expires_at(&progress),
        })
    }

    /// Expiry deadline of a session, as reported to the client
    pub async fn expires_at_for(&self, session: &UploadSession) -> DateTime<Utc> {
        let progress = session.progress.lock().await;
        self.expires_at(&progress)
    }

    /// Cancel a session and delete its chunks
    pub async fn cancel_session(
        &self,
        client_id: &str,
        id: Uuid,
    ) -> Result<Arc<UploadSession>, UploadError> {
        let session = self.get_session(client_id, id).await?;

        {
            let mut progress = session.progress.lock().await;
            if progress.state == SessionState::Finalizing {
                return Err(UploadError::SessionBusy(format!(
                    "session {} is being finalized",
                    id
                )));
            }
            progress.state = SessionState::Expired;
        }

        self.inner.table.write().await.sessions.remove(&id);
        self.inner.chunk_store.delete_session_chunks(id).await?;

        tracing::info!(
            session_id = %id,
            file_path = %session.file_path,
            "Upload session cancelled"
        );

        Ok(session)
    }

    // ========================================================================
    // Finalize Coordination
    // ========================================================================

    /// Claim every session of a version for assembly.
    ///
    /// Seals the version against new sessions and moves each session to
    /// `Finalizing`. Fails without side effects when any session is missing
    /// chunks or a file of the version lost its session to expiry. An empty
    /// list means the version has no live sessions.
    pub async fn begin_finalize(&self, key: &VersionKey) -> Result<Vec<Arc<UploadSession>>, UploadError> {
        let mut sessions: Vec<Arc<UploadSession>> = {
            let mut table = self.inner.table.write().await;
            if table.sealed.contains(key) {
                return Err(UploadError::SessionBusy(format!(
                    "version {} of {:?} is already being finalized",
                    key.version, key.backup_name
                )));
            }
            if let Some(lost) = table.lost.get(key).and_then(|files| files.values().next()) {
                return Err(lost.incomplete());
            }
            table.sealed.insert(key.clone());
            table
                .sessions
                .values()
                .filter(|s| &s.version_key() == key)
                .cloned()
                .collect()
        };
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        for (claimed, session) in sessions.iter().enumerate() {
            let mut progress = session.progress.lock().await;
            if progress.state != SessionState::Complete {
                let err = UploadError::IncompleteUpload {
                    file_path: session.file_path.clone(),
                    uploaded: progress.uploaded_chunks(),
                    total: session.total_chunks,
                    missing: progress.missing_chunks(session.total_chunks),
                };
                drop(progress);
                self.release(key, &sessions[..claimed], SessionState::Complete).await;
                return Err(err);
            }
            progress.state = SessionState::Finalizing;
        }

        if sessions.is_empty() {
            self.inner.table.write().await.sealed.remove(key);
        }

        Ok(sessions)
    }

    /// Conclude a finalize started with [`begin_finalize`](Self::begin_finalize).
    ///
    /// On success the sessions become `Finalized`, leave the table and their
    /// chunks are deleted. On failure they return to `Complete` so the
    /// finalize can be retried.
    pub async fn finish_finalize(&self, key: &VersionKey, sessions: &[Arc<UploadSession>], succeeded: bool) {
        if !succeeded {
            self.release(key, sessions, SessionState::Complete).await;
            return;
        }

        for session in sessions {
            session.progress.lock().await.state = SessionState::Finalized;
        }

        {
            let mut table = self.inner.table.write().await;
            for session in sessions {
                table.sessions.remove(&session.id);
            }
            table.sealed.remove(key);
        }

        for session in sessions {
            if let Err(e) = self.inner.chunk_store.delete_session_chunks(session.id).await {
                tracing::warn!(
                    session_id = %session.id,
                    error = %e,
                    "Failed to delete chunks of finalized session"
                );
            }
        }
    }

    async fn release(&self, key: &VersionKey, sessions: &[Arc<UploadSession>], state: SessionState) {
        for session in sessions {
            let mut progress = session.progress.lock().await;
            if progress.state == SessionState::Finalizing {
                progress.state = state;
            }
        }
        self.inner.table.write().await.sealed.remove(key);
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    /// Drop the lost-file records of a version once no live session targets
    /// it. Returns whether the version was abandoned.
    pub async fn forget_if_abandoned(&self, key: &VersionKey) -> bool {
        let mut table = self.inner.table.write().await;
        if table.sessions.values().any(|s| &s.version_key() == key) {
            return false;
        }
        table.lost.remove(key);
        true
    }

    /// Get session count
    pub async fn session_count(&self) -> usize {
        self.inner.table.read().await.sessions.len()
    }

    /// Sessions still accepting chunks
    pub async fn active_session_count(&self) -> usize {
        let sessions: Vec<Arc<UploadSession>> =
            self.inner.table.read().await.sessions.values().cloned().collect();

        let mut count = 0;
        for session in sessions {
            if session.state().await.is_writable() {
                count += 1;
            }
        }
        count
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Collect sessions idle beyond the window.
    ///
    /// Sessions being finalized are never collected.
    pub async fn cleanup_expired(&self) -> Vec<ExpiredSession> {
        let now = Utc::now();
        let candidates: Vec<Arc<UploadSession>> =
            self.inner.table.read().await.sessions.values().cloned().collect();

        let mut expired = Vec::new();
        for session in candidates {
            let mut progress = session.progress.lock().await;
            if progress.state.is_writable() && self.is_idle(&progress, now) {
                progress.state = SessionState::Expired;
                expired.push(ExpiredSession {
                    id: session.id,
                    key: session.version_key(),
                    backup_id: session.backup_id,
                    file_path: session.file_path.clone(),
                    uploaded_chunks: progress.uploaded_chunks(),
                    total_chunks: session.total_chunks,
                    missing_chunks: progress.missing_chunks(session.total_chunks),
                });
            }
        }

        if expired.is_empty() {
            return expired;
        }

        {
            let mut table = self.inner.table.write().await;
            for session in &expired {
                table.sessions.remove(&session.id);
                table
                    .lost
                    .entry(session.key.clone())
                    .or_default()
                    .insert(session.file_path.clone(), session.clone());
            }
        }

        for session in &expired {
            match self.inner.chunk_store.delete_session_chunks(session.id).await {
                Ok(files) => tracing::debug!(
                    session_id = %session.id,
                    file_path = %session.file_path,
                    files = files,
                    "Cleaned up expired session"
                ),
                Err(e) => tracing::warn!(
                    session_id = %session.id,
                    error = %e,
                    "Failed to delete chunks of expired session"
                ),
            }
        }

        tracing::info!(count = expired.len(), "Cleaned up expired upload sessions");

        expired
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_request(file_path: &str, total_chunks: u32) -> NewSession {
        NewSession {
            client_id: "acme".to_string(),
            backup_name: "nightly".to_string(),
            file_path: file_path.to_string(),
            file_size: 1024,
            total_chunks,
            metadata: serde_json::Map::new(),
            version: None,
            checksum: None,
        }
    }

    fn manager(temp_dir: &TempDir, idle: std::time::Duration) -> SessionManager {
        SessionManager::new(ChunkStore::new(temp_dir.path().to_path_buf()), idle)
    }

    fn key() -> VersionKey {
        VersionKey {
            client_id: "acme".to_string(),
            backup_name: "nightly".to_string(),
            version: 1,
        }
    }

    const HOUR: std::time::Duration = std::time::Duration::from_secs(3600);

    #[tokio::test]
    async fn test_create_session() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, HOUR);

        let session = manager
            .create_session(&create_test_request("db.bak", 2), 1, 10)
            .await
            .unwrap();

        assert_eq!(session.file_path, "db.bak");
        assert_eq!(session.total_chunks, 2);
        assert_eq!(session.state().await, SessionState::Created);
        assert!(session.temp_folder.is_dir());
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_receive_chunks_until_complete() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, HOUR);
        let session = manager
            .create_session(&create_test_request("db.bak", 2), 1, 10)
            .await
            .unwrap();

        let first = manager
            .receive_chunk("acme", session.id, 0, b"hello ", None)
            .await
            .unwrap();
        assert_eq!(first.uploaded_chunks, 1);
        assert!(!first.complete);
        assert_eq!(session.state().await, SessionState::Receiving);

        let second = manager
            .receive_chunk("acme", session.id, 1, b"world", None)
            .await
            .unwrap();
        assert_eq!(second.uploaded_chunks, 2);
        assert!(second.complete);
        assert_eq!(session.state().await, SessionState::Complete);
    }

    #[tokio::test]
    async fn test_resend_does_not_double_count() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, HOUR);
        let session = manager
            .create_session(&create_test_request("db.bak", 5), 1, 10)
            .await
            .unwrap();

        manager.receive_chunk("acme", session.id, 3, b"abc", None).await.unwrap();
        let again = manager.receive_chunk("acme", session.id, 3, b"abc", None).await.unwrap();

        assert_eq!(again.uploaded_chunks, 1);
        assert_eq!(session.uploaded_chunks().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resends_count_once() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, HOUR);
        let session = manager
            .create_session(&create_test_request("db.bak", 4), 1, 10)
            .await
            .unwrap();

        let tasks = (0..8).map(|_| {
            let manager = manager.clone();
            let id = session.id;
            tokio::spawn(async move { manager.receive_chunk("acme", id, 2, b"same", None).await })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let snapshot = manager.snapshot("acme", session.id).await.unwrap();
        assert_eq!(snapshot.uploaded_chunks, 1);
        assert_eq!(snapshot.missing_chunks, vec![0, 1, 3]);
    }

    #[tokio::test]
    async fn test_chunk_index_out_of_bounds() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, HOUR);
        let session = manager
            .create_session(&create_test_request("db.bak", 2), 1, 10)
            .await
            .unwrap();

        let result = manager.receive_chunk("acme", session.id, 2, b"x", None).await;
        assert!(matches!(
            result,
            Err(UploadError::ChunkIndexOutOfBounds { index: 2, total: 2 })
        ));
    }

    #[tokio::test]
    async fn test_chunk_checksum_header_mismatch_is_not_counted() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, HOUR);
        let session = manager
            .create_session(&create_test_request("db.bak", 2), 1, 10)
            .await
            .unwrap();

        let result = manager
            .receive_chunk("acme", session.id, 0, b"payload", Some("00ff"))
            .await;

        assert!(matches!(result, Err(UploadError::ChunkChecksumMismatch { .. })));
        assert_eq!(session.uploaded_chunks().await, 0);
    }

    #[tokio::test]
    async fn test_other_client_cannot_see_session() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, HOUR);
        let session = manager
            .create_session(&create_test_request("db.bak", 2), 1, 10)
            .await
            .unwrap();

        let result = manager.receive_chunk("globex", session.id, 0, b"x", None).await;
        assert!(matches!(result, Err(UploadError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_file_in_version_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, HOUR);
        manager
            .create_session(&create_test_request("db.bak", 2), 1, 10)
            .await
            .unwrap();

        let result = manager
            .create_session(&create_test_request("db.bak", 2), 1, 10)
            .await;
        assert!(matches!(result, Err(UploadError::Validation(_))));
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_begin_finalize_rejects_incomplete() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, HOUR);
        let session = manager
            .create_session(&create_test_request("db.bak", 2), 1, 10)
            .await
            .unwrap();
        manager.receive_chunk("acme", session.id, 0, b"x", None).await.unwrap();

        let result = manager.begin_finalize(&key()).await;
        match result {
            Err(UploadError::IncompleteUpload { uploaded, total, missing, .. }) => {
                assert_eq!((uploaded, total), (1, 2));
                assert_eq!(missing, vec![1]);
            }
            other => panic!("expected IncompleteUpload, got {other:?}"),
        }

        // Still writable, and the version is not left sealed.
        manager.receive_chunk("acme", session.id, 1, b"y", None).await.unwrap();
        assert_eq!(manager.begin_finalize(&key()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finalizing_session_rejects_chunks_and_new_files() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, HOUR);
        let session = manager
            .create_session(&create_test_request("db.bak", 1), 1, 10)
            .await
            .unwrap();
        manager.receive_chunk("acme", session.id, 0, b"x", None).await.unwrap();

        let claimed = manager.begin_finalize(&key()).await.unwrap();
        assert_eq!(session.state().await, SessionState::Finalizing);

        let resend = manager.receive_chunk("acme", session.id, 0, b"x", None).await;
        assert!(matches!(resend, Err(UploadError::SessionBusy(_))));

        let join = manager
            .create_session(&create_test_request("other.bak", 1), 1, 10)
            .await;
        assert!(matches!(join, Err(UploadError::Validation(_))));

        let second = manager.begin_finalize(&key()).await;
        assert!(matches!(second, Err(UploadError::SessionBusy(_))));

        manager.finish_finalize(&key(), &claimed, false).await;
        assert_eq!(session.state().await, SessionState::Complete);
    }

    #[tokio::test]
    async fn test_successful_finalize_removes_session() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, HOUR);
        let session = manager
            .create_session(&create_test_request("db.bak", 1), 1, 10)
            .await
            .unwrap();
        manager.receive_chunk("acme", session.id, 0, b"x", None).await.unwrap();

        let claimed = manager.begin_finalize(&key()).await.unwrap();
        manager.finish_finalize(&key(), &claimed, true).await;

        assert_eq!(session.state().await, SessionState::Finalized);
        assert!(!session.temp_folder.exists());
        assert!(matches!(
            manager.receive_chunk("acme", session.id, 0, b"x", None).await,
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, std::time::Duration::ZERO);
        let session = manager
            .create_session(&create_test_request("db.bak", 2), 1, 10)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let expired = manager.cleanup_expired().await;

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, session.id);
        assert_eq!(session.state().await, SessionState::Expired);
        assert!(!session.temp_folder.exists());
        assert!(manager.forget_if_abandoned(&key()).await);
    }

    #[tokio::test]
    async fn test_expired_sibling_blocks_finalize_until_reuploaded() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, std::time::Duration::from_millis(200));
        let stale = manager
            .create_session(&create_test_request("a.bin", 2), 1, 10)
            .await
            .unwrap();
        manager.receive_chunk("acme", stale.id, 0, b"x", None).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let live = manager
            .create_session(&create_test_request("b.bin", 1), 1, 10)
            .await
            .unwrap();
        manager.receive_chunk("acme", live.id, 0, b"y", None).await.unwrap();

        let expired = manager.cleanup_expired().await;
        assert_eq!(expired.len(), 1);
        assert!(!manager.forget_if_abandoned(&key()).await);

        match manager.begin_finalize(&key()).await {
            Err(UploadError::IncompleteUpload { file_path, uploaded, total, missing }) => {
                assert_eq!(file_path, "a.bin");
                assert_eq!((uploaded, total), (1, 2));
                assert_eq!(missing, vec![1]);
            }
            other => panic!("expected IncompleteUpload, got {other:?}"),
        }
        assert_eq!(live.state().await, SessionState::Complete);

        let again = manager
            .create_session(&create_test_request("a.bin", 1), 1, 10)
            .await
            .unwrap();
        manager.receive_chunk("acme", again.id, 0, b"z", None).await.unwrap();
        assert_eq!(manager.begin_finalize(&key()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_session() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, HOUR);
        let session = manager
            .create_session(&create_test_request("db.bak", 2), 1, 10)
            .await
            .unwrap();

        manager.cancel_session("acme", session.id).await.unwrap();

        assert!(manager.get_session("acme", session.id).await.is_err());
        assert!(!session.temp_folder.exists());
    }
}
