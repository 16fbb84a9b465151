//! Upload Service
//!
//! The operations exposed to the HTTP layer: start, chunk, status, cancel,
//! finalize, and the periodic expiry sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use super::assembler::{AssembledFile, Assembler, AssemblyFailure};
use super::gateway::{AuditEntry, Backup, BackupFileRecord, BackupGateway, BackupStatus};
use super::naming::validate_start_request;
use super::session::{SessionManager, UploadSession, VersionKey};
use super::types::{
    BackupSummary, ChunkUploadResponse, SessionSnapshot, StartUploadRequest, StartUploadResponse,
    UploadError,
};
use super::version::VersionAllocator;

/// Limits applied to start requests
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_total_chunks: u32,
}

#[derive(Clone)]
pub struct UploadService {
    gateway: Arc<dyn BackupGateway>,
    allocator: VersionAllocator,
    sessions: SessionManager,
    assembler: Assembler,
    limits: UploadLimits,
}

impl UploadService {
    pub fn new(
        gateway: Arc<dyn BackupGateway>,
        sessions: SessionManager,
        assembler: Assembler,
        limits: UploadLimits,
    ) -> Self {
        Self {
            allocator: VersionAllocator::new(gateway.clone()),
            gateway,
            sessions,
            assembler,
            limits,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Open a session for one file, allocating a version unless one is given
    pub async fn start_session(
        &self,
        client_id: &str,
        request: StartUploadRequest,
    ) -> Result<StartUploadResponse, UploadError> {
        let now = Utc::now();
        let new_session = validate_start_request(client_id, request, self.limits.max_total_chunks, now)?;

        let (version, backup_id, allocated) = match new_session.version {
            Some(version) => {
                let backup = self
                    .require_backup(client_id, &new_session.backup_name, version)
                    .await?;
                if backup.status != BackupStatus::Pending {
                    return Err(UploadError::Validation(format!(
                        "version {} of {:?} is {}, only pending versions accept files",
                        version, new_session.backup_name, backup.status
                    )));
                }
                (version, backup.id, false)
            }
            None => {
                let allocated = self
                    .allocator
                    .allocate(client_id, &new_session.backup_name, now, &new_session.metadata)
                    .await?;
                (allocated.version, allocated.backup_id, true)
            }
        };

        let session = match self.sessions.create_session(&new_session, version, backup_id).await {
            Ok(session) => session,
            Err(e) => {
                if allocated {
                    self.mark_failed(backup_id, 0, 0).await;
                }
                return Err(e);
            }
        };

        self.audit(AuditEntry {
            client_id: client_id.to_string(),
            action: "upload_start",
            outcome: "success",
            backup_id: Some(backup_id),
            bytes: 0,
            detail: format!("{} v{}: {}", session.backup_name, version, session.file_path),
        })
        .await;

        Ok(StartUploadResponse {
            session_id: session.id.to_string(),
            version,
            backup_id,
            file_path: session.file_path.clone(),
            total_chunks: session.total_chunks,
            expires_at: self.sessions.expires_at_for(&session).await,
        })
    }

    // ========================================================================
    // Chunks and Session Queries
    // ========================================================================

    /// Persist one chunk. Resending an index is safe.
    pub async fn receive_chunk(
        &self,
        client_id: &str,
        session_id: &str,
        chunk_index: u32,
        data: &[u8],
        chunk_checksum: Option<&str>,
    ) -> Result<ChunkUploadResponse, UploadError> {
        let id = parse_session_id(session_id)?;
        self.sessions
            .receive_chunk(client_id, id, chunk_index, data, chunk_checksum)
            .await
    }

    pub async fn session_status(
        &self,
        client_id: &str,
        session_id: &str,
    ) -> Result<SessionSnapshot, UploadError> {
        let id = parse_session_id(session_id)?;
        self.sessions.snapshot(client_id, id).await
    }

    /// Abandon a session and delete its chunks
    pub async fn cancel_session(&self, client_id: &str, session_id: &str) -> Result<(), UploadError> {
        let id = parse_session_id(session_id)?;
        let session = self.sessions.cancel_session(client_id, id).await?;

        self.audit(AuditEntry {
            client_id: client_id.to_string(),
            action: "upload_cancel",
            outcome: "success",
            backup_id: Some(session.backup_id),
            bytes: 0,
            detail: session.file_path.clone(),
        })
        .await;

        Ok(())
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    /// Assemble every file of a pending version and commit it.
    ///
    /// Finalizing an already completed version returns its stored summary.
    pub async fn finalize(
        &self,
        client_id: &str,
        backup_name: &str,
        version: i64,
    ) -> Result<BackupSummary, UploadError> {
        let backup = self.require_backup(client_id, backup_name, version).await?;

        if backup.status == BackupStatus::Completed {
            tracing::debug!(
                backup_id = backup.id,
                "Finalize of completed backup, returning stored summary"
            );
            return Ok(summary_of(&backup));
        }

        let key = VersionKey {
            client_id: client_id.to_string(),
            backup_name: backup.backup_name.clone(),
            version,
        };

        let claimed = match self.sessions.begin_finalize(&key).await {
            Ok(sessions) if sessions.is_empty() => Err(UploadError::IncompleteUpload {
                file_path: format!("{} v{} (no files uploaded)", backup_name, version),
                uploaded: 0,
                total: 0,
                missing: Vec::new(),
            }),
            other => other,
        };
        let sessions = match claimed {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::info!(
                    client_id = %client_id,
                    backup_name = %backup_name,
                    version = version,
                    error = %e,
                    "Finalize rejected"
                );
                self.audit(AuditEntry {
                    client_id: client_id.to_string(),
                    action: "backup_finalize",
                    outcome: "rejected",
                    backup_id: Some(backup.id),
                    bytes: 0,
                    detail: e.to_string(),
                })
                .await;
                return Err(e);
            }
        };

        let outcome = self.commit_version(&backup, &sessions).await;
        self.sessions
            .finish_finalize(&key, &sessions, outcome.is_ok())
            .await;

        match outcome {
            Ok(summary) => {
                tracing::info!(
                    client_id = %client_id,
                    backup_name = %backup_name,
                    version = version,
                    backup_id = summary.backup_id,
                    files = summary.files_count,
                    total_size = summary.total_size,
                    "Backup finalized"
                );
                self.audit(AuditEntry {
                    client_id: client_id.to_string(),
                    action: "backup_finalize",
                    outcome: "success",
                    backup_id: Some(backup.id),
                    bytes: summary.total_size,
                    detail: format!("{} v{}: {} files", backup_name, version, summary.files_count),
                })
                .await;
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(
                    client_id = %client_id,
                    backup_name = %backup_name,
                    version = version,
                    error = %e,
                    "Backup finalize failed"
                );
                self.mark_failed(backup.id, backup.files_count, backup.total_size)
                    .await;
                self.audit(AuditEntry {
                    client_id: client_id.to_string(),
                    action: "backup_finalize",
                    outcome: "failure",
                    backup_id: Some(backup.id),
                    bytes: 0,
                    detail: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    async fn commit_version(
        &self,
        backup: &Backup,
        sessions: &[Arc<UploadSession>],
    ) -> Result<BackupSummary, UploadError> {
        let mut files_count = 0i64;
        let mut total_size = 0i64;

        for session in sessions {
            let assembled = self.assemble_one(backup.id, session).await?;
            files_count += 1;
            total_size += assembled.checksum.size as i64;
        }

        self.gateway
            .update_backup_status(backup.id, BackupStatus::Completed, files_count, total_size)
            .await?;

        Ok(BackupSummary {
            backup_id: backup.id,
            files_count,
            total_size,
            timestamp: backup.timestamp,
        })
    }

    async fn assemble_one(
        &self,
        backup_id: i64,
        session: &UploadSession,
    ) -> Result<AssembledFile, UploadError> {
        match self.assembler.assemble(session).await {
            Ok(assembled) => {
                self.gateway
                    .upsert_backup_file(
                        backup_id,
                        &BackupFileRecord {
                            file_path: assembled.file_path.clone(),
                            file_size: assembled.checksum.size as i64,
                            checksum: assembled.checksum.digest.clone(),
                            status: BackupStatus::Completed,
                        },
                    )
                    .await?;
                Ok(assembled)
            }
            Err(AssemblyFailure { error, observed }) => {
                let (file_size, checksum) = observed
                    .map(|c| (c.size as i64, c.digest))
                    .unwrap_or_default();
                let flagged = self
                    .gateway
                    .upsert_backup_file(
                        backup_id,
                        &BackupFileRecord {
                            file_path: session.file_path.clone(),
                            file_size,
                            checksum,
                            status: BackupStatus::Failed,
                        },
                    )
                    .await;
                if let Err(e) = flagged {
                    tracing::warn!(error = %e, file_path = %session.file_path, "Failed to flag file record");
                }
                Err(error)
            }
        }
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    /// Drop idle sessions; versions left without sessions are marked failed.
    /// A version that still has live sessions keeps its expired files as
    /// missing, so it cannot complete without them. Returns the number of
    /// sessions removed.
    pub async fn sweep_expired(&self) -> usize {
        let expired = self.sessions.cleanup_expired().await;
        let count = expired.len();

        let mut by_version: HashMap<VersionKey, Vec<_>> = HashMap::new();
        for session in expired {
            by_version.entry(session.key.clone()).or_default().push(session);
        }

        for (key, sessions) in by_version {
            let backup_id = sessions[0].backup_id;
            for session in &sessions {
                self.audit(AuditEntry {
                    client_id: key.client_id.clone(),
                    action: "session_expired",
                    outcome: "failure",
                    backup_id: Some(backup_id),
                    bytes: 0,
                    detail: format!(
                        "{}: {}/{} chunks",
                        session.file_path, session.uploaded_chunks, session.total_chunks
                    ),
                })
                .await;
            }

            if !self.sessions.forget_if_abandoned(&key).await {
                tracing::info!(
                    backup_id = backup_id,
                    backup_name = %key.backup_name,
                    version = key.version,
                    lost_files = sessions.len(),
                    "Version has expired files, finalize blocked until they are re-uploaded"
                );
                continue;
            }

            match self
                .gateway
                .find_backup(&key.client_id, &key.backup_name, key.version)
                .await
            {
                Ok(Some(backup)) if backup.status == BackupStatus::Pending => {
                    tracing::info!(
                        backup_id = backup.id,
                        backup_name = %key.backup_name,
                        version = key.version,
                        "Marking abandoned backup as failed"
                    );
                    self.mark_failed(backup.id, backup.files_count, backup.total_size)
                        .await;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to load backup for expired sessions"),
            }
        }

        count
    }

    /// Start the periodic expiry sweep
    pub fn start_cleanup_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let service = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                service.sweep_expired().await;
            }
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn require_backup(
        &self,
        client_id: &str,
        backup_name: &str,
        version: i64,
    ) -> Result<Backup, UploadError> {
        self.gateway
            .find_backup(client_id, backup_name, version)
            .await?
            .ok_or_else(|| UploadError::BackupNotFound {
                client_id: client_id.to_string(),
                backup_name: backup_name.to_string(),
                version,
            })
    }

    async fn mark_failed(&self, backup_id: i64, files_count: i64, total_size: i64) {
        if let Err(e) = self
            .gateway
            .update_backup_status(backup_id, BackupStatus::Failed, files_count, total_size)
            .await
        {
            tracing::warn!(backup_id = backup_id, error = %e, "Failed to mark backup as failed");
        }
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.gateway.record_audit(&entry).await {
            tracing::warn!(action = entry.action, error = %e, "Failed to write audit entry");
        }
    }
}

fn parse_session_id(raw: &str) -> Result<Uuid, UploadError> {
    Uuid::parse_str(raw).map_err(|_| UploadError::SessionNotFound(raw.to_string()))
}

fn summary_of(backup: &Backup) -> BackupSummary {
    BackupSummary {
        backup_id: backup.id,
        files_count: backup.files_count,
        total_size: backup.total_size,
        timestamp: backup.timestamp,
    }
}

// ============================================================================
// Tests
// ============================================================================
