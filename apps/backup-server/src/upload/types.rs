//! Upload types for the chunked backup protocol

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Largest file path (after normalization) accepted for a backup file
pub const MAX_FILE_PATH_LEN: usize = 1024;

/// Largest backup name accepted
pub const MAX_BACKUP_NAME_LEN: usize = 255;

// ============================================================================
// Start Types
// ============================================================================

/// Request to open an upload session for one file.
///
/// Every field is optional on the wire so that absent values surface as
/// `ValidationError` instead of a body rejection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadRequest {
    /// Name of the backup set this file belongs to
    pub backup_name: Option<String>,

    /// Client-side file name or relative path
    pub file_name: Option<String>,

    /// Declared total size in bytes (advisory)
    pub file_size: Option<i64>,

    /// Declared number of chunks (advisory)
    pub total_chunks: Option<i64>,

    /// Opaque metadata stored on the backup record
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Join an existing pending version instead of allocating a new one
    #[serde(default)]
    pub version: Option<i64>,

    /// Declared SHA-256 of the whole file (hex)
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Response to a start request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadResponse {
    /// Upload session ID
    pub session_id: String,

    /// Version the file is recorded under
    pub version: i64,

    /// Backup record the version maps to
    pub backup_id: i64,

    /// Normalized path the file will be stored under
    pub file_path: String,

    /// Total chunks expected
    pub total_chunks: u32,

    /// When the session expires if no chunk arrives
    pub expires_at: DateTime<Utc>,
}

/// A start request after validation and normalization
#[derive(Debug, Clone)]
pub struct NewSession {
    pub client_id: String,
    pub backup_name: String,
    pub file_path: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub version: Option<i64>,
    pub checksum: Option<String>,
}

// ============================================================================
// Chunk Upload Types
// ============================================================================

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    /// Chunk index that was uploaded
    pub chunk_index: u32,

    /// Distinct chunks received so far
    pub uploaded_chunks: usize,

    /// Total chunks expected
    pub total_chunks: u32,

    /// Whether all chunks have been received
    pub complete: bool,
}

/// Metadata for a persisted chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Chunk index within its session
    pub index: u32,

    /// SHA-256 of the chunk (hex)
    pub checksum: String,

    /// Size in bytes
    pub size: u64,

    /// Slot path on disk
    pub storage_path: PathBuf,

    /// When the chunk was stored
    pub stored_at: DateTime<Utc>,
}

// ============================================================================
// Finalize Types
// ============================================================================

/// Request to finalize a version
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub backup_name: Option<String>,
    pub version: Option<i64>,
}

/// Summary of a committed version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub backup_id: i64,
    pub files_count: i64,
    pub total_size: i64,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Session Types
// ============================================================================

/// Upload session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No chunk received yet
    Created,
    /// Some chunks received
    Receiving,
    /// Every declared chunk received
    Complete,
    /// Being assembled; chunk writes are rejected
    Finalizing,
    /// Assembled and committed
    Finalized,
    /// Garbage collected after the idle window
    Expired,
}

impl SessionState {
    /// Whether chunk writes are still accepted
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Created | Self::Receiving | Self::Complete)
    }

    /// Whether the session reached a state it can never leave
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Expired)
    }
}

/// Mutable bookkeeping of a session, guarded by the session's own lock
#[derive(Debug, Clone)]
pub struct SessionProgress {
    /// Distinct chunk indices persisted so far
    pub received: BTreeSet<u32>,

    /// Current lifecycle state
    pub state: SessionState,

    /// Last accepted chunk (or creation)
    pub last_activity: DateTime<Utc>,
}

impl SessionProgress {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            received: BTreeSet::new(),
            state: SessionState::Created,
            last_activity: now,
        }
    }

    /// Distinct chunks received
    pub fn uploaded_chunks(&self) -> usize {
        self.received.len()
    }

    /// Record a committed chunk. Returns false when the index was already counted.
    pub fn mark_chunk_received(&mut self, index: u32, total_chunks: u32, now: DateTime<Utc>) -> bool {
        let inserted = self.received.insert(index);
        self.last_activity = now;
        self.state = if self.received.len() == total_chunks as usize {
            SessionState::Complete
        } else {
            SessionState::Receiving
        };
        inserted
    }

    /// Indices that still need to be uploaded
    pub fn missing_chunks(&self, total_chunks: u32) -> Vec<u32> {
        (0..total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }
}

/// Point-in-time view of a session, returned by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub client_id: String,
    pub backup_name: String,
    pub file_path: String,
    pub version: i64,
    pub backup_id: i64,
    pub file_size: u64,
    pub total_chunks: u32,
    pub uploaded_chunks: usize,
    pub missing_chunks: Vec<u32>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Backup not found: {client_id}/{backup_name} v{version}")]
    BackupNotFound {
        client_id: String,
        backup_name: String,
        version: i64,
    },

    #[error("Session busy: {0}")]
    SessionBusy(String),

    #[error("Chunk index out of bounds: {index} (total: {total})")]
    ChunkIndexOutOfBounds { index: u32, total: u32 },

    #[error("Chunk checksum mismatch for index {index}: expected {expected}, got {actual}")]
    ChunkChecksumMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("Incomplete upload for {file_path}: {uploaded}/{total} chunks received")]
    IncompleteUpload {
        file_path: String,
        uploaded: usize,
        total: u32,
        missing: Vec<u32>,
    },

    #[error("Assembly failed for {file_path}: {reason}")]
    Assembly { file_path: String, reason: String },

    #[error("Integrity check failed for {file_path}: {reason}")]
    IntegrityMismatch { file_path: String, reason: String },

    #[error("Version conflict: {client_id}/{backup_name} v{version} already exists")]
    VersionConflict {
        client_id: String,
        backup_name: String,
        version: i64,
    },

    #[error("Database error: {0}")]
    Database(String),
}

impl UploadError {
    /// I/O failure while touching chunk or artifact storage
    pub fn storage(file_path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Assembly {
            file_path: file_path.into(),
            reason: err.to_string(),
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::BackupNotFound { .. } => StatusCode::NOT_FOUND,
            Self::SessionBusy(_) => StatusCode::CONFLICT,
            Self::ChunkIndexOutOfBounds { .. } => StatusCode::BAD_REQUEST,
            Self::ChunkChecksumMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::IncompleteUpload { .. } => StatusCode::CONFLICT,
            Self::Assembly { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::IntegrityMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::VersionConflict { .. } => StatusCode::CONFLICT,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::BackupNotFound { .. } => "BACKUP_NOT_FOUND",
            Self::SessionBusy(_) => "SESSION_BUSY",
            Self::ChunkIndexOutOfBounds { .. } => "CHUNK_INDEX_OUT_OF_BOUNDS",
            Self::ChunkChecksumMismatch { .. } => "CHUNK_CHECKSUM_MISMATCH",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::Assembly { .. } => "ASSEMBLY_ERROR",
            Self::IntegrityMismatch { .. } => "ASSEMBLY_ERROR",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Whether the caller may retry (resend a chunk, continue, finalize again)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SessionBusy(_)
            | Self::ChunkChecksumMismatch { .. }
            | Self::IncompleteUpload { .. }
            | Self::Assembly { .. }
            | Self::IntegrityMismatch { .. }
            | Self::Database(_) => true,
            Self::Validation(_)
            | Self::SessionNotFound(_)
            | Self::BackupNotFound { .. }
            | Self::ChunkIndexOutOfBounds { .. }
            | Self::VersionConflict { .. } => false,
        }
    }
}
