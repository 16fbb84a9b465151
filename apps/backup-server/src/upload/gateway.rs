//! Backup Metadata Gateway
//!
//! The narrow persistence surface the upload core calls into. The SQLite
//! implementation lives in `crate::db::backups`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::UploadError;

/// Backup / file record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UploadError::Database(format!("unknown status {other:?}"))),
        }
    }
}

/// One versioned snapshot of a named backup set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub id: i64,
    pub client_id: String,
    pub backup_name: String,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub status: BackupStatus,
    pub files_count: i64,
    pub total_size: i64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Values for a new pending backup
#[derive(Debug, Clone)]
pub struct NewBackup<'a> {
    pub client_id: &'a str,
    pub backup_name: &'a str,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
    pub metadata: &'a serde_json::Map<String, serde_json::Value>,
}

/// A file record as written by the finalizer
#[derive(Debug, Clone)]
pub struct BackupFileRecord {
    pub file_path: String,
    pub file_size: i64,
    pub checksum: String,
    pub status: BackupStatus,
}

/// One audit log line
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub client_id: String,
    pub action: &'static str,
    pub outcome: &'static str,
    pub backup_id: Option<i64>,
    pub bytes: i64,
    pub detail: String,
}

/// Persistence operations required by the upload core
#[async_trait::async_trait]
pub trait BackupGateway: Send + Sync {
    /// Insert a pending backup; fails with `VersionConflict` if the triple exists
    async fn create_backup(&self, backup: NewBackup<'_>) -> Result<i64, UploadError>;

    async fn find_backup(
        &self,
        client_id: &str,
        backup_name: &str,
        version: i64,
    ) -> Result<Option<Backup>, UploadError>;

    /// Set status and aggregates. A completed backup is never modified.
    async fn update_backup_status(
        &self,
        backup_id: i64,
        status: BackupStatus,
        files_count: i64,
        total_size: i64,
    ) -> Result<(), UploadError>;

    async fn upsert_backup_file(
        &self,
        backup_id: i64,
        file: &BackupFileRecord,
    ) -> Result<(), UploadError>;

    async fn max_version(
        &self,
        client_id: &str,
        backup_name: &str,
    ) -> Result<Option<i64>, UploadError>;

    async fn record_audit(&self, entry: &AuditEntry) -> Result<(), UploadError>;
}
