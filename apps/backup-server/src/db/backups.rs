//! Backup metadata database operations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::upload::{
    AuditEntry, Backup, BackupFileRecord, BackupGateway, BackupStatus, NewBackup, UploadError,
};

/// Backup row as stored
#[derive(Debug, Clone, sqlx::FromRow)]
struct BackupRow {
    id: i64,
    client_id: String,
    backup_name: String,
    version: i64,
    timestamp: String,
    status: String,
    files_count: i64,
    total_size: i64,
    metadata: Option<String>,
}

impl BackupRow {
    fn into_backup(self) -> Result<Backup, UploadError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| UploadError::Database(format!("bad timestamp on backup {}: {}", self.id, e)))?
            .with_timezone(&Utc);

        let metadata = match self.metadata.as_deref() {
            None | Some("") => serde_json::Map::new(),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| UploadError::Database(format!("bad metadata on backup {}: {}", self.id, e)))?,
        };

        Ok(Backup {
            id: self.id,
            client_id: self.client_id,
            backup_name: self.backup_name,
            version: self.version,
            timestamp,
            status: self.status.parse()?,
            files_count: self.files_count,
            total_size: self.total_size,
            metadata,
        })
    }
}

/// File record within a backup
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BackupFile {
    pub id: i64,
    pub backup_id: i64,
    pub file_path: String,
    pub file_size: i64,
    pub checksum: String,
    pub status: String,
    pub uploaded_at: String,
}

/// Audit log record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLog {
    pub id: i64,
    pub client_id: String,
    pub action: String,
    pub outcome: String,
    pub backup_id: Option<i64>,
    pub bytes: i64,
    pub detail: String,
    pub created_at: String,
}

fn db_error(err: sqlx::Error) -> UploadError {
    tracing::error!("Database error: {}", err);
    UploadError::Database(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// SQLite-backed implementation of [`BackupGateway`]
#[derive(Clone)]
pub struct SqliteBackupGateway {
    pool: SqlitePool,
}

impl SqliteBackupGateway {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Files recorded for a backup, ordered by path
    pub async fn list_backup_files(&self, backup_id: i64) -> Result<Vec<BackupFile>, UploadError> {
        sqlx::query_as::<_, BackupFile>(
            r#"
            SELECT id, backup_id, file_path, file_size, checksum, status, uploaded_at
            FROM backup_files
            WHERE backup_id = ?
            ORDER BY file_path
            "#,
        )
        .bind(backup_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }

    /// Audit trail of one client, oldest first
    pub async fn list_audit(&self, client_id: &str) -> Result<Vec<AuditLog>, UploadError> {
        sqlx::query_as::<_, AuditLog>(
            r#"
            SELECT id, client_id, action, outcome, backup_id, bytes, detail, created_at
            FROM audit_logs
            WHERE client_id = ?
            ORDER BY id
            "#,
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }
}

#[async_trait]
impl BackupGateway for SqliteBackupGateway {
    async fn create_backup(&self, backup: NewBackup<'_>) -> Result<i64, UploadError> {
        let metadata = serde_json::to_string(backup.metadata)
            .map_err(|e| UploadError::Validation(format!("metadata is not serializable: {}", e)))?;
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            INSERT INTO backups (client_id, backup_name, version, timestamp, status, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(backup.client_id)
        .bind(backup.backup_name)
        .bind(backup.version)
        .bind(backup.timestamp.to_rfc3339())
        .bind(&metadata)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(UploadError::VersionConflict {
                client_id: backup.client_id.to_string(),
                backup_name: backup.backup_name.to_string(),
                version: backup.version,
            }),
            Err(e) => Err(db_error(e)),
        }
    }

    async fn find_backup(
        &self,
        client_id: &str,
        backup_name: &str,
        version: i64,
    ) -> Result<Option<Backup>, UploadError> {
        let row = sqlx::query_as::<_, BackupRow>(
            r#"
            SELECT id, client_id, backup_name, version, timestamp, status,
                   files_count, total_size, metadata
            FROM backups
            WHERE client_id = ? AND backup_name = ? AND version = ?
            "#,
        )
        .bind(client_id)
        .bind(backup_name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(BackupRow::into_backup).transpose()
    }

    async fn update_backup_status(
        &self,
        backup_id: i64,
        status: BackupStatus,
        files_count: i64,
        total_size: i64,
    ) -> Result<(), UploadError> {
        let result = sqlx::query(
            r#"
            UPDATE backups
            SET status = ?, files_count = ?, total_size = ?, updated_at = ?
            WHERE id = ? AND status != 'completed'
            "#,
        )
        .bind(status.as_str())
        .bind(files_count)
        .bind(total_size)
        .bind(Utc::now().to_rfc3339())
        .bind(backup_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            tracing::debug!(backup_id = backup_id, status = %status, "Backup status left unchanged");
        }

        Ok(())
    }

    async fn upsert_backup_file(
        &self,
        backup_id: i64,
        file: &BackupFileRecord,
    ) -> Result<(), UploadError> {
        sqlx::query(
            r#"
            INSERT INTO backup_files (backup_id, file_path, file_size, checksum, status, uploaded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(backup_id, file_path) DO UPDATE SET
                file_size = excluded.file_size,
                checksum = excluded.checksum,
                status = excluded.status,
                uploaded_at = excluded.uploaded_at
            "#,
        )
        .bind(backup_id)
        .bind(&file.file_path)
        .bind(file.file_size)
        .bind(&file.checksum)
        .bind(file.status.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn max_version(
        &self,
        client_id: &str,
        backup_name: &str,
    ) -> Result<Option<i64>, UploadError> {
        sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(version) FROM backups WHERE client_id = ? AND backup_name = ?",
        )
        .bind(client_id)
        .bind(backup_name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn record_audit(&self, entry: &AuditEntry) -> Result<(), UploadError> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (client_id, action, outcome, backup_id, bytes, detail, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.client_id)
        .bind(entry.action)
        .bind(entry.outcome)
        .bind(entry.backup_id)
        .bind(entry.bytes)
        .bind(&entry.detail)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn new_backup<'a>(
        version: i64,
        metadata: &'a serde_json::Map<String, serde_json::Value>,
    ) -> NewBackup<'a> {
        NewBackup {
            client_id: "acme",
            backup_name: "nightly",
            version,
            timestamp: Utc::now(),
            metadata,
        }
    }

    #[tokio::test]
    async fn test_create_and_find_backup() {
        let gateway = SqliteBackupGateway::new(testutil::pool().await);
        let mut metadata = serde_json::Map::new();
        metadata.insert("host".into(), serde_json::json!("db01"));

        let id = gateway.create_backup(new_backup(1, &metadata)).await.unwrap();
        let backup = gateway.find_backup("acme", "nightly", 1).await.unwrap().unwrap();

        assert_eq!(backup.id, id);
        assert_eq!(backup.status, BackupStatus::Pending);
        assert_eq!(backup.metadata, metadata);
        assert_eq!(backup.files_count, 0);
        assert!(gateway.find_backup("acme", "nightly", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_version_is_conflict() {
        let gateway = SqliteBackupGateway::new(testutil::pool().await);
        let metadata = serde_json::Map::new();

        gateway.create_backup(new_backup(1, &metadata)).await.unwrap();
        let result = gateway.create_backup(new_backup(1, &metadata)).await;

        assert!(matches!(result, Err(UploadError::VersionConflict { version: 1, .. })));
    }

    #[tokio::test]
    async fn test_max_version() {
        let gateway = SqliteBackupGateway::new(testutil::pool().await);
        let metadata = serde_json::Map::new();

        assert_eq!(gateway.max_version("acme", "nightly").await.unwrap(), None);
        gateway.create_backup(new_backup(1, &metadata)).await.unwrap();
        gateway.create_backup(new_backup(4, &metadata)).await.unwrap();
        assert_eq!(gateway.max_version("acme", "nightly").await.unwrap(), Some(4));
        assert_eq!(gateway.max_version("acme", "weekly").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_completed_backup_is_never_modified() {
        let gateway = SqliteBackupGateway::new(testutil::pool().await);
        let metadata = serde_json::Map::new();
        let id = gateway.create_backup(new_backup(1, &metadata)).await.unwrap();

        gateway
            .update_backup_status(id, BackupStatus::Failed, 0, 0)
            .await
            .unwrap();
        gateway
            .update_backup_status(id, BackupStatus::Completed, 2, 300)
            .await
            .unwrap();
        gateway
            .update_backup_status(id, BackupStatus::Failed, 0, 0)
            .await
            .unwrap();

        let backup = gateway.find_backup("acme", "nightly", 1).await.unwrap().unwrap();
        assert_eq!(backup.status, BackupStatus::Completed);
        assert_eq!((backup.files_count, backup.total_size), (2, 300));
    }

    #[tokio::test]
    async fn test_upsert_backup_file_replaces_record() {
        let gateway = SqliteBackupGateway::new(testutil::pool().await);
        let metadata = serde_json::Map::new();
        let id = gateway.create_backup(new_backup(1, &metadata)).await.unwrap();

        let mut record = BackupFileRecord {
            file_path: "db.bak".into(),
            file_size: 10,
            checksum: "aa".into(),
            status: BackupStatus::Failed,
        };
        gateway.upsert_backup_file(id, &record).await.unwrap();
        record.checksum = "bb".into();
        record.status = BackupStatus::Completed;
        gateway.upsert_backup_file(id, &record).await.unwrap();

        let files = gateway.list_backup_files(id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].checksum, "bb");
        assert_eq!(files[0].status, "completed");
    }

    #[tokio::test]
    async fn test_record_audit() {
        let gateway = SqliteBackupGateway::new(testutil::pool().await);

        gateway
            .record_audit(&AuditEntry {
                client_id: "acme".into(),
                action: "upload_start",
                outcome: "success",
                backup_id: None,
                bytes: 0,
                detail: "db.bak".into(),
            })
            .await
            .unwrap();

        let audit = gateway.list_audit("acme").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "upload_start");
        assert!(gateway.list_audit("globex").await.unwrap().is_empty());
    }
}
