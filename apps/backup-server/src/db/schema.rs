//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Clients allowed to upload (API keys stored as SHA-256 hex)
CREATE TABLE IF NOT EXISTS clients (
    client_id TEXT PRIMARY KEY,
    api_key_hash TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per version of a named backup set
CREATE TABLE IF NOT EXISTS backups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id TEXT NOT NULL,
    backup_name TEXT NOT NULL,
    version INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    -- 'pending', 'completed' or 'failed'
    status TEXT NOT NULL DEFAULT 'pending',
    files_count INTEGER NOT NULL DEFAULT 0,
    total_size INTEGER NOT NULL DEFAULT 0,
    metadata TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),

    UNIQUE(client_id, backup_name, version)
);

CREATE INDEX IF NOT EXISTS idx_backups_client ON backups(client_id, backup_name);
CREATE INDEX IF NOT EXISTS idx_backups_status ON backups(status);

-- Files committed (or flagged) within a backup version
CREATE TABLE IF NOT EXISTS backup_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backup_id INTEGER NOT NULL REFERENCES backups(id) ON DELETE CASCADE,
    file_path TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    status TEXT NOT NULL,
    uploaded_at TEXT NOT NULL,

    UNIQUE(backup_id, file_path)
);

CREATE INDEX IF NOT EXISTS idx_backup_files_backup ON backup_files(backup_id);

-- Append-only audit trail
CREATE TABLE IF NOT EXISTS audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id TEXT NOT NULL,
    action TEXT NOT NULL,
    outcome TEXT NOT NULL,
    backup_id INTEGER,
    bytes INTEGER NOT NULL DEFAULT 0,
    detail TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_client ON audit_logs(client_id);
CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_logs(created_at);
"#;
