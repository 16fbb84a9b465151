//! Application state management

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::SqliteBackupGateway;
use crate::upload::{Assembler, ChunkStore, SessionManager, UploadLimits, UploadService};

/// Error type for state initialization
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to create storage directory {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    uploads: UploadService,
}

impl AppState {
    /// Create a new application state
    ///
    /// Creates the backup and chunk roots if they do not exist yet.
    pub async fn new(config: Config, db: SqlitePool) -> Result<Self, StateError> {
        for dir in [&config.storage.backup_root, &config.storage.chunk_root] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| StateError::Storage {
                    path: dir.clone(),
                    source,
                })?;
        }

        let chunk_store = ChunkStore::new(config.storage.chunk_root.clone());
        let sessions = SessionManager::new(
            chunk_store.clone(),
            Duration::from_secs(config.upload.session_idle_secs),
        );
        let assembler = Assembler::new(
            config.storage.backup_root.clone(),
            chunk_store,
            config.upload.verify_after_write,
        );
        let uploads = UploadService::new(
            Arc::new(SqliteBackupGateway::new(db.clone())),
            sessions,
            assembler,
            UploadLimits {
                max_total_chunks: config.upload.max_total_chunks,
            },
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                uploads,
            }),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the upload service
    pub fn uploads(&self) -> &UploadService {
        &self.inner.uploads
    }
}
