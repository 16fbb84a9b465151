//! Shared fixtures for unit tests

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::config::{Config, DatabaseConfig};
use crate::db::{create_pool, ClientRepository, SqliteBackupGateway};
use crate::state::AppState;
use crate::upload::{BackupGateway, UploadService};

/// Fresh in-memory database with the schema applied
pub async fn pool() -> SqlitePool {
    create_pool(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
    })
    .await
    .unwrap()
}

pub async fn gateway() -> Arc<dyn BackupGateway> {
    Arc::new(SqliteBackupGateway::new(pool().await))
}

/// Deterministic, non-repeating-looking test content
pub fn payload(len: usize) -> Vec<u8> {
    (0..len as u64)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
        .collect()
}

/// Configuration rooted in a temporary directory
pub fn config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.database.url = "sqlite::memory:".to_string();
    config.storage.backup_root = temp_dir.path().join("backups");
    config.storage.chunk_root = temp_dir.path().join("chunks");
    config
}

async fn build_state(config: Config, clients: &[(&str, &str)]) -> AppState {
    let db = pool().await;
    let repo = ClientRepository::new(&db);
    for (client_id, api_key) in clients {
        repo.register(client_id, api_key).await.unwrap();
    }
    AppState::new(config, db).await.unwrap()
}

/// Application state with the given `(client_id, api_key)` pairs registered
pub async fn app_state(clients: &[(&str, &str)]) -> (AppState, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let state = build_state(config(&temp_dir), clients).await;
    (state, temp_dir)
}

/// Upload service plus direct access to its database
pub struct TestContext {
    pub temp_dir: TempDir,
    pub gateway: SqliteBackupGateway,
    pub service: UploadService,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_idle_timeout(Duration::from_secs(3600)).await
    }

    pub async fn with_idle_timeout(idle: Duration) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config(&temp_dir);
        config.upload.session_idle_secs = idle.as_secs();

        let state = build_state(config, &[]).await;
        Self {
            gateway: SqliteBackupGateway::new(state.db().clone()),
            service: state.uploads().clone(),
            temp_dir,
        }
    }

    pub fn backup_root(&self) -> PathBuf {
        self.temp_dir.path().join("backups")
    }

    pub fn chunk_root(&self) -> PathBuf {
        self.temp_dir.path().join("chunks")
    }
}
