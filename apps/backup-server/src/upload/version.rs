//! Version Allocator
//!
//! Hands out `max(version) + 1` per (client, backup name). The read of the
//! current maximum and the insert of the new pending backup happen under a
//! per-key async lock, so concurrent starts for one key are serialized while
//! unrelated keys proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::gateway::{BackupGateway, NewBackup};
use super::types::UploadError;

type LockKey = (String, String);

/// A version reserved by inserting its pending backup record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedVersion {
    pub version: i64,
    pub backup_id: i64,
}

#[derive(Clone)]
pub struct VersionAllocator {
    gateway: Arc<dyn BackupGateway>,
    locks: Arc<Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl VersionAllocator {
    pub fn new(gateway: Arc<dyn BackupGateway>) -> Self {
        Self {
            gateway,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Next version for the pair, read from durable state
    pub async fn next_version(&self, client_id: &str, backup_name: &str) -> Result<i64, UploadError> {
        let current = self.gateway.max_version(client_id, backup_name).await?;
        Ok(current.map_or(1, |v| v + 1))
    }

    /// Reserve the next version by creating its pending backup
    pub async fn allocate(
        &self,
        client_id: &str,
        backup_name: &str,
        timestamp: DateTime<Utc>,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<AllocatedVersion, UploadError> {
        let key = (client_id.to_string(), backup_name.to_string());
        let lock = self.key_lock(&key);

        let result = async {
            let _guard = lock.lock().await;
            let version = self.next_version(client_id, backup_name).await?;
            let backup_id = self
                .gateway
                .create_backup(NewBackup {
                    client_id,
                    backup_name,
                    version,
                    timestamp,
                    metadata,
                })
                .await?;
            Ok::<_, UploadError>(AllocatedVersion { version, backup_id })
        }
        .await;

        drop(lock);
        self.release_key(&key);
        let result = result?;

        tracing::debug!(
            client_id = %client_id,
            backup_name = %backup_name,
            version = result.version,
            backup_id = result.backup_id,
            "Allocated backup version"
        );

        Ok(result)
    }

    fn key_lock(&self, key: &LockKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(key.clone()).or_default().clone()
    }

    /// Forget the key's lock once nobody else holds or waits on it
    fn release_key(&self, key: &LockKey) {
        let mut locks = self.locks.lock();
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    /// Keys currently tracked in the lock table
    pub fn tracked_keys(&self) -> usize {
        self.locks.lock().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
