//! Chunk Store
//!
//! Temporary on-disk storage for uploaded chunks before assembly.
//!
//! Layout: `<root>/<session_id>/<index:08>.chunk`. A chunk is first staged to
//! a uniquely named sibling file and then renamed over its slot, so a resend
//! of the same index replaces the slot atomically and readers never see a
//! half-written chunk.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::checksum::{Checksum, HashingWriter};
use super::types::{ChunkMetadata, UploadError};

/// A chunk written to scratch space but not yet visible in its slot
#[derive(Debug)]
pub struct StagedChunk {
    pub session_id: Uuid,
    pub index: u32,
    pub checksum: Checksum,
    staged_path: PathBuf,
}

/// Local filesystem chunk store
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    base_path: PathBuf,
}

impl ChunkStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner { base_path }),
        }
    }

    /// Scratch folder owned by one session
    pub fn session_dir(&self, session_id: Uuid) -> PathBuf {
        self.inner.base_path.join(session_id.to_string())
    }

    /// Final slot of a chunk
    pub fn chunk_path(&self, session_id: Uuid, chunk_index: u32) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{:08}.chunk", chunk_index))
    }

    /// Create the scratch folder for a new session
    pub async fn create_session_dir(&self, session_id: Uuid) -> Result<PathBuf, UploadError> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| UploadError::storage(dir.display().to_string(), e))?;
        Ok(dir)
    }

    /// Write chunk bytes to a staging file, hashing them on the way to disk
    pub async fn stage_chunk(
        &self,
        session_id: Uuid,
        chunk_index: u32,
        data: &[u8],
    ) -> Result<StagedChunk, UploadError> {
        let staged_path = self.session_dir(session_id).join(format!(
            "{:08}.chunk.{}.tmp",
            chunk_index,
            Uuid::new_v4().simple()
        ));
        let label = staged_path.display().to_string();

        let written = async {
            let file = tokio::fs::File::create(&staged_path).await?;
            let mut writer = HashingWriter::new(file);
            writer.write_all(data).await?;
            let (file, checksum) = writer.finish().await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(checksum)
        }
        .await;

        match written {
            Ok(checksum) => Ok(StagedChunk {
                session_id,
                index: chunk_index,
                checksum,
                staged_path,
            }),
            Err(e) => {
                let _ = tokio::fs::remove_file(&staged_path).await;
                Err(UploadError::storage(label, e))
            }
        }
    }

    /// Move a staged chunk into its slot, replacing any earlier copy
    pub async fn commit_chunk(&self, staged: StagedChunk) -> Result<ChunkMetadata, UploadError> {
        let slot = self.chunk_path(staged.session_id, staged.index);

        if let Err(e) = tokio::fs::rename(&staged.staged_path, &slot).await {
            let _ = tokio::fs::remove_file(&staged.staged_path).await;
            return Err(UploadError::storage(slot.display().to_string(), e));
        }

        Ok(ChunkMetadata {
            index: staged.index,
            checksum: staged.checksum.digest,
            size: staged.checksum.size,
            storage_path: slot,
            stored_at: Utc::now(),
        })
    }

    /// Drop a staged chunk that will not be committed
    pub async fn discard_chunk(&self, staged: StagedChunk) {
        if let Err(e) = tokio::fs::remove_file(&staged.staged_path).await {
            tracing::warn!(
                session_id = %staged.session_id,
                chunk_index = staged.index,
                error = %e,
                "Failed to remove staged chunk"
            );
        }
    }

    /// Open a committed chunk for reading
    pub async fn open_chunk(
        &self,
        session_id: Uuid,
        chunk_index: u32,
    ) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(self.chunk_path(session_id, chunk_index)).await
    }

    /// Delete a session's scratch folder. Returns the number of entries it
    /// held when the deletion started.
    ///
    /// A chunk staged concurrently can land after the listing; the folder is
    /// removed recursively so such late files go with it.
    pub async fn delete_session_chunks(&self, session_id: Uuid) -> Result<usize, UploadError> {
        let session_dir = self.session_dir(session_id);
        let label = session_dir.display().to_string();

        let mut entries = match tokio::fs::read_dir(&session_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(UploadError::storage(label, e)),
        };
        let mut count = 0;
        while entries
            .next_entry()
            .await
            .map_err(|e| UploadError::storage(label.clone(), e))?
            .is_some()
        {
            count += 1;
        }

        let mut attempts = 0;
        loop {
            match tokio::fs::remove_dir_all(&session_dir).await {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(_) if attempts < REMOVE_ATTEMPTS => attempts += 1,
                Err(e) => return Err(UploadError::storage(label, e)),
            }
        }

        Ok(count)
    }
}

/// Retries for a scratch folder that gains files while it is being removed
const REMOVE_ATTEMPTS: u32 = 3;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::checksum::checksum_bytes;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn read_slot(store: &ChunkStore, session_id: Uuid, index: u32) -> Vec<u8> {
        let mut file = store.open_chunk(session_id, index).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_stage_and_commit() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        let session_id = Uuid::new_v4();
        store.create_session_dir(session_id).await.unwrap();

        let data = b"test chunk data";
        let staged = store.stage_chunk(session_id, 0, data).await.unwrap();
        assert_eq!(staged.checksum, checksum_bytes(data));

        let metadata = store.commit_chunk(staged).await.unwrap();
        assert_eq!(metadata.size, data.len() as u64);
        assert_eq!(metadata.storage_path, store.chunk_path(session_id, 0));
        assert_eq!(read_slot(&store, session_id, 0).await, data);
    }

    #[tokio::test]
    async fn test_resend_overwrites_slot() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        let session_id = Uuid::new_v4();
        store.create_session_dir(session_id).await.unwrap();

        let first = store.stage_chunk(session_id, 3, b"old bytes").await.unwrap();
        store.commit_chunk(first).await.unwrap();
        let second = store.stage_chunk(session_id, 3, b"new bytes").await.unwrap();
        store.commit_chunk(second).await.unwrap();

        assert_eq!(read_slot(&store, session_id, 3).await, b"new bytes");

        // Only the slot remains; staging files were renamed away.
        let deleted = store.delete_session_chunks(session_id).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn test_discard_leaves_slot_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        let session_id = Uuid::new_v4();
        store.create_session_dir(session_id).await.unwrap();

        let staged = store.stage_chunk(session_id, 1, b"late").await.unwrap();
        store.discard_chunk(staged).await;

        assert!(store.open_chunk(session_id, 1).await.is_err());
        assert_eq!(store.delete_session_chunks(session_id).await.unwrap(), 0);
        assert!(!store.session_dir(session_id).exists());
    }

    #[tokio::test]
    async fn test_stage_without_session_dir_fails() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());

        let result = store.stage_chunk(Uuid::new_v4(), 0, b"data").await;
        assert!(matches!(result, Err(UploadError::Assembly { .. })));
    }

    #[tokio::test]
    async fn test_delete_removes_uncommitted_and_nested_entries() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        let session_id = Uuid::new_v4();
        let dir = store.create_session_dir(session_id).await.unwrap();

        let committed = store.stage_chunk(session_id, 0, b"kept").await.unwrap();
        store.commit_chunk(committed).await.unwrap();
        let _in_flight = store.stage_chunk(session_id, 1, b"racing").await.unwrap();
        tokio::fs::create_dir(dir.join("late")).await.unwrap();
        tokio::fs::write(dir.join("late").join("x.tmp"), b"x").await.unwrap();

        assert_eq!(store.delete_session_chunks(session_id).await.unwrap(), 3);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_delete_unknown_session() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        assert_eq!(store.delete_session_chunks(Uuid::new_v4()).await.unwrap(), 0);
    }
}
