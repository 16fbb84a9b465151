//! File Assembler
//!
//! Concatenates a session's chunks in index order into
//! `<backup_root>/<client>/<backup_name>/v<version>/<file_path>`.
//!
//! Bytes are hashed while they stream to `<backup_name>/.staging/<uuid>.tmp`,
//! outside every version tree, so no uploaded path can collide with a file
//! being assembled. The staged file is synced and renamed into place only
//! after the size and declared checksum check out; a failed assembly deletes
//! it.

use std::path::{Path, PathBuf};

use tokio::io::BufWriter;
use uuid::Uuid;

use super::checksum::{checksum_file, Checksum, HashingWriter};
use super::chunk_store::ChunkStore;
use super::session::UploadSession;
use super::types::UploadError;

/// A file written and verified in the backup tree
#[derive(Debug, Clone)]
pub struct AssembledFile {
    pub file_path: String,
    pub artifact_path: PathBuf,
    pub checksum: Checksum,
}

/// Why an assembly failed, plus what was observed before it did
#[derive(Debug)]
pub struct AssemblyFailure {
    pub error: UploadError,
    pub observed: Option<Checksum>,
}

impl From<UploadError> for AssemblyFailure {
    fn from(error: UploadError) -> Self {
        Self {
            error,
            observed: None,
        }
    }
}

#[derive(Clone)]
pub struct Assembler {
    backup_root: PathBuf,
    chunk_store: ChunkStore,
    verify_after_write: bool,
}

impl Assembler {
    pub fn new(backup_root: PathBuf, chunk_store: ChunkStore, verify_after_write: bool) -> Self {
        Self {
            backup_root,
            chunk_store,
            verify_after_write,
        }
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Where a file of a given version lives in the backup tree
    pub fn artifact_path(
        &self,
        client_id: &str,
        backup_name: &str,
        version: i64,
        file_path: &str,
    ) -> PathBuf {
        let mut path = self
            .backup_root
            .join(client_id)
            .join(backup_name)
            .join(format!("v{}", version));
        for segment in file_path.split('/') {
            path.push(segment);
        }
        path
    }

    /// Scratch folder for files of a backup set still being assembled
    pub fn staging_dir(&self, client_id: &str, backup_name: &str) -> PathBuf {
        self.backup_root
            .join(client_id)
            .join(backup_name)
            .join(STAGING_DIR)
    }

    /// Assemble and verify one session's file
    pub async fn assemble(&self, session: &UploadSession) -> Result<AssembledFile, AssemblyFailure> {
        let artifact_path = self.artifact_path(
            &session.client_id,
            &session.backup_name,
            session.version,
            &session.file_path,
        );
        let staging_dir = self.staging_dir(&session.client_id, &session.backup_name);
        let staged_path = staging_dir.join(format!("{}.tmp", Uuid::new_v4().simple()));
        let storage_err = |e: std::io::Error| UploadError::storage(session.file_path.clone(), e);

        tokio::fs::create_dir_all(&staging_dir).await.map_err(storage_err)?;

        let staged = self.write_staged(session, &staged_path).await;
        let checksum = match staged {
            Ok(checksum) => checksum,
            Err(failure) => {
                discard(&staged_path).await;
                return Err(failure);
            }
        };

        let moved = async {
            if let Some(parent) = artifact_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&staged_path, &artifact_path).await
        };
        if let Err(e) = moved.await {
            discard(&staged_path).await;
            return Err(storage_err(e).into());
        }

        if self.verify_after_write {
            let on_disk = checksum_file(&artifact_path).await.map_err(storage_err)?;
            if on_disk != checksum {
                return Err(mismatch(
                    session,
                    format!(
                        "stored artifact hashes to {} ({} bytes), stream hashed to {}",
                        on_disk.digest, on_disk.size, checksum.digest
                    ),
                    checksum,
                ));
            }
        }

        tracing::debug!(
            session_id = %session.id,
            file_path = %session.file_path,
            size = checksum.size,
            checksum = %checksum.digest,
            "Assembled file"
        );

        Ok(AssembledFile {
            file_path: session.file_path.clone(),
            artifact_path,
            checksum,
        })
    }

    /// Concatenate the chunks into `staged_path` and check size and checksum
    async fn write_staged(
        &self,
        session: &UploadSession,
        staged_path: &Path,
    ) -> Result<Checksum, AssemblyFailure> {
        let storage_err = |e: std::io::Error| UploadError::storage(session.file_path.clone(), e);

        let file = tokio::fs::File::create(staged_path).await.map_err(storage_err)?;
        let mut writer = HashingWriter::new(BufWriter::new(file));

        for index in 0..session.total_chunks {
            let mut chunk = self
                .chunk_store
                .open_chunk(session.id, index)
                .await
                .map_err(|e| {
                    UploadError::storage(session.file_path.clone(), format!("chunk {}: {}", index, e))
                })?;
            tokio::io::copy(&mut chunk, &mut writer)
                .await
                .map_err(|e| {
                    UploadError::storage(session.file_path.clone(), format!("chunk {}: {}", index, e))
                })?;
        }

        let (buffered, checksum) = writer.finish().await.map_err(storage_err)?;
        buffered.into_inner().sync_all().await.map_err(storage_err)?;

        if checksum.size != session.file_size {
            return Err(mismatch(
                session,
                format!(
                    "declared {} bytes, assembled {} bytes",
                    session.file_size, checksum.size
                ),
                checksum,
            ));
        }

        if let Some(declared) = &session.checksum {
            if !checksum.matches(declared) {
                return Err(mismatch(
                    session,
                    format!("declared checksum {}, assembled {}", declared, checksum.digest),
                    checksum,
                ));
            }
        }

        Ok(checksum)
    }
}

const STAGING_DIR: &str = ".staging";

async fn discard(staged_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(staged_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %staged_path.display(), error = %e, "Failed to remove staged file");
        }
    }
}

fn mismatch(session: &UploadSession, reason: String, observed: Checksum) -> AssemblyFailure {
    tracing::warn!(
        session_id = %session.id,
        file_path = %session.file_path,
        reason = %reason,
        "Assembled file failed integrity check"
    );
    AssemblyFailure {
        error: UploadError::IntegrityMismatch {
            file_path: session.file_path.clone(),
            reason,
        },
        observed: Some(observed),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::checksum::checksum_bytes;
    use crate::upload::session::SessionManager;
    use crate::upload::types::NewSession;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        manager: SessionManager,
        assembler: Assembler,
    }

    fn fixture(verify_after_write: bool) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let chunk_store = ChunkStore::new(temp_dir.path().join("chunks"));
        let manager = SessionManager::new(chunk_store.clone(), Duration::from_secs(3600));
        let assembler = Assembler::new(temp_dir.path().join("backups"), chunk_store, verify_after_write);
        Fixture {
            _temp_dir: temp_dir,
            manager,
            assembler,
        }
    }

    async fn uploaded_session(
        fixture: &Fixture,
        file_path: &str,
        chunks: &[&[u8]],
        declared_size: u64,
        checksum: Option<String>,
    ) -> Arc<UploadSession> {
        let request = NewSession {
            client_id: "acme".into(),
            backup_name: "nightly".into(),
            file_path: file_path.into(),
            file_size: declared_size,
            total_chunks: chunks.len() as u32,
            metadata: serde_json::Map::new(),
            version: None,
            checksum,
        };
        let session = fixture.manager.create_session(&request, 1, 1).await.unwrap();
        // Out of order on purpose; assembly must follow index order.
        for (index, data) in chunks.iter().enumerate().rev() {
            fixture
                .manager
                .receive_chunk("acme", session.id, index as u32, data, None)
                .await
                .unwrap();
        }
        session
    }

    async fn staged_files(fixture: &Fixture) -> usize {
        let dir = fixture.assembler.staging_dir("acme", "nightly");
        let mut entries = tokio::fs::read_dir(dir).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_assembles_in_index_order() {
        let fixture = fixture(true);
        let session = uploaded_session(&fixture, "dir/db.bak", &[b"one-", b"two-", b"three"], 13, None).await;

        let assembled = fixture.assembler.assemble(&session).await.unwrap();

        let expected_path = fixture.assembler.backup_root().join("acme/nightly/v1/dir/db.bak");
        assert_eq!(assembled.artifact_path, expected_path);
        assert_eq!(tokio::fs::read(&expected_path).await.unwrap(), b"one-two-three");
        assert_eq!(assembled.checksum, checksum_bytes(b"one-two-three"));
        assert_eq!(staged_files(&fixture).await, 0);
    }

    #[tokio::test]
    async fn test_declared_checksum_is_verified() {
        let fixture = fixture(false);
        let good = checksum_bytes(b"hello world").digest;
        let session = uploaded_session(&fixture, "ok.bin", &[b"hello ", b"world"], 11, Some(good)).await;

        assert!(fixture.assembler.assemble(&session).await.is_ok());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_discards_staged_file() {
        let fixture = fixture(false);
        let wrong = checksum_bytes(b"something else").digest;
        let session = uploaded_session(&fixture, "bad.bin", &[b"hello ", b"world"], 11, Some(wrong)).await;

        let failure = fixture.assembler.assemble(&session).await.unwrap_err();

        assert!(matches!(failure.error, UploadError::IntegrityMismatch { .. }));
        assert_eq!(failure.observed, Some(checksum_bytes(b"hello world")));
        let artifact = fixture.assembler.artifact_path("acme", "nightly", 1, "bad.bin");
        assert!(!artifact.exists());
        assert_eq!(staged_files(&fixture).await, 0);
    }

    #[tokio::test]
    async fn test_size_mismatch_is_integrity_error() {
        let fixture = fixture(false);
        let session = uploaded_session(&fixture, "short.bin", &[b"abc", b"def"], 10, None).await;

        let failure = fixture.assembler.assemble(&session).await.unwrap_err();
        assert!(matches!(failure.error, UploadError::IntegrityMismatch { .. }));
        assert_eq!(failure.observed.unwrap().size, 6);
    }

    #[tokio::test]
    async fn test_file_named_like_a_staging_suffix_survives_its_sibling() {
        let fixture = fixture(true);
        let part = uploaded_session(&fixture, "x.part", &[b"AAAAA"], 5, None).await;
        let plain = uploaded_session(&fixture, "x", &[b"BBBBB"], 5, None).await;

        fixture.assembler.assemble(&part).await.unwrap();
        fixture.assembler.assemble(&plain).await.unwrap();

        let version_dir = fixture.assembler.backup_root().join("acme/nightly/v1");
        assert_eq!(tokio::fs::read(version_dir.join("x.part")).await.unwrap(), b"AAAAA");
        assert_eq!(tokio::fs::read(version_dir.join("x")).await.unwrap(), b"BBBBB");
    }

    #[tokio::test]
    async fn test_missing_chunk_file_is_assembly_error() {
        let fixture = fixture(false);
        let session = uploaded_session(&fixture, "gone.bin", &[b"abc", b"def"], 6, None).await;
        tokio::fs::remove_file(fixture.manager.chunk_store().chunk_path(session.id, 1))
            .await
            .unwrap();

        let failure = fixture.assembler.assemble(&session).await.unwrap_err();
        assert!(matches!(failure.error, UploadError::Assembly { .. }));
        assert!(failure.observed.is_none());
    }
}
