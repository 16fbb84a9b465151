//! Chunked Backup Upload
//!
//! Reliable transfer of large backup files with:
//! - Resumable, idempotent chunk uploads
//! - Monotonic per-(client, backup name) versioning
//! - Streaming SHA-256 verification of assembled files
//!
//! Protocol Flow:
//! 1. Client starts one session per file and receives a version
//! 2. Client uploads chunks in any order, resending on failure
//! 3. Client finalizes the version once every file is complete
//! 4. Server assembles, verifies and commits each file, then the version

pub mod assembler;
pub mod checksum;
pub mod chunk_store;
pub mod gateway;
pub mod naming;
pub mod service;
pub mod session;
pub mod types;
pub mod version;

pub use assembler::{AssembledFile, Assembler};
pub use checksum::{checksum_bytes, checksum_file, Checksum, HashingWriter};
pub use chunk_store::ChunkStore;
pub use gateway::{AuditEntry, Backup, BackupFileRecord, BackupGateway, BackupStatus, NewBackup};
pub use service::{UploadLimits, UploadService};
pub use session::{SessionManager, UploadSession, VersionKey};
pub use types::*;
pub use version::{AllocatedVersion, VersionAllocator};
