//! Checksum Engine
//!
//! Streaming SHA-256 with byte counting. Two entry points share one hasher:
//! - [`HashingWriter`] taps bytes as they are written to their destination
//! - [`checksum_file`] reads a finished file back from disk
//!
//! Both yield the same lowercase hex digest for the same content.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Read buffer used by the post-hoc path
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Final digest and byte count of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    /// Lowercase hex SHA-256
    pub digest: String,
    /// Bytes hashed
    pub size: u64,
}

impl Checksum {
    /// Case-insensitive comparison against a client-declared hex digest
    pub fn matches(&self, declared: &str) -> bool {
        self.digest.eq_ignore_ascii_case(declared.trim())
    }
}

/// Incremental SHA-256 hasher that also counts bytes
#[derive(Clone, Default)]
pub struct StreamingChecksum {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    pub fn finalize(self) -> Checksum {
        Checksum {
            digest: hex::encode(self.hasher.finalize()),
            size: self.bytes,
        }
    }
}

/// Checksum of an in-memory buffer
pub fn checksum_bytes(data: &[u8]) -> Checksum {
    let mut checksum = StreamingChecksum::new();
    checksum.update(data);
    checksum.finalize()
}

/// Hash everything `reader` yields, in constant memory
pub async fn checksum_reader<R>(reader: &mut R) -> io::Result<Checksum>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut checksum = StreamingChecksum::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        checksum.update(&buf[..n]);
    }

    Ok(checksum.finalize())
}

/// Post-hoc path: hash a completed file from storage
pub async fn checksum_file(path: impl AsRef<Path>) -> io::Result<Checksum> {
    let mut file = tokio::fs::File::open(path.as_ref()).await?;
    checksum_reader(&mut file).await
}

// ============================================================================
// Hashing Writer
// ============================================================================

/// Writer adapter that hashes exactly the bytes the inner writer accepted.
///
/// The digest is only reachable through [`HashingWriter::finish`], which
/// flushes first; a failed write or flush drops the partial state with the
/// writer.
pub struct HashingWriter<W> {
    inner: W,
    checksum: StreamingChecksum,
}

impl<W: AsyncWrite + Unpin> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            checksum: StreamingChecksum::new(),
        }
    }

    /// Flush the inner writer and hand back it and the final checksum
    pub async fn finish(mut self) -> io::Result<(W, Checksum)> {
        use tokio::io::AsyncWriteExt;
        self.inner.flush().await?;
        Ok((self.inner, self.checksum.finalize()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for HashingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.checksum.update(&buf[..n]);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ============================================================================
// Tests
// ============================================================================
