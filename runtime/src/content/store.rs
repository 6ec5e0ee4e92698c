//! Disk-based content-addressed blob store.
//!
//! Blobs are stored under `blobs/sha256/<hex>`. Writers stream into a
//! private file under `ingest/` while hashing, and are renamed into place
//! only once the digest and size match the expected descriptor. Readers
//! therefore never observe partial blobs, and two writers racing on the
//! same digest both end up with the same immutable file.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use cage_core::descriptor::{split_digest, Descriptor};
use cage_core::error::{CageError, Result};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Content-addressed store keyed by digest.
#[derive(Debug, Clone)]
pub struct ContentStore {
    /// Root directory of the store
    root: PathBuf,
}

impl ContentStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn new(root: &Path) -> Result<Self> {
        for dir in [root.join("blobs").join("sha256"), root.join("ingest")] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                CageError::ContentStoreError(format!(
                    "Failed to create content store directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        tracing::debug!(root = %root.display(), "Content store opened");
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Get the store root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob for `digest`. The digest is validated first.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let (algorithm, hash) = split_digest(digest)?;
        Ok(self.root.join("blobs").join(algorithm).join(hash))
    }

    /// Whether a committed blob exists for `digest`.
    pub fn contains(&self, digest: &str) -> bool {
        self.blob_path(digest).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Open a blob for reading.
    pub fn open(&self, desc: &Descriptor) -> Result<File> {
        let path = self.blob_path(&desc.digest)?;
        File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CageError::BlobNotFound {
                digest: desc.digest.clone(),
            },
            _ => CageError::ContentStoreError(format!(
                "Failed to open blob {}: {}",
                desc.digest, e
            )),
        })
    }

    /// Read a whole blob into memory.
    pub async fn read_blob(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        let path = self.blob_path(&desc.digest)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CageError::BlobNotFound {
                digest: desc.digest.clone(),
            },
            _ => CageError::ContentStoreError(format!(
                "Failed to read blob {}: {}",
                desc.digest, e
            )),
        })
    }

    /// Start writing the blob described by `expected`.
    pub async fn writer(&self, expected: &Descriptor) -> Result<BlobWriter> {
        let target = self.blob_path(&expected.digest)?;
        let temp_path = self
            .root
            .join("ingest")
            .join(format!("{}.{}", &expected.digest[7..19], uuid::Uuid::new_v4()));

        let file = tokio::fs::File::create(&temp_path).await.map_err(|e| {
            CageError::ContentStoreError(format!(
                "Failed to create ingest file {}: {}",
                temp_path.display(),
                e
            ))
        })?;

        Ok(BlobWriter {
            expected: expected.clone(),
            target,
            temp_path,
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
            committed: false,
        })
    }

    /// Write an in-memory blob. A blob that is already present is left as is.
    pub async fn write_blob(&self, expected: &Descriptor, data: &[u8]) -> Result<()> {
        if self.contains(&expected.digest) {
            return Ok(());
        }
        let mut writer = self.writer(expected).await?;
        writer.write_all(data).await?;
        writer.commit().await
    }

    /// List the digests of all committed blobs.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.root.join("blobs").join("sha256");
        let mut digests = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                digests.push(format!("sha256:{}", entry.file_name().to_string_lossy()));
            }
        }
        digests.sort();
        Ok(digests)
    }
}

/// Streaming, verifying writer for a single blob.
///
/// Dropping a writer without committing removes its ingest file.
pub struct BlobWriter {
    expected: Descriptor,
    target: PathBuf,
    temp_path: PathBuf,
    file: Option<tokio::fs::File>,
    hasher: Sha256,
    written: u64,
    committed: bool,
}

impl BlobWriter {
    /// Number of bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Verify size and digest, then move the blob into place.
    pub async fn commit(mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        if self.written != self.expected.size {
            return Err(CageError::IntegrityError(format!(
                "size mismatch for {}: expected {} bytes, got {}",
                self.expected.digest, self.expected.size, self.written
            )));
        }

        let computed = format!(
            "sha256:{}",
            hex::encode(std::mem::take(&mut self.hasher).finalize())
        );
        if computed != self.expected.digest {
            return Err(CageError::IntegrityError(format!(
                "digest mismatch: expected {}, computed {}",
                self.expected.digest, computed
            )));
        }

        if self.target.exists() {
            tracing::debug!(digest = %self.expected.digest, "Blob already committed");
            return Ok(());
        }

        tokio::fs::rename(&self.temp_path, &self.target)
            .await
            .map_err(|e| {
                CageError::ContentStoreError(format!(
                    "Failed to commit blob {}: {}",
                    self.expected.digest, e
                ))
            })?;
        self.committed = true;

        tracing::debug!(
            digest = %self.expected.digest,
            size = self.written,
            "Committed blob"
        );
        Ok(())
    }
}

impl AsyncWrite for BlobWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let file = match this.file.as_mut() {
            Some(file) => file,
            None => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    "blob writer already closed",
                )))
            }
        };
        match Pin::new(file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.hasher.update(&buf[..n]);
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}
