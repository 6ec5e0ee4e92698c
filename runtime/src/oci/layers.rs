//! OCI layer extraction.
//!
//! Layers are applied onto a rootfs strictly in order. Each blob is
//! decompressed according to its magic bytes, the uncompressed stream is
//! hashed against the layer's diff id, whiteouts delete lower-layer
//! content, and device nodes, sockets and FIFOs are never created.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use cage_core::error::{CageError, Result};
use flate2::read::MultiGzDecoder;
use sha2::{Digest as _, Sha256};
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;
use xz2::read::XzDecoder;

use super::image::Layer;
use crate::content::ContentStore;

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;

/// Compression of a layer blob, detected from its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Compression {
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(&[0x1f, 0x8b]) {
            Compression::Gzip
        } else if header.starts_with(b"BZh") {
            Compression::Bzip2
        } else if header.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Compression::Xz
        } else if header.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// Apply `layers` onto `dest` in order.
///
/// Extraction runs on the blocking pool. Cancellation is checked between
/// layers and between archive entries.
pub async fn apply_layers(
    store: &ContentStore,
    layers: &[Layer],
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    for (i, layer) in layers.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(CageError::Cancelled);
        }

        let file = store.open(&layer.blob)?;
        let task_layer = layer.clone();
        let task_dest = dest.to_path_buf();
        let task_cancel = cancel.clone();
        tokio::task::spawn_blocking(move || apply_layer(file, &task_layer, &task_dest, &task_cancel))
            .await
            .map_err(|e| CageError::ExtractError {
                digest: layer.blob.digest.clone(),
                message: format!("extraction task failed: {}", e),
            })??;

        tracing::debug!(
            index = i,
            digest = %layer.blob.digest,
            target = %dest.display(),
            "Applied layer"
        );
    }
    Ok(())
}

/// Apply a single layer blob onto `dest`, verifying its diff id.
pub fn apply_layer(
    blob: File,
    layer: &Layer,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let extract_error = |message: String| CageError::ExtractError {
        digest: layer.blob.digest.clone(),
        message,
    };

    let mut reader = BufReader::new(blob);
    let compression = Compression::detect(reader.fill_buf().map_err(|e| extract_error(e.to_string()))?);
    let decoder: Box<dyn Read> = match compression {
        Compression::None => Box::new(reader),
        Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
        Compression::Bzip2 => Box::new(BzDecoder::new(reader)),
        Compression::Xz => Box::new(XzDecoder::new(reader)),
        Compression::Zstd => {
            return Err(extract_error(
                "zstd-compressed layers are not supported".to_string(),
            ))
        }
    };

    let mut archive = Archive::new(HashingReader::new(decoder));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    unpack_entries(&mut archive, dest, cancel).map_err(|e| match e {
        CageError::Cancelled => CageError::Cancelled,
        CageError::IoError(e) => extract_error(e.to_string()),
        other => other,
    })?;

    // Drain trailing padding so the digest covers the whole stream.
    let mut hashing = archive.into_inner();
    io::copy(&mut hashing, &mut io::sink()).map_err(|e| extract_error(e.to_string()))?;

    let computed = hashing.digest();
    if computed != layer.diff_id {
        return Err(extract_error(format!(
            "diff id mismatch: expected {}, computed {}",
            layer.diff_id, computed
        )));
    }
    Ok(())
}

fn unpack_entries<R: Read>(
    archive: &mut Archive<R>,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let dest_canon = dest.canonicalize()?;
    let mut unpacked: HashSet<PathBuf> = HashSet::new();

    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(CageError::Cancelled);
        }
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(rel) = normalize(&path) else {
            tracing::warn!(path = %path.display(), "Skipping entry outside rootfs");
            continue;
        };

        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let parent = rel.parent().unwrap_or_else(|| Path::new(""));
            if !inside(&dest_canon, &dest.join(parent)) {
                continue;
            }
            if file_name == WHITEOUT_OPAQUE {
                clear_dir(&dest.join(parent), dest, &unpacked)?;
            } else if is_plain_name(hidden) {
                remove_path(&dest.join(parent).join(hidden))?;
            } else {
                tracing::warn!(path = %path.display(), "Skipping malformed whiteout");
            }
            continue;
        }

        if is_excluded(entry.header()) {
            tracing::debug!(path = %rel.display(), "Skipping special file");
            continue;
        }

        if entry.unpack_in(dest)? {
            unpacked.insert(rel);
        }
    }
    Ok(())
}

/// Device nodes, FIFOs and sockets are never materialized.
fn is_excluded(header: &tar::Header) -> bool {
    match header.entry_type() {
        EntryType::Char | EntryType::Block | EntryType::Fifo => true,
        _ => header
            .mode()
            .map(|mode| mode & S_IFMT == S_IFSOCK)
            .unwrap_or(false),
    }
}

/// Relative form of an archive path, `None` if it climbs out of the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// A whiteout target must name one entry of its directory.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Whether `path` resolves (through symlinks) to somewhere under `root`.
fn inside(root: &Path, path: &Path) -> bool {
    match path.canonicalize() {
        Ok(canon) => canon.starts_with(root),
        Err(_) => false,
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// Empty `dir` of lower-layer content, keeping what this layer already wrote.
fn clear_dir(dir: &Path, dest: &Path, keep: &HashSet<PathBuf>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        let rel = path.strip_prefix(dest).unwrap_or(&path);
        if keep.iter().any(|k| k.starts_with(rel)) {
            continue;
        }
        remove_path(&path)?;
    }
    Ok(())
}

/// Reader that hashes everything read through it.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn digest(self) -> String {
        format!("sha256:{}", hex::encode(self.hasher.finalize()))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
