//! Volume drivers.
//!
//! A driver creates named copy-on-write filesystems. [`ZfsDriver`] shells
//! out to `zfs`; [`DirectoryDriver`] backs volumes with plain directories
//! for hosts without ZFS and for tests.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use cage_core::error::{CageError, Result};
use tokio::process::Command;

/// Creates named filesystems.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Create `name`, mounted at `mountpoint` when given.
    ///
    /// Returns [`CageError::VolumeExists`] when the name is already taken,
    /// so callers can decide whether reuse is acceptable.
    async fn create(&self, name: &str, mountpoint: Option<&Path>) -> Result<()>;
}

/// Driver backed by the `zfs` command.
#[derive(Debug, Clone)]
pub struct ZfsDriver {
    binary: PathBuf,
}

impl ZfsDriver {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("zfs"),
        }
    }

    /// Use a specific `zfs` binary.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exists(&self, name: &str) -> bool {
        Command::new(&self.binary)
            .args(["list", "-H", "-o", "name", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

impl Default for ZfsDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VolumeDriver for ZfsDriver {
    async fn create(&self, name: &str, mountpoint: Option<&Path>) -> Result<()> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("create");
        if let Some(mountpoint) = mountpoint {
            cmd.arg("-o")
                .arg(format!("mountpoint={}", mountpoint.display()));
        }
        cmd.arg(name).stdin(Stdio::null()).kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| CageError::VolumeError {
            name: name.to_string(),
            message: format!("failed to run {}: {}", self.binary.display(), e),
        })?;

        if output.status.success() {
            tracing::info!(dataset = name, "Created dataset");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("dataset already exists") || self.exists(name).await {
            return Err(CageError::VolumeExists {
                name: name.to_string(),
            });
        }

        Err(CageError::VolumeError {
            name: name.to_string(),
            message: stderr,
        })
    }
}

/// Driver that creates plain directories.
///
/// Volume names map to directories under `base`; a requested mountpoint
/// is created directly instead.
#[derive(Debug, Clone)]
pub struct DirectoryDriver {
    base: PathBuf,
}

impl DirectoryDriver {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn path_for(&self, name: &str, mountpoint: Option<&Path>) -> PathBuf {
        match mountpoint {
            Some(path) => path.to_path_buf(),
            None => self.base.join(name),
        }
    }
}

#[async_trait]
impl VolumeDriver for DirectoryDriver {
    async fn create(&self, name: &str, mountpoint: Option<&Path>) -> Result<()> {
        let path = self.path_for(name, mountpoint);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match tokio::fs::create_dir(&path).await {
            Ok(()) => {
                tracing::debug!(volume = name, path = %path.display(), "Created directory volume");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(CageError::VolumeExists {
                    name: name.to_string(),
                })
            }
            Err(e) => Err(CageError::VolumeError {
                name: name.to_string(),
                message: format!("failed to create {}: {}", path.display(), e),
            }),
        }
    }
}
