//! Per-container volume lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use cage_core::error::Result;
use cage_core::{CageConfig, Volume};

use super::driver::VolumeDriver;

/// Creates the namespace dataset and one dataset per container.
pub struct VolumeManager {
    driver: Arc<dyn VolumeDriver>,
    namespace: String,
    root: PathBuf,
}

impl VolumeManager {
    pub fn new(driver: Arc<dyn VolumeDriver>, config: &CageConfig) -> Self {
        Self {
            driver,
            namespace: config.namespace(),
            root: config.root.clone(),
        }
    }

    /// Namespace dataset (`<dataset>/<product>`).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Create the namespace dataset. An existing namespace is fine.
    pub async fn ensure_namespace(&self) -> Result<()> {
        match self.driver.create(&self.namespace, None).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_volume_exists() => {
                tracing::debug!(namespace = %self.namespace, "Namespace already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Create the container's dataset mounted at `<root>/<id>`.
    ///
    /// A dataset left behind by an earlier attempt is reused; the rootfs
    /// is then unpacked over whatever it holds.
    pub async fn create_or_reuse(&self, id: &str) -> Result<Volume> {
        let volume = Volume::new(Volume::name_for(&self.namespace, id), self.root.join(id));

        match self.driver.create(&volume.name, Some(&volume.mountpoint)).await {
            Ok(()) => {
                tracing::info!(
                    volume = %volume.name,
                    mountpoint = %volume.mountpoint.display(),
                    "Created container volume"
                );
            }
            Err(e) if e.is_volume_exists() => {
                tracing::warn!(volume = %volume.name, "Reusing existing container volume");
            }
            Err(e) => return Err(e),
        }
        Ok(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::DirectoryDriver;
    use cage_core::error::CageError;
    use std::path::Path;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> VolumeManager {
        let config = CageConfig::with_root(dir.path().join("root"));
        let driver = Arc::new(DirectoryDriver::new(dir.path().join("pool")));
        VolumeManager::new(driver, &config)
    }

    #[tokio::test]
    async fn test_ensure_namespace_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.ensure_namespace().await.unwrap();
        manager.ensure_namespace().await.unwrap();
        assert_eq!(manager.namespace(), "tank/cage");
        assert!(dir.path().join("pool/tank/cage").is_dir());
    }

    #[tokio::test]
    async fn test_create_or_reuse() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let first = manager.create_or_reuse("c1").await.unwrap();
        assert_eq!(first.name, "tank/cage/c1");
        assert_eq!(first.mountpoint, dir.path().join("root/c1"));
        assert!(first.mountpoint.is_dir());

        let second = manager.create_or_reuse("c1").await.unwrap();
        assert_eq!(first, second);
    }

    struct FailingDriver;

    #[async_trait::async_trait]
    impl VolumeDriver for FailingDriver {
        async fn create(&self, name: &str, _mountpoint: Option<&Path>) -> Result<()> {
            Err(CageError::VolumeError {
                name: name.to_string(),
                message: "out of space".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_other_errors_propagate() {
        let config = CageConfig::with_root("/var/lib/cage");
        let manager = VolumeManager::new(Arc::new(FailingDriver), &config);

        assert!(manager.ensure_namespace().await.is_err());
        let err = manager.create_or_reuse("c1").await.unwrap_err();
        assert!(err.to_string().contains("out of space"));
    }
}
