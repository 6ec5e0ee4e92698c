//! Container provisioning pipeline.
//!
//! `create` runs four phases in order: fetch the image graph into the
//! content store, create the container's volume, unpack the layers into
//! its rootfs, and write the runtime spec next to it. A failure is
//! reported with the phase it happened in; cancellation is reported as is.

use std::future::Future;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cage_core::config::CONTENT_DIR_NAME;
use cage_core::error::{CageError, Phase, PhaseExt, Result};
use cage_core::{CageConfig, Descriptor, Volume};
use tokio_util::sync::CancellationToken;

use crate::content::ContentStore;
use crate::oci::{apply_layers, Dispatcher, Image, Resolver};
use crate::spec::{RuntimeSpec, SpecBuilder, SpecInputs};
use crate::volume::{VolumeDriver, VolumeManager};

/// Rootfs directory inside a container directory.
pub const ROOTFS_DIR: &str = "rootfs";

/// Runtime spec file inside a container directory.
pub const SPEC_FILE: &str = "config.json";

const ROOTFS_MODE: u32 = 0o711;

/// Caller overrides for a new container.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Command replacing the image cmd
    pub args: Vec<String>,
    /// Environment overrides (`KEY=VALUE` sets, bare `KEY` unsets)
    pub env: Vec<String>,
    /// Network attachments recorded for the launcher
    pub networks: Vec<String>,
}

/// A provisioned container.
#[derive(Debug, Clone)]
pub struct ContainerInstance {
    pub id: String,
    /// Canonical name of the image it was created from
    pub image: String,
    /// Container directory (`<root>/<id>`)
    pub root: PathBuf,
    pub rootfs: PathBuf,
    pub volume: Volume,
    pub spec: RuntimeSpec,
}

impl ContainerInstance {
    pub fn spec_path(&self) -> PathBuf {
        self.root.join(SPEC_FILE)
    }
}

/// Provisions containers from image references.
pub struct Provisioner {
    config: CageConfig,
    store: ContentStore,
    resolver: Arc<dyn Resolver>,
    volumes: VolumeManager,
}

impl Provisioner {
    /// Build a provisioner. Fails when the configuration is invalid or the
    /// content store cannot be created.
    pub fn new(
        config: CageConfig,
        resolver: Arc<dyn Resolver>,
        driver: Arc<dyn VolumeDriver>,
    ) -> Result<Self> {
        config.validate()?;
        let store = ContentStore::new(&config.content_dir)?;
        let volumes = VolumeManager::new(driver, &config);

        Ok(Self {
            config,
            store,
            resolver,
            volumes,
        })
    }

    pub fn config(&self) -> &CageConfig {
        &self.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Provision container `id` from `reference`.
    pub async fn create(
        &self,
        reference: &str,
        id: &str,
        options: &CreateOptions,
        cancel: &CancellationToken,
    ) -> Result<ContainerInstance> {
        validate_id(id)?;
        tracing::info!(reference, id, "Creating container");

        let (image_name, root) = self.fetch(reference, cancel).await.phase(Phase::Fetch)?;
        let volume = self.create_volume(id, cancel).await.phase(Phase::Volume)?;

        let container_dir = self.config.container_dir(id);
        let rootfs = container_dir.join(ROOTFS_DIR);
        let image = self
            .unpack(&root, &rootfs, cancel)
            .await
            .phase(Phase::Unpack)?;

        let spec = self
            .write_spec(id, &container_dir, &rootfs, &image, options)
            .phase(Phase::Spec)?;

        tracing::info!(
            id,
            image = %image_name,
            rootfs = %rootfs.display(),
            "Container created"
        );

        Ok(ContainerInstance {
            id: id.to_string(),
            image: image_name,
            root: container_dir,
            rootfs,
            volume,
            spec,
        })
    }

    async fn fetch(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, Descriptor)> {
        let (name, root) = cancellable(cancel, self.resolver.resolve(reference)).await?;
        tracing::info!(name = %name, digest = %root.digest, "Resolved image");

        let fetcher = self.resolver.fetcher(&name)?;
        Dispatcher::new(self.store.clone(), fetcher, self.config.fetch_concurrency)
            .dispatch(&root, cancel)
            .await?;
        Ok((name, root))
    }

    async fn create_volume(&self, id: &str, cancel: &CancellationToken) -> Result<Volume> {
        cancellable(cancel, self.volumes.ensure_namespace()).await?;
        cancellable(cancel, self.volumes.create_or_reuse(id)).await
    }

    async fn unpack(
        &self,
        root: &Descriptor,
        rootfs: &Path,
        cancel: &CancellationToken,
    ) -> Result<Image> {
        let image = Image::load(&self.store, root).await?;
        let layers = image.layers()?;

        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(ROOTFS_MODE)
            .create(rootfs)
            .map_err(|e| {
                CageError::Other(format!(
                    "Failed to create rootfs {}: {}",
                    rootfs.display(),
                    e
                ))
            })?;

        apply_layers(&self.store, &layers, rootfs, cancel).await?;
        tracing::info!(layers = layers.len(), rootfs = %rootfs.display(), "Unpacked image");
        Ok(image)
    }

    fn write_spec(
        &self,
        id: &str,
        container_dir: &Path,
        rootfs: &Path,
        image: &Image,
        options: &CreateOptions,
    ) -> Result<RuntimeSpec> {
        let inputs = SpecInputs {
            id,
            rootfs,
            state_dir: container_dir,
            image: &image.config,
            args: &options.args,
            env: &options.env,
            networks: &options.networks,
        };
        let spec = SpecBuilder::new().build(&inputs)?;

        let path = container_dir.join(SPEC_FILE);
        let tmp = container_dir.join(format!("{}.tmp", SPEC_FILE));
        let json = serde_json::to_vec_pretty(&spec)?;
        std::fs::write(&tmp, json).map_err(|e| {
            CageError::SpecError(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            CageError::SpecError(format!("Failed to write {}: {}", path.display(), e))
        })?;

        tracing::debug!(path = %path.display(), "Wrote runtime spec");
        Ok(spec)
    }
}

/// A container directory found under the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub id: String,
    pub path: PathBuf,
    /// Whether provisioning got as far as writing the spec
    pub has_spec: bool,
}

/// List container directories under the root, skipping the content store.
pub fn list_containers(config: &CageConfig) -> Result<Vec<ContainerEntry>> {
    let entries = match std::fs::read_dir(&config.root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut containers = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_dir() || config.is_content_dir(&path) {
            continue;
        }
        containers.push(ContainerEntry {
            id: entry.file_name().to_string_lossy().into_owned(),
            has_spec: path.join(SPEC_FILE).is_file(),
            path,
        });
    }
    containers.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(containers)
}

/// Container ids name a directory and a dataset, so they are a single
/// path component and may not shadow the content store.
fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id != CONTENT_DIR_NAME
        && !id.starts_with('-')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CageError::ConfigError(format!("invalid container id '{}'", id)))
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CageError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::DEFAULT_PATH_ENV;
    use crate::testutil::{ImageFixture, MemoryRegistry, TarLayer};
    use crate::volume::DirectoryDriver;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        registry: MemoryRegistry,
        provisioner: Provisioner,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let config = CageConfig::with_root(dir.path().join("root"));
            let registry = MemoryRegistry::new();
            let driver = Arc::new(DirectoryDriver::new(dir.path().join("pool")));
            let provisioner =
                Provisioner::new(config, Arc::new(registry.clone()), driver).unwrap();
            Self {
                dir,
                registry,
                provisioner,
            }
        }

        fn root(&self) -> PathBuf {
            self.dir.path().join("root")
        }
    }

    fn sample_image() -> ImageFixture {
        let layer = TarLayer::new()
            .dir("bin/")
            .file("bin/app", b"#!/bin/sh\necho app\n")
            .build();
        ImageFixture::new(
            json!({
                "Env": ["FOO=bar"],
                "Entrypoint": ["/bin/app"],
                "Cmd": ["--flag"],
                "User": ""
            }),
            &[layer],
            true,
        )
    }

    #[tokio::test]
    async fn test_create_end_to_end() {
        let h = Harness::new();
        h.registry.push("sample:v1", &sample_image());

        let instance = h
            .provisioner
            .create("sample:v1", "c1", &CreateOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(instance.volume.name, "tank/cage/c1");
        assert_eq!(instance.volume.mountpoint, h.root().join("c1"));
        assert!(h.dir.path().join("pool/tank/cage").is_dir());
        assert_eq!(
            fs::read(instance.rootfs.join("bin/app")).unwrap(),
            b"#!/bin/sh\necho app\n"
        );

        let mode = fs::metadata(&instance.rootfs).unwrap().permissions();
        assert_eq!(std::os::unix::fs::PermissionsExt::mode(&mode) & 0o777, 0o711);

        let written: RuntimeSpec =
            serde_json::from_slice(&fs::read(instance.spec_path()).unwrap()).unwrap();
        assert_eq!(written, instance.spec);

        let process = written.process.unwrap();
        assert_eq!(process.args, vec!["/bin/app", "--flag"]);
        assert_eq!(
            process.env,
            vec!["FOO=bar".to_string(), DEFAULT_PATH_ENV.to_string()]
        );
        assert_eq!(process.cwd, "/");
        assert_eq!(process.user.uid, 0);
        assert_eq!(process.user.additional_gids, vec![0]);
        assert_eq!(written.hostname.as_deref(), Some("c1"));
        assert!(h.root().join("c1/hosts").is_file());
        assert!(h.root().join("c1/hostname").is_file());
    }

    #[tokio::test]
    async fn test_image_without_env_gets_default_path() {
        let h = Harness::new();
        let layer = TarLayer::new().file("bin/app", b"app").build();
        h.registry.push(
            "bare:v1",
            &ImageFixture::new(json!({ "Cmd": ["/bin/app"] }), &[layer], true),
        );

        let options = CreateOptions {
            env: vec!["FOO=bar".to_string()],
            ..Default::default()
        };
        let instance = h
            .provisioner
            .create("bare:v1", "c1", &options, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            instance.spec.process.unwrap().env,
            vec![DEFAULT_PATH_ENV.to_string(), "FOO=bar".to_string()]
        );
    }

    #[tokio::test]
    async fn test_create_twice_reuses_volume() {
        let h = Harness::new();
        h.registry.push("sample:v1", &sample_image());
        let token = CancellationToken::new();

        h.provisioner
            .create("sample:v1", "c1", &CreateOptions::default(), &token)
            .await
            .unwrap();
        let fetches = h.registry.fetches();

        let again = h
            .provisioner
            .create("sample:v1", "c1", &CreateOptions::default(), &token)
            .await
            .unwrap();

        assert!(again.rootfs.join("bin/app").is_file());
        assert_eq!(h.registry.fetches(), fetches);
    }

    #[tokio::test]
    async fn test_layer_count_mismatch_fails_before_unpack() {
        let h = Harness::new();
        let layers: Vec<Vec<u8>> = (0..3)
            .map(|i| TarLayer::new().file(&format!("f{}", i), b"x").build())
            .collect();
        let diff_ids = layers[..2]
            .iter()
            .map(|l| cage_core::descriptor::sha256_digest(l))
            .collect();
        h.registry.push(
            "broken:v1",
            &ImageFixture::with_diff_ids(json!({}), &layers, true, diff_ids),
        );

        let err = h
            .provisioner
            .create("broken:v1", "c1", &CreateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CageError::Phase {
                phase: Phase::Unpack,
                ..
            }
        ));
        assert!(matches!(err.root(), CageError::IntegrityError(_)));
        assert!(!h.root().join("c1").join(ROOTFS_DIR).exists());
    }

    #[tokio::test]
    async fn test_unknown_reference_is_fetch_failure() {
        let h = Harness::new();
        let err = h
            .provisioner
            .create("missing:v1", "c1", &CreateOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("fetch image: "));
        assert!(matches!(err.root(), CageError::ResolveError { .. }));
        assert!(!h.root().join("c1").exists());
    }

    #[tokio::test]
    async fn test_cancelled_create() {
        let h = Harness::new();
        h.registry.push("sample:v1", &sample_image());
        let token = CancellationToken::new();
        token.cancel();

        let err = h
            .provisioner
            .create("sample:v1", "c1", &CreateOptions::default(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, CageError::Cancelled));
    }

    #[tokio::test]
    async fn test_invalid_ids_rejected() {
        let h = Harness::new();
        for id in ["", "..", "content", "a/b", "-rf"] {
            let result = h
                .provisioner
                .create("sample:v1", id, &CreateOptions::default(), &CancellationToken::new())
                .await;
            assert!(result.is_err(), "id {:?} accepted", id);
        }
    }

    #[tokio::test]
    async fn test_list_containers_skips_content_store() {
        let h = Harness::new();
        h.registry.push("sample:v1", &sample_image());
        let token = CancellationToken::new();
        for id in ["web", "api"] {
            h.provisioner
                .create("sample:v1", id, &CreateOptions::default(), &token)
                .await
                .unwrap();
        }
        fs::create_dir_all(h.root().join("partial")).unwrap();

        let listed = list_containers(h.provisioner.config()).unwrap();
        let ids: Vec<&str> = listed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["api", "partial", "web"]);
        assert!(listed[0].has_spec);
        assert!(!listed[1].has_spec);
    }

    #[test]
    fn test_list_missing_root() {
        let config = CageConfig::with_root("/nonexistent/cage-root");
        assert!(list_containers(&config).unwrap().is_empty());
    }
}
