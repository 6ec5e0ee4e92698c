//! OCI image parsing and representation.
//!
//! Reads manifests, indexes and configs back out of the content store
//! and exposes what provisioning needs: the runtime config and the
//! ordered layer list paired with diff ids.

use cage_core::descriptor::Descriptor;
use cage_core::error::{CageError, Result};
use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};

use crate::content::ContentStore;

/// Nested indexes deeper than this are rejected.
const MAX_INDEX_DEPTH: usize = 4;

/// Parsed image runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageConfig {
    /// Default environment (`KEY=value`)
    pub env: Vec<String>,

    /// Entrypoint command
    pub entrypoint: Vec<String>,

    /// Default command arguments
    pub cmd: Vec<String>,

    /// Working directory
    pub working_dir: Option<String>,

    /// User to run as (`name`, `uid`, `name:group` or `uid:gid`)
    pub user: Option<String>,

    /// Uncompressed layer digests, bottom to top
    pub diff_ids: Vec<String>,
}

impl ImageConfig {
    fn from_oci_config(oci_config: &ImageConfiguration) -> Self {
        let config = oci_config.config();

        let entrypoint = config
            .as_ref()
            .and_then(|c| c.entrypoint().clone())
            .unwrap_or_default();
        let cmd = config
            .as_ref()
            .and_then(|c| c.cmd().clone())
            .unwrap_or_default();
        let env = config
            .as_ref()
            .and_then(|c| c.env().clone())
            .unwrap_or_default();
        let working_dir = config
            .as_ref()
            .and_then(|c| c.working_dir().clone())
            .filter(|d| !d.is_empty());
        let user = config
            .as_ref()
            .and_then(|c| c.user().clone())
            .filter(|u| !u.is_empty());

        Self {
            env,
            entrypoint,
            cmd,
            working_dir,
            user,
            diff_ids: oci_config.rootfs().diff_ids().clone(),
        }
    }
}

/// A layer blob paired with the digest of its uncompressed tar stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub diff_id: String,
    pub blob: Descriptor,
}

/// An image loaded from the content store.
#[derive(Debug, Clone)]
pub struct Image {
    /// Platform manifest the image was loaded from
    pub manifest: Descriptor,

    /// Image configuration
    pub config: ImageConfig,

    /// Layer blobs in application order
    layers: Vec<Descriptor>,
}

impl Image {
    /// Load the image rooted at `root`, which may be a manifest or an index.
    ///
    /// An index is narrowed to the manifest for the host platform.
    pub async fn load(store: &ContentStore, root: &Descriptor) -> Result<Self> {
        let mut target = root.clone();
        let mut depth = 0;
        while target.is_index() {
            if depth == MAX_INDEX_DEPTH {
                return Err(CageError::OciImageError(format!(
                    "Index nesting too deep at {}",
                    target.digest
                )));
            }
            let data = store.read_blob(&target).await?;
            let index = parse_index(&data)?;
            target = select_platform_manifest(&index).ok_or_else(|| {
                let (os, arch) = host_platform();
                CageError::OciImageError(format!(
                    "No manifest for platform {}/{} in {}",
                    os, arch, target.digest
                ))
            })?;
            depth += 1;
        }

        if !target.is_manifest() {
            return Err(CageError::OciImageError(format!(
                "Unsupported root media type: {}",
                target.media_type
            )));
        }

        let data = store.read_blob(&target).await?;
        let manifest = parse_manifest(&data)?;
        let config_desc = convert_descriptor(manifest.config());
        let config_data = store.read_blob(&config_desc).await?;
        let oci_config: ImageConfiguration = serde_json::from_slice(&config_data)
            .map_err(|e| CageError::OciImageError(format!("Failed to parse config: {}", e)))?;

        Ok(Self {
            manifest: target,
            config: ImageConfig::from_oci_config(&oci_config),
            layers: manifest.layers().iter().map(convert_descriptor).collect(),
        })
    }

    /// Layers paired with their diff ids.
    ///
    /// Fails before any layer is touched when the config and the manifest
    /// disagree on the number of layers.
    pub fn layers(&self) -> Result<Vec<Layer>> {
        if self.config.diff_ids.len() != self.layers.len() {
            return Err(CageError::IntegrityError(
                "mismatched image rootfs and manifest layers".to_string(),
            ));
        }

        Ok(self
            .config
            .diff_ids
            .iter()
            .zip(&self.layers)
            .map(|(diff_id, blob)| Layer {
                diff_id: diff_id.clone(),
                blob: blob.clone(),
            })
            .collect())
    }
}

/// Descriptors a manifest or index refers to that must be fetched.
///
/// Manifests yield their config and layers; indexes yield the manifests
/// for the host platform. Leaf blobs have no children.
pub(crate) fn children(desc: &Descriptor, data: &[u8]) -> Result<Vec<Descriptor>> {
    if desc.is_manifest() {
        let manifest = parse_manifest(data)?;
        let mut out = vec![convert_descriptor(manifest.config())];
        out.extend(manifest.layers().iter().map(convert_descriptor));
        return Ok(out);
    }
    if desc.is_index() {
        let index = parse_index(data)?;
        return Ok(select_platform_manifest(&index).into_iter().collect());
    }
    Ok(Vec::new())
}

/// Host platform as OCI `(os, architecture)` names.
pub fn host_platform() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    };
    ("linux", arch)
}

fn parse_manifest(data: &[u8]) -> Result<ImageManifest> {
    serde_json::from_slice(data)
        .map_err(|e| CageError::OciImageError(format!("Failed to parse manifest: {}", e)))
}

fn parse_index(data: &[u8]) -> Result<ImageIndex> {
    serde_json::from_slice(data)
        .map_err(|e| CageError::OciImageError(format!("Failed to parse index: {}", e)))
}

/// First index entry whose platform matches the host. Entries without a
/// platform are accepted.
fn select_platform_manifest(index: &ImageIndex) -> Option<Descriptor> {
    let (os, arch) = host_platform();
    index
        .manifests()
        .iter()
        .find(|m| match m.platform() {
            Some(platform) => {
                enum_name(platform.os()).as_deref() == Some(os)
                    && enum_name(platform.architecture()).as_deref() == Some(arch)
            }
            None => true,
        })
        .map(convert_descriptor)
}

/// Wire name of an oci-spec platform enum.
fn enum_name<T: serde::Serialize>(value: &T) -> Option<String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Some(s),
        _ => None,
    }
}

fn convert_descriptor(desc: &oci_spec::image::Descriptor) -> Descriptor {
    Descriptor::new(
        desc.media_type().to_string(),
        desc.digest().to_string(),
        desc.size().max(0) as u64,
    )
}
