//! Test fixtures: synthetic layers, images and an in-memory registry.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cage_core::descriptor::{
    sha256_digest, Descriptor, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_LAYER,
    MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_MANIFEST,
};
use cage_core::error::{CageError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use tar::{Builder, EntryType, Header};
use tokio::io::AsyncWriteExt;

use crate::content::BlobWriter;
use crate::oci::image::host_platform;
use crate::oci::{Fetcher, Resolver};

/// Builds an uncompressed layer tarball.
pub struct TarLayer {
    builder: Builder<Vec<u8>>,
}

impl TarLayer {
    pub fn new() -> Self {
        Self {
            builder: Builder::new(Vec::new()),
        }
    }

    pub fn dir(mut self, path: &str) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    pub fn file(mut self, path: &str, content: &[u8]) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        self.builder.append_data(&mut header, path, content).unwrap();
        self
    }

    pub fn special(mut self, path: &str, entry_type: EntryType) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(0o644);
        header.set_size(0);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    /// Regular entry whose mode carries the socket file type.
    pub fn socket(mut self, path: &str) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o140755);
        header.set_size(0);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// A complete image held in memory, keyed by digest.
pub struct ImageFixture {
    pub root: Descriptor,
    pub manifest: Descriptor,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    pub diff_ids: Vec<String>,
    pub blobs: HashMap<String, Vec<u8>>,
}

impl ImageFixture {
    /// Build an image from uncompressed layer tarballs. Layers are gzipped
    /// when `compress` is set. `config` is the image's runtime config object.
    pub fn new(config: serde_json::Value, layer_tars: &[Vec<u8>], compress: bool) -> Self {
        let diff_ids: Vec<String> = layer_tars.iter().map(|t| sha256_digest(t)).collect();
        Self::with_diff_ids(config, layer_tars, compress, diff_ids)
    }

    /// Like [`ImageFixture::new`] with explicit diff ids.
    pub fn with_diff_ids(
        config: serde_json::Value,
        layer_tars: &[Vec<u8>],
        compress: bool,
        diff_ids: Vec<String>,
    ) -> Self {
        let (os, arch) = host_platform();
        let mut blobs = HashMap::new();

        let layers: Vec<Descriptor> = layer_tars
            .iter()
            .map(|tar| {
                let (media_type, data) = if compress {
                    (MEDIA_TYPE_OCI_LAYER_GZIP, gzip(tar))
                } else {
                    (MEDIA_TYPE_OCI_LAYER, tar.clone())
                };
                let desc = Descriptor::for_bytes(media_type, &data);
                blobs.insert(desc.digest.clone(), data);
                desc
            })
            .collect();

        let config_bytes = serde_json::to_vec(&json!({
            "architecture": arch,
            "os": os,
            "config": config,
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        }))
        .unwrap();
        let config_desc = Descriptor::for_bytes(MEDIA_TYPE_OCI_CONFIG, &config_bytes);
        blobs.insert(config_desc.digest.clone(), config_bytes);

        let manifest_bytes = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": config_desc,
            "layers": layers,
        }))
        .unwrap();
        let manifest = Descriptor::for_bytes(MEDIA_TYPE_OCI_MANIFEST, &manifest_bytes);
        blobs.insert(manifest.digest.clone(), manifest_bytes);

        Self {
            root: manifest.clone(),
            manifest,
            config: config_desc,
            layers,
            diff_ids,
            blobs,
        }
    }

    /// Wrap the manifest in an index next to a manifest for another platform.
    pub fn indexed(mut self) -> Self {
        let (os, arch) = host_platform();
        let foreign = Descriptor::for_bytes(MEDIA_TYPE_OCI_MANIFEST, b"not fetched");
        let foreign_arch = if arch == "s390x" { "amd64" } else { "s390x" };

        let mut host_entry = serde_json::to_value(&self.manifest).unwrap();
        host_entry["platform"] = json!({ "architecture": arch, "os": os });
        let mut foreign_entry = serde_json::to_value(&foreign).unwrap();
        foreign_entry["platform"] = json!({ "architecture": foreign_arch, "os": "linux" });

        let index_bytes = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_INDEX,
            "manifests": [foreign_entry, host_entry],
        }))
        .unwrap();
        let index = Descriptor::for_bytes(MEDIA_TYPE_OCI_INDEX, &index_bytes);
        self.blobs.insert(index.digest.clone(), index_bytes);
        self.root = index;
        self
    }
}

/// Registry serving fixtures from memory.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    images: Arc<Mutex<HashMap<String, Descriptor>>>,
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    fetches: Arc<AtomicUsize>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reference: &str, image: &ImageFixture) {
        self.images
            .lock()
            .unwrap()
            .insert(reference.to_string(), image.root.clone());
        let mut blobs = self.blobs.lock().unwrap();
        for (digest, data) in &image.blobs {
            blobs.insert(digest.clone(), data.clone());
        }
    }

    /// Replace the served bytes of a blob without changing its digest.
    pub fn corrupt(&self, digest: &str, data: Vec<u8>) {
        self.blobs.lock().unwrap().insert(digest.to_string(), data);
    }

    /// Stop serving a blob.
    pub fn remove(&self, digest: &str) {
        self.blobs.lock().unwrap().remove(digest);
    }

    /// Number of blob fetches served.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for MemoryRegistry {
    async fn resolve(&self, reference: &str) -> Result<(String, Descriptor)> {
        let images = self.images.lock().unwrap();
        let desc = images
            .get(reference)
            .cloned()
            .ok_or_else(|| CageError::ResolveError {
                reference: reference.to_string(),
                message: "not found".to_string(),
            })?;
        Ok((reference.to_string(), desc))
    }

    fn fetcher(&self, _name: &str) -> Result<Arc<dyn Fetcher>> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Fetcher for MemoryRegistry {
    async fn fetch(&self, desc: &Descriptor, sink: &mut BlobWriter) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(&desc.digest)
            .cloned()
            .ok_or_else(|| CageError::FetchError {
                digest: desc.digest.clone(),
                message: "blob unknown to registry".to_string(),
            })?;
        sink.write_all(&data).await?;
        Ok(())
    }
}
