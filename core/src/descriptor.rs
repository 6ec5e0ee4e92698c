//! Content descriptors and media types.
//!
//! A descriptor is the self-verifying identity of a blob: its digest,
//! size and media type. Two descriptors with the same digest name the
//! same bytes.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{CageError, Result};

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Manifest media types accepted when resolving a reference.
pub const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
];

/// Identity of a blob in the content store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content
    pub media_type: String,
    /// Content digest (e.g., "sha256:abc123...")
    pub digest: String,
    /// Size in bytes
    pub size: u64,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
        }
    }

    /// Build the descriptor of an in-memory blob.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, sha256_digest(data), data.len() as u64)
    }

    /// Whether the referenced blob is an image manifest.
    pub fn is_manifest(&self) -> bool {
        matches!(
            self.media_type.as_str(),
            MEDIA_TYPE_OCI_MANIFEST | MEDIA_TYPE_DOCKER_MANIFEST
        )
    }

    /// Whether the referenced blob is a multi-platform index.
    pub fn is_index(&self) -> bool {
        matches!(
            self.media_type.as_str(),
            MEDIA_TYPE_OCI_INDEX | MEDIA_TYPE_DOCKER_MANIFEST_LIST
        )
    }

    /// Split the digest into algorithm and hex-encoded hash.
    pub fn parts(&self) -> Result<(&str, &str)> {
        split_digest(&self.digest)
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.digest, self.media_type)
    }
}

/// Compute the `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Split and validate a digest string.
///
/// Only `sha256` is accepted and the hash must be 64 lowercase hex
/// characters, which also keeps digests safe to use as path components.
pub fn split_digest(digest: &str) -> Result<(&str, &str)> {
    let (algorithm, hash) = digest.split_once(':').ok_or_else(|| {
        CageError::IntegrityError(format!("invalid digest '{}': expected algorithm:hex", digest))
    })?;

    if algorithm != "sha256" {
        return Err(CageError::IntegrityError(format!(
            "unsupported digest algorithm '{}'",
            algorithm
        )));
    }

    let valid = hash.len() == 64
        && hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if !valid {
        return Err(CageError::IntegrityError(format!(
            "invalid digest '{}': malformed sha256 hash",
            digest
        )));
    }

    Ok((algorithm, hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_digest_of_empty() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_for_bytes() {
        let desc = Descriptor::for_bytes(MEDIA_TYPE_OCI_CONFIG, b"{}");
        assert_eq!(desc.size, 2);
        assert!(desc.digest.starts_with("sha256:"));
        assert!(!desc.is_manifest());
    }

    #[test]
    fn test_manifest_and_index_detection() {
        let manifest = Descriptor::new(MEDIA_TYPE_DOCKER_MANIFEST, sha256_digest(b"m"), 1);
        let index = Descriptor::new(MEDIA_TYPE_OCI_INDEX, sha256_digest(b"i"), 1);
        assert!(manifest.is_manifest());
        assert!(!manifest.is_index());
        assert!(index.is_index());
    }

    #[test]
    fn test_split_digest_valid() {
        let digest = sha256_digest(b"hello");
        let (algo, hash) = split_digest(&digest).unwrap();
        assert_eq!(algo, "sha256");
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_split_digest_rejects_traversal() {
        assert!(split_digest("sha256:../../etc/passwd").is_err());
        assert!(split_digest("md5:abcd").is_err());
        assert!(split_digest("nocolon").is_err());
    }

    #[test]
    fn test_descriptor_serializes_camel_case() {
        let desc = Descriptor::new(MEDIA_TYPE_OCI_LAYER, sha256_digest(b"x"), 1);
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["mediaType"], MEDIA_TYPE_OCI_LAYER);
        assert_eq!(json["size"], 1);
    }
}
