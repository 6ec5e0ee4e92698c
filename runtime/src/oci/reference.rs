//! Image reference parsing.
//!
//! Turns human-readable references such as `sample:v1` or
//! `ghcr.io/org/app@sha256:...` into registry, repository, tag and digest.

use cage_core::error::{CageError, Result};

/// Registry used when the reference names none.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when the reference carries neither tag nor digest.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port if any (e.g., "docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/nginx")
    pub repository: String,
    /// Tag, if any
    pub tag: Option<String>,
    /// Digest, if any (e.g., "sha256:...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference string.
    ///
    /// - `nginx` → `docker.io/library/nginx:latest`
    /// - `org/app:v1` → `docker.io/org/app:v1`
    /// - `registry:5000/app` → `registry:5000/app:latest`
    /// - `ghcr.io/org/app@sha256:...` → digest pinned, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(CageError::OciImageError("Empty image reference".to_string()));
        }

        let (remainder, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(CageError::OciImageError(format!(
                        "Invalid digest in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(remainder);
        if name.is_empty() {
            return Err(CageError::OciImageError(format!(
                "Empty repository in reference '{}'",
                reference
            )));
        }
        let (registry, repository) = split_registry(name, reference)?;

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Canonical `registry/repository[:tag][@digest]` form.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Same repository, pinned to `digest`.
    pub fn pinned(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_reference())
    }
}

/// Split `name[:tag]`, where only a colon after the last `/` starts a tag.
///
/// A bare `host:port` (no slash, all-digit suffix) is treated as a name.
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let last_segment_start = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name_tag[last_segment_start..].rfind(':') {
        Some(offset) => {
            let colon = last_segment_start + offset;
            let tag = &name_tag[colon + 1..];
            let is_port = last_segment_start == 0 && tag.chars().all(|c| c.is_ascii_digit());
            if is_port || tag.is_empty() {
                (name_tag, None)
            } else {
                (&name_tag[..colon], Some(tag))
            }
        }
        None => (name_tag, None),
    }
}

/// Split the registry host from the repository path.
///
/// The first path component is a registry when it contains a dot or a
/// colon, or is `localhost`. Single-component Docker Hub names live under
/// `library/`.
fn split_registry(name: &str, reference: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(CageError::OciImageError(format!(
                    "Empty repository in reference '{}'",
                    reference
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
        return Ok((DEFAULT_REGISTRY.to_string(), name.to_string()));
    }
    Ok((DEFAULT_REGISTRY.to_string(), format!("library/{}", name)))
}
