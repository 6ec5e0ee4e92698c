//! Registry resolution and blob fetching.
//!
//! Uses the `oci-distribution` crate to talk to container registries
//! (Docker Hub, GHCR, plain-HTTP local registries). The [`Resolver`] and
//! [`Fetcher`] traits are the seam the dispatch graph and the provisioning
//! pipeline depend on, so alternative transports can be plugged in.

use std::sync::Arc;

use async_trait::async_trait;
use cage_core::descriptor::{
    Descriptor, ACCEPTED_MANIFEST_TYPES, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use cage_core::error::{CageError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use tokio::io::AsyncWriteExt;

use super::reference::ImageReference;
use crate::content::BlobWriter;

/// Resolves references to root descriptors.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `reference` to its canonical name and root descriptor.
    async fn resolve(&self, reference: &str) -> Result<(String, Descriptor)>;

    /// Fetcher for blobs of the repository named by `name`.
    fn fetcher(&self, name: &str) -> Result<Arc<dyn Fetcher>>;
}

/// Streams blobs into the content store.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Write the bytes of `desc` into `sink`. The sink verifies them on commit.
    async fn fetch(&self, desc: &Descriptor, sink: &mut BlobWriter) -> Result<()>;
}

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Anonymous access.
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Basic authentication.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, anonymous if unset.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Credential lookup callback, keyed by registry host.
pub type CredentialLookup = Arc<dyn Fn(&str) -> RegistryAuth + Send + Sync>;

/// Lookup that reads credentials from the environment for every registry.
pub fn env_credentials() -> CredentialLookup {
    Arc::new(|_registry: &str| RegistryAuth::from_env())
}

/// Resolver backed by a remote registry.
pub struct RegistryResolver {
    client: Arc<Client>,
    credentials: CredentialLookup,
}

impl RegistryResolver {
    /// Create a resolver. `plain_http` disables TLS for every registry.
    pub fn new(plain_http: bool, credentials: CredentialLookup) -> Self {
        let config = ClientConfig {
            protocol: if plain_http {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            ..Default::default()
        };

        Self {
            client: Arc::new(Client::new(config)),
            credentials,
        }
    }
}

#[async_trait]
impl Resolver for RegistryResolver {
    async fn resolve(&self, reference: &str) -> Result<(String, Descriptor)> {
        let resolve_error = |message: String| CageError::ResolveError {
            reference: reference.to_string(),
            message,
        };

        let parsed = ImageReference::parse(reference).map_err(|e| resolve_error(e.to_string()))?;
        let oci_ref = to_oci_reference(&parsed).map_err(|e| resolve_error(e.to_string()))?;
        let auth = (self.credentials)(&parsed.registry).to_oci_auth();

        tracing::info!(reference = %parsed, "Resolving image");

        let (bytes, digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &auth, ACCEPTED_MANIFEST_TYPES)
            .await
            .map_err(|e| resolve_error(e.to_string()))?;
        let bytes = bytes.to_vec();

        let desc = Descriptor::new(sniff_manifest_type(&bytes), digest, bytes.len() as u64);

        tracing::debug!(
            reference = %parsed,
            digest = %desc.digest,
            media_type = %desc.media_type,
            "Resolved image"
        );

        Ok((parsed.full_reference(), desc))
    }

    fn fetcher(&self, name: &str) -> Result<Arc<dyn Fetcher>> {
        let reference = ImageReference::parse(name)?;
        let auth = (self.credentials)(&reference.registry).to_oci_auth();
        Ok(Arc::new(RegistryFetcher {
            client: self.client.clone(),
            reference,
            auth,
        }))
    }
}

/// Fetches blobs of one repository.
pub struct RegistryFetcher {
    client: Arc<Client>,
    reference: ImageReference,
    auth: OciRegistryAuth,
}

#[async_trait]
impl Fetcher for RegistryFetcher {
    async fn fetch(&self, desc: &Descriptor, sink: &mut BlobWriter) -> Result<()> {
        let fetch_error = |message: String| CageError::FetchError {
            digest: desc.digest.clone(),
            message,
        };

        if desc.is_manifest() || desc.is_index() {
            // Manifests are served from the manifests endpoint, not /blobs.
            let pinned = to_oci_reference(&self.reference.pinned(&desc.digest))?;
            let (bytes, _) = self
                .client
                .pull_manifest_raw(&pinned, &self.auth, ACCEPTED_MANIFEST_TYPES)
                .await
                .map_err(|e| fetch_error(e.to_string()))?;
            sink.write_all(&bytes).await?;
            return Ok(());
        }

        let oci_ref = to_oci_reference(&self.reference)?;
        let layer = OciDescriptor {
            media_type: desc.media_type.clone(),
            digest: desc.digest.clone(),
            size: desc.size as i64,
            ..Default::default()
        };
        self.client
            .pull_blob(&oci_ref, &layer, &mut *sink)
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        Ok(())
    }
}

/// Convert an [`ImageReference`] to an oci-distribution reference.
fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = match (&reference.digest, &reference.tag) {
        (Some(digest), _) => format!("{}/{}@{}", reference.registry, reference.repository, digest),
        (None, Some(tag)) => format!("{}/{}:{}", reference.registry, reference.repository, tag),
        (None, None) => format!("{}/{}:latest", reference.registry, reference.repository),
    };

    ref_str.parse::<Reference>().map_err(|e| {
        CageError::OciImageError(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

/// Media type of a raw manifest: its `mediaType` field, else inferred from shape.
pub(crate) fn sniff_manifest_type(bytes: &[u8]) -> String {
    let value: serde_json::Value = match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(_) => return MEDIA_TYPE_OCI_MANIFEST.to_string(),
    };
    if let Some(media_type) = value.get("mediaType").and_then(|v| v.as_str()) {
        return media_type.to_string();
    }
    if value.get("manifests").is_some() {
        MEDIA_TYPE_OCI_INDEX.to_string()
    } else {
        MEDIA_TYPE_OCI_MANIFEST.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cage_core::descriptor::MEDIA_TYPE_DOCKER_MANIFEST;

    #[test]
    fn test_registry_auth_to_oci() {
        assert!(matches!(
            RegistryAuth::anonymous().to_oci_auth(),
            OciRegistryAuth::Anonymous
        ));
        assert!(matches!(
            RegistryAuth::basic("user", "pass").to_oci_auth(),
            OciRegistryAuth::Basic(_, _)
        ));
    }

    #[test]
    fn test_credential_lookup_is_keyed_by_registry() {
        let lookup: CredentialLookup = Arc::new(|registry: &str| {
            if registry == "registry.local:5000" {
                RegistryAuth::basic("ci", "secret")
            } else {
                RegistryAuth::anonymous()
            }
        });
        assert_eq!(lookup("registry.local:5000"), RegistryAuth::basic("ci", "secret"));
        assert_eq!(lookup("docker.io"), RegistryAuth::anonymous());
    }

    #[test]
    fn test_to_oci_reference_with_tag() {
        let r = ImageReference::parse("ghcr.io/org/app:v1").unwrap();
        assert_eq!(to_oci_reference(&r).unwrap().to_string(), "ghcr.io/org/app:v1");
    }

    #[test]
    fn test_to_oci_reference_pinned() {
        let digest = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";
        let r = ImageReference::parse("ghcr.io/org/app:v1").unwrap().pinned(digest);
        let oci_ref = to_oci_reference(&r).unwrap();
        assert_eq!(oci_ref.digest(), Some(digest));
    }

    #[test]
    fn test_sniff_manifest_type() {
        let docker = format!(r#"{{"schemaVersion":2,"mediaType":"{}"}}"#, MEDIA_TYPE_DOCKER_MANIFEST);
        assert_eq!(sniff_manifest_type(docker.as_bytes()), MEDIA_TYPE_DOCKER_MANIFEST);
        assert_eq!(
            sniff_manifest_type(br#"{"schemaVersion":2,"manifests":[]}"#),
            MEDIA_TYPE_OCI_INDEX
        );
        assert_eq!(
            sniff_manifest_type(br#"{"schemaVersion":2,"layers":[]}"#),
            MEDIA_TYPE_OCI_MANIFEST
        );
    }

    #[test]
    fn test_fetcher_rejects_invalid_name() {
        let resolver = RegistryResolver::new(true, env_credentials());
        assert!(resolver.fetcher("").is_err());
    }
}
