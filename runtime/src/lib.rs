//! Cage Runtime - container provisioning engine.
//!
//! Resolves image references, fetches image content into a
//! content-addressed store, creates per-container copy-on-write volumes,
//! unpacks layers into a rootfs and writes the OCI runtime spec the
//! launcher consumes.

#![allow(clippy::result_large_err)]

pub mod content;
pub mod oci;
pub mod provision;
pub mod spec;
pub mod volume;

#[cfg(test)]
mod testutil;

// Re-export common types
pub use content::{BlobWriter, ContentStore};
pub use oci::{
    env_credentials, CredentialLookup, Fetcher, Image, ImageConfig, ImageReference, Layer,
    RegistryAuth, RegistryResolver, Resolver,
};
pub use provision::{
    list_containers, ContainerEntry, ContainerInstance, CreateOptions, Provisioner, ROOTFS_DIR,
    SPEC_FILE,
};
pub use spec::{RuntimeSpec, SpecBuilder, SpecStage};
pub use volume::{DirectoryDriver, VolumeDriver, VolumeManager, ZfsDriver};

/// Cage Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
