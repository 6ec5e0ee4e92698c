//! OCI image support.
//!
//! Resolves references against a registry, fetches the image graph into
//! the content store, and applies layers onto a container rootfs.
//!
//! # Flow
//!
//! ```text
//! reference ──resolve──▶ root descriptor ──dispatch──▶ content store
//!                                                         │
//!                              rootfs ◀──apply layers── Image::load
//! ```

pub mod dispatch;
pub mod image;
pub mod layers;
pub mod reference;
pub mod registry;

pub use dispatch::Dispatcher;
pub use image::{Image, ImageConfig, Layer};
pub use layers::{apply_layers, Compression};
pub use reference::ImageReference;
pub use registry::{
    env_credentials, CredentialLookup, Fetcher, RegistryAuth, RegistryResolver, Resolver,
};
