//! Content-addressed storage for image blobs.
//!
//! Manifests, configs and layers are stored by digest. The fetch path
//! writes through [`BlobWriter`]; extraction reads back with
//! [`ContentStore::open`].

mod store;

pub use store::{BlobWriter, ContentStore};
