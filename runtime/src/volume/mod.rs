//! Copy-on-write volumes for container root filesystems.
//!
//! Each container gets its own dataset under a shared namespace dataset.
//! Drivers are pluggable so hosts without ZFS can use plain directories.

mod driver;
mod manager;

pub use driver::{DirectoryDriver, VolumeDriver, ZfsDriver};
pub use manager::VolumeManager;
