//! Volume types for per-container copy-on-write storage.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A dataset dedicated to one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Full dataset name (`<dataset>/<product>/<container-id>`)
    pub name: String,

    /// Where the dataset is mounted on the host
    pub mountpoint: PathBuf,
}

impl Volume {
    pub fn new(name: impl Into<String>, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            mountpoint: mountpoint.into(),
        }
    }

    /// Dataset name for a container under a namespace.
    pub fn name_for(namespace: &str, container_id: &str) -> String {
        format!("{}/{}", namespace, container_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_name_for() {
        assert_eq!(Volume::name_for("tank/cage", "c1"), "tank/cage/c1");
    }

    #[test]
    fn test_volume_new() {
        let vol = Volume::new("tank/cage/c1", "/var/lib/cage/c1");
        assert_eq!(vol.name, "tank/cage/c1");
        assert_eq!(vol.mountpoint, PathBuf::from("/var/lib/cage/c1"));
    }
}
