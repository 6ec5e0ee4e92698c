use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CageError, Result};

/// Default state root for provisioned containers.
pub const DEFAULT_ROOT: &str = "/var/lib/cage";

/// Default parent dataset for container volumes.
pub const DEFAULT_DATASET: &str = "tank";

/// Product segment of volume names (`<dataset>/<product>/<id>`).
pub const PRODUCT: &str = "cage";

/// Name of the content store directory under the root.
pub const CONTENT_DIR_NAME: &str = "content";

/// Cage configuration
///
/// Constructed once at process startup and passed by reference into each
/// component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CageConfig {
    /// Directory holding one subdirectory per container
    pub root: PathBuf,

    /// Content-addressed blob store
    pub content_dir: PathBuf,

    /// Parent dataset (storage namespace) for container volumes
    pub dataset: String,

    /// Product segment of volume names
    pub product: String,

    /// Talk to registries over plain HTTP
    pub plain_http: bool,

    /// Maximum number of blob fetches in flight
    pub fetch_concurrency: usize,

    /// Enable debug output in the logs
    pub debug: bool,
}

impl Default for CageConfig {
    fn default() -> Self {
        Self::with_root(DEFAULT_ROOT)
    }
}

impl CageConfig {
    /// Configuration rooted at `root`, content store inside it.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            content_dir: root.join(CONTENT_DIR_NAME),
            root,
            dataset: DEFAULT_DATASET.to_string(),
            product: PRODUCT.to_string(),
            plain_http: false,
            fetch_concurrency: 4,
            debug: false,
        }
    }

    /// Defaults overridden from `CAGE_ROOT`, `CAGE_DATASET` and `DEBUG`.
    pub fn from_env() -> Self {
        let mut config = match std::env::var("CAGE_ROOT") {
            Ok(root) if !root.is_empty() => Self::with_root(root),
            _ => Self::default(),
        };
        if let Ok(dataset) = std::env::var("CAGE_DATASET") {
            if !dataset.is_empty() {
                config.dataset = dataset;
            }
        }
        if let Ok(debug) = std::env::var("DEBUG") {
            config.debug = parse_bool(&debug);
        }
        config
    }

    /// Check the configuration before any component is built from it.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            return Err(CageError::ConfigError(format!(
                "root must be an absolute path: {}",
                self.root.display()
            )));
        }
        if self.dataset.trim().is_empty() || self.dataset.starts_with('/') {
            return Err(CageError::ConfigError(format!(
                "invalid dataset name '{}'",
                self.dataset
            )));
        }
        if self.fetch_concurrency == 0 {
            return Err(CageError::ConfigError(
                "fetch concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Shared namespace dataset: `<dataset>/<product>`.
    pub fn namespace(&self) -> String {
        format!("{}/{}", self.dataset, self.product)
    }

    /// Directory owned by one container.
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Whether `path` is the content store rather than a container directory.
    pub fn is_content_dir(&self, path: &Path) -> bool {
        path == self.content_dir
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CageConfig::default();
        assert_eq!(config.root, PathBuf::from("/var/lib/cage"));
        assert_eq!(config.content_dir, PathBuf::from("/var/lib/cage/content"));
        assert_eq!(config.dataset, "tank");
        assert_eq!(config.namespace(), "tank/cage");
        assert!(!config.plain_http);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_container_dir() {
        let config = CageConfig::with_root("/srv/cage");
        assert_eq!(config.container_dir("c1"), PathBuf::from("/srv/cage/c1"));
        assert!(config.is_content_dir(Path::new("/srv/cage/content")));
        assert!(!config.is_content_dir(Path::new("/srv/cage/c1")));
    }

    #[test]
    fn test_validate_rejects_relative_root() {
        let config = CageConfig::with_root("relative/root");
        assert!(matches!(config.validate(), Err(CageError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_empty_dataset() {
        let mut config = CageConfig::default();
        config.dataset = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = CageConfig::default();
        config.fetch_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = CageConfig::with_root("/tmp/cage");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.root, config.root);
        assert_eq!(parsed.dataset, config.dataset);
    }
}
