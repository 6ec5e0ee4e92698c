use std::fmt;

use thiserror::Error;

/// Pipeline phase a fatal error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetch,
    Volume,
    Unpack,
    Spec,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Fetch => "fetch image",
            Phase::Volume => "create volume",
            Phase::Unpack => "unpack image",
            Phase::Spec => "generate spec",
        };
        f.write_str(name)
    }
}

/// Cage error types
#[derive(Error, Debug)]
pub enum CageError {
    /// Reference could not be resolved to a root descriptor
    #[error("Resolve failed: {reference} - {message}")]
    ResolveError { reference: String, message: String },

    /// A blob in the image graph could not be fetched
    #[error("Fetch failed: {digest} - {message}")]
    FetchError { digest: String, message: String },

    /// Content does not match its declared identity
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    /// Blob missing from the content store
    #[error("Blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Content store I/O failure
    #[error("Content store error: {0}")]
    ContentStoreError(String),

    /// Volume or namespace dataset already exists
    #[error("Volume already exists: {name}")]
    VolumeExists { name: String },

    /// Any other volume creation failure
    #[error("Volume error: {name} - {message}")]
    VolumeError { name: String, message: String },

    /// Applying a layer onto the rootfs failed
    #[error("Extract failed for layer {digest}: {message}")]
    ExtractError { digest: String, message: String },

    /// User/group resolution or mount composition failed
    #[error("Spec error: {0}")]
    SpecError(String),

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Work aborted by the cancellation signal
    #[error("Operation cancelled")]
    Cancelled,

    /// Fatal error wrapped with the phase that produced it
    #[error("{phase}: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<CageError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CageError {
    /// Wrap this error with the pipeline phase that produced it.
    pub fn in_phase(self, phase: Phase) -> Self {
        CageError::Phase {
            phase,
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through phase wrappers.
    pub fn root(&self) -> &CageError {
        match self {
            CageError::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error (or the one it wraps) reports an existing volume.
    pub fn is_volume_exists(&self) -> bool {
        matches!(self.root(), CageError::VolumeExists { .. })
    }
}

impl From<serde_json::Error> for CageError {
    fn from(err: serde_json::Error) -> Self {
        CageError::SerializationError(err.to_string())
    }
}

/// Result type alias for cage operations
pub type Result<T> = std::result::Result<T, CageError>;

/// Extension for attaching a phase to fallible pipeline steps.
pub trait PhaseExt<T> {
    fn phase(self, phase: Phase) -> Result<T>;
}

impl<T> PhaseExt<T> for Result<T> {
    fn phase(self, phase: Phase) -> Result<T> {
        self.map_err(|e| match e {
            CageError::Cancelled => CageError::Cancelled,
            other => other.in_phase(phase),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_error_display() {
        let error = CageError::ResolveError {
            reference: "docker.io/library/nginx:latest".to_string(),
            message: "unauthorized".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Resolve failed: docker.io/library/nginx:latest - unauthorized"
        );
    }

    #[test]
    fn test_fetch_error_display() {
        let error = CageError::FetchError {
            digest: "sha256:abc".to_string(),
            message: "connection reset".to_string(),
        };
        assert_eq!(error.to_string(), "Fetch failed: sha256:abc - connection reset");
    }

    #[test]
    fn test_phase_wrapper_display() {
        let error = CageError::IntegrityError(
            "mismatched image rootfs and manifest layers".to_string(),
        )
        .in_phase(Phase::Unpack);
        assert_eq!(
            error.to_string(),
            "unpack image: Integrity error: mismatched image rootfs and manifest layers"
        );
    }

    #[test]
    fn test_root_looks_through_phases() {
        let error = CageError::VolumeExists {
            name: "tank/cage".to_string(),
        }
        .in_phase(Phase::Volume);
        assert!(error.is_volume_exists());
        assert!(matches!(error.root(), CageError::VolumeExists { .. }));
    }

    #[test]
    fn test_volume_error_is_not_exists() {
        let error = CageError::VolumeError {
            name: "tank/cage/c1".to_string(),
            message: "permission denied".to_string(),
        };
        assert!(!error.is_volume_exists());
    }

    #[test]
    fn test_phase_ext_keeps_cancelled_unwrapped() {
        let result: Result<()> = Err(CageError::Cancelled);
        let err = result.phase(Phase::Fetch).unwrap_err();
        assert!(matches!(err, CageError::Cancelled));
    }

    #[test]
    fn test_phase_ext_wraps_other_errors() {
        let result: Result<()> = Err(CageError::SpecError("no such user".to_string()));
        let err = result.phase(Phase::Spec).unwrap_err();
        assert!(matches!(
            err,
            CageError::Phase {
                phase: Phase::Spec,
                ..
            }
        ));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: CageError = io_error.into();
        assert!(matches!(error, CageError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ invalid");
        let error: CageError = result.unwrap_err().into();
        assert!(matches!(error, CageError::SerializationError(_)));
    }
}
