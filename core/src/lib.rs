//! Cage Core - Foundational Types
//!
//! Configuration, error, descriptor and volume types shared by the
//! cage runtime and CLI.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod volume;

// Re-export commonly used types
pub use config::CageConfig;
pub use descriptor::Descriptor;
pub use error::{CageError, Phase, PhaseExt, Result};
pub use volume::Volume;

/// Cage version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
