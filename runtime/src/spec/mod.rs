//! Runtime specification generation.

mod builder;
mod env;
mod hosts;
mod seccomp;
pub mod types;
mod user;

pub use builder::{SpecBuilder, SpecInputs, SpecStage, DEFAULT_ORDER, NETWORKS_ANNOTATION};
pub use env::{replace_or_append_env, DEFAULT_PATH_ENV};
pub use hosts::write_hosts_files;
pub use seccomp::default_profile;
pub use types::{Mount, Process, RuntimeSpec};
pub use user::{additional_gids, resolve_user};
