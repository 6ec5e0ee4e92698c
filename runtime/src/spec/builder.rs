//! Runtime specification assembly.
//!
//! A spec is built by running an ordered list of named stages over an
//! empty document. Each stage takes the spec and the shared inputs and
//! returns the updated spec; the first failing stage aborts the build.

use std::path::Path;

use cage_core::error::{CageError, Result};

use super::env::{replace_or_append_env, DEFAULT_PATH_ENV};
use super::hosts::write_hosts_files;
use super::seccomp::default_profile;
use super::types::{Mount, Namespace, Root, RuntimeSpec, OCI_VERSION};
use super::user::{additional_gids, resolve_user};
use crate::oci::ImageConfig;

/// Annotation carrying the requested network attachments.
pub const NETWORKS_ANNOTATION: &str = "cage.networks";

/// Everything the stages read.
#[derive(Debug, Clone, Copy)]
pub struct SpecInputs<'a> {
    /// Container identifier, also the hostname
    pub id: &'a str,
    /// Unpacked root filesystem
    pub rootfs: &'a Path,
    /// Container state directory, receives `hosts` and `hostname`
    pub state_dir: &'a Path,
    /// Image runtime configuration
    pub image: &'a ImageConfig,
    /// Caller command, replaces the image cmd when non-empty
    pub args: &'a [String],
    /// Caller environment overrides
    pub env: &'a [String],
    /// Network attachments for the launcher
    pub networks: &'a [String],
}

/// One named step of spec assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecStage {
    Defaults,
    RootfsPath,
    Hostname,
    ImageConfig,
    HostLocaltime,
    Env,
    Seccomp,
    NoNewPrivileges,
    HostResolvConf,
    HostsFiles,
    Annotations,
}

/// Stage order used for every provisioned container.
pub const DEFAULT_ORDER: &[SpecStage] = &[
    SpecStage::Defaults,
    SpecStage::RootfsPath,
    SpecStage::Hostname,
    SpecStage::ImageConfig,
    SpecStage::HostLocaltime,
    SpecStage::Env,
    SpecStage::Seccomp,
    SpecStage::NoNewPrivileges,
    SpecStage::HostResolvConf,
    SpecStage::HostsFiles,
    SpecStage::Annotations,
];

impl SpecStage {
    pub fn name(&self) -> &'static str {
        match self {
            SpecStage::Defaults => "defaults",
            SpecStage::RootfsPath => "rootfs-path",
            SpecStage::Hostname => "hostname",
            SpecStage::ImageConfig => "image-config",
            SpecStage::HostLocaltime => "host-localtime",
            SpecStage::Env => "env",
            SpecStage::Seccomp => "seccomp",
            SpecStage::NoNewPrivileges => "no-new-privileges",
            SpecStage::HostResolvConf => "host-resolv-conf",
            SpecStage::HostsFiles => "hosts-files",
            SpecStage::Annotations => "annotations",
        }
    }

    pub fn apply(&self, spec: RuntimeSpec, inputs: &SpecInputs<'_>) -> Result<RuntimeSpec> {
        match self {
            SpecStage::Defaults => Ok(with_defaults(spec)),
            SpecStage::RootfsPath => Ok(with_rootfs_path(spec, inputs)),
            SpecStage::Hostname => Ok(RuntimeSpec {
                hostname: Some(inputs.id.to_string()),
                ..spec
            }),
            SpecStage::ImageConfig => with_image_config(spec, inputs),
            SpecStage::HostLocaltime => {
                Ok(with_mount(spec, Mount::bind_ro("/etc/localtime", "/etc/localtime")))
            }
            SpecStage::Env => Ok(with_env(spec, inputs.env)),
            SpecStage::Seccomp => {
                let mut spec = spec;
                spec.linux_mut().seccomp = Some(default_profile());
                Ok(spec)
            }
            SpecStage::NoNewPrivileges => {
                let mut spec = spec;
                spec.process_mut().no_new_privileges = true;
                Ok(spec)
            }
            SpecStage::HostResolvConf => Ok(with_mount(
                spec,
                Mount::bind_ro("/etc/resolv.conf", "/etc/resolv.conf"),
            )),
            SpecStage::HostsFiles => with_hosts_files(spec, inputs),
            SpecStage::Annotations => Ok(with_annotations(spec, inputs)),
        }
    }
}

/// Runs stages in order.
#[derive(Debug, Clone)]
pub struct SpecBuilder {
    stages: Vec<SpecStage>,
}

impl Default for SpecBuilder {
    fn default() -> Self {
        Self {
            stages: DEFAULT_ORDER.to_vec(),
        }
    }
}

impl SpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder running exactly `stages`, in the given order.
    pub fn with_stages(stages: &[SpecStage]) -> Self {
        Self {
            stages: stages.to_vec(),
        }
    }

    pub fn stages(&self) -> &[SpecStage] {
        &self.stages
    }

    pub fn build(&self, inputs: &SpecInputs<'_>) -> Result<RuntimeSpec> {
        self.stages
            .iter()
            .try_fold(RuntimeSpec::default(), |spec, stage| {
                tracing::trace!(stage = stage.name(), "Applying spec stage");
                stage.apply(spec, inputs).map_err(|e| match e {
                    CageError::SpecError(message) => {
                        CageError::SpecError(format!("{}: {}", stage.name(), message))
                    }
                    other => other,
                })
            })
    }
}

fn with_defaults(mut spec: RuntimeSpec) -> RuntimeSpec {
    spec.oci_version = OCI_VERSION.to_string();

    let process = spec.process_mut();
    if process.cwd.is_empty() {
        process.cwd = "/".to_string();
    }

    let mounts = [
        Mount::new("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"]),
        Mount::new(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        Mount::new(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        Mount::new(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        Mount::new("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        Mount::new("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
    ];
    for mount in mounts {
        spec.set_mount(mount);
    }

    let linux = spec.linux_mut();
    linux.namespaces = ["pid", "ipc", "uts", "mount", "network"]
        .iter()
        .map(|kind| Namespace {
            kind: kind.to_string(),
            path: None,
        })
        .collect();
    linux.masked_paths = [
        "/proc/acpi",
        "/proc/kcore",
        "/proc/keys",
        "/proc/latency_stats",
        "/proc/timer_list",
        "/proc/timer_stats",
        "/proc/sched_debug",
        "/sys/firmware",
        "/proc/scsi",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect();
    linux.readonly_paths = [
        "/proc/asound",
        "/proc/bus",
        "/proc/fs",
        "/proc/irq",
        "/proc/sys",
        "/proc/sysrq-trigger",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect();

    spec
}

fn with_rootfs_path(mut spec: RuntimeSpec, inputs: &SpecInputs<'_>) -> RuntimeSpec {
    spec.root = Some(Root {
        path: inputs.rootfs.display().to_string(),
        readonly: false,
    });
    spec
}

fn with_image_config(mut spec: RuntimeSpec, inputs: &SpecInputs<'_>) -> Result<RuntimeSpec> {
    let image = inputs.image;
    let process = spec.process_mut();

    let defaults = if image.env.is_empty() {
        vec![DEFAULT_PATH_ENV.to_string()]
    } else {
        image.env.clone()
    };
    process.env = replace_or_append_env(&defaults, &process.env);
    if !process.env.iter().any(|e| e.starts_with("PATH=")) {
        process.env.push(DEFAULT_PATH_ENV.to_string());
    }

    let cmd = if inputs.args.is_empty() {
        image.cmd.as_slice()
    } else {
        inputs.args
    };
    process.args = image.entrypoint.iter().chain(cmd).cloned().collect();

    process.cwd = image
        .working_dir
        .clone()
        .unwrap_or_else(|| "/".to_string());

    match &image.user {
        Some(user) => {
            let (uid, gid) = resolve_user(inputs.rootfs, user)?;
            process.user.uid = uid;
            process.user.gid = gid;
            process.user.additional_gids = additional_gids(inputs.rootfs, &uid.to_string(), gid)?;
        }
        None => {
            // The image's group database is consulted even without a user.
            process.user.additional_gids =
                additional_gids(inputs.rootfs, "root", process.user.gid)?;
        }
    }

    Ok(spec)
}

fn with_env(mut spec: RuntimeSpec, overrides: &[String]) -> RuntimeSpec {
    if overrides.is_empty() {
        return spec;
    }
    let process = spec.process_mut();
    process.env = replace_or_append_env(&process.env, overrides);
    spec
}

fn with_mount(mut spec: RuntimeSpec, mount: Mount) -> RuntimeSpec {
    spec.set_mount(mount);
    spec
}

fn with_hosts_files(mut spec: RuntimeSpec, inputs: &SpecInputs<'_>) -> Result<RuntimeSpec> {
    let (hosts, hostname) = write_hosts_files(inputs.state_dir, inputs.id)?;
    spec.set_mount(Mount::bind_ro("/etc/hosts", &hosts.display().to_string()));
    spec.set_mount(Mount::bind_ro(
        "/etc/hostname",
        &hostname.display().to_string(),
    ));
    Ok(spec)
}

fn with_annotations(mut spec: RuntimeSpec, inputs: &SpecInputs<'_>) -> RuntimeSpec {
    if !inputs.networks.is_empty() {
        spec.annotations
            .insert(NETWORKS_ANNOTATION.to_string(), inputs.networks.join(","));
    }
    spec
}
