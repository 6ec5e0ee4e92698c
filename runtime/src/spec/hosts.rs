//! Container-scoped `/etc/hosts` and `/etc/hostname`.

use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use cage_core::error::{CageError, Result};

const HOSTS_MODE: u32 = 0o666;

/// Write `hosts` and `hostname` for container `id` into `dir`.
///
/// Returns the paths of the hosts and hostname files.
pub fn write_hosts_files(dir: &Path, id: &str) -> Result<(PathBuf, PathBuf)> {
    let write_error = |path: &Path, e: std::io::Error| {
        CageError::SpecError(format!("Failed to write {}: {}", path.display(), e))
    };

    fs::create_dir_all(dir).map_err(|e| write_error(dir, e))?;

    let hosts = dir.join("hosts");
    let content = format!(
        "127.0.0.1       localhost\n127.0.0.1       {}\n::1     localhost ip6-localhost ip6-loopback\n",
        id
    );
    fs::write(&hosts, content).map_err(|e| write_error(&hosts, e))?;
    fs::set_permissions(&hosts, Permissions::from_mode(HOSTS_MODE))
        .map_err(|e| write_error(&hosts, e))?;

    let hostname = dir.join("hostname");
    fs::write(&hostname, id).map_err(|e| write_error(&hostname, e))?;

    Ok((hosts, hostname))
}
