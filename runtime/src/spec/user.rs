//! User and group resolution against the image's own databases.
//!
//! Lookups read `/etc/passwd` and `/etc/group` inside the rootfs.
//! Symlinks are followed as if the rootfs were `/`, so a link in the
//! image can never point the lookup at host files.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use cage_core::error::{CageError, Result};

const MAX_SYMLINK_HOPS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

/// Resolve a user string to `(uid, gid)`.
///
/// Accepts `name`, `uid`, `name:group`, `uid:gid` and mixed forms. Names
/// must exist in the image. A bare numeric uid missing from the image
/// resolves with gid 0.
pub fn resolve_user(rootfs: &Path, user: &str) -> Result<(u32, u32)> {
    let (user_part, group_part) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };

    let passwd = read_passwd(rootfs)?;
    let (uid, primary_gid) = match user_part.parse::<u32>() {
        Ok(uid) => {
            let gid = passwd
                .iter()
                .flatten()
                .find(|e| e.uid == uid)
                .map(|e| e.gid)
                .unwrap_or(0);
            (uid, gid)
        }
        Err(_) => {
            let entry = passwd
                .iter()
                .flatten()
                .find(|e| e.name == user_part)
                .ok_or_else(|| {
                    CageError::SpecError(format!("no such user '{}' in image", user_part))
                })?;
            (entry.uid, entry.gid)
        }
    };

    let gid = match group_part {
        None => primary_gid,
        Some(group) => match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => read_group(rootfs)?
                .iter()
                .flatten()
                .find(|g| g.name == group)
                .map(|g| g.gid)
                .ok_or_else(|| {
                    CageError::SpecError(format!("no such group '{}' in image", group))
                })?,
        },
    };

    Ok((uid, gid))
}

/// Supplementary groups of `user` (a name or a numeric uid).
///
/// These are the groups listing the user as a member, excluding the group
/// named after the user. When the image has no account databases the
/// result is `fallback_gid` alone.
pub fn additional_gids(rootfs: &Path, user: &str, fallback_gid: u32) -> Result<Vec<u32>> {
    let username = match user.parse::<u32>() {
        Ok(uid) => match read_passwd(rootfs)?
            .unwrap_or_default()
            .into_iter()
            .find(|e| e.uid == uid)
        {
            Some(entry) => entry.name,
            None => return Ok(vec![fallback_gid]),
        },
        Err(_) => user.to_string(),
    };

    let groups = match read_group(rootfs)? {
        Some(groups) => groups,
        None => return Ok(vec![fallback_gid]),
    };

    Ok(groups
        .into_iter()
        .filter(|g| g.name != username && g.members.iter().any(|m| *m == username))
        .map(|g| g.gid)
        .collect())
}

fn read_passwd(rootfs: &Path) -> Result<Option<Vec<PasswdEntry>>> {
    Ok(read_database(rootfs, "etc/passwd")?.map(|content| {
        content
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split(':').collect();
                if line.starts_with('#') || fields.len() < 4 {
                    return None;
                }
                Some(PasswdEntry {
                    name: fields[0].to_string(),
                    uid: fields[2].parse().ok()?,
                    gid: fields[3].parse().ok()?,
                })
            })
            .collect()
    }))
}

fn read_group(rootfs: &Path) -> Result<Option<Vec<GroupEntry>>> {
    Ok(read_database(rootfs, "etc/group")?.map(|content| {
        content
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split(':').collect();
                if line.starts_with('#') || fields.len() < 3 {
                    return None;
                }
                let members = fields
                    .get(3)
                    .map(|list| {
                        list.split(',')
                            .map(str::trim)
                            .filter(|m| !m.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Some(GroupEntry {
                    name: fields[0].to_string(),
                    gid: fields[2].parse().ok()?,
                    members,
                })
            })
            .collect()
    }))
}

/// Read a file inside the rootfs, `None` if it does not exist.
fn read_database(rootfs: &Path, rel: &str) -> Result<Option<String>> {
    let path = resolve_in_root(rootfs, Path::new(rel)).map_err(|e| {
        CageError::SpecError(format!("failed to resolve /{} in image: {}", rel, e))
    })?;
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CageError::SpecError(format!(
            "failed to read /{} in image: {}",
            rel, e
        ))),
    }
}

/// Resolve `rel` under `root`, following symlinks with `root` as `/`.
fn resolve_in_root(root: &Path, rel: &Path) -> io::Result<PathBuf> {
    let mut resolved = PathBuf::new();
    let mut pending: VecDeque<OsString> = components(rel).collect();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        if part == ".." {
            resolved.pop();
            continue;
        }

        let candidate = resolved.join(&part);
        let full = root.join(&candidate);
        match std::fs::symlink_metadata(&full) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "too many levels of symbolic links",
                    ));
                }
                let target = std::fs::read_link(&full)?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                let mut expanded: VecDeque<OsString> = components(&target).collect();
                expanded.extend(pending);
                pending = expanded;
            }
            _ => resolved = candidate,
        }
    }

    Ok(root.join(resolved))
}

fn components(path: &Path) -> impl Iterator<Item = OsString> + '_ {
    path.components().filter_map(|c| match c {
        Component::Normal(part) => Some(part.to_os_string()),
        Component::ParentDir => Some(OsString::from("..")),
        _ => None,
    })
}
