//! Mount Manager: loopback device pool and scoped image mounts.
//!
//! Loopback devices are a finite, host-wide resource, so acquisition is
//! serialized against other invocations of this tool with an exclusive
//! advisory lock on a well-known lock file. A busy lock or a free-device
//! shortfall fails fast with `ResourceExhausted`: never blocking, never
//! reusing a busy device.
//!
//! Every attach and every mount is wrapped in a guard that releases it on
//! drop, so devices are freed exactly once on any exit path. Acquisition is
//! all-or-none: a failure partway through a multi-image setup unwinds the
//! guards already built and leaves nothing mounted.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::UpgradeError;
use crate::preflight::effective_uid;
use crate::process::Cmd;

/// Host-wide lock serializing loopback acquisition across invocations.
pub const DEFAULT_LOCK_PATH: &str = "/run/lock/upgrade-builder.lock";

/// Exclusive claim on the host's loopback pool.
///
/// Holding a `LoopPool` means this process may attach devices; the advisory
/// lock is released when the pool drops.
#[derive(Debug)]
pub struct LoopPool {
    _lock: File,
}

impl LoopPool {
    /// Acquire the pool, requiring `needed` free devices.
    pub fn acquire(needed: usize) -> Result<Self> {
        if effective_uid() != 0 {
            return Err(UpgradeError::PermissionDenied(
                "loopback device acquisition requires root".into(),
            )
            .into());
        }
        Self::with_lock_path(Path::new(DEFAULT_LOCK_PATH), needed)
    }

    /// Acquire with an explicit lock path (no privilege check).
    pub fn with_lock_path(lock_path: &Path, needed: usize) -> Result<Self> {
        let lock = try_lock(lock_path)?;

        let free = free_device_count()?;
        if free < needed {
            return Err(UpgradeError::ResourceExhausted(format!(
                "{} free loopback device(s) available, {} required",
                free, needed
            ))
            .into());
        }

        Ok(Self { _lock: lock })
    }

    /// Attach an image read-only with partition scanning.
    pub fn attach(&self, image: &Path) -> Result<LoopDevice> {
        let result = Cmd::new("losetup")
            .args(["--find", "--show", "--read-only", "--partscan"])
            .arg_path(image)
            .allow_fail()
            .run()?;
        if !result.success() {
            let stderr = result.stderr.trim().to_string();
            // Another process can still win a device between our free-count
            // check and the attach; losetup reports that distinctly.
            if stderr.contains("could not find an unused") {
                return Err(UpgradeError::ResourceExhausted(format!(
                    "no free loopback device for '{}': {}",
                    image.display(),
                    stderr
                ))
                .into());
            }
            return Err(UpgradeError::MountFailure(format!(
                "losetup exited with status {} for '{}': {}",
                result.code(),
                image.display(),
                stderr
            ))
            .into());
        }

        let device = result
            .stdout_lines()
            .into_iter()
            .next()
            .ok_or_else(|| {
                UpgradeError::MountFailure(format!(
                    "losetup reported no device for '{}'",
                    image.display()
                ))
            })?;
        Ok(LoopDevice {
            device: PathBuf::from(device),
        })
    }
}

/// An attached loopback device; detached on drop.
#[derive(Debug)]
pub struct LoopDevice {
    device: PathBuf,
}

impl LoopDevice {
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Partition nodes of this device, ascending by partition index.
    pub fn partitions(&self) -> Result<Vec<PathBuf>> {
        let device_name = self
            .device
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let mut parts: Vec<(u32, PathBuf)> = Vec::new();
        for entry in fs::read_dir("/dev").context("reading /dev")? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = partition_index(name, &device_name) {
                parts.push((index, entry.path()));
            }
        }
        parts.sort_by_key(|(index, _)| *index);
        Ok(parts.into_iter().map(|(_, p)| p).collect())
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        let result = Cmd::new("losetup")
            .arg("--detach")
            .arg_path(&self.device)
            .allow_fail()
            .run();
        match result {
            Ok(r) if r.success() => {}
            _ => eprintln!("warning: failed to detach {}", self.device.display()),
        }
    }
}

/// A mounted rootfs from a wic image.
///
/// Unmounts, removes the scratch mountpoint, and (via the owned
/// [`LoopDevice`]) detaches the device on drop, in that order.
#[derive(Debug)]
pub struct MountHandle {
    mountpoint: PathBuf,
    mounted: bool,
    _device: LoopDevice,
}

impl MountHandle {
    pub fn path(&self) -> &Path {
        &self.mountpoint
    }

    /// Path to the OSTree repository inside the mounted rootfs, if present.
    pub fn ostree_repo_path(&self) -> Option<PathBuf> {
        let repo = self.mountpoint.join("ostree/repo");
        repo.is_dir().then_some(repo)
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if self.mounted {
            let result = Cmd::new("umount").arg_path(&self.mountpoint).allow_fail().run();
            match result {
                Ok(r) if r.success() => {}
                _ => eprintln!("warning: failed to unmount {}", self.mountpoint.display()),
            }
        }
        let _ = fs::remove_dir(&self.mountpoint);
    }
}

/// Attach `image` and mount its rootfs partition read-only.
///
/// Partitions are probed in ascending index order; the first that mounts
/// and carries a rootfs marker (`ostree` or `usr` at its root) wins. A wic
/// image puts the rootfs after the boot partition, and the boot partition
/// carries neither marker. An image with no partition table is mounted
/// whole.
pub fn mount_rootfs(pool: &LoopPool, image: &Path) -> Result<MountHandle> {
    let device = pool.attach(image)?;

    let partitions = device.partitions()?;
    let candidates = if partitions.is_empty() {
        vec![device.device().to_path_buf()]
    } else {
        partitions
    };

    let mountpoint = scratch_mountpoint()?;
    for candidate in &candidates {
        let result = Cmd::new("mount")
            .args(["-o", "ro"])
            .arg_path(candidate)
            .arg_path(&mountpoint)
            .allow_fail()
            .run()?;
        if !result.success() {
            continue;
        }
        if mountpoint.join("ostree").is_dir() || mountpoint.join("usr").is_dir() {
            return Ok(MountHandle {
                mountpoint,
                mounted: true,
                _device: device,
            });
        }
        // Mounted fine but not a rootfs (e.g. the boot partition).
        let _ = Cmd::new("umount").arg_path(&mountpoint).allow_fail().run();
    }

    let _ = fs::remove_dir(&mountpoint);
    Err(UpgradeError::MountFailure(format!(
        "no mountable rootfs partition found in '{}'",
        image.display()
    ))
    .into())
}

/// Free loopback devices: `/dev/loop<N>` nodes minus the busy set.
pub fn free_device_count() -> Result<usize> {
    let result = Cmd::new("losetup")
        .args(["--list", "--noheadings", "--output", "NAME"])
        .error_msg("listing busy loopback devices failed")
        .run()?;
    let busy: BTreeSet<String> = result.stdout_lines().into_iter().collect();

    let mut total = Vec::new();
    for entry in fs::read_dir("/dev").context("reading /dev")? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_loop_node_name(name) {
            total.push(format!("/dev/{}", name));
        }
    }
    Ok(count_free(&total, &busy))
}

fn try_lock(lock_path: &Path) -> Result<File> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating lock directory '{}'", parent.display()))?;
    }

    // Never unlink a "stale" lock file: a second process could create a new
    // file at the same path and acquire a separate exclusive lock, defeating
    // mutual exclusion.
    let lock = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("creating lock file '{}'", lock_path.display()))?;

    if lock.try_lock_exclusive().is_err() {
        return Err(UpgradeError::ResourceExhausted(format!(
            "loopback pool is held by another upgrade-builder run (lock: {})",
            lock_path.display()
        ))
        .into());
    }
    Ok(lock)
}

/// `loop0`, `loop7`, ... but not `loop0p1` or `loop-control`.
fn is_loop_node_name(name: &str) -> bool {
    match name.strip_prefix("loop") {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Partition index of `name` for a device called `device_name`.
fn partition_index(name: &str, device_name: &str) -> Option<u32> {
    name.strip_prefix(device_name)?
        .strip_prefix('p')?
        .parse()
        .ok()
}

fn count_free(total: &[String], busy: &BTreeSet<String>) -> usize {
    total.iter().filter(|d| !busy.contains(*d)).count()
}

fn scratch_mountpoint() -> Result<PathBuf> {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("upgrade-builder-mnt-{}-{}", std::process::id(), n));
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating mountpoint '{}'", dir.display()))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_node_names() {
        assert!(is_loop_node_name("loop0"));
        assert!(is_loop_node_name("loop17"));
        assert!(!is_loop_node_name("loop"));
        assert!(!is_loop_node_name("loop0p1"));
        assert!(!is_loop_node_name("loop-control"));
        assert!(!is_loop_node_name("sda"));
    }

    #[test]
    fn test_partition_index_parsing() {
        assert_eq!(partition_index("loop3p1", "loop3"), Some(1));
        assert_eq!(partition_index("loop3p12", "loop3"), Some(12));
        // loop31's partitions must not count as loop3's.
        assert_eq!(partition_index("loop31p1", "loop3"), None);
        assert_eq!(partition_index("loop3", "loop3"), None);
        assert_eq!(partition_index("sda1", "loop3"), None);
    }

    #[test]
    fn test_count_free() {
        let total = vec!["/dev/loop0".to_string(), "/dev/loop1".to_string()];
        let mut busy = BTreeSet::new();
        assert_eq!(count_free(&total, &busy), 2);
        busy.insert("/dev/loop0".to_string());
        assert_eq!(count_free(&total, &busy), 1);
        busy.insert("/dev/loop1".to_string());
        assert_eq!(count_free(&total, &busy), 0);
    }

    #[test]
    fn test_lock_contention_is_resource_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("pool.lock");

        let first = try_lock(&lock_path).unwrap();
        let err = try_lock(&lock_path).unwrap_err();
        let cat = err
            .chain()
            .find_map(|c| c.downcast_ref::<UpgradeError>())
            .unwrap();
        assert_eq!(cat.exit_code(), 4);

        // Released on drop; a fresh claim succeeds.
        drop(first);
        assert!(try_lock(&lock_path).is_ok());
    }
}
