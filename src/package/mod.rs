//! Artifact Packager: deterministic archives, naming, atomic install.
//!
//! Archives are built in-process with sorted entry order and zeroed
//! mtime/uid/gid, so identical staging trees produce byte-identical
//! tarballs; reruns of the same upgrade are comparable by checksum. The
//! final artifact is written under a temp name in the destination
//! directory and renamed into place; a failed run never leaves a partial
//! file under the final name.
//!
//! Mount-based pipelines run as root, so everything they produce is
//! root-owned; [`fix_ownership_or_warn`] hands the output back to the
//! invoking user recorded in `SUDO_UID`/`SUDO_GID`.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

use crate::error::UpgradeError;

/// How the final output file is named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamingPolicy {
    /// `<tag>-field-upgradeupdate.tar.gz` in the output directory.
    FieldUpgrade { tag: String },
    /// The literal output path given on the command line.
    Fixed { path: PathBuf },
    /// `data.tar.gz`, or `data.bin` when the bin rename is requested.
    Data { bin: bool },
}

impl NamingPolicy {
    /// Final artifact path under `output_dir` (ignored for `Fixed`).
    pub fn resolve(&self, output_dir: &Path) -> PathBuf {
        match self {
            NamingPolicy::FieldUpgrade { tag } => {
                output_dir.join(format!("{}-field-upgradeupdate.tar.gz", tag))
            }
            NamingPolicy::Fixed { path } => path.clone(),
            NamingPolicy::Data { bin: false } => output_dir.join("data.tar.gz"),
            NamingPolicy::Data { bin: true } => output_dir.join("data.bin"),
        }
    }
}

/// Package a staging directory as a gzip tarball at `dest`.
///
/// Fails with `PackagingFailed` if `dest` exists and `force` is unset. The
/// archive is complete and valid before it appears under `dest`.
pub fn package_dir(staging: &Path, dest: &Path, force: bool) -> Result<()> {
    check_destination(dest, force)?;

    let parent = dest_parent(dest);
    fs::create_dir_all(parent)
        .with_context(|| format!("creating output directory '{}'", parent.display()))?;
    let tmp = parent.join(tmp_name("data.tar.gz"));

    if let Err(e) = create_tar_gz(staging, &tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(UpgradeError::PackagingFailed(format!(
            "building '{}': {:#}",
            dest.display(),
            e
        ))
        .into());
    }

    atomic_rename(&tmp, dest)
        .map_err(|e| UpgradeError::PackagingFailed(format!("{:#}", e)).into())
}

/// Install a single produced file at `dest` (temp-then-rename).
pub fn install_file(src: &Path, dest: &Path, force: bool) -> Result<()> {
    check_destination(dest, force)?;
    if !src.is_file() {
        return Err(UpgradeError::PackagingFailed(format!(
            "produced artifact '{}' is missing",
            src.display()
        ))
        .into());
    }
    atomic_rename(src, dest)
        .map_err(|e| UpgradeError::PackagingFailed(format!("{:#}", e)).into())
}

/// Directory a destination lands in; a bare file name lands in `.`.
fn dest_parent(dest: &Path) -> &Path {
    match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn check_destination(dest: &Path, force: bool) -> Result<()> {
    if dest.exists() && !force {
        return Err(UpgradeError::PackagingFailed(format!(
            "'{}' already exists (pass --force to overwrite)",
            dest.display()
        ))
        .into());
    }
    Ok(())
}

/// Create a deterministic `.tar.gz` of a directory.
///
/// Entries are sorted by relative path; mtimes and uid/gid are zeroed; the
/// gzip header carries no timestamp. Identical input trees produce
/// byte-identical archives.
pub fn create_tar_gz(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("creating '{}'", out_path.display()))?;
    let encoder = flate2::write::GzEncoder::new(out, flate2::Compression::default());
    let mut builder = TarBuilder::new(encoder);

    // Collect paths deterministically.
    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(src_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        let p = ent.path();
        if p == src_dir {
            continue;
        }
        entries.push(p.to_path_buf());
    }

    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    for p in entries {
        let rel = p
            .strip_prefix(src_dir)
            .unwrap_or(&p)
            .to_string_lossy()
            .replace('\\', "/");

        let md = fs::symlink_metadata(&p)?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(unix_mode(&md));
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            builder.append_link(&mut header, rel, &target)?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_mode(unix_mode(&md));
            header.set_cksum();
            let f = File::open(&p)?;
            builder.append_data(&mut header, rel, f)?;
        }
    }

    let encoder = builder.into_inner().context("finalizing tar stream")?;
    encoder.finish().context("finalizing gzip stream")?;
    Ok(())
}

#[cfg(unix)]
fn unix_mode(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode()
}

#[cfg(not(unix))]
fn unix_mode(md: &fs::Metadata) -> u32 {
    if md.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// Rename with a copy+remove fallback for cross-filesystem moves.
pub fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dest_parent(dst))?;
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_e) => {
            // EXDEV: stage next to the destination, then rename.
            let tmp = dst.with_extension("tmp");
            fs::copy(src, &tmp)
                .with_context(|| format!("copying {} to {}", src.display(), tmp.display()))?;
            fs::rename(&tmp, dst)
                .with_context(|| format!("renaming {} to {}", tmp.display(), dst.display()))?;
            fs::remove_file(src)
                .with_context(|| format!("removing tmp {}", src.display()))?;
            Ok(())
        }
    }
}

/// Unique temp file name for staging next to a destination.
pub fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!(".{}-{}-{}", prefix, std::process::id(), n)
}

/// SHA-256 and size of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    let sha = format!("{:x}", hasher.finalize());
    Ok((sha, size))
}

/// The non-root user who invoked this (root) process, from sudo's env.
pub fn invoking_user() -> Option<(u32, u32)> {
    parse_sudo_ids(
        std::env::var("SUDO_UID").ok().as_deref(),
        std::env::var("SUDO_GID").ok().as_deref(),
    )
}

fn parse_sudo_ids(uid: Option<&str>, gid: Option<&str>) -> Option<(u32, u32)> {
    let uid: u32 = uid?.trim().parse().ok()?;
    let gid: u32 = gid?.trim().parse().ok()?;
    // sudo run from a root shell: nothing to hand back.
    if uid == 0 {
        return None;
    }
    Some((uid, gid))
}

/// Recursively hand ownership of `path` back to the invoking user.
///
/// No-op when not running under sudo. Failure is reported to the caller as
/// `OwnershipFixFailed`; callers warn and continue; the artifact itself is
/// already complete.
pub fn fix_ownership(path: &Path) -> std::result::Result<(), UpgradeError> {
    let Some((uid, gid)) = invoking_user() else {
        return Ok(());
    };

    for ent in WalkDir::new(path).follow_links(false) {
        let ent = ent.map_err(|e| {
            UpgradeError::OwnershipFixFailed(format!("walking '{}': {}", path.display(), e))
        })?;
        lchown(ent.path(), uid, gid).map_err(|e| {
            UpgradeError::OwnershipFixFailed(format!(
                "chown {}:{} '{}': {}",
                uid,
                gid,
                ent.path().display(),
                e
            ))
        })?;
    }
    Ok(())
}

/// [`fix_ownership`], demoted to a warning.
pub fn fix_ownership_or_warn(path: &Path) {
    if let Err(e) = fix_ownership(path) {
        eprintln!("warning: {}", e);
    }
}

#[cfg(unix)]
fn lchown(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // lchown, not chown: never follow symlinks out of the output tree.
    let rc = unsafe { libc::lchown(cpath.as_ptr(), uid, gid) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn lchown(_path: &Path, _uid: u32, _gid: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tree(root: &Path) {
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("metadata"), "From-sha:a\nTo-sha:b\n").unwrap();
        fs::write(root.join("sub/0"), vec![0u8; 4096]).unwrap();
        fs::write(root.join("superblock"), b"delta-superblock").unwrap();
    }

    #[test]
    fn test_tarball_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        make_tree(&tree);

        let a = dir.path().join("a.tar.gz");
        let b = dir.path().join("b.tar.gz");
        create_tar_gz(&tree, &a).unwrap();
        create_tar_gz(&tree, &b).unwrap();

        assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
    }

    #[test]
    fn test_tarball_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        make_tree(&tree);

        let a = dir.path().join("a.tar.gz");
        create_tar_gz(&tree, &a).unwrap();

        fs::write(tree.join("superblock"), b"different-delta").unwrap();
        let b = dir.path().join("b.tar.gz");
        create_tar_gz(&tree, &b).unwrap();

        assert_ne!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
    }

    #[test]
    fn test_naming_policy_resolution() {
        let out = Path::new("/work/out");
        assert_eq!(
            NamingPolicy::FieldUpgrade { tag: "v7".into() }.resolve(out),
            Path::new("/work/out/v7-field-upgradeupdate.tar.gz")
        );
        assert_eq!(
            NamingPolicy::Data { bin: false }.resolve(out),
            Path::new("/work/out/data.tar.gz")
        );
        assert_eq!(
            NamingPolicy::Data { bin: true }.resolve(out),
            Path::new("/work/out/data.bin")
        );
        assert_eq!(
            NamingPolicy::Fixed {
                path: "/elsewhere/delta.bin".into()
            }
            .resolve(out),
            Path::new("/elsewhere/delta.bin")
        );
    }

    #[test]
    fn test_package_dir_refuses_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        make_tree(&tree);
        let dest = dir.path().join("data.tar.gz");
        fs::write(&dest, b"already here").unwrap();

        let err = package_dir(&tree, &dest, false).unwrap_err();
        let cat = err
            .chain()
            .find_map(|c| c.downcast_ref::<UpgradeError>())
            .unwrap();
        assert_eq!(cat.exit_code(), 7);
        // The original file is untouched.
        assert_eq!(fs::read(&dest).unwrap(), b"already here");

        package_dir(&tree, &dest, true).unwrap();
        assert_ne!(fs::read(&dest).unwrap(), b"already here");
    }

    #[test]
    fn test_package_dir_leaves_no_temp_litter() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        make_tree(&tree);
        let dest = dir.path().join("out/data.tar.gz");

        package_dir(&tree, &dest, false).unwrap();

        let names: Vec<String> = fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["data.tar.gz".to_string()]);
    }

    #[test]
    fn test_dest_parent_of_bare_name() {
        assert_eq!(dest_parent(Path::new("delta.bin")), Path::new("."));
        assert_eq!(dest_parent(Path::new("out/delta.bin")), Path::new("out"));
        assert_eq!(dest_parent(Path::new("/abs/delta.bin")), Path::new("/abs"));
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        fs::write(&p, b"abc").unwrap();
        let (sha, size) = sha256_file(&p).unwrap();
        assert_eq!(size, 3);
        assert_eq!(
            sha,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_parse_sudo_ids() {
        assert_eq!(parse_sudo_ids(Some("1000"), Some("1000")), Some((1000, 1000)));
        assert_eq!(parse_sudo_ids(None, Some("1000")), None);
        assert_eq!(parse_sudo_ids(Some("1000"), None), None);
        assert_eq!(parse_sudo_ids(Some("not-a-uid"), Some("1000")), None);
        // sudo from a root shell: no user to hand back to.
        assert_eq!(parse_sudo_ids(Some("0"), Some("0")), None);
    }

    #[test]
    fn test_install_file_is_atomic_about_existing_dest() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("staged");
        fs::write(&src, b"delta").unwrap();
        let dest = dir.path().join("delta.bin");
        fs::write(&dest, b"old").unwrap();

        assert!(install_file(&src, &dest, false).is_err());
        assert_eq!(fs::read(&dest).unwrap(), b"old");

        install_file(&src, &dest, true).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"delta");
        assert!(!src.exists());
    }
}
