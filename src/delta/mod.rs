//! Delta Producer: computes the upgrade payload between base and target.
//!
//! Two mechanisms, selected by image domain:
//!
//! - **wic mode** - a file-sync diff between two mounted rootfs trees via
//!   `rsync --compare-dest`: files byte-identical to the base are omitted,
//!   so the staged tree is exactly the changed-file payload.
//! - **repo mode** - a native OSTree static delta between two commits (or
//!   from a null baseline in from-scratch mode), staged next to a
//!   `metadata` file the device-side deploy step consumes.
//!
//! All output lands in a staging directory owned by the caller; the
//! Packager turns staging into the final artifact atomically.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::error::UpgradeError;
use crate::process::Cmd;
use crate::repo::{OsTreeRepo, StaticDeltaOpts};

/// File name of the delta superblock inside a repo-mode staging tree.
pub const SUPERBLOCK_NAME: &str = "superblock";

/// File name of the sha metadata inside a repo-mode staging tree.
pub const METADATA_NAME: &str = "metadata";

/// Stage the changed-file tree transforming `base` into `target`.
///
/// Runs `rsync --archive --checksum --compare-dest=<base>/ <target>/
/// <staging>/`. `--checksum` diffs by content, not timestamps, so two builds
/// of the same rootfs differ in mtimes but not bytes.
pub fn rsync_changed_tree(base: &Path, target: &Path, staging: &Path) -> Result<()> {
    let base = base
        .canonicalize()
        .with_context(|| format!("resolving base tree '{}'", base.display()))?;

    let result = Cmd::new("rsync")
        .args(["--archive", "--checksum"])
        // --compare-dest must be absolute or rsync resolves it against the
        // destination.
        .arg(format!("--compare-dest={}/", base.display()))
        .arg(format!("{}/", target.display()))
        .arg(format!("{}/", staging.display()))
        .allow_fail()
        .run()?;
    if !result.success() {
        return Err(UpgradeError::DeltaGenerationFailed(format!(
            "rsync exited with status {}: {}",
            result.code(),
            result.stderr.trim()
        ))
        .into());
    }

    // rsync keeps empty directories for unchanged subtrees; they carry no
    // upgrade content.
    prune_empty_dirs(staging)?;
    Ok(())
}

/// Stage a repo-mode static delta: `superblock` (+ part files) and
/// `metadata` in `staging`.
///
/// In from-scratch mode (`from_sha == None`) the metadata `From-sha` field
/// carries the machine name instead of a commit; the deploy step on the
/// device sanity-checks that the ref is present in the device repo.
pub fn generate_static_delta(
    repo: &OsTreeRepo,
    staging: &Path,
    machine: &str,
    to_sha: &str,
    from_sha: Option<&str>,
) -> Result<()> {
    write_metadata(staging, from_sha.unwrap_or(machine), to_sha)?;

    repo.static_delta(&StaticDeltaOpts {
        to_sha,
        from_sha,
        filename: &staging.join(SUPERBLOCK_NAME),
        inline: false,
    })
}

/// Generate a single-file inline delta at `output`.
pub fn generate_inline_delta(
    repo: &OsTreeRepo,
    output: &Path,
    to_sha: &str,
    from_sha: Option<&str>,
) -> Result<()> {
    repo.static_delta(&StaticDeltaOpts {
        to_sha,
        from_sha,
        filename: output,
        inline: true,
    })
}

/// Write the from/to sha metadata consumed at deploy time.
///
/// The format is fixed: `From-sha:<from>\nTo-sha:<to>\n`.
pub fn write_metadata(dir: &Path, from: &str, to: &str) -> Result<()> {
    let path = dir.join(METADATA_NAME);
    fs::write(&path, format!("From-sha:{}\nTo-sha:{}\n", from, to))
        .with_context(|| format!("writing '{}'", path.display()))
}

fn prune_empty_dirs(root: &Path) -> Result<()> {
    // Children first, so a directory of empty directories collapses.
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            prune_empty_dirs(&entry.path())?;
            // Only removes empty directories; fails (ignored) otherwise.
            let _ = fs::remove_dir(entry.path());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_format_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        write_metadata(dir.path(), "aaa111", "bbb222").unwrap();
        let content = fs::read_to_string(dir.path().join("metadata")).unwrap();
        assert_eq!(content, "From-sha:aaa111\nTo-sha:bbb222\n");
    }

    #[test]
    fn test_metadata_empty_mode_carries_machine_name() {
        let dir = tempfile::tempdir().unwrap();
        // Callers pass the machine ref as `from` in from-scratch mode.
        write_metadata(dir.path(), "imx8mmevk", "bbb222").unwrap();
        let content = fs::read_to_string(dir.path().join("metadata")).unwrap();
        assert!(content.starts_with("From-sha:imx8mmevk\n"));
    }

    #[test]
    fn test_prune_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        fs::create_dir_all(dir.path().join("kept")).unwrap();
        fs::write(dir.path().join("kept/file"), b"x").unwrap();

        prune_empty_dirs(dir.path()).unwrap();

        assert!(!dir.path().join("a").exists());
        assert!(dir.path().join("kept/file").exists());
    }
}
