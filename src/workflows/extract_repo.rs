//! Extract the OSTree repository out of a wic image into a directory.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::error::UpgradeError;
use crate::mount::{mount_rootfs, LoopPool};
use crate::package;
use crate::preflight;
use crate::process::Cmd;
use crate::resolve::ImageReference;

pub struct ExtractRepoOpts {
    pub image: PathBuf,
    /// Directory to populate with the repository content.
    pub dest: PathBuf,
    pub force: bool,
}

pub fn run(opts: &ExtractRepoOpts) -> Result<()> {
    preflight::check_required_tools(preflight::WIC_TOOLS)?;
    preflight::require_root("extract-repo")?;

    let image = ImageReference::wic(&opts.image)?;
    if opts.dest.exists() {
        if !opts.force {
            return Err(UpgradeError::PackagingFailed(format!(
                "'{}' already exists (pass --force to overwrite)",
                opts.dest.display()
            ))
            .into());
        }
        fs::remove_dir_all(&opts.dest)
            .with_context(|| format!("removing existing '{}'", opts.dest.display()))?;
    }

    println!("[mount] acquiring 1 loopback device");
    let pool = LoopPool::acquire(1)?;
    let mount = mount_rootfs(&pool, &image.location)?;
    let repo = mount.ostree_repo_path().ok_or_else(|| {
        UpgradeError::InvalidArguments(format!(
            "'{}' does not contain an OSTree repository at /ostree/repo",
            image.location.display()
        ))
    })?;

    println!("[package] copying repository to '{}'", opts.dest.display());
    // --hard-links: repo objects are hardlinked into checkouts; the copy
    // must not explode them into independent files.
    let result = Cmd::new("rsync")
        .args(["--archive", "--hard-links"])
        .arg(format!("{}/", repo.display()))
        .arg(format!("{}/", opts.dest.display()))
        .allow_fail()
        .run()?;
    if !result.success() {
        let _ = fs::remove_dir_all(&opts.dest);
        return Err(UpgradeError::PackagingFailed(format!(
            "rsync exited with status {} copying the repository: {}",
            result.code(),
            result.stderr.trim()
        ))
        .into());
    }

    package::fix_ownership_or_warn(&opts.dest);
    println!("repository extracted to '{}'", opts.dest.display());
    Ok(())
}
