//! Two-image field upgrade: diff two wic rootfs trees into a tarball.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::delta;
use crate::error::UpgradeError;
use crate::mount::{mount_rootfs, LoopPool};
use crate::package::{self, NamingPolicy};
use crate::preflight;
use crate::resolve::{ImageReference, UpgradeRequest};
use crate::workflows::report_artifact;

pub struct CreateUpgradeOpts {
    pub old_image: PathBuf,
    pub new_image: PathBuf,
    pub tag: String,
    pub output_dir: PathBuf,
    pub force: bool,
}

/// Produce `<tag>-field-upgradeupdate.tar.gz` from two wic images.
pub fn run(opts: &CreateUpgradeOpts) -> Result<()> {
    preflight::check_required_tools(preflight::WIC_TOOLS)?;
    preflight::require_root("create-upgrade")?;

    let request = UpgradeRequest::delta(
        ImageReference::wic(&opts.old_image)?,
        ImageReference::wic(&opts.new_image)?,
    );
    let base_ref = request.base().ok_or_else(|| {
        UpgradeError::InvalidArguments("two-image mode requires a base image".into())
    })?;

    println!("[mount] acquiring 2 loopback devices");
    let pool = LoopPool::acquire(2)?;
    let base_mount = mount_rootfs(&pool, &base_ref.location)?;
    let target_mount = mount_rootfs(&pool, &request.target().location)?;

    fs::create_dir_all(&opts.output_dir)
        .with_context(|| format!("creating output directory '{}'", opts.output_dir.display()))?;
    let staging = tempfile::Builder::new()
        .prefix(".field-upgrade-")
        .tempdir_in(&opts.output_dir)
        .context("creating staging directory")?;

    println!("[delta] computing changed-file tree");
    delta::rsync_changed_tree(base_mount.path(), target_mount.path(), staging.path())?;

    let dest = NamingPolicy::FieldUpgrade {
        tag: opts.tag.clone(),
    }
    .resolve(&opts.output_dir);
    println!("[package] writing {}", dest.display());
    package::package_dir(staging.path(), &dest, opts.force)?;
    package::fix_ownership_or_warn(&dest);
    report_artifact(&dest)
}
