//! Single-file OSTree delta between the repos inside two wic images.
//!
//! The mounted images are read-only, so the delta is generated in a scratch
//! archive repo: the target commit (and in delta mode the base commit) is
//! pulled in with `pull-local`, the mounts are released, and `static-delta
//! generate --inline` writes one self-contained file that is renamed to the
//! requested output path.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::delta;
use crate::error::UpgradeError;
use crate::mount::{mount_rootfs, LoopPool, MountHandle};
use crate::package;
use crate::preflight;
use crate::repo::OsTreeRepo;
use crate::resolve;
use crate::workflows::report_artifact;

pub struct OsTreeUpgradeOpts {
    pub empty: bool,
    /// `<first-image> <new-image> <output>`, or `<new-image> <output>` with
    /// `--empty`; shape-checked by the resolver.
    pub paths: Vec<PathBuf>,
    pub force: bool,
}

pub fn run(opts: &OsTreeUpgradeOpts) -> Result<()> {
    preflight::check_required_tools(preflight::WIC_TOOLS)?;
    preflight::check_required_tools(preflight::REPO_TOOLS)?;
    preflight::require_root("create-ostree-upgrade")?;

    let (request, output) = resolve::resolve_ostree_upgrade_args(opts.empty, &opts.paths)?;

    let needed = if request.empty_base() { 1 } else { 2 };
    println!("[mount] acquiring {} loopback device(s)", needed);
    let pool = LoopPool::acquire(needed)?;

    let target_mount = mount_rootfs(&pool, &request.target().location)?;
    let target_repo = open_image_repo(&target_mount, &request.target().location)?;
    let machine = target_repo.machine_ref(None)?;
    let request = request.with_machine(machine.clone());
    println!("[resolve] machine ref: {}", machine);

    let to_sha = target_repo.rev_parse(&machine)?;

    let work_dir = tempfile::Builder::new()
        .prefix(".ostree-upgrade-")
        .tempdir()
        .context("creating scratch repository directory")?;
    let work_repo = OsTreeRepo::init_archive(&work_dir.path().join("repo"))?;
    work_repo.pull_local_from(&target_repo, &to_sha)?;
    drop(target_mount);

    let from_sha = match request.base() {
        Some(base) => {
            let base_mount = mount_rootfs(&pool, &base.location)?;
            let base_repo = open_image_repo(&base_mount, &base.location)?;
            let sha = base_repo.rev_parse(&machine)?;
            work_repo.pull_local_from(&base_repo, &sha)?;
            Some(sha)
        }
        None => None,
    };

    let out_parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(out_parent)
        .with_context(|| format!("creating output directory '{}'", out_parent.display()))?;
    let tmp = out_parent.join(package::tmp_name("delta.bin"));

    println!(
        "[delta] generating {} static delta",
        if request.empty_base() { "from-scratch" } else { "minimal" }
    );
    if let Err(e) = delta::generate_inline_delta(&work_repo, &tmp, &to_sha, from_sha.as_deref()) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    package::install_file(&tmp, &output, opts.force)?;
    package::fix_ownership_or_warn(&output);
    report_artifact(&output)
}

fn open_image_repo(mount: &MountHandle, image: &Path) -> Result<OsTreeRepo> {
    let repo_path = mount.ostree_repo_path().ok_or_else(|| {
        UpgradeError::InvalidArguments(format!(
            "'{}' does not contain an OSTree repository at /ostree/repo",
            image.display()
        ))
    })?;
    OsTreeRepo::open(&repo_path)
}
