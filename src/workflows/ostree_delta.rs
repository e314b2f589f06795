//! Repo-mode delta generator: static delta between two commits of an
//! on-disk repository, packaged as `data.tar.gz` (or `data.bin`).

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::delta;
use crate::package::{self, NamingPolicy};
use crate::preflight;
use crate::repo::OsTreeRepo;
use crate::resolve::{self, ImageReference, UpgradeRequest};
use crate::workflows::report_artifact;

pub struct OsTreeDeltaOpts {
    /// Initial (deployed) repository.
    pub repo: PathBuf,
    /// Output directory; created if necessary.
    pub output: PathBuf,
    /// New (update) repository, when the target commit lives elsewhere.
    pub update_repo: Option<PathBuf>,
    pub machine: Option<String>,
    pub to_sha: Option<String>,
    pub from_sha: Option<String>,
    pub empty: bool,
    pub generate_bin: bool,
    pub force: bool,
}

pub fn run(opts: &OsTreeDeltaOpts) -> Result<()> {
    preflight::check_required_tools(preflight::REPO_TOOLS)?;
    resolve::validate_repo_delta_flags(
        opts.empty,
        opts.from_sha.as_deref(),
        opts.update_repo.as_deref(),
    )?;

    let deployed = OsTreeRepo::open(&opts.repo)?;
    let update = opts
        .update_repo
        .as_deref()
        .map(OsTreeRepo::open)
        .transpose()?;

    let target = ImageReference::repo(
        opts.update_repo.as_deref().unwrap_or(&opts.repo),
        opts.to_sha.clone(),
    )?;
    let request = if opts.empty {
        UpgradeRequest::from_scratch(target)
    } else {
        UpgradeRequest::delta(ImageReference::repo(&opts.repo, opts.from_sha.clone())?, target)
    };

    let machine = deployed.machine_ref(opts.machine.as_deref())?;
    let request = request.with_machine(machine.clone());
    println!("[resolve] machine ref: {}", machine);

    let to_rev = request
        .target()
        .sha
        .clone()
        .unwrap_or_else(|| machine.clone());
    let to_sha = update.as_ref().unwrap_or(&deployed).rev_parse(&to_rev)?;

    let from_sha = match request.base() {
        None => None,
        Some(base) => {
            let from_rev = match &base.sha {
                Some(sha) => sha.clone(),
                // Single-repo runs delta from the previous commit on the
                // machine branch; two-repo runs from the deployed head.
                None if update.is_some() => machine.clone(),
                None => format!("{}^", machine),
            };
            Some(deployed.rev_parse(&from_rev)?)
        }
    };

    // The target commit must exist in the deployed repo before a delta
    // against it can be generated there.
    if let Some(update) = &update {
        deployed.pull_local_from(update, &to_sha)?;
    }

    fs::create_dir_all(&opts.output)
        .with_context(|| format!("creating output directory '{}'", opts.output.display()))?;
    let staging = tempfile::Builder::new()
        .prefix(".delta-staging-")
        .tempdir_in(&opts.output)
        .context("creating staging directory")?;

    println!(
        "[delta] {} -> {}",
        from_sha.as_deref().unwrap_or("(empty)"),
        to_sha
    );
    delta::generate_static_delta(&deployed, staging.path(), &machine, &to_sha, from_sha.as_deref())?;

    let dest = NamingPolicy::Data {
        bin: opts.generate_bin,
    }
    .resolve(&opts.output);
    println!("[package] writing {}", dest.display());
    package::package_dir(staging.path(), &dest, opts.force)?;
    package::fix_ownership_or_warn(&dest);
    report_artifact(&dest)
}
