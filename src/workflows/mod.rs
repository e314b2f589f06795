//! One module per CLI operation.
//!
//! Each workflow wires the four pipeline stages in order (resolve, mount,
//! delta, package) and owns nothing else; the stage modules do the work.
//! Scratch staging and mounts are scoped guards, so any early return
//! unwinds them before the workflow reports failure.

pub mod create_upgrade;
pub mod extract_repo;
pub mod ostree_delta;
pub mod ostree_upgrade;
pub mod repo_info;

use anyhow::Result;
use std::path::Path;

/// Print the completion line for a produced artifact.
pub(crate) fn report_artifact(path: &Path) -> Result<()> {
    let (sha, size) = crate::package::sha256_file(path)?;
    println!("created '{}' ({} bytes)", path.display(), size);
    println!("sha256: {}", sha);
    Ok(())
}
