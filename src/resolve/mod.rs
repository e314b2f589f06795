//! Image Resolver: turns CLI input into a validated upgrade request.
//!
//! The resolver owns all input validation. Downstream stages may assume the
//! referenced images exist, the base/empty combination is coherent, and the
//! machine-ref selection rule has been applied.
//!
//! # Machine-ref selection
//!
//! A Yocto-built repository carries exactly one "machine" ref naming the
//! device type, plus build-internal refs whose names start with `ostree`
//! (e.g. `ostree/1/1/0`). The machine ref is discovered by discarding the
//! internal refs, sorting the remainder lexicographically and taking the
//! first. The ordering makes default-machine upgrades reproducible when a
//! repo unexpectedly carries several candidate refs.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::error::UpgradeError;

/// What an [`ImageReference`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// A raw, partitioned disk image produced by a Yocto build.
    Wic,
    /// An OSTree repository directory.
    Repo,
}

/// A resolved reference to an upgrade input. Immutable once built.
#[derive(Debug, Clone)]
pub struct ImageReference {
    pub kind: ImageKind,
    pub location: PathBuf,
    /// Pinned commit within a repo-kind reference; `None` means "head".
    pub sha: Option<String>,
}

impl ImageReference {
    /// Reference a wic disk image, validating that the file is readable.
    pub fn wic(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(UpgradeError::InvalidArguments(format!(
                "image '{}' does not exist or is not a file",
                path.display()
            ))
            .into());
        }
        Ok(Self {
            kind: ImageKind::Wic,
            location: path.to_path_buf(),
            sha: None,
        })
    }

    /// Reference an OSTree repository directory, optionally pinned to a sha.
    pub fn repo(path: &Path, sha: Option<String>) -> Result<Self> {
        ensure_is_directory(path)?;
        Ok(Self {
            kind: ImageKind::Repo,
            location: path.to_path_buf(),
            sha,
        })
    }
}

/// The resolved pair of upgrade inputs.
///
/// Invariant: `empty_base()` is true iff `base` is `None`; the constructors
/// are the only way to build one, so the invariant cannot be violated.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    base: Option<ImageReference>,
    target: ImageReference,
    /// Machine ref selected for repo operations. `None` until discovered
    /// from the repository (wic file-diff mode never needs one).
    machine: Option<String>,
}

impl UpgradeRequest {
    /// An upgrade from `base` to `target`.
    pub fn delta(base: ImageReference, target: ImageReference) -> Self {
        Self {
            base: Some(base),
            target,
            machine: None,
        }
    }

    /// A from-scratch upgrade: full target content from a null baseline.
    pub fn from_scratch(target: ImageReference) -> Self {
        Self {
            base: None,
            target,
            machine: None,
        }
    }

    pub fn base(&self) -> Option<&ImageReference> {
        self.base.as_ref()
    }

    pub fn target(&self) -> &ImageReference {
        &self.target
    }

    pub fn empty_base(&self) -> bool {
        self.base.is_none()
    }

    pub fn machine(&self) -> Option<&str> {
        self.machine.as_deref()
    }

    pub fn with_machine(mut self, machine: String) -> Self {
        self.machine = Some(machine);
        self
    }
}

/// Check that a path exists and is a directory.
pub fn ensure_is_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(UpgradeError::InvalidArguments(format!(
            "'{}' does not exist",
            path.display()
        ))
        .into());
    }
    if !path.is_dir() {
        return Err(UpgradeError::InvalidArguments(format!(
            "'{}' is not a directory",
            path.display()
        ))
        .into());
    }
    Ok(())
}

/// Select the machine ref from a repository's ref list.
///
/// Refs starting with `ostree` are build-internal and never candidates.
/// Returns the lexicographically first remaining ref.
pub fn select_machine_ref(refs: &[String]) -> Option<String> {
    let mut candidates: Vec<&String> = refs
        .iter()
        .filter(|r| !r.starts_with("ostree"))
        .collect();
    candidates.sort();
    candidates.first().map(|s| s.to_string())
}

/// Resolve the positional arguments of `create-ostree-upgrade`.
///
/// Delta mode takes `<first-image> <new-image> <output>`; from-scratch mode
/// (`--empty`) takes `<new-image> <output>`. Anything else is rejected, as
/// is combining `--empty` with an explicit base.
pub fn resolve_ostree_upgrade_args(
    empty: bool,
    paths: &[PathBuf],
) -> Result<(UpgradeRequest, PathBuf)> {
    let request = match (empty, paths) {
        (true, [new_image, output]) => {
            let target = ImageReference::wic(new_image)?;
            (UpgradeRequest::from_scratch(target), output.clone())
        }
        (false, [first_image, new_image, output]) => {
            let base = ImageReference::wic(first_image)?;
            let target = ImageReference::wic(new_image)?;
            (UpgradeRequest::delta(base, target), output.clone())
        }
        (true, [_, _, _]) => {
            return Err(UpgradeError::InvalidArguments(
                "--empty and an explicit base image are mutually exclusive".into(),
            )
            .into());
        }
        _ => {
            return Err(UpgradeError::InvalidArguments(
                "expected '<first-image> <new-image> <output>' or '--empty <new-image> <output>'"
                    .into(),
            )
            .into());
        }
    };
    Ok(request)
}

/// Validate the flag combination of the repo-mode delta generator.
///
/// `--empty` produces a full delta and cannot be combined with a base
/// selector (`--from-sha`) or a second repository (`--update-repo`).
pub fn validate_repo_delta_flags(
    empty: bool,
    from_sha: Option<&str>,
    update_repo: Option<&Path>,
) -> Result<()> {
    if empty && from_sha.is_some() {
        return Err(UpgradeError::InvalidArguments(
            "--empty and --from-sha are mutually exclusive".into(),
        )
        .into());
    }
    if empty && update_repo.is_some() {
        return Err(UpgradeError::InvalidArguments(
            "--empty and --update-repo are mutually exclusive".into(),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_machine_ref_ignores_internal_refs() {
        let r = refs(&["ostree/1/1/0", "imx8mmevk", "ostree-staging"]);
        assert_eq!(select_machine_ref(&r), Some("imx8mmevk".to_string()));
    }

    #[test]
    fn test_machine_ref_is_lexicographic_first() {
        let r = refs(&["zebra", "imx8mmevk", "raspberrypi4"]);
        assert_eq!(select_machine_ref(&r), Some("imx8mmevk".to_string()));
        // Order of enumeration must not matter.
        let r = refs(&["raspberrypi4", "zebra", "imx8mmevk"]);
        assert_eq!(select_machine_ref(&r), Some("imx8mmevk".to_string()));
    }

    #[test]
    fn test_machine_ref_none_when_only_internal() {
        let r = refs(&["ostree/1/1/0"]);
        assert_eq!(select_machine_ref(&r), None);
        assert_eq!(select_machine_ref(&[]), None);
    }

    #[test]
    fn test_empty_base_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("new.wic");
        std::fs::write(&img, b"raw").unwrap();

        let target = ImageReference::wic(&img).unwrap();
        let request = UpgradeRequest::from_scratch(target.clone());
        assert!(request.empty_base());
        assert!(request.base().is_none());

        let request = UpgradeRequest::delta(target.clone(), target);
        assert!(!request.empty_base());
        assert!(request.base().is_some());
    }

    #[test]
    fn test_wic_reference_requires_existing_file() {
        let err = ImageReference::wic(Path::new("/nonexistent_image_12345.wic")).unwrap_err();
        let cat = err
            .chain()
            .find_map(|c| c.downcast_ref::<UpgradeError>())
            .unwrap();
        assert_eq!(cat.exit_code(), 2);
    }

    #[test]
    fn test_ostree_upgrade_args_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wic");
        let b = dir.path().join("b.wic");
        std::fs::write(&a, b"raw").unwrap();
        std::fs::write(&b, b"raw").unwrap();
        let out = dir.path().join("delta.bin");

        let (req, output) =
            resolve_ostree_upgrade_args(false, &[a.clone(), b.clone(), out.clone()]).unwrap();
        assert!(!req.empty_base());
        assert_eq!(output, out);

        let (req, _) = resolve_ostree_upgrade_args(true, &[b.clone(), out.clone()]).unwrap();
        assert!(req.empty_base());

        // --empty plus an explicit base is rejected.
        assert!(resolve_ostree_upgrade_args(true, &[a.clone(), b.clone(), out.clone()]).is_err());
        // Neither a base nor --empty.
        assert!(resolve_ostree_upgrade_args(false, &[b, out]).is_err());
    }

    #[test]
    fn test_empty_mode_never_touches_base_path() {
        // The from-scratch shape takes no base argument at all, so a
        // missing "base" file on disk cannot affect resolution.
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("new.wic");
        std::fs::write(&img, b"raw").unwrap();
        let out = dir.path().join("delta.bin");
        let (req, _) = resolve_ostree_upgrade_args(true, &[img, out]).unwrap();
        assert!(req.base().is_none());
    }

    #[test]
    fn test_repo_delta_flag_exclusions() {
        assert!(validate_repo_delta_flags(false, Some("abc"), None).is_ok());
        assert!(validate_repo_delta_flags(true, None, None).is_ok());
        assert!(validate_repo_delta_flags(true, Some("abc"), None).is_err());
        assert!(validate_repo_delta_flags(true, None, Some(Path::new("/r"))).is_err());
    }
}
