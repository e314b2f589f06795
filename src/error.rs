//! Failure taxonomy for the upgrade pipeline.
//!
//! Every stage failure is classified into one of these categories so the
//! binary can report a single diagnostic and exit with a stable code per
//! category. Errors are carried through `anyhow` chains; construct one with
//! `Err(UpgradeError::MountFailure(..).into())` or attach it as context, and
//! let the CLI layer downcast the chain to pick the exit code.

use std::fmt;

/// Classified pipeline failure.
///
/// `OwnershipFixFailed` is special: it is reported as a warning after the
/// artifact has been produced and never aborts a run.
#[derive(Debug)]
pub enum UpgradeError {
    /// Bad or missing CLI input, or an unresolvable path/ref/sha.
    InvalidArguments(String),
    /// Mount-requiring operation invoked without elevated privileges.
    PermissionDenied(String),
    /// No free loopback device, or contention with a concurrent run.
    ResourceExhausted(String),
    /// An image could not be attached or mounted.
    MountFailure(String),
    /// The underlying diff/delta tool exited non-zero.
    DeltaGenerationFailed(String),
    /// Archive creation or final install failed, or the destination exists.
    PackagingFailed(String),
    /// Ownership normalization of produced files failed (non-fatal).
    OwnershipFixFailed(String),
}

impl UpgradeError {
    /// Process exit code for this category.
    ///
    /// Codes are part of the CLI contract: scripts driving this tool key off
    /// them. 1 is reserved for unclassified errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            UpgradeError::InvalidArguments(_) => 2,
            UpgradeError::PermissionDenied(_) => 3,
            UpgradeError::ResourceExhausted(_) => 4,
            UpgradeError::MountFailure(_) => 5,
            UpgradeError::DeltaGenerationFailed(_) => 6,
            UpgradeError::PackagingFailed(_) => 7,
            // Never terminal: surfaced as a warning, not an exit status.
            UpgradeError::OwnershipFixFailed(_) => 1,
        }
    }

    fn category(&self) -> &'static str {
        match self {
            UpgradeError::InvalidArguments(_) => "invalid arguments",
            UpgradeError::PermissionDenied(_) => "permission denied",
            UpgradeError::ResourceExhausted(_) => "resource exhausted",
            UpgradeError::MountFailure(_) => "mount failure",
            UpgradeError::DeltaGenerationFailed(_) => "delta generation failed",
            UpgradeError::PackagingFailed(_) => "packaging failed",
            UpgradeError::OwnershipFixFailed(_) => "ownership fix failed",
        }
    }

    fn message(&self) -> &str {
        match self {
            UpgradeError::InvalidArguments(m)
            | UpgradeError::PermissionDenied(m)
            | UpgradeError::ResourceExhausted(m)
            | UpgradeError::MountFailure(m)
            | UpgradeError::DeltaGenerationFailed(m)
            | UpgradeError::PackagingFailed(m)
            | UpgradeError::OwnershipFixFailed(m) => m,
        }
    }
}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category(), self.message())
    }
}

impl std::error::Error for UpgradeError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_exit_codes_are_distinct_and_nonzero() {
        let errors = [
            UpgradeError::InvalidArguments("a".into()),
            UpgradeError::PermissionDenied("b".into()),
            UpgradeError::ResourceExhausted("c".into()),
            UpgradeError::MountFailure("d".into()),
            UpgradeError::DeltaGenerationFailed("e".into()),
            UpgradeError::PackagingFailed("f".into()),
        ];
        let codes: BTreeSet<i32> = errors.iter().map(|e| e.exit_code()).collect();
        assert_eq!(codes.len(), errors.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_display_names_category() {
        let err = UpgradeError::MountFailure("bad superblock".into());
        let s = err.to_string();
        assert!(s.contains("mount failure"));
        assert!(s.contains("bad superblock"));
    }

    #[test]
    fn test_downcast_through_anyhow_chain() {
        let err: anyhow::Error = UpgradeError::ResourceExhausted("no free loop device".into()).into();
        let err = err.context("acquiring loopback devices");
        let found = err
            .chain()
            .find_map(|c| c.downcast_ref::<UpgradeError>())
            .expect("category survives the chain");
        assert_eq!(found.exit_code(), 4);
    }
}
