//! Preflight checks for upgrade-artifact builds.
//!
//! Validates host tools and privileges before any stage runs. Mount-based
//! operations need root for raw loopback access, and every operation shells
//! out to host binaries; checking both up front turns cryptic mid-pipeline
//! failures into a clear report.
//!
//! # Example
//!
//! ```rust
//! use upgrade_builder::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("ostree") {
//!     println!("ostree not installed");
//! }
//!
//! let tools = &[("rsync", "rsync"), ("losetup", "util-linux")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::error::UpgradeError;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools required for wic-image operations.
///
/// Each tuple is (command_name, package_name).
pub const WIC_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("rsync", "rsync"),
];

/// Host tools required for OSTree repository operations.
pub const REPO_TOOLS: &[(&str, &str)] = &[("ostree", "ostree")];

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `tools` - Slice of (command, package) tuples
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Require elevated privileges before any mount is attempted.
///
/// Raw block/loopback mounting needs root; this is checked at the CLI layer
/// so the failure happens before a single device is touched.
pub fn require_root(operation: &str) -> Result<()> {
    if effective_uid() != 0 {
        return Err(UpgradeError::PermissionDenied(format!(
            "{} mounts loopback devices and must run as root (re-run with sudo)",
            operation
        ))
        .into());
    }
    Ok(())
}

/// Effective UID of this process.
pub fn effective_uid() -> u32 {
    // geteuid cannot fail.
    unsafe { libc::geteuid() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        // 'ls' should exist on any Unix system
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_failure() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        assert!(err.to_string().contains("fake-package"));
    }

    #[test]
    fn test_require_root_denied_for_normal_users() {
        if effective_uid() == 0 {
            // CI containers sometimes run as root; nothing to assert there.
            return;
        }
        let err = require_root("create-upgrade").unwrap_err();
        let cat = err
            .chain()
            .find_map(|c| c.downcast_ref::<UpgradeError>())
            .unwrap();
        assert_eq!(cat.exit_code(), 3);
    }
}
