//! OSTree repository wrapper.
//!
//! All repository operations shell out to the `ostree` binary; this module
//! owns the command shapes and the parsing of their output. Nothing here
//! mounts anything; a repo inside a wic image is reached through a
//! [`crate::mount::MountHandle`] first.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::UpgradeError;
use crate::process::Cmd;
use crate::resolve::{ensure_is_directory, select_machine_ref};

/// One commit from `ostree log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub sha: String,
    pub version: Option<String>,
    pub date: Option<String>,
}

/// Handle on an OSTree repository directory.
#[derive(Debug, Clone)]
pub struct OsTreeRepo {
    path: PathBuf,
}

impl OsTreeRepo {
    /// Open an existing repository, validating the directory shape.
    pub fn open(path: &Path) -> Result<Self> {
        ensure_is_directory(path)?;
        if !path.join("config").is_file() {
            return Err(UpgradeError::InvalidArguments(format!(
                "'{}' is not an OSTree repository (no config file)",
                path.display()
            ))
            .into());
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Initialize a fresh archive-mode repository at `path`.
    ///
    /// Used for the scratch repo that delta generation works in, so commits
    /// can be pulled together from read-only mounted images.
    pub fn init_archive(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("creating repository directory '{}'", path.display()))?;
        let result = Cmd::new("ostree")
            .arg(repo_flag(path))
            .args(["init", "--mode=archive"])
            .allow_fail()
            .run()?;
        if !result.success() {
            return Err(UpgradeError::DeltaGenerationFailed(format!(
                "ostree init failed with status {} for '{}': {}",
                result.code(),
                path.display(),
                result.stderr.trim()
            ))
            .into());
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All refs known to the repository, sorted.
    pub fn refs(&self) -> Result<Vec<String>> {
        let result = Cmd::new("ostree")
            .arg(repo_flag(&self.path))
            .arg("refs")
            .error_msg("listing repository refs failed")
            .run()?;
        let mut refs = result.stdout_lines();
        refs.sort();
        Ok(refs)
    }

    /// The machine ref to operate on: `explicit` if given, otherwise the
    /// selection rule from [`crate::resolve::select_machine_ref`].
    pub fn machine_ref(&self, explicit: Option<&str>) -> Result<String> {
        if let Some(machine) = explicit {
            return Ok(machine.to_string());
        }
        let refs = self.refs()?;
        select_machine_ref(&refs).ok_or_else(|| {
            UpgradeError::InvalidArguments(format!(
                "could not determine the machine ref from '{}' (refs seen: {})",
                self.path.display(),
                if refs.is_empty() {
                    "none".to_string()
                } else {
                    refs.join(", ")
                }
            ))
            .into()
        })
    }

    /// Resolve a rev (ref name, `ref^`, or sha prefix) to a full commit sha.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let result = Cmd::new("ostree")
            .arg(repo_flag(&self.path))
            .args(["rev-parse", rev])
            .allow_fail()
            .run()?;
        let sha = result.stdout_lines().into_iter().next();
        match (result.success(), sha) {
            (true, Some(sha)) => Ok(sha),
            _ => Err(UpgradeError::InvalidArguments(format!(
                "rev '{}' not found in '{}'",
                rev,
                self.path.display()
            ))
            .into()),
        }
    }

    /// Commit history of `rev`, newest first.
    pub fn log(&self, rev: &str) -> Result<Vec<LogEntry>> {
        let result = Cmd::new("ostree")
            .arg(repo_flag(&self.path))
            .args(["log", rev])
            .error_msg("reading repository log failed")
            .run()?;
        Ok(parse_log(&result.stdout))
    }

    /// Pull a commit from another repository into this one.
    pub fn pull_local_from(&self, source: &OsTreeRepo, sha: &str) -> Result<()> {
        println!("  pulling {} from {}", sha, source.path.display());
        let result = Cmd::new("ostree")
            .arg(repo_flag(&self.path))
            .arg("pull-local")
            .arg_path(&source.path)
            .arg(sha)
            .allow_fail()
            .run()?;
        if !result.success() {
            return Err(UpgradeError::DeltaGenerationFailed(format!(
                "ostree pull-local exited with status {}: {}",
                result.code(),
                result.stderr.trim()
            ))
            .into());
        }
        Ok(())
    }

    /// Generate a static delta into `opts.filename`.
    ///
    /// `from_sha == None` is from-scratch mode (`--empty`): the delta
    /// carries the entire target commit.
    pub fn static_delta(&self, opts: &StaticDeltaOpts<'_>) -> Result<()> {
        let mut cmd = Cmd::new("ostree")
            .arg(repo_flag(&self.path))
            .args(["static-delta", "generate"])
            // Keeps the delta payload in a single data part file.
            .args(["--max-chunk-size=2048", "--min-fallback-size=0"])
            .arg(format!("--filename={}", opts.filename.display()))
            .args(["--to", opts.to_sha]);
        if opts.inline {
            cmd = cmd.arg("--inline");
        }
        cmd = match opts.from_sha {
            Some(from) => cmd.args(["--from", from]),
            None => cmd.arg("--empty"),
        };

        let result = cmd.allow_fail().run()?;
        if !result.success() {
            return Err(UpgradeError::DeltaGenerationFailed(format!(
                "ostree static-delta generate exited with status {}: {}",
                result.code(),
                result.stderr.trim()
            ))
            .into());
        }
        Ok(())
    }
}

/// Options for `static-delta generate`.
#[derive(Debug)]
pub struct StaticDeltaOpts<'a> {
    pub to_sha: &'a str,
    pub from_sha: Option<&'a str>,
    pub filename: &'a Path,
    /// Emit a single self-contained delta file instead of superblock+parts.
    pub inline: bool,
}

fn repo_flag(path: &Path) -> String {
    format!("--repo={}", path.display())
}

/// Parse `ostree log` output into entries.
///
/// The format is line-oriented:
///
/// ```text
/// commit 3ad6...
/// ContentChecksum:  8ab3...
/// Date:  2021-05-05 12:00:00 +0000
/// Version: 0.2.1
///
///     build of imx8mmevk
/// ```
///
/// `Date` values contain colons, so they split on the first colon only.
pub fn parse_log(output: &str) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("commit") {
            let sha = rest.trim();
            if !sha.is_empty() {
                entries.push(LogEntry {
                    sha: sha.to_string(),
                    version: None,
                    date: None,
                });
            }
            continue;
        }
        let Some(current) = entries.last_mut() else {
            continue;
        };
        if let Some(rest) = line.strip_prefix("Version:") {
            current.version = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Date:") {
            current.date = Some(rest.trim().to_string());
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
commit 3ad60011ff6b2e58f9c1b0ea65a2bc37a81dea1d78e4f67d24bdb7b2d54dcb28
ContentChecksum:  8ab36a4023b7e24d02fd2e1e2ef5c868ce26b0b502e2e103b636004325e4b0c1
Date:  2021-05-05 12:00:00 +0000
Version: 0.2.1

    development build

commit 52a0b08b2ff1b2e58f9c1b0ea65a2bc37a81dea1d78e4f67d24bdb7b2d54dcb28
Date:  2021-04-28 09:30:00 +0000
Version: 0.2.0

    previous build
";

    #[test]
    fn test_parse_log_entries() {
        let entries = parse_log(LOG);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].sha.starts_with("3ad60011"));
        assert_eq!(entries[0].version.as_deref(), Some("0.2.1"));
        // Date fields contain colons and must survive intact.
        assert_eq!(entries[0].date.as_deref(), Some("2021-05-05 12:00:00 +0000"));
        assert_eq!(entries[1].version.as_deref(), Some("0.2.0"));
    }

    #[test]
    fn test_parse_log_tolerates_missing_fields() {
        let entries = parse_log("commit abc123\n\n    no version line\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, None);
        assert_eq!(entries[0].date, None);
    }

    #[test]
    fn test_parse_log_ignores_leading_noise() {
        let entries = parse_log("Version: stray\ncommit abc123\nVersion: 1.0\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version.as_deref(), Some("1.0"));
    }

    #[test]
    fn test_open_rejects_non_repo_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = OsTreeRepo::open(dir.path()).unwrap_err();
        assert!(err.to_string().contains("not an OSTree repository"));
    }

    #[test]
    fn test_open_accepts_repo_shaped_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config"), "[core]\nmode=archive\n").unwrap();
        let repo = OsTreeRepo::open(dir.path()).unwrap();
        assert_eq!(repo.path(), dir.path());
    }
}
