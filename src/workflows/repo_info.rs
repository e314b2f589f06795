//! Read-only repository inspection, printed as JSON for build pipelines.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;

use crate::preflight;
use crate::repo::{LogEntry, OsTreeRepo};

pub struct RepoInfoOpts {
    pub repo: PathBuf,
    pub machine: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RepoReport {
    pub repo: PathBuf,
    pub machine: String,
    pub head: String,
    /// Newest first.
    pub commits: Vec<LogEntry>,
}

pub fn run(opts: &RepoInfoOpts) -> Result<()> {
    preflight::check_required_tools(preflight::REPO_TOOLS)?;

    let repo = OsTreeRepo::open(&opts.repo)?;
    let machine = repo.machine_ref(opts.machine.as_deref())?;
    let head = repo.rev_parse(&machine)?;
    let commits = repo.log(&machine)?;

    let report = RepoReport {
        repo: opts.repo.clone(),
        machine,
        head,
        commits,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("encoding repo report")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_serialization_shape() {
        let report = RepoReport {
            repo: PathBuf::from("/repos/deployed"),
            machine: "imx8mmevk".into(),
            head: "3ad60011".into(),
            commits: vec![LogEntry {
                sha: "3ad60011".into(),
                version: Some("0.2.1".into()),
                date: None,
            }],
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&report).unwrap()).unwrap();
        assert_eq!(json["machine"], "imx8mmevk");
        assert_eq!(json["commits"][0]["version"], "0.2.1");
        assert!(json["commits"][0]["date"].is_null());
    }
}
