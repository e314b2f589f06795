//! Thin builder over `std::process::Command` for host tool invocation.
//!
//! Everything hard in this tool is delegated to mature host binaries
//! (`ostree`, `losetup`, `mount`, `rsync`). `Cmd` wraps the spawn/wait
//! plumbing: captured stdout/stderr so callers can parse query output or
//! build a diagnostic, and a uniform failure message carrying the exit
//! status.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Command, Stdio};

/// Result of a captured command run.
#[derive(Debug)]
pub struct CmdResult {
    success: bool,
    code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.success
    }

    /// Exit code, or -1 when the process died to a signal.
    pub fn code(&self) -> i32 {
        self.code.unwrap_or(-1)
    }

    /// Stdout split into trimmed, non-empty lines.
    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// Builder for a single external command invocation.
#[derive(Debug)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    allow_fail: bool,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            allow_fail: false,
            error_msg: None,
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for a in args {
            self.args.push(a.as_ref().to_os_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    /// A non-zero exit becomes a normal `CmdResult` instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Message prepended to the failure report for a non-zero exit.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Run with captured stdout/stderr.
    pub fn run(self) -> Result<CmdResult> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run '{}'", self.program))?;

        let result = CmdResult {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success && !self.allow_fail {
            bail!("{}", self.failure_report(&result));
        }
        Ok(result)
    }

    fn failure_report(&self, result: &CmdResult) -> String {
        let mut msg = match &self.error_msg {
            Some(m) => format!("{}\n", m),
            None => String::new(),
        };
        msg.push_str(&format!(
            "'{}' exited with status {}",
            self.command_line(),
            result.code()
        ));
        let stderr = result.stderr.trim();
        if !stderr.is_empty() {
            msg.push_str(&format!("\nstderr: {}", stderr));
        }
        msg
    }

    fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for a in &self.args {
            line.push(' ');
            line.push_str(&a.to_string_lossy());
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_lines(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_nonzero_exit_is_an_error() {
        let err = Cmd::new("sh")
            .args(["-c", "exit 3"])
            .error_msg("scripted failure")
            .run()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("scripted failure"));
        assert!(msg.contains("status 3"));
    }

    #[test]
    fn test_allow_fail_returns_result() {
        let result = Cmd::new("sh").args(["-c", "exit 3"]).allow_fail().run().unwrap();
        assert!(!result.success());
        assert_eq!(result.code(), 3);
    }
}
