//! Process execution seam for the kernel tool wrappers.
//!
//! `ipset` and `iptables` are driven through this trait so that the adapters
//! can be unit-tested without touching the kernel.

use anyhow::Result;
use std::io::Write;
use std::process::{Command, Stdio};

#[cfg(test)]
use mockall::automock;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub code: Option<i32>,
}

impl ExecOutput {
    /// Stdout and stderr concatenated, for error messages.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Runs external commands.
///
/// Arguments are `&[String]` rather than `&[&str]` so the trait stays
/// mockable (mockall cannot express the nested lifetime).
#[cfg_attr(test, automock)]
pub trait Exec: Send + Sync {
    /// Run a command to completion and capture its output.
    fn run(&self, program: &str, args: &[String]) -> Result<ExecOutput>;

    /// Run a command, feeding `input` to its stdin.
    fn run_with_stdin(&self, program: &str, args: &[String], input: &str) -> Result<ExecOutput>;
}

/// Production executor backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExec;

impl SystemExec {
    pub fn new() -> Self {
        Self
    }
}

impl Exec for SystemExec {
    fn run(&self, program: &str, args: &[String]) -> Result<ExecOutput> {
        let output = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }

    fn run_with_stdin(&self, program: &str, args: &[String], input: &str) -> Result<ExecOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes())?;
        }

        let output = child.wait_with_output()?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

/// Convert a borrowed argument list into the owned form the trait takes.
pub fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
