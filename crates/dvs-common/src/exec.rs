//! Process boundary.
//!
//! All container, namespace and link manipulation shells out through a
//! [`CommandRunner`]. Every call yields an exit code and text output;
//! callers decide which non-zero exits are tolerable races.

use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use crate::error::{DvsError, Result};

/// Exit code and captured text of one finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        CmdOutput {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        CmdOutput {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(err);
        }
        text
    }
}

/// Render a command line for logs and error messages.
pub fn render(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        if arg.contains(char::is_whitespace) {
            line.push('\'');
            line.push_str(arg);
            line.push('\'');
        } else {
            line.push_str(arg);
        }
    }
    line
}

pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output. A non-zero exit is not an error
    /// at this level; only a failure to launch is.
    fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput>;

    /// Start a background process and return its pid.
    fn spawn(&self, program: &str, args: &[&str]) -> Result<u32>;

    /// Terminate a process previously returned by [`CommandRunner::spawn`].
    fn kill(&self, pid: u32) -> Result<()>;

    /// [`CommandRunner::run`], mapping a non-zero exit to [`DvsError::Command`].
    fn check(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let output = self.run(program, args)?;
        if output.success() {
            Ok(output)
        } else {
            Err(DvsError::Command {
                command: render(program, args),
                code: output.code,
                output: output.combined(),
            })
        }
    }
}

/// Runs commands on the host via `std::process::Command`, optionally behind
/// `sudo`.
#[derive(Debug, Default)]
pub struct HostRunner {
    sudo: bool,
    children: Mutex<HashMap<u32, Child>>,
}

impl HostRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    fn command(&self, program: &str, args: &[&str]) -> Command {
        if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program).args(args);
            cmd
        } else {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    }
}

impl CommandRunner for HostRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        tracing::trace!(command = %render(program, args), "exec");
        let output = self.command(program, args).stdin(Stdio::null()).output()?;
        Ok(CmdOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(&self, program: &str, args: &[&str]) -> Result<u32> {
        let child = self
            .command(program, args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let pid = child.id();
        tracing::debug!(pid, command = %render(program, args), "spawned background process");
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, child);
        Ok(pid)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        let child = self
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);
        match child {
            Some(mut child) => {
                // Already exited is fine; reap either way.
                let _ = child.kill();
                let _ = child.wait();
                Ok(())
            }
            None => {
                let pid = pid.to_string();
                let _ = self.run("kill", &["-9", &pid])?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_quotes_whitespace() {
        assert_eq!(
            render("ip", &["netns", "exec", "vs-srv0", "bash", "-c", "ping -c 1 10.0.0.1"]),
            "ip netns exec vs-srv0 bash -c 'ping -c 1 10.0.0.1'"
        );
    }

    #[test]
    fn combined_joins_streams() {
        let out = CmdOutput {
            code: 2,
            stdout: "partial\n".into(),
            stderr: "RTNETLINK answers: File exists\n".into(),
        };
        assert_eq!(out.combined(), "partial\nRTNETLINK answers: File exists");
        assert!(!out.success());
    }

    #[test]
    fn host_runner_captures_exit_code() {
        let runner = HostRunner::new();
        let out = runner.run("sh", &["-c", "echo hi; exit 3"]).unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout.trim(), "hi");
        let err = runner.check("sh", &["-c", "exit 1"]).unwrap_err();
        assert!(matches!(err, DvsError::Command { code: 1, .. }));
    }

    #[test]
    fn host_runner_kills_spawned_child() {
        let runner = HostRunner::new();
        let pid = runner.spawn("sleep", &["30"]).unwrap();
        runner.kill(pid).unwrap();
        assert!(runner.children.lock().unwrap().is_empty());
    }
}
