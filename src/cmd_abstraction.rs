//! Command execution seam.
//!
//! Every call into iptables, the save/restore tools, systemctl and the
//! distribution persistence helpers goes through [`CommandExecutor`], so the
//! backend and persistence layers can be driven by `MockCommandExecutor` in
//! unit tests.

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[cfg(test)]
use mockall::automock;

/// Captured result of one command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status was zero.
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Turn a failed invocation into an error carrying stderr.
    pub fn into_result(self, program: &str) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            anyhow::bail!("{} failed: {}", program, self.stderr.trim())
        }
    }
}

/// Runs external programs.
///
/// Arguments are `&[String]` rather than `&[&str]` because mockall cannot
/// express the nested lifetime.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Run `cmd` with `args`. An `Err` means the program could not be
    /// started at all; a non-zero exit is reported through `success`.
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Same as [`execute`](Self::execute), feeding `stdin` to the child.
    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput>;
}

/// Longest a single external command may run before it is killed.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Executor backed by `std::process::Command`, killing children that
/// outlive its timeout.
#[derive(Debug, Clone, Copy)]
pub struct RealCommandExecutor {
    timeout: Duration,
}

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn spawn(cmd: &str, args: &[String], with_stdin: bool) -> Result<Child> {
        Command::new(cmd)
            .args(args)
            .stdin(if with_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute {}", cmd))
    }

    /// Collect output while polling for exit; pipes are drained on their
    /// own threads so a chatty child never blocks on a full pipe.
    fn wait(&self, cmd: &str, mut child: Child) -> Result<CommandOutput> {
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("Failed to wait for {}", cmd))?
            {
                break status;
            }
            if start.elapsed() > self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!("{} timed out after {:?}", cmd, self.timeout);
            }
            thread::sleep(POLL_INTERVAL);
        };

        Ok(CommandOutput {
            stdout: collect(stdout),
            stderr: collect(stderr),
            success: status.success(),
            code: status.code(),
        })
    }
}

impl Default for RealCommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let child = Self::spawn(cmd, args, false)?;
        self.wait(cmd, child)
    }

    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin_data: &str) -> Result<CommandOutput> {
        let mut child = Self::spawn(cmd, args, true)?;

        let writer = child.stdin.take().map(|mut stdin| {
            let data = stdin_data.to_string();
            thread::spawn(move || stdin.write_all(data.as_bytes()))
        });

        let output = self.wait(cmd, child)?;
        if let Some(writer) = writer {
            match writer.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) if output.success => {
                    return Err(e).with_context(|| format!("Failed to write stdin of {}", cmd))
                }
                _ => {}
            }
        }
        Ok(output)
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Run a command and return stdout, failing on a non-zero exit.
pub fn run(executor: &dyn CommandExecutor, program: &str, args: &[&str]) -> Result<String> {
    executor
        .execute(program, &args_to_strings(args))?
        .into_result(program)
}

/// True when `program --version` can be started and exits cleanly.
pub fn is_available(executor: &dyn CommandExecutor, program: &str) -> bool {
    executor
        .execute(program, &args_to_strings(&["--version"]))
        .map(|o| o.success)
        .unwrap_or(false)
}
