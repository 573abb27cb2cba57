//! External tool execution
//!
//! Every external program the orchestrator touches (cargo, packaging tools,
//! account tools, service managers) is invoked through a [`CommandRunner`].
//! Production code uses [`SystemRunner`]; tests substitute a scripted fake.
//!
//! # Architecture Rule
//!
//! Stage code never calls `std::process::Command` directly. It describes the
//! call as an [`Invocation`] (usually produced by a typed [`ToolArgs`]
//! struct) and hands it to the runner. That keeps process-group isolation
//! and PID registration in one place and makes every stage testable.

use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// A fully described external command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// The command line as a single string, for logs and fakes
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Trait for typed tool arguments.
///
/// Implementors define the mapping between Rust struct fields and the tool's
/// flags, so a flag mismatch is a compile error rather than a runtime one.
pub trait ToolArgs {
    /// Program to execute (looked up on `PATH`)
    fn program(&self) -> &'static str;

    /// CLI arguments exactly as the tool expects them
    fn to_cli_args(&self) -> Vec<String>;

    /// Extra environment variables the tool requires
    fn get_env_vars(&self) -> Vec<(String, String)> {
        vec![]
    }

    /// Build the invocation
    fn invocation(&self) -> Invocation {
        let mut invocation = Invocation::new(self.program()).args(self.to_cli_args());
        invocation.env = self.get_env_vars();
        invocation
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolOutput {
    /// Standard output from the tool.
    pub stdout: String,
    /// Standard error from the tool.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the tool exited successfully (exit code 0).
    pub success: bool,
}

impl ToolOutput {
    /// A successful result with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    /// A failed result with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
            success: false,
        }
    }

    /// Human-readable diagnostic: stderr if present, else stdout, else the code
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exit code {}", self.exit_code.unwrap_or(-1))
    }

    /// Check if the tool succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            anyhow::bail!(
                "{} failed (exit code {}): {}",
                context,
                self.exit_code.unwrap_or(-1),
                self.diagnostic()
            )
        }
    }
}

/// Executes invocations. A nonzero exit is reported in [`ToolOutput`], not
/// as an `Err`; `Err` means the program could not be run at all.
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput>;

    /// Run and turn a nonzero exit into an error carrying the diagnostic
    fn run_checked(&self, invocation: &Invocation) -> Result<ToolOutput> {
        let output = self.run(invocation)?;
        output.ensure_success(&invocation.program)?;
        Ok(output)
    }
}

/// Runs real processes in their own process group, registered for cleanup.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
        info!("exec: {}", invocation);
        if !invocation.env.is_empty() {
            debug!("exec env: {:?}", invocation.env);
        }

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", invocation.program))?;
        let pid = child.id();
        ChildRegistry::with_global(|registry| registry.register(pid));

        let output = child.wait_with_output();
        ChildRegistry::with_global(|registry| registry.unregister(pid));
        let output = output.with_context(|| format!("Failed waiting for {}", invocation.program))?;

        let result = ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
            success: output.status.success(),
        };
        if result.success {
            debug!("{} exited successfully", invocation.program);
        } else {
            info!(
                "{} failed with exit code {}",
                invocation.program,
                result.exit_code.unwrap_or(-1)
            );
        }
        Ok(result)
    }
}
