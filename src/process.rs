//! Thin builder over `std::process::Command`.
//!
//! `run()` captures output and turns a failed exit into an error carrying the
//! command line and stderr. `run_interactive()` hands the child the caller's
//! standard streams and only reports how it exited.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Command, ExitStatus, Output, Stdio};

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    fn from_output(output: Output) -> Self {
        Self {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Command builder with uniform error reporting.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Message used as the outermost error context on failure.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Command line rendered for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Run with captured stdout/stderr.
    pub fn run(self) -> Result<CmdOutput> {
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute {}", self.display()))?;
        let output = CmdOutput::from_output(output);

        if !output.success() {
            let detail = format!(
                "{} failed with {}\n{}",
                self.display(),
                output.status,
                output.stderr.trim()
            );
            match self.error_msg {
                Some(msg) => bail!("{msg}: {detail}"),
                None => bail!(detail),
            }
        }
        Ok(output)
    }

    /// Run attached to the caller's stdin/stdout/stderr and wait for exit.
    ///
    /// Only a failure to start the process is an error; the exit status is
    /// returned as-is for the caller to judge.
    pub fn run_interactive(self) -> Result<ExitStatus> {
        let status = self
            .command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| match &self.error_msg {
                Some(msg) => format!("{msg}: failed to execute {}", self.display()),
                None => format!("Failed to execute {}", self.display()),
            })?;
        Ok(status)
    }
}
