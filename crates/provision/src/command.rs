use std::ffi::{OsStr, OsString};
use std::process::Command;
use std::sync::Arc;

use tracing::trace;

/// Error from a failed command.
#[derive(Debug, Clone, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// A host program invocation: program plus arguments, no shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    program: OsString,
    args: Vec<OsString>,
}

impl HostCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
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

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Human-readable form for logs and errors.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.to_string_lossy());
        parts.extend(self.args.iter().map(|a| a.to_string_lossy()));
        parts.join(" ")
    }
}

/// Capability to run host programs.
///
/// Blocking: implementations wait for the program to exit. Async callers go
/// through [`run_blocking`].
pub trait CommandRunner: Send + Sync {
    /// Run `command`, returning trimmed stdout on success and trimmed stderr
    /// in the error otherwise.
    fn run(&self, command: &HostCommand) -> Result<String, CommandError>;
}

/// Runs commands on the real host via `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &HostCommand) -> Result<String, CommandError> {
        let rendered = command.display();
        trace!(command = %rendered, "exec");

        let output = Command::new(command.program())
            .args(command.get_args())
            .output()
            .map_err(|e| CommandError {
                command: rendered.clone(),
                detail: e.to_string(),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(CommandError {
                command: rendered,
                detail: if stderr.is_empty() {
                    output.status.to_string()
                } else {
                    stderr
                },
            })
        }
    }
}

/// Run a command, logging and discarding any failure.
pub fn run_ignore_errors(runner: &dyn CommandRunner, command: &HostCommand) {
    if let Err(e) = runner.run(command) {
        trace!(command = %e.command, detail = %e.detail, "command failed (ignored)");
    }
}

/// Run `command` on the blocking pool so async callers never stall the runtime.
pub async fn run_blocking(
    runner: &Arc<dyn CommandRunner>,
    command: HostCommand,
) -> Result<String, CommandError> {
    let runner = Arc::clone(runner);
    let rendered = command.display();
    tokio::task::spawn_blocking(move || runner.run(&command))
        .await
        .map_err(|e| CommandError {
            command: rendered,
            detail: format!("task failed: {e}"),
        })?
}
