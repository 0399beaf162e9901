//! External command execution.
//!
//! Commands run through a [`CommandExecutor`] so retry and pipeline logic
//! can be exercised without spawning processes. [`SystemExecutor`] logs
//! every stdout/stderr line of the child as it is read.

mod sync;

use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;

use thiserror::Error;
use tracing::{info, warn};

pub use sync::{SyncRunner, TransferVerb, SYNC_RETRIES};

/// Errors from running external commands.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The process could not be started or its output could not be read.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        /// Command line that failed.
        command: String,
        /// Underlying IO error.
        source: io::Error,
    },

    /// A sync or cp did not succeed within the retry limit.
    #[error("couldn't {verb} {source_path} to {destination} after {attempts} attempts")]
    RetriesExhausted {
        /// Operation that failed.
        verb: TransferVerb,
        /// Source path or URI.
        source_path: String,
        /// Destination path or URI.
        destination: String,
        /// Attempts made.
        attempts: u32,
    },

    /// A command exited unsuccessfully.
    #[error("{message} (`{command}` exited with {status})")]
    Failed {
        /// Caller-supplied description of the failure.
        message: String,
        /// Command line that failed.
        command: String,
        /// Exit status description.
        status: String,
    },
}

/// A program with arguments and an optional working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
}

impl ExternalCommand {
    /// Command running `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    /// Command line interpreted by `sh -c`.
    pub fn shell(line: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(line)
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run in `dir` instead of the current directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments in order.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Working directory, if set.
    pub fn working_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }
}

impl fmt::Display for ExternalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Result of running a command to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal.
    pub code: Option<i32>,
    /// Stdout and stderr lines, interleaved in arrival order.
    pub lines: Vec<String>,
}

impl CommandOutput {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn status(&self) -> String {
        match self.code {
            Some(code) => format!("status {code}"),
            None => "a signal".to_string(),
        }
    }
}

/// Runs external commands to completion.
pub trait CommandExecutor: Send + Sync {
    /// Run `command`, blocking until it exits.
    fn execute(&self, command: &ExternalCommand) -> Result<CommandOutput, CommandError>;
}

impl<E: CommandExecutor + ?Sized> CommandExecutor for &E {
    fn execute(&self, command: &ExternalCommand) -> Result<CommandOutput, CommandError> {
        (**self).execute(command)
    }
}

/// Spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn execute(&self, command: &ExternalCommand) -> Result<CommandOutput, CommandError> {
        let rendered = command.to_string();
        let spawn_error = |source| CommandError::Spawn {
            command: rendered.clone(),
            source,
        };
        info!(command = %rendered, "running command");

        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &command.current_dir {
            process.current_dir(dir);
        }
        let mut child = process.spawn().map_err(spawn_error)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let lines = merge_lines(stdout, stderr);
        let status = child.wait().map_err(spawn_error)?;
        let lines = lines.map_err(spawn_error)?;

        Ok(CommandOutput {
            code: status.code(),
            lines,
        })
    }
}

/// Read both streams to the end, logging and collecting lines in the order
/// they arrive.
fn merge_lines(
    stdout: Option<impl Read + Send>,
    stderr: Option<impl Read + Send>,
) -> io::Result<Vec<String>> {
    let (sender, receiver) = mpsc::channel();
    thread::scope(|scope| {
        if let Some(stream) = stdout {
            let sender = sender.clone();
            scope.spawn(move || forward_lines(stream, &sender));
        }
        if let Some(stream) = stderr {
            let sender = sender.clone();
            scope.spawn(move || forward_lines(stream, &sender));
        }
        drop(sender);

        let mut lines = Vec::new();
        for line in receiver {
            let line = line?;
            info!(target: "command_output", "{line}");
            lines.push(line);
        }
        Ok::<_, io::Error>(lines)
    })
}

fn forward_lines(stream: impl Read, sender: &mpsc::Sender<io::Result<String>>) {
    for line in BufReader::new(stream).lines() {
        let failed = line.is_err();
        if sender.send(line).is_err() || failed {
            break;
        }
    }
}

/// Run `command` once; a non-zero exit fails with `error_message`.
pub fn run_command<E: CommandExecutor + ?Sized>(
    executor: &E,
    command: &ExternalCommand,
    error_message: &str,
) -> Result<CommandOutput, CommandError> {
    let output = executor.execute(command)?;
    if !output.success() {
        warn!(command = %command, status = %output.status(), "command failed");
        return Err(CommandError::Failed {
            message: error_message.to_string(),
            command: command.to_string(),
            status: output.status(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_command_line() {
        let command = ExternalCommand::new("aws")
            .args(["s3", "sync", "--no-progress"])
            .arg("s3://bucket/in")
            .arg("/data/in");
        assert_eq!(
            command.to_string(),
            "aws s3 sync --no-progress s3://bucket/in /data/in"
        );
        assert_eq!(command.program(), "aws");
        assert_eq!(command.arguments().len(), 5);
    }

    #[test]
    fn shell_commands_wrap_sh() {
        let command = ExternalCommand::shell("echo hi").current_dir("/tmp");
        assert_eq!(command.program(), "sh");
        assert_eq!(command.arguments(), ["-c", "echo hi"]);
        assert_eq!(command.working_dir(), Some(Path::new("/tmp")));
    }

    #[cfg(unix)]
    #[test]
    fn system_executor_captures_both_streams() {
        let output = SystemExecutor
            .execute(&ExternalCommand::shell("echo out; echo err 1>&2; exit 3"))
            .expect("sh runs");
        assert_eq!(output.code, Some(3));
        assert!(!output.success());
        assert!(output.lines.contains(&"out".to_string()));
        assert!(output.lines.contains(&"err".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn system_executor_keeps_arrival_order() {
        let output = SystemExecutor
            .execute(&ExternalCommand::shell(
                "echo one; sleep 0.2; echo two 1>&2; sleep 0.2; echo three",
            ))
            .expect("sh runs");
        assert!(output.success());
        assert_eq!(output.lines, ["one", "two", "three"]);
    }

    #[cfg(unix)]
    #[test]
    fn run_command_fails_with_caller_message() {
        let err = run_command(
            &SystemExecutor,
            &ExternalCommand::shell("exit 1"),
            "alignment failed",
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("alignment failed"));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = SystemExecutor
            .execute(&ExternalCommand::new("definitely-not-a-real-program-4821"))
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
