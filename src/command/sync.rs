use std::fmt;

use tracing::{info, warn};

use super::{CommandError, CommandExecutor, ExternalCommand};

/// Attempts made for each sync or cp before giving up.
pub const SYNC_RETRIES: u32 = 3;

const DEFAULT_CLI: &str = "aws";

/// Kind of transfer performed by the storage CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferVerb {
    /// Recursive directory sync.
    Sync,
    /// Single-object copy.
    Cp,
}

impl TransferVerb {
    /// CLI subcommand name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Cp => "cp",
        }
    }
}

impl fmt::Display for TransferVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives the storage CLI's `sync` and `cp` with bounded, immediate retry.
#[derive(Debug, Clone)]
pub struct SyncRunner<E> {
    executor: E,
    program: String,
    retries: u32,
}

impl<E: CommandExecutor> SyncRunner<E> {
    /// Runner invoking `aws s3` through `executor`.
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            program: DEFAULT_CLI.to_string(),
            retries: SYNC_RETRIES,
        }
    }

    /// Use a different CLI program.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Use a different retry limit (at least one attempt is always made).
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    /// Executor used for every command.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Recursively sync `source` to `destination`.
    pub fn sync(&self, source: &str, destination: &str) -> Result<(), CommandError> {
        self.run(TransferVerb::Sync, source, destination)
    }

    /// Copy a single object or file from `source` to `destination`.
    pub fn cp(&self, source: &str, destination: &str) -> Result<(), CommandError> {
        self.run(TransferVerb::Cp, source, destination)
    }

    /// The command line used for `verb`.
    pub fn command(&self, verb: TransferVerb, source: &str, destination: &str) -> ExternalCommand {
        let command = ExternalCommand::new(&self.program).args(["s3", verb.as_str()]);
        let command = match verb {
            TransferVerb::Sync => command.arg("--no-progress"),
            TransferVerb::Cp => command,
        };
        command.arg(source).arg(destination)
    }

    fn run(&self, verb: TransferVerb, source: &str, destination: &str) -> Result<(), CommandError> {
        let command = self.command(verb, source, destination);
        for attempt in 1..=self.retries {
            match self.executor.execute(&command) {
                Ok(output) if output.success() => {
                    info!(%verb, source, destination, attempt, "transfer complete");
                    return Ok(());
                }
                Ok(output) => {
                    warn!(%verb, attempt, code = ?output.code, "retrying {verb}");
                }
                Err(err) => {
                    warn!(%verb, attempt, error = %err, "retrying {verb}");
                }
            }
        }
        Err(CommandError::RetriesExhausted {
            verb,
            source_path: source.to_string(),
            destination: destination.to_string(),
            attempts: self.retries,
        })
    }
}
