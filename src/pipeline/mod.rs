//! Alignment run orchestration.
//!
//! A run goes through five stages in order, stopping at the first failure:
//!
//! 1. **Provision**: create the data, results and genome directories.
//! 2. **Fetch reference**: prepare the reference genome for the taxon.
//! 3. **Stage inputs**: sync every library's FASTQs and rewrite the manifest.
//! 4. **Execute**: run the alignment command.
//! 5. **Publish**: sync the output directory to the remote output location.
//!
//! Nothing is cleaned up on failure; directories and partial remote writes
//! are left for inspection.

pub mod manifest;
mod requirements;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::command::{run_command, CommandError, CommandExecutor, ExternalCommand, SyncRunner};
use crate::reference::{ReferenceError, ReferenceResolver};
use crate::store::ObjectUri;

pub use manifest::{process_libraries, staging_dir, ManifestError, ManifestPlan, StagedLibrary};
pub use requirements::JobRequirements;

/// Default working root.
pub const DEFAULT_ROOT_DIR: &str = "/mnt";

const ORIGINAL_MANIFEST: &str = "libraries.original.csv";
const STAGED_MANIFEST: &str = "libraries.csv";

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A working directory already exists.
    #[error("directory {0} already exists")]
    DirectoryExists(PathBuf),

    /// Local filesystem failure.
    #[error("failed to {operation} {path}: {source}")]
    Io {
        /// What was being done.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },

    /// The input manifest is malformed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The reference genome could not be prepared.
    #[error(transparent)]
    Reference(#[from] ReferenceError),

    /// A sync, copy or the alignment command failed.
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Pipeline stage, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Directory setup.
    Provision,
    /// Reference download.
    FetchReference,
    /// Input staging and manifest rewrite.
    StageInputs,
    /// Alignment command.
    Execute,
    /// Result upload.
    Publish,
}

impl Stage {
    /// Stage name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::FetchReference => "fetch_reference",
            Self::StageInputs => "stage_inputs",
            Self::Execute => "execute",
            Self::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Reference genome selector.
    pub taxon: String,
    /// Run identifier; names the output folder.
    pub run_id: String,
    /// Library manifest, remote (`s3://`) or local.
    pub libraries_uri: String,
    /// Remote prefix the run's outputs are published under.
    pub output_uri: String,
    /// Working root.
    pub root_dir: PathBuf,
    /// Batch job identifier; nests the working root when set.
    pub job_id: Option<String>,
}

impl RunConfig {
    /// Run rooted at [`DEFAULT_ROOT_DIR`].
    pub fn new(
        taxon: impl Into<String>,
        run_id: impl Into<String>,
        libraries_uri: impl Into<String>,
        output_uri: impl Into<String>,
    ) -> Self {
        Self {
            taxon: taxon.into(),
            run_id: run_id.into(),
            libraries_uri: libraries_uri.into(),
            output_uri: output_uri.into(),
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            job_id: None,
        }
    }

    /// Use a different working root.
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    /// Nest the working root under a job identifier.
    pub fn with_job_id(mut self, job_id: Option<String>) -> Self {
        self.job_id = job_id;
        self
    }

    /// Root directory this run works in.
    pub fn working_root(&self) -> PathBuf {
        match &self.job_id {
            Some(job_id) => self.root_dir.join(job_id),
            None => self.root_dir.clone(),
        }
    }

    /// Remote location of this run's outputs.
    pub fn output_destination(&self) -> String {
        join_uri(&self.output_uri, &self.run_id)
    }
}

/// Directories created by the provision stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Working root.
    pub root_dir: PathBuf,
    /// Staged inputs.
    pub data_dir: PathBuf,
    /// Alignment results.
    pub result_dir: PathBuf,
    /// Reference genome.
    pub genome_dir: PathBuf,
}

/// Everything later stages need; fixed once the reference is in place.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RunContext {
    /// Run identifier.
    pub run_id: String,
    /// Working root.
    pub root_dir: PathBuf,
    /// Staged inputs.
    pub data_dir: PathBuf,
    /// Alignment results; the alignment command runs here.
    pub result_dir: PathBuf,
    /// Reference genome directory.
    pub genome_dir: PathBuf,
    /// Prepared reference genome.
    pub reference_path: PathBuf,
    /// Local directory published at the end of the run.
    pub local_output_path: PathBuf,
    /// Remote destination of the published outputs.
    pub output_path: String,
}

impl RunContext {
    fn new(config: &RunConfig, workspace: Workspace, reference_path: PathBuf) -> Self {
        let local_output_path = workspace.result_dir.join(&config.run_id).join("outs");
        Self {
            run_id: config.run_id.clone(),
            root_dir: workspace.root_dir,
            data_dir: workspace.data_dir,
            result_dir: workspace.result_dir,
            genome_dir: workspace.genome_dir,
            reference_path,
            local_output_path,
            output_path: config.output_destination(),
        }
    }
}

/// Builds the alignment command for a prepared run.
pub trait AlignmentCommand {
    /// Command to run against `manifest`.
    fn command(&self, context: &RunContext, manifest: &Path) -> ExternalCommand;

    /// Message reported when the command fails.
    fn failure_message(&self, context: &RunContext) -> String;
}

/// `cellranger-arc count`-style invocation.
#[derive(Debug, Clone)]
pub struct CellrangerCount {
    program: String,
    requirements: JobRequirements,
}

impl CellrangerCount {
    /// Invoke `program count` sized to `requirements`.
    pub fn new(program: impl Into<String>, requirements: JobRequirements) -> Self {
        Self {
            program: program.into(),
            requirements,
        }
    }
}

impl AlignmentCommand for CellrangerCount {
    fn command(&self, context: &RunContext, manifest: &Path) -> ExternalCommand {
        ExternalCommand::new(&self.program)
            .arg("count")
            .arg(format!("--id={}", context.run_id))
            .arg(format!("--reference={}", context.reference_path.display()))
            .arg(format!("--libraries={}", manifest.display()))
            .arg(format!("--localcores={}", self.requirements.vcpus))
            .arg(format!("--localmem={}", self.requirements.memory_gb()))
            .current_dir(&context.result_dir)
    }

    fn failure_message(&self, context: &RunContext) -> String {
        format!("{} count failed for run {}", self.program, context.run_id)
    }
}

/// Runs the five stages of an alignment.
#[derive(Debug)]
pub struct Pipeline<E, R> {
    runner: SyncRunner<E>,
    resolver: R,
}

impl<E: CommandExecutor, R: ReferenceResolver> Pipeline<E, R> {
    /// Pipeline moving data with `runner` and fetching references with
    /// `resolver`.
    pub fn new(runner: SyncRunner<E>, resolver: R) -> Self {
        Self { runner, resolver }
    }

    /// Runner used for syncs and commands.
    pub fn runner(&self) -> &SyncRunner<E> {
        &self.runner
    }

    /// Run every stage in order.
    pub fn run<A: AlignmentCommand>(
        &self,
        config: &RunConfig,
        aligner: &A,
    ) -> Result<RunContext, PipelineError> {
        info!(run_id = %config.run_id, taxon = %config.taxon, "starting run");
        let workspace = self.provision(config)?;
        let context = self.fetch_reference(config, workspace)?;
        let manifest = self.stage_inputs(config, &context)?;
        self.execute(aligner, &context, &manifest)?;
        self.publish(&context)?;
        info!(run_id = %config.run_id, output = %context.output_path, "run complete");
        Ok(context)
    }

    /// Create the working directories. Each must not exist yet.
    pub fn provision(&self, config: &RunConfig) -> Result<Workspace, PipelineError> {
        log_stage(Stage::Provision);
        let root_dir = config.working_root();
        let workspace = Workspace {
            data_dir: root_dir.join("data"),
            result_dir: root_dir.join("results"),
            genome_dir: root_dir.join("genome").join("reference"),
            root_dir,
        };
        for dir in [
            &workspace.data_dir,
            &workspace.result_dir,
            &workspace.genome_dir,
        ] {
            create_fresh_dir(dir)?;
        }
        Ok(workspace)
    }

    /// Prepare the reference genome and fix the run context.
    pub fn fetch_reference(
        &self,
        config: &RunConfig,
        workspace: Workspace,
    ) -> Result<RunContext, PipelineError> {
        log_stage(Stage::FetchReference);
        let reference_path = self
            .resolver
            .resolve(&config.taxon, &workspace.genome_dir, &self.runner)?;
        Ok(RunContext::new(config, workspace, reference_path))
    }

    /// Fetch the manifest if remote, stage every library, and return the
    /// path of the rewritten manifest.
    pub fn stage_inputs(
        &self,
        config: &RunConfig,
        context: &RunContext,
    ) -> Result<PathBuf, PipelineError> {
        log_stage(Stage::StageInputs);
        let original = if ObjectUri::is_remote(&config.libraries_uri) {
            let local = context.root_dir.join(ORIGINAL_MANIFEST);
            self.runner
                .cp(&config.libraries_uri, &local.to_string_lossy())?;
            local
        } else {
            PathBuf::from(&config.libraries_uri)
        };

        let rewritten = context.root_dir.join(STAGED_MANIFEST);
        process_libraries(&original, &rewritten, &context.data_dir, &self.runner)?;
        Ok(rewritten)
    }

    /// Run the alignment command; a non-zero exit aborts the run.
    pub fn execute<A: AlignmentCommand>(
        &self,
        aligner: &A,
        context: &RunContext,
        manifest: &Path,
    ) -> Result<(), PipelineError> {
        log_stage(Stage::Execute);
        let command = aligner.command(context, manifest);
        run_command(
            self.runner.executor(),
            &command,
            &aligner.failure_message(context),
        )?;
        Ok(())
    }

    /// Sync the local output directory to the run's remote destination.
    pub fn publish(&self, context: &RunContext) -> Result<(), PipelineError> {
        log_stage(Stage::Publish);
        self.runner.sync(
            &context.local_output_path.to_string_lossy(),
            &context.output_path,
        )?;
        Ok(())
    }
}

fn log_stage(stage: Stage) {
    info!(%stage, "stage started");
}

/// Create `dir` and any missing parents; fail if `dir` itself exists.
fn create_fresh_dir(dir: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent).map_err(|source| PipelineError::Io {
            operation: "create directory",
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::create_dir(dir).map_err(|source| match source.kind() {
        io::ErrorKind::AlreadyExists => PipelineError::DirectoryExists(dir.to_path_buf()),
        _ => PipelineError::Io {
            operation: "create directory",
            path: dir.to_path_buf(),
            source,
        },
    })
}

/// Join a path segment onto a `/`-separated URI.
pub fn join_uri(base: &str, segment: &str) -> String {
    if base.is_empty() || base.ends_with('/') {
        format!("{base}{segment}")
    } else {
        format!("{base}/{segment}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_destination_joins_run_id() {
        let config = RunConfig::new("homo", "run-7", "s3://b/libs.csv", "s3://b/out");
        assert_eq!(config.output_destination(), "s3://b/out/run-7");

        let trailing = RunConfig::new("homo", "run-7", "s3://b/libs.csv", "s3://b/out/");
        assert_eq!(trailing.output_destination(), "s3://b/out/run-7");
    }

    #[test]
    fn job_id_nests_working_root() {
        let config = RunConfig::new("homo", "r", "l", "o")
            .with_root_dir("/scratch")
            .with_job_id(Some("job-1".to_string()));
        assert_eq!(config.working_root(), PathBuf::from("/scratch/job-1"));
        assert_eq!(
            RunConfig::new("homo", "r", "l", "o").working_root(),
            PathBuf::from(DEFAULT_ROOT_DIR)
        );
    }

    #[test]
    fn cellranger_command_runs_in_result_dir() {
        let context = RunContext {
            run_id: "run-7".to_string(),
            root_dir: PathBuf::from("/mnt"),
            data_dir: PathBuf::from("/mnt/data"),
            result_dir: PathBuf::from("/mnt/results"),
            genome_dir: PathBuf::from("/mnt/genome/reference"),
            reference_path: PathBuf::from("/mnt/genome/reference/GRCh38"),
            local_output_path: PathBuf::from("/mnt/results/run-7/outs"),
            output_path: "s3://b/out/run-7".to_string(),
        };
        let aligner = CellrangerCount::new("cellranger-arc", JobRequirements::default());
        let command = aligner.command(&context, Path::new("/mnt/libraries.csv"));

        assert_eq!(
            command.to_string(),
            "cellranger-arc count --id=run-7 --reference=/mnt/genome/reference/GRCh38 \
             --libraries=/mnt/libraries.csv --localcores=64 --localmem=256"
        );
        assert_eq!(command.working_dir(), Some(Path::new("/mnt/results")));
    }
}
