use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use multiomics_runner::pipeline::DEFAULT_ROOT_DIR;
use multiomics_runner::reference::DEFAULT_REFERENCE_PREFIX;
use multiomics_runner::store::status_report;
use multiomics_runner::transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_WORKERS};
use multiomics_runner::{
    BatchDispatcher, CellrangerCount, DispatchConfig, DispatchSummary, JobRequirements,
    ObjectStore, ObjectUri, Pipeline, ReferenceCatalog, RemoteArchiveResolver, RunConfig,
    S3Store, SyncRunner, SystemExecutor,
};
use tracing_subscriber::EnvFilter;

const JOB_ID_VAR: &str = "AWS_BATCH_JOB_ID";

#[derive(Parser, Debug)]
#[command(
    name = "multiomics-runner",
    about = "Stage, align and publish single-cell multiome runs"
)]
struct Cli {
    /// Worker threads for bulk storage operations.
    #[arg(long, global = true, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
    /// Items handed to a worker at a time.
    #[arg(long, global = true, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full alignment pipeline for one run.
    Run {
        /// Organism whose reference genome to align against.
        #[arg(long)]
        taxon: String,
        /// Run identifier; names the published output folder.
        #[arg(long)]
        run_id: String,
        /// Library manifest (s3:// URI or local path).
        #[arg(long)]
        libraries_csv: String,
        /// Remote prefix outputs are published under.
        #[arg(long)]
        output_uri: String,
        /// Working root directory.
        #[arg(long, default_value = DEFAULT_ROOT_DIR)]
        root_dir: PathBuf,
        /// Location of packaged reference archives.
        #[arg(long, default_value = DEFAULT_REFERENCE_PREFIX)]
        reference_prefix: String,
        /// Alignment program.
        #[arg(long, default_value = "cellranger-arc")]
        aligner: String,
    },
    /// Copy every object under one prefix to another.
    Copy {
        /// Source prefix (s3://bucket/prefix).
        source: String,
        /// Destination prefix (s3://bucket/prefix).
        destination: String,
        /// Copy even when the destination key already exists.
        #[arg(long)]
        force: bool,
    },
    /// Delete every object under a prefix.
    Remove {
        /// Prefix to delete (s3://bucket/prefix).
        uri: String,
        /// Confirm the deletion.
        #[arg(long)]
        really: bool,
    },
    /// Download every object under a prefix into a local directory.
    Download {
        /// Prefix to download (s3://bucket/prefix).
        uri: String,
        /// Local directory; key paths below the prefix are preserved.
        local_dir: PathBuf,
        /// Download even when the local file already exists.
        #[arg(long)]
        force: bool,
    },
    /// Request restoration of archived objects under a prefix.
    Restore {
        /// Prefix to restore (s3://bucket/prefix).
        uri: String,
    },
    /// List objects under a prefix.
    List {
        /// Prefix to list (s3://bucket/prefix).
        uri: String,
        /// Print object sizes.
        #[arg(long, conflicts_with = "folders")]
        sizes: bool,
        /// List folders directly under the prefix instead of objects.
        #[arg(long)]
        folders: bool,
    },
    /// Show storage class and restore state of objects under a prefix.
    Status {
        /// Prefix to inspect (s3://bucket/prefix).
        uri: String,
    },
    /// Recursively sync between a local path and a remote prefix.
    Sync {
        /// Source path or URI.
        source: String,
        /// Destination path or URI.
        destination: String,
    },
    /// Copy a single file or object.
    Cp {
        /// Source path or URI.
        source: String,
        /// Destination path or URI.
        destination: String,
    },
    /// Print the default compute request for an alignment job.
    Requirements,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let dispatch = DispatchConfig::default()
        .with_workers(cli.workers)
        .with_chunk_size(cli.chunk_size);

    match cli.command {
        Commands::Run {
            taxon,
            run_id,
            libraries_csv,
            output_uri,
            root_dir,
            reference_prefix,
            aligner,
        } => {
            let config = RunConfig::new(taxon, run_id, libraries_csv, output_uri)
                .with_root_dir(root_dir)
                .with_job_id(std::env::var(JOB_ID_VAR).ok());
            run_pipeline(&config, reference_prefix, aligner)?
        }
        Commands::Copy {
            source,
            destination,
            force,
        } => run_copy(dispatch, &source, &destination, force)?,
        Commands::Remove { uri, really } => run_remove(dispatch, &uri, really)?,
        Commands::Download {
            uri,
            local_dir,
            force,
        } => run_download(dispatch, &uri, &local_dir, force)?,
        Commands::Restore { uri } => run_restore(dispatch, &uri)?,
        Commands::List {
            uri,
            sizes,
            folders,
        } => run_list(&uri, sizes, folders)?,
        Commands::Status { uri } => run_status(&uri)?,
        Commands::Sync {
            source,
            destination,
        } => SyncRunner::new(SystemExecutor)
            .sync(&source, &destination)
            .context("sync failed")?,
        Commands::Cp {
            source,
            destination,
        } => SyncRunner::new(SystemExecutor)
            .cp(&source, &destination)
            .context("cp failed")?,
        Commands::Requirements => print_requirements(&JobRequirements::default())?,
    }

    Ok(())
}

fn run_pipeline(config: &RunConfig, reference_prefix: String, aligner: String) -> Result<()> {
    let pipeline = Pipeline::new(
        SyncRunner::new(SystemExecutor),
        RemoteArchiveResolver::new(ReferenceCatalog::default(), reference_prefix),
    );
    let aligner = CellrangerCount::new(aligner, JobRequirements::default());
    let context = pipeline
        .run(config, &aligner)
        .with_context(|| format!("run {} failed", config.run_id))?;
    println!("published {} to {}", context.run_id, context.output_path);
    Ok(())
}

fn connect() -> Result<S3Store> {
    S3Store::from_env().map_err(|err| anyhow!("failed to configure S3 client: {err}"))
}

fn parse_uri(uri: &str) -> Result<ObjectUri> {
    ObjectUri::parse(uri, true).with_context(|| format!("invalid object uri {uri}"))
}

fn keys_under(store: &S3Store, uri: &ObjectUri) -> Result<Vec<String>> {
    store
        .list(&uri.bucket, &uri.key)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to list {uri}"))
}

fn report(operation: &str, summary: DispatchSummary) {
    println!(
        "{operation}: {} submitted, {} skipped",
        summary.submitted, summary.skipped
    );
}

fn run_copy(dispatch: DispatchConfig, source: &str, destination: &str, force: bool) -> Result<()> {
    let source = parse_uri(source)?;
    let destination = parse_uri(destination)?;
    let store = connect()?;

    let src_keys = keys_under(&store, &source)?;
    let dst_keys: Vec<String> = src_keys
        .iter()
        .map(|key| rebase(key, &source.key, &destination.key))
        .collect();

    let summary = BatchDispatcher::with_config(&store, dispatch)
        .copy_files(
            &src_keys,
            &dst_keys,
            &source.bucket,
            &destination.bucket,
            force,
        )
        .with_context(|| format!("failed to copy {source} to {destination}"))?;
    report("copy", summary);
    Ok(())
}

fn run_remove(dispatch: DispatchConfig, uri: &str, really: bool) -> Result<()> {
    let uri = parse_uri(uri)?;
    if uri.key.is_empty() && really {
        bail!("refusing to remove the whole bucket {}", uri.bucket);
    }
    let store = connect()?;
    let keys = keys_under(&store, &uri)?;
    let summary = BatchDispatcher::with_config(&store, dispatch)
        .remove_files(&keys, &uri.bucket, really)
        .with_context(|| format!("failed to remove {uri}"))?;
    report("remove", summary);
    Ok(())
}

fn run_download(dispatch: DispatchConfig, uri: &str, local_dir: &Path, force: bool) -> Result<()> {
    let uri = parse_uri(uri)?;
    let store = connect()?;
    let keys = keys_under(&store, &uri)?;
    let destinations: Vec<PathBuf> = keys
        .iter()
        .map(|key| local_dir.join(rebase(key, &uri.key, "").trim_start_matches('/')))
        .collect();

    let summary = BatchDispatcher::with_config(&store, dispatch)
        .download_files(&keys, &destinations, &uri.bucket, force)
        .with_context(|| format!("failed to download {uri}"))?;
    report("download", summary);
    Ok(())
}

fn run_restore(dispatch: DispatchConfig, uri: &str) -> Result<()> {
    let uri = parse_uri(uri)?;
    let store = connect()?;
    let keys = keys_under(&store, &uri)?;
    let summary = BatchDispatcher::with_config(&store, dispatch)
        .restore_files(&keys, &uri.bucket)
        .with_context(|| format!("failed to restore {uri}"))?;
    report("restore", summary);
    Ok(())
}

fn run_list(uri: &str, sizes: bool, folders: bool) -> Result<()> {
    let uri = parse_uri(uri)?;
    let store = connect()?;
    if folders {
        for folder in store.list_folders(&uri.bucket, &uri.key) {
            println!("{}", folder.with_context(|| format!("failed to list {uri}"))?);
        }
    } else if sizes {
        for entry in store.list_with_size(&uri.bucket, &uri.key) {
            let (key, size) = entry.with_context(|| format!("failed to list {uri}"))?;
            println!("{size}\t{key}");
        }
    } else {
        for key in store.list(&uri.bucket, &uri.key) {
            println!("{}", key.with_context(|| format!("failed to list {uri}"))?);
        }
    }
    Ok(())
}

fn run_status(uri: &str) -> Result<()> {
    let uri = parse_uri(uri)?;
    let store = connect()?;
    let keys = keys_under(&store, &uri)?;
    for (key, status) in status_report(&store, &uri.bucket, &keys)? {
        println!(
            "{key}\t{}\t{}",
            status.storage_class.as_deref().unwrap_or("STANDARD"),
            status.restore.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

#[cfg(feature = "serde")]
fn print_requirements(requirements: &JobRequirements) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(requirements)?);
    Ok(())
}

#[cfg(not(feature = "serde"))]
fn print_requirements(requirements: &JobRequirements) -> Result<()> {
    println!("vcpus\t{}", requirements.vcpus);
    println!("memory\t{}", requirements.memory);
    println!("storage\t{}", requirements.storage);
    println!("image\t{}", requirements.image);
    Ok(())
}

/// Move `key` from under `from` to under `to`.
fn rebase(key: &str, from: &str, to: &str) -> String {
    let relative = key.strip_prefix(from).unwrap_or(key);
    format!("{to}{relative}")
}
