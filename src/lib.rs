//! # Multiome alignment runner
//!
//! Operational glue around an external single-cell alignment tool:
//!
//! 1. **Object store client**: list/copy/remove/download/restore against a
//!    bucket-and-key store, with transparent paging
//! 2. **Batch dispatcher**: bulk operations over a bounded worker pool, with
//!    skip-existing idempotence and first-error reporting
//! 3. **Sync runner**: the storage CLI's `sync`/`cp` with bounded retry
//! 4. **Pipeline**: provision → fetch reference → stage inputs → execute →
//!    publish, fail-fast
//!
//! ## Usage Example
//!
//! ```no_run
//! use multiomics_runner::{
//!     CellrangerCount, JobRequirements, Pipeline, RemoteArchiveResolver, RunConfig,
//!     SyncRunner, SystemExecutor,
//! };
//!
//! let pipeline = Pipeline::new(
//!     SyncRunner::new(SystemExecutor),
//!     RemoteArchiveResolver::default(),
//! );
//! let config = RunConfig::new("homo", "run-1", "s3://lab/libraries.csv", "s3://lab/out");
//! let aligner = CellrangerCount::new("cellranger-arc", JobRequirements::default());
//! let context = pipeline.run(&config, &aligner)?;
//! println!("published to {}", context.output_path);
//! # Ok::<(), multiomics_runner::PipelineError>(())
//! ```

#![warn(missing_docs, missing_debug_implementations)]

pub mod command; // External commands and the sync runner
pub mod pipeline; // Five-stage run orchestration
pub mod reference; // Reference genome lookup
pub mod store; // Object store client
pub mod transfer; // Bulk transfer dispatch

pub use command::{
    run_command, CommandError, CommandExecutor, CommandOutput, ExternalCommand, SyncRunner,
    SystemExecutor, TransferVerb, SYNC_RETRIES,
};
pub use pipeline::{
    AlignmentCommand, CellrangerCount, JobRequirements, Pipeline, PipelineError, RunConfig,
    RunContext, Stage, Workspace,
};
pub use reference::{ReferenceCatalog, ReferenceError, ReferenceResolver, RemoteArchiveResolver};
pub use store::{
    MemoryStore, ObjectStatus, ObjectStore, ObjectUri, S3Store, StoreError, StoreOperation,
};
pub use transfer::{
    BatchDispatcher, DispatchConfig, DispatchSummary, TransferBatch, TransferError, TransferItem,
};
