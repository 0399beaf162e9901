//! Bulk transfers over an object store.
//!
//! A [`BatchDispatcher`] fans a homogeneous operation (copy, remove,
//! download, restore) out over a bounded worker pool. Copies and downloads
//! first drop items whose destination already exists unless forced; that
//! filter is best effort and can race with other writers.

mod pool;

use std::collections::HashSet;
use std::path::PathBuf;

use thiserror::Error;
use tracing::info;

use crate::store::{common_prefix, ObjectStore, StoreError};
use pool::WorkerPool;

/// Default number of workers in the transfer pool.
pub const DEFAULT_WORKERS: usize = 16;

/// Default number of items handed to a worker at a time.
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// Errors surfaced by batch dispatch.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A destructive operation was requested without confirmation.
    #[error("refusing to {operation} {count} objects without confirmation")]
    MissingConfirmation {
        /// Operation that was refused.
        operation: &'static str,
        /// Number of items in the refused batch.
        count: usize,
    },

    /// Pool parameters are unusable.
    #[error("invalid dispatch configuration: {0}")]
    InvalidConfig(String),

    /// Source and destination lists differ in length.
    #[error("{sources} sources but {destinations} destinations")]
    LengthMismatch {
        /// Number of sources.
        sources: usize,
        /// Number of destinations.
        destinations: usize,
    },

    /// Nothing is left to dispatch: the input was empty or every
    /// destination already exists.
    #[error("nothing to {operation}: {}", describe_skipped(.skipped))]
    EmptyBatch {
        /// Operation that had nothing to do.
        operation: &'static str,
        /// Items removed by the filter.
        skipped: usize,
    },

    /// An item's store operation failed.
    #[error("transfer failed: {0}")]
    Item(#[from] StoreError),

    /// The worker pool could not be started.
    #[error("failed to start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

fn describe_skipped(skipped: &usize) -> String {
    match *skipped {
        0 => "no items given".to_string(),
        _ => format!("all {skipped} destinations already exist"),
    }
}

/// Worker pool parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Items handed to a worker per scheduling step.
    pub chunk_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl DispatchConfig {
    /// Set the number of workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Reject zero-sized pools and chunks.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.workers == 0 {
            return Err(TransferError::InvalidConfig(
                "workers must be > 0".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidConfig(
                "chunk size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A single source → destination transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferItem<D = String> {
    source: String,
    destination: D,
}

impl<D> TransferItem<D> {
    /// Pair a source key with its destination.
    pub fn new(source: impl Into<String>, destination: D) -> Self {
        Self {
            source: source.into(),
            destination,
        }
    }

    /// Source key.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Destination key or path.
    pub fn destination(&self) -> &D {
        &self.destination
    }
}

/// Ordered list of transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferBatch<D = String> {
    items: Vec<TransferItem<D>>,
}

impl<D> TransferBatch<D> {
    /// Zip sources with destinations; the lists must be the same length.
    pub fn zip<S>(sources: &[S], destinations: Vec<D>) -> Result<Self, TransferError>
    where
        S: AsRef<str>,
    {
        if sources.len() != destinations.len() {
            return Err(TransferError::LengthMismatch {
                sources: sources.len(),
                destinations: destinations.len(),
            });
        }
        let items = sources
            .iter()
            .zip(destinations)
            .map(|(source, destination)| TransferItem::new(source.as_ref(), destination))
            .collect();
        Ok(Self { items })
    }

    /// Keep only items whose destination satisfies `keep`; returns how many
    /// were dropped.
    pub fn retain_destinations(&mut self, mut keep: impl FnMut(&D) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(|item| keep(&item.destination));
        before - self.items.len()
    }

    /// Items in order.
    pub fn items(&self) -> &[TransferItem<D>] {
        &self.items
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Items handed to the pool.
    pub submitted: usize,
    /// Items skipped because their destination already existed.
    pub skipped: usize,
}

/// Runs bulk operations against a store over a bounded worker pool.
#[derive(Debug)]
pub struct BatchDispatcher<'a, S: ObjectStore> {
    store: &'a S,
    config: DispatchConfig,
}

impl<'a, S: ObjectStore> BatchDispatcher<'a, S> {
    /// Dispatcher with the default pool (16 workers, chunks of 64).
    pub fn new(store: &'a S) -> Self {
        Self::with_config(store, DispatchConfig::default())
    }

    /// Dispatcher with explicit pool parameters.
    pub fn with_config(store: &'a S, config: DispatchConfig) -> Self {
        Self { store, config }
    }

    /// Pool parameters in use.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Copy `src_keys` in `src_bucket` to `dst_keys` in `dst_bucket`.
    ///
    /// Unless `force` is set, pairs whose destination key already exists are
    /// skipped; existing keys are found by listing the destinations' common
    /// prefix.
    pub fn copy_files<K: AsRef<str>>(
        &self,
        src_keys: &[K],
        dst_keys: &[K],
        src_bucket: &str,
        dst_bucket: &str,
        force: bool,
    ) -> Result<DispatchSummary, TransferError> {
        let destinations = dst_keys.iter().map(|key| key.as_ref().to_string()).collect();
        let mut batch = TransferBatch::zip(src_keys, destinations)?;

        let mut skipped = 0;
        if !force {
            if batch.is_empty() {
                return Err(TransferError::EmptyBatch {
                    operation: "copy",
                    skipped,
                });
            }
            let existing = self.existing_keys(dst_bucket, dst_keys)?;
            skipped = batch.retain_destinations(|dest| !existing.contains(dest));
            if batch.is_empty() {
                return Err(TransferError::EmptyBatch {
                    operation: "copy",
                    skipped,
                });
            }
        }

        info!(count = batch.len(), skipped, src_bucket, dst_bucket, "copying files");
        let submitted = self.pool()?.run(batch.items(), |item| {
            self.store
                .copy(src_bucket, item.source(), dst_bucket, item.destination())
        })?;
        Ok(DispatchSummary { submitted, skipped })
    }

    /// Delete `keys` from `bucket`. Refuses to run unless `really` is set.
    pub fn remove_files<K: AsRef<str> + Sync>(
        &self,
        keys: &[K],
        bucket: &str,
        really: bool,
    ) -> Result<DispatchSummary, TransferError> {
        if !really {
            return Err(TransferError::MissingConfirmation {
                operation: "remove",
                count: keys.len(),
            });
        }

        info!(count = keys.len(), bucket, "removing files");
        let submitted = self
            .pool()?
            .run(keys, |key| self.store.remove(bucket, key.as_ref()))?;
        Ok(DispatchSummary {
            submitted,
            skipped: 0,
        })
    }

    /// Download `keys` from `bucket` to the matching local paths.
    ///
    /// Unless `force` is set, pairs whose local path already exists are
    /// skipped.
    pub fn download_files<K: AsRef<str>>(
        &self,
        keys: &[K],
        destinations: &[PathBuf],
        bucket: &str,
        force: bool,
    ) -> Result<DispatchSummary, TransferError> {
        let mut batch = TransferBatch::zip(keys, destinations.to_vec())?;

        let mut skipped = 0;
        if !force {
            skipped = batch.retain_destinations(|dest| !dest.exists());
            if batch.is_empty() {
                return Err(TransferError::EmptyBatch {
                    operation: "download",
                    skipped,
                });
            }
        }

        info!(count = batch.len(), skipped, bucket, "downloading files");
        let submitted = self.pool()?.run(batch.items(), |item| {
            self.store
                .download(bucket, item.source(), item.destination())
        })?;
        Ok(DispatchSummary { submitted, skipped })
    }

    /// Request restoration of archived `keys` in `bucket`. Objects that are
    /// not archived, or already restoring, are left alone.
    pub fn restore_files<K: AsRef<str> + Sync>(
        &self,
        keys: &[K],
        bucket: &str,
    ) -> Result<DispatchSummary, TransferError> {
        info!(count = keys.len(), bucket, "restoring files");
        let submitted = self.pool()?.run(keys, |key| {
            self.store.restore(bucket, key.as_ref()).map(|_| ())
        })?;
        Ok(DispatchSummary {
            submitted,
            skipped: 0,
        })
    }

    fn pool(&self) -> Result<WorkerPool, TransferError> {
        WorkerPool::new(&self.config)
    }

    fn existing_keys<K: AsRef<str>>(
        &self,
        bucket: &str,
        wanted: &[K],
    ) -> Result<HashSet<String>, StoreError> {
        let prefix = common_prefix(wanted);
        let wanted: HashSet<&str> = wanted.iter().map(AsRef::as_ref).collect();
        let mut existing = HashSet::new();
        for key in self.store.list(bucket, prefix) {
            let key = key?;
            if wanted.contains(key.as_str()) {
                existing.insert(key);
            }
        }
        Ok(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn zip_rejects_mismatched_lengths() {
        let err = TransferBatch::zip(&["a", "b"], vec!["x".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            TransferError::LengthMismatch {
                sources: 2,
                destinations: 1
            }
        ));
    }

    #[test]
    fn zero_workers_is_a_configuration_error() {
        let config = DispatchConfig::default().with_workers(0);
        assert!(matches!(
            config.validate(),
            Err(TransferError::InvalidConfig(_))
        ));
    }

    #[test]
    fn copy_skips_existing_destinations() {
        let store = MemoryStore::new();
        for key in ["in/a", "in/b", "in/c"] {
            store.put("src", key, key.as_bytes());
        }
        store.put("dst", "out/b", "old");

        let dispatcher = BatchDispatcher::new(&store);
        let summary = dispatcher
            .copy_files(
                &keys(&["in/a", "in/b", "in/c"]),
                &keys(&["out/a", "out/b", "out/c"]),
                "src",
                "dst",
                false,
            )
            .expect("copy succeeds");

        assert_eq!(summary, DispatchSummary { submitted: 2, skipped: 1 });
        assert_eq!(store.calls().copies(), 2);
        assert_eq!(store.get("dst", "out/b").as_deref(), Some(&b"old"[..]));
        assert_eq!(store.get("dst", "out/a").as_deref(), Some(&b"in/a"[..]));
    }

    #[test]
    fn forced_copy_overwrites() {
        let store = MemoryStore::new();
        store.put("src", "in/a", "new");
        store.put("dst", "out/a", "old");

        let summary = BatchDispatcher::new(&store)
            .copy_files(&keys(&["in/a"]), &keys(&["out/a"]), "src", "dst", true)
            .expect("copy succeeds");

        assert_eq!(summary.submitted, 1);
        assert_eq!(store.get("dst", "out/a").as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn fully_filtered_copy_is_an_empty_batch() {
        let store = MemoryStore::new();
        store.put("src", "in/a", "x");
        store.put("dst", "out/a", "x");

        let err = BatchDispatcher::new(&store)
            .copy_files(&keys(&["in/a"]), &keys(&["out/a"]), "src", "dst", false)
            .unwrap_err();
        assert!(matches!(err, TransferError::EmptyBatch { skipped: 1, .. }));
        assert_eq!(
            err.to_string(),
            "nothing to copy: all 1 destinations already exist"
        );
        assert_eq!(store.calls().copies(), 0);
    }

    #[test]
    fn empty_input_is_reported_as_such() {
        let store = MemoryStore::new();
        let none: Vec<String> = Vec::new();

        let err = BatchDispatcher::new(&store)
            .copy_files(&none, &none, "src", "dst", false)
            .unwrap_err();
        assert_eq!(err.to_string(), "nothing to copy: no items given");
        assert_eq!(store.calls().list_pages(), 0);
    }

    #[test]
    fn restore_only_requests_cold_objects() {
        use crate::store::{ObjectStatus, COLD_STORAGE_CLASS};

        let store = MemoryStore::new();
        store.put("b", "hot", "x");
        store.put_with_status(
            "b",
            "cold",
            "x",
            ObjectStatus {
                storage_class: Some(COLD_STORAGE_CLASS.to_string()),
                restore: None,
            },
        );

        let summary = BatchDispatcher::new(&store)
            .restore_files(&["hot", "cold"], "b")
            .expect("restore succeeds");
        assert_eq!(summary.submitted, 2);
        assert_eq!(store.calls().statuses(), 2);
        assert_eq!(store.calls().restores(), 1);
    }
}
