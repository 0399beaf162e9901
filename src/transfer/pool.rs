use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use super::{DispatchConfig, TransferError};
use crate::store::StoreError;

/// Fixed-size worker pool handing out items in chunks.
///
/// Each chunk is processed start to finish by one worker; a failing item
/// does not stop the rest of its chunk or any other chunk.
pub(crate) struct WorkerPool {
    pool: ThreadPool,
    chunk_size: usize,
}

impl WorkerPool {
    pub(crate) fn new(config: &DispatchConfig) -> Result<Self, TransferError> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|index| format!("transfer-{index}"))
            .build()?;
        Ok(Self {
            pool,
            chunk_size: config.chunk_size,
        })
    }

    /// Run `op` once per item and return the number of items processed, or
    /// the first failure in item order once every item has been attempted.
    pub(crate) fn run<T, F>(&self, items: &[T], op: F) -> Result<usize, StoreError>
    where
        T: Sync,
        F: Fn(&T) -> Result<(), StoreError> + Sync,
    {
        let chunk_size = self.chunk_size;
        let outcomes: Vec<Result<(), StoreError>> = self.pool.install(|| {
            items
                .par_chunks(chunk_size)
                .flat_map_iter(|chunk| chunk.iter().map(&op).collect::<Vec<_>>())
                .collect()
        });

        let failed = outcomes.iter().filter(|outcome| outcome.is_err()).count();
        debug!(items = items.len(), failed, "worker pool drained");

        let processed = outcomes.len();
        outcomes
            .into_iter()
            .collect::<Result<Vec<()>, _>>()
            .map(|_| processed)
    }
}
