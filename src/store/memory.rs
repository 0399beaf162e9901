//! In-process object store.
//!
//! Keeps objects in a sorted map, counts every call, and can be told to fail
//! on specific keys. Used as the test double for the dispatcher and for dry
//! runs of bulk operations.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{
    ListPage, ListRequest, ObjectEntry, ObjectStatus, ObjectStore, StoreError, StoreOperation,
};

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    status: ObjectStatus,
}

/// Per-operation call counters.
#[derive(Debug, Default)]
pub struct CallCounts {
    list_pages: AtomicUsize,
    copies: AtomicUsize,
    removes: AtomicUsize,
    downloads: AtomicUsize,
    statuses: AtomicUsize,
    restores: AtomicUsize,
}

impl CallCounts {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Listing pages fetched.
    pub fn list_pages(&self) -> usize {
        self.list_pages.load(Ordering::SeqCst)
    }

    /// Copy calls.
    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    /// Remove calls.
    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    /// Download calls.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Status lookups.
    pub fn statuses(&self) -> usize {
        self.statuses.load(Ordering::SeqCst)
    }

    /// Restore requests actually issued.
    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }
}

/// Object store held entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    failing: Mutex<HashSet<(String, String)>>,
    page_size: usize,
    calls: CallCounts,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store with the default page size.
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Empty store returning at most `page_size` entries per listing page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(HashSet::new()),
            page_size: page_size.max(1),
            calls: CallCounts::default(),
        }
    }

    /// Insert (or replace) an object in the default storage tier.
    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.put_with_status(bucket, key, data, ObjectStatus::default());
    }

    /// Insert (or replace) an object with an explicit storage status.
    pub fn put_with_status(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Vec<u8>>,
        status: ObjectStatus,
    ) {
        lock(&self.objects).insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.into(),
                status,
            },
        );
    }

    /// Make every operation on `bucket`/`key` fail.
    pub fn fail_on(&self, bucket: &str, key: &str) {
        lock(&self.failing).insert((bucket.to_string(), key.to_string()));
    }

    /// Whether `bucket`/`key` exists.
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        lock(&self.objects).contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// Contents of an object, if present.
    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .map(|object| object.data.clone())
    }

    /// Number of objects in `bucket`.
    pub fn len(&self, bucket: &str) -> usize {
        lock(&self.objects)
            .keys()
            .filter(|(b, _)| b == bucket)
            .count()
    }

    /// Whether `bucket` holds no objects.
    pub fn is_empty(&self, bucket: &str) -> bool {
        self.len(bucket) == 0
    }

    /// Call counters.
    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    fn check(&self, operation: StoreOperation, bucket: &str, key: &str) -> Result<(), StoreError> {
        if lock(&self.failing).contains(&(bucket.to_string(), key.to_string())) {
            return Err(StoreError::new(
                operation,
                bucket,
                key,
                io::Error::other("injected failure"),
            ));
        }
        Ok(())
    }

    fn fetch(
        &self,
        operation: StoreOperation,
        bucket: &str,
        key: &str,
    ) -> Result<StoredObject, StoreError> {
        self.check(operation, bucket, key)?;
        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| {
                StoreError::new(
                    operation,
                    bucket,
                    key,
                    io::Error::new(io::ErrorKind::NotFound, "no such key"),
                )
            })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ObjectStore for MemoryStore {
    fn list_page(
        &self,
        request: &ListRequest,
        continuation: Option<&str>,
    ) -> Result<ListPage, StoreError> {
        CallCounts::bump(&self.calls.list_pages);
        self.check(StoreOperation::List, &request.bucket, &request.prefix)?;

        let objects = lock(&self.objects);
        let mut page = ListPage::default();
        let mut last_seen = None;
        let matching = objects
            .iter()
            .filter(|((bucket, key), _)| {
                bucket == &request.bucket && key.starts_with(request.prefix.as_str())
            })
            .filter(|((_, key), _)| continuation.map_or(true, |token| key.as_str() > token));

        let mut emitted = 0;
        for ((_, key), object) in matching {
            let rest = &key[request.prefix.len()..];
            let folder = request.delimiter.as_deref().and_then(|delimiter| {
                rest.find(delimiter)
                    .map(|at| format!("{}{}", request.prefix, &rest[..at + delimiter.len()]))
            });
            if folder.is_some() && page.common_prefixes.last() == folder.as_ref() {
                continue;
            }
            if emitted == self.page_size {
                page.next_token = last_seen;
                return Ok(page);
            }
            match folder {
                Some(folder) => {
                    // resume after every key under this folder
                    last_seen = Some(format!("{folder}{}", char::MAX));
                    page.common_prefixes.push(folder);
                }
                None => {
                    last_seen = Some(key.clone());
                    page.objects.push(ObjectEntry {
                        key: key.clone(),
                        size: object.data.len() as u64,
                    });
                }
            }
            emitted += 1;
        }
        Ok(page)
    }

    fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), StoreError> {
        CallCounts::bump(&self.calls.copies);
        let object = self.fetch(StoreOperation::Copy, src_bucket, src_key)?;
        self.check(StoreOperation::Copy, dst_bucket, dst_key)?;
        lock(&self.objects).insert((dst_bucket.to_string(), dst_key.to_string()), object);
        Ok(())
    }

    fn remove(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        CallCounts::bump(&self.calls.removes);
        self.check(StoreOperation::Remove, bucket, key)?;
        lock(&self.objects).remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), StoreError> {
        CallCounts::bump(&self.calls.downloads);
        let object = self.fetch(StoreOperation::Download, bucket, key)?;
        let write = || -> io::Result<()> {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(dest, &object.data)
        };
        write().map_err(|err| StoreError::new(StoreOperation::Download, bucket, key, err))
    }

    fn status(&self, bucket: &str, key: &str) -> Result<ObjectStatus, StoreError> {
        CallCounts::bump(&self.calls.statuses);
        Ok(self.fetch(StoreOperation::Status, bucket, key)?.status)
    }

    fn request_restore(&self, bucket: &str, key: &str, days: i32) -> Result<(), StoreError> {
        CallCounts::bump(&self.calls.restores);
        self.check(StoreOperation::Restore, bucket, key)?;
        let mut objects = lock(&self.objects);
        let object = objects
            .get_mut(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| {
                StoreError::new(
                    StoreOperation::Restore,
                    bucket,
                    key,
                    io::Error::new(io::ErrorKind::NotFound, "no such key"),
                )
            })?;
        object.status.restore = Some(format!("ongoing-request=\"true\", days={days}"));
        Ok(())
    }
}
