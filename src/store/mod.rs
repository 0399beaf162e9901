//! Object store client contract.
//!
//! Stores implement a small set of blocking calls (one listing page, copy,
//! delete, download, status, restore). Paging is handled once, here, by
//! [`Listing`], so every store gets the same lazy iteration behaviour.

mod listing;
pub mod memory;
pub mod s3;

use std::fmt;
use std::path::Path;

use thiserror::Error;

pub use listing::{ListPage, ListRequest, Listing, ObjectEntry};
pub use memory::MemoryStore;
pub use s3::S3Store;

/// Boxed cause carried by [`StoreError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Scheme prefix for object URIs.
pub const S3_SCHEME: &str = "s3://";

/// Storage class whose objects must be restored before they can be read.
pub const COLD_STORAGE_CLASS: &str = "GLACIER";

/// Number of days a restored object stays readable.
pub const RESTORE_DAYS: i32 = 7;

/// Remote operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    /// Listing a prefix.
    List,
    /// Server-side copy.
    Copy,
    /// Object deletion.
    Remove,
    /// Download to local storage.
    Download,
    /// Metadata lookup.
    Status,
    /// Restore request from cold storage.
    Restore,
}

impl StoreOperation {
    /// Short lowercase name used in messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Copy => "copy",
            Self::Remove => "remove",
            Self::Download => "download",
            Self::Status => "status",
            Self::Restore => "restore",
        }
    }
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote call failed.
#[derive(Debug, Error)]
#[error("{operation} failed for s3://{bucket}/{key}: {source}")]
pub struct StoreError {
    /// Operation that failed.
    pub operation: StoreOperation,
    /// Bucket addressed by the call.
    pub bucket: String,
    /// Key (or prefix, for listings) addressed by the call.
    pub key: String,
    /// Underlying cause.
    #[source]
    pub source: BoxError,
}

impl StoreError {
    /// Build an error for `operation` on `bucket`/`key`.
    pub fn new(
        operation: StoreOperation,
        bucket: impl Into<String>,
        key: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            operation,
            bucket: bucket.into(),
            key: key.into(),
            source: source.into(),
        }
    }
}

/// Storage tier and restore state of a single object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStatus {
    /// Storage class reported by the store; `None` means the default tier.
    pub storage_class: Option<String>,
    /// Restore header, present once a restore has been requested.
    pub restore: Option<String>,
}

impl ObjectStatus {
    /// Whether a restore request should be issued for this object.
    pub fn needs_restore(&self) -> bool {
        self.storage_class.as_deref() == Some(COLD_STORAGE_CLASS) && self.restore.is_none()
    }
}

/// Blocking client for a bucket/key object store.
///
/// Implementations must be shareable across worker threads; the batch
/// dispatcher calls them concurrently with independent items.
pub trait ObjectStore: Send + Sync {
    /// Fetch one page of a listing, continuing from `continuation` if given.
    fn list_page(
        &self,
        request: &ListRequest,
        continuation: Option<&str>,
    ) -> Result<ListPage, StoreError>;

    /// Server-side copy of `src_bucket/src_key` to `dst_bucket/dst_key`.
    fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), StoreError>;

    /// Delete a single object.
    fn remove(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    /// Download an object to `dest`, replacing any existing file.
    fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), StoreError>;

    /// Storage class and restore state for an object.
    fn status(&self, bucket: &str, key: &str) -> Result<ObjectStatus, StoreError>;

    /// Issue a restore request for an archived object.
    ///
    /// Callers normally go through [`ObjectStore::restore`], which skips
    /// objects that are not archived or already restoring.
    fn request_restore(&self, bucket: &str, key: &str, days: i32) -> Result<(), StoreError>;

    /// Trigger un-archival if the object is in cold storage and not already
    /// restoring. Returns `true` when a request was issued.
    fn restore(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        if self.status(bucket, key)?.needs_restore() {
            self.request_restore(bucket, key, RESTORE_DAYS)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Lazily list every key under `prefix`.
    fn list<'a>(&'a self, bucket: &str, prefix: &str) -> Listing<'a, Self, String>
    where
        Self: Sized,
    {
        Listing::new(self, ListRequest::new(bucket, prefix), |page| {
            page.objects.into_iter().map(|entry| entry.key).collect()
        })
    }

    /// Lazily list every `(key, size)` pair under `prefix`.
    fn list_with_size<'a>(&'a self, bucket: &str, prefix: &str) -> Listing<'a, Self, (String, u64)>
    where
        Self: Sized,
    {
        Listing::new(self, ListRequest::new(bucket, prefix), |page| {
            page.objects
                .into_iter()
                .map(|entry| (entry.key, entry.size))
                .collect()
        })
    }

    /// Lazily list the "folders" directly under `prefix` using the `/`
    /// delimiter. `prefix` should end with `/`.
    fn list_folders<'a>(&'a self, bucket: &str, prefix: &str) -> Listing<'a, Self, String>
    where
        Self: Sized,
    {
        Listing::new(
            self,
            ListRequest::new(bucket, prefix).with_delimiter("/"),
            |page| page.common_prefixes,
        )
    }
}

/// Errors parsing an object URI.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    /// The URI lacks the `s3://` scheme where one is required.
    #[error("object uri {0:?} must start with s3://")]
    MissingScheme(String),
    /// The URI names no bucket.
    #[error("object uri {0:?} has no bucket")]
    MissingBucket(String),
}

/// A bucket and key (file or folder) parsed from `s3://bucket/key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUri {
    /// Bucket name.
    pub bucket: String,
    /// Key under the bucket; empty when the URI names the bucket only.
    pub key: String,
}

impl ObjectUri {
    /// Parse `s3://bucket/key`. When `require_scheme` is false the scheme is
    /// optional and `bucket/key` is accepted as well.
    pub fn parse(uri: &str, require_scheme: bool) -> Result<Self, UriError> {
        let rest = match uri.strip_prefix(S3_SCHEME) {
            Some(rest) => rest,
            None if require_scheme => return Err(UriError::MissingScheme(uri.to_string())),
            None => uri,
        };
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(UriError::MissingBucket(uri.to_string()));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// Whether `uri` carries the `s3://` scheme.
    pub fn is_remote(uri: &str) -> bool {
        uri.starts_with(S3_SCHEME)
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{S3_SCHEME}{}/{}", self.bucket, self.key)
    }
}

/// Log storage/restore status for each key and return the statuses.
pub fn status_report<S: ObjectStore + ?Sized>(
    store: &S,
    bucket: &str,
    keys: &[String],
) -> Result<Vec<(String, ObjectStatus)>, StoreError> {
    let mut report = Vec::with_capacity(keys.len());
    for key in keys {
        let status = store.status(bucket, key)?;
        tracing::info!(
            key = %key,
            storage_class = status.storage_class.as_deref().unwrap_or("STANDARD"),
            restore = status.restore.as_deref().unwrap_or("-"),
            "object status"
        );
        report.push((key.clone(), status));
    }
    Ok(report)
}

/// Longest common character prefix of `values`.
pub fn common_prefix<S: AsRef<str>>(values: &[S]) -> &str {
    let Some(first) = values.first().map(AsRef::as_ref) else {
        return "";
    };
    let mut end = first.len();
    for value in &values[1..] {
        let value = value.as_ref();
        end = first
            .char_indices()
            .zip(value.chars())
            .take_while(|((_, a), b)| a == b)
            .map(|((idx, a), _)| idx + a.len_utf8())
            .last()
            .unwrap_or(0)
            .min(end);
    }
    &first[..end]
}
