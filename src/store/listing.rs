use std::collections::VecDeque;
use std::fmt;

use super::{ObjectStore, StoreError};

/// Parameters of a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    /// Bucket to list.
    pub bucket: String,
    /// Key prefix to enumerate.
    pub prefix: String,
    /// Delimiter grouping keys into common prefixes ("folders").
    pub delimiter: Option<String>,
}

impl ListRequest {
    /// List every key under `prefix`.
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            delimiter: None,
        }
    }

    /// Group keys by `delimiter`.
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }
}

/// A key and its size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
}

/// One page of listing results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Objects on this page.
    pub objects: Vec<ObjectEntry>,
    /// Common prefixes on this page (only with a delimiter).
    pub common_prefixes: Vec<String>,
    /// Token for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

/// Lazy, transparently paged listing.
///
/// Pages are fetched only as the iterator is drained. A listing cannot be
/// resumed mid-stream after an error; start a new one instead.
pub struct Listing<'a, S: ObjectStore + ?Sized, T> {
    store: &'a S,
    request: ListRequest,
    extract: fn(ListPage) -> Vec<T>,
    buffer: VecDeque<T>,
    token: Option<String>,
    exhausted: bool,
}

impl<'a, S: ObjectStore + ?Sized, T> Listing<'a, S, T> {
    /// Build a listing projecting each page through `extract`.
    pub fn new(store: &'a S, request: ListRequest, extract: fn(ListPage) -> Vec<T>) -> Self {
        Self {
            store,
            request,
            extract,
            buffer: VecDeque::new(),
            token: None,
            exhausted: false,
        }
    }

    /// The request being listed.
    pub fn request(&self) -> &ListRequest {
        &self.request
    }
}

impl<S: ObjectStore + ?Sized, T> Iterator for Listing<'_, S, T> {
    type Item = Result<T, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }
            if self.exhausted {
                return None;
            }
            match self.store.list_page(&self.request, self.token.as_deref()) {
                Ok(mut page) => {
                    self.token = page.next_token.take();
                    self.exhausted = self.token.is_none();
                    self.buffer.extend((self.extract)(page));
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl<S: ObjectStore + ?Sized, T> fmt::Debug for Listing<'_, S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listing")
            .field("request", &self.request)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
