//! S3 backend over `aws-sdk-s3`.
//!
//! The SDK is async; the store owns a multi-threaded tokio runtime and
//! blocks on it, so worker threads can call it like any other blocking
//! client. Objects above [`MULTIPART_COPY_THRESHOLD`] are copied part by
//! part since a single server-side copy is capped at 5 GiB. Downloads land
//! in a sibling `.part` file that is renamed into place once complete, so
//! an interrupted transfer never leaves a truncated file at the destination.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, RestoreRequest};
use aws_sdk_s3::Client;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::io::AsyncRead;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use super::{
    BoxError, ListPage, ListRequest, ObjectEntry, ObjectStatus, ObjectStore, StoreError,
    StoreOperation,
};

/// Largest object copied with a single `CopyObject` call.
pub const MULTIPART_COPY_THRESHOLD: u64 = 5 * 1024 * 1024 * 1024;

/// Part size for multipart copies.
pub const MULTIPART_COPY_PART_SIZE: u64 = 512 * 1024 * 1024;

/// Key bytes left unescaped in `x-amz-copy-source`.
const COPY_SOURCE_KEY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// `<bucket>/<url-encoded key>`, as `CopyObject` and `UploadPartCopy` expect.
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", utf8_percent_encode(key, COPY_SOURCE_KEY))
}

/// Temporary sibling of `dest` used while a download is in flight.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Stream `body` to `dest`. Nothing appears at `dest` unless the whole body
/// was written; the partial file is removed on failure.
async fn write_complete<R: AsyncRead + Unpin>(body: &mut R, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(dest);
    let written = async {
        let mut file = tokio::fs::File::create(&partial).await?;
        tokio::io::copy(body, &mut file).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, dest).await
    }
    .await;

    if written.is_err() {
        if let Err(err) = tokio::fs::remove_file(&partial).await {
            debug!(path = %partial.display(), error = %err, "failed to remove partial download");
        }
    }
    written
}

/// Blocking S3 client.
pub struct S3Store {
    client: Client,
    runtime: Runtime,
}

impl fmt::Debug for S3Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Store").finish_non_exhaustive()
    }
}

impl S3Store {
    /// Build a client from the default AWS configuration chain (environment,
    /// profile, instance metadata).
    pub fn from_env() -> Result<Self, BoxError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("s3-store")
            .build()?;
        let config = runtime.block_on(aws_config::load_defaults(
            aws_config::BehaviorVersion::latest(),
        ));
        Ok(Self {
            client: Client::new(&config),
            runtime,
        })
    }

    /// Wrap an existing client.
    pub fn with_client(client: Client) -> Result<Self, BoxError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("s3-store")
            .build()?;
        Ok(Self { client, runtime })
    }

    fn error(
        operation: StoreOperation,
        bucket: &str,
        key: &str,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> StoreError {
        debug!(%operation, bucket, key, error = %DisplayErrorContext(&err), "s3 call failed");
        StoreError::new(operation, bucket, key, err)
    }

    async fn object_size(&self, bucket: &str, key: &str) -> Result<u64, StoreError> {
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| Self::error(StoreOperation::Copy, bucket, key, err))?;
        Ok(head.content_length().unwrap_or_default().max(0) as u64)
    }

    async fn multipart_copy(
        &self,
        copy_source: &str,
        size: u64,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), StoreError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(dst_bucket)
            .key(dst_key)
            .send()
            .await
            .map_err(|err| Self::error(StoreOperation::Copy, dst_bucket, dst_key, err))?;
        let upload_id = create.upload_id().unwrap_or_default().to_string();

        match self
            .copy_parts(copy_source, size, dst_bucket, dst_key, &upload_id)
            .await
        {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(dst_bucket)
                    .key(dst_key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|err| Self::error(StoreOperation::Copy, dst_bucket, dst_key, err))?;
                Ok(())
            }
            Err(err) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(dst_bucket)
                    .key(dst_key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        bucket = dst_bucket,
                        key = dst_key,
                        error = %DisplayErrorContext(&abort),
                        "failed to abort multipart copy"
                    );
                }
                Err(err)
            }
        }
    }

    async fn copy_parts(
        &self,
        copy_source: &str,
        size: u64,
        dst_bucket: &str,
        dst_key: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, StoreError> {
        let mut parts = Vec::new();
        let mut start = 0u64;
        let mut part_number = 1i32;
        while start < size {
            let end = (start + MULTIPART_COPY_PART_SIZE).min(size) - 1;
            let response = self
                .client
                .upload_part_copy()
                .bucket(dst_bucket)
                .key(dst_key)
                .upload_id(upload_id)
                .part_number(part_number)
                .copy_source(copy_source)
                .copy_source_range(format!("bytes={start}-{end}"))
                .send()
                .await
                .map_err(|err| Self::error(StoreOperation::Copy, dst_bucket, dst_key, err))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(
                        response
                            .copy_part_result()
                            .and_then(|result| result.e_tag())
                            .map(str::to_string),
                    )
                    .build(),
            );
            start = end + 1;
            part_number += 1;
        }
        Ok(parts)
    }
}

impl ObjectStore for S3Store {
    fn list_page(
        &self,
        request: &ListRequest,
        continuation: Option<&str>,
    ) -> Result<ListPage, StoreError> {
        let response = self
            .runtime
            .block_on(
                self.client
                    .list_objects_v2()
                    .bucket(&request.bucket)
                    .prefix(&request.prefix)
                    .set_delimiter(request.delimiter.clone())
                    .set_continuation_token(continuation.map(str::to_string))
                    .send(),
            )
            .map_err(|err| {
                Self::error(StoreOperation::List, &request.bucket, &request.prefix, err)
            })?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|object| {
                object.key().map(|key| ObjectEntry {
                    key: key.to_string(),
                    size: object.size().unwrap_or_default().max(0) as u64,
                })
            })
            .collect();
        let common_prefixes = response
            .common_prefixes()
            .iter()
            .filter_map(|prefix| prefix.prefix().map(str::to_string))
            .collect();
        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage {
            objects,
            common_prefixes,
            next_token,
        })
    }

    fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), StoreError> {
        let source = copy_source(src_bucket, src_key);
        self.runtime.block_on(async {
            let size = self.object_size(src_bucket, src_key).await?;
            if size > MULTIPART_COPY_THRESHOLD {
                debug!(src_bucket, src_key, size, "multipart copy");
                return self
                    .multipart_copy(&source, size, dst_bucket, dst_key)
                    .await;
            }
            self.client
                .copy_object()
                .copy_source(&source)
                .bucket(dst_bucket)
                .key(dst_key)
                .send()
                .await
                .map_err(|err| Self::error(StoreOperation::Copy, dst_bucket, dst_key, err))?;
            Ok(())
        })
    }

    fn remove(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.runtime
            .block_on(self.client.delete_object().bucket(bucket).key(key).send())
            .map_err(|err| Self::error(StoreOperation::Remove, bucket, key, err))?;
        Ok(())
    }

    fn download(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), StoreError> {
        self.runtime.block_on(async {
            let response = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|err| Self::error(StoreOperation::Download, bucket, key, err))?;

            let mut body = response.body.into_async_read();
            write_complete(&mut body, dest)
                .await
                .map_err(|err| Self::error(StoreOperation::Download, bucket, key, err))
        })
    }

    fn status(&self, bucket: &str, key: &str) -> Result<ObjectStatus, StoreError> {
        let head = self
            .runtime
            .block_on(self.client.head_object().bucket(bucket).key(key).send())
            .map_err(|err| Self::error(StoreOperation::Status, bucket, key, err))?;
        Ok(ObjectStatus {
            storage_class: head.storage_class().map(|class| class.as_str().to_string()),
            restore: head.restore().map(str::to_string),
        })
    }

    fn request_restore(&self, bucket: &str, key: &str, days: i32) -> Result<(), StoreError> {
        self.runtime
            .block_on(
                self.client
                    .restore_object()
                    .bucket(bucket)
                    .key(key)
                    .restore_request(RestoreRequest::builder().days(days).build())
                    .send(),
            )
            .map_err(|err| Self::error(StoreOperation::Restore, bucket, key, err))?;
        Ok(())
    }
}
