//! Storage-driver contract consumed by the hub core.
//!
//! The driver fronts a generation-versioned object store plus the small
//! key/value tables backing revocation and blacklist policy and the
//! best-effort task queue. Implementations may back these with different
//! services; the hub only relies on the semantics below.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;

use crate::errors::HubResult;
use crate::models::metadata::{FileStatEntry, ObjectStat};
use crate::models::records::{BlacklistType, FileLogRecord};

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Clone, Default)]
pub struct ListFilesArgs {
    /// `<topLevel>/<optional sub-prefix>`; the trailing slash after the top
    /// level keeps sibling namespaces out of the listing.
    pub path_prefix: String,
    /// Opaque continuation token from a previous page, or `None`.
    pub page: Option<String>,
    pub page_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ListFilesResult {
    pub entries: Vec<String>,
    pub page: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListFilesStatResult {
    pub entries: Vec<FileStatEntry>,
    pub page: Option<String>,
}

pub struct WriteArgs {
    pub storage_top_level: String,
    pub path: String,
    pub stream: ByteStream,
    pub content_type: String,
    pub cache_control: Option<String>,
    /// Required current etag (`*` matches any existing object).
    pub if_match_tag: Option<String>,
    /// `*` requires the object to not exist yet.
    pub if_none_match_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WriteResult {
    pub public_url: String,
    /// Quoted lowercase-hex MD5 of the stored body.
    pub etag: String,
    pub size: u64,
    /// New size minus previous size (previous is 0 for a create).
    pub size_change: i64,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct DeleteArgs {
    pub storage_top_level: String,
    pub path: String,
    pub if_match_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeleteResult {
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct RenameArgs {
    pub storage_top_level: String,
    pub path: String,
    pub new_path: String,
    pub if_match_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RenameResult {
    pub size: u64,
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// One-shot initialization; a failure here terminates the process.
    async fn ensure_initialized(&self) -> HubResult<()>;

    /// Base URL prepended to `<topLevel>/<path>` when synthesizing
    /// `publicURL` values. Always ends with `/`.
    fn read_url_prefix(&self) -> String;

    async fn list_files(&self, args: ListFilesArgs) -> HubResult<ListFilesResult>;

    async fn list_files_stat(&self, args: ListFilesArgs) -> HubResult<ListFilesStatResult>;

    async fn perform_stat(&self, storage_top_level: &str, path: &str) -> HubResult<ObjectStat>;

    /// Conditional streaming write. Precondition failures carry the current
    /// etag when the object exists; a generation conflict with a concurrent
    /// writer also surfaces as a precondition failure.
    async fn perform_write(&self, args: WriteArgs) -> HubResult<WriteResult>;

    /// Conditional delete of an existing object.
    async fn perform_delete(&self, args: DeleteArgs) -> HubResult<DeleteResult>;

    /// Conditional move; destination inherits fresh metadata and a bumped
    /// generation.
    async fn perform_rename(&self, args: RenameArgs) -> HubResult<RenameResult>;

    /// Oldest valid token `iat` for a bucket, unix seconds; 0 when unset.
    async fn read_auth_timestamp(&self, bucket_address: &str) -> HubResult<u64>;

    /// Monotonic upsert: smaller timestamps never overwrite larger ones.
    async fn write_auth_timestamp(&self, bucket_address: &str, timestamp: u64) -> HubResult<()>;

    async fn read_blacklist_type(&self, address: &str) -> HubResult<BlacklistType>;

    /// Best-effort enqueue of backup paths and file-log records; never
    /// surfaces an error to the caller.
    async fn add_task_to_queue(&self, backup_paths: &[String], file_logs: &[FileLogRecord]);

    /// Backend connectivity probe for the readiness endpoint.
    async fn health_check(&self) -> HubResult<()>;
}
