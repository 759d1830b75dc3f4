//! Disk-backed storage driver.
//!
//! SQLite holds object metadata (with the per-key generation counter), the
//! revocation and blacklist tables, the append-only file log, and the task
//! queue; payload bytes live on local disk sharded beneath
//! `base_path/{topLevel}/{shard}/{shard}/{path}`. Conditional mutations are
//! guarded SQL updates on the generation column, so losers of a concurrent
//! race observe a precondition failure rather than clobbering the winner.

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use rand::Rng;
use sqlx::{sqlite::Sqlite, FromRow, QueryBuilder, SqlitePool};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

use crate::errors::{HubError, HubResult};
use crate::models::metadata::{FileStatEntry, ObjectStat};
use crate::models::records::{BlacklistType, FileLogRecord};
use crate::services::driver::{
    DeleteArgs, DeleteResult, ListFilesArgs, ListFilesResult, ListFilesStatResult, RenameArgs,
    RenameResult, StorageDriver, WriteArgs, WriteResult,
};
use crate::services::stream_monitor::is_size_limit_error;

use async_trait::async_trait;

const AUTH_TIMESTAMP_WRITE_RETRIES: u32 = 2;

#[derive(Debug, Clone, FromRow)]
struct ObjectRow {
    path: String,
    content_type: Option<String>,
    cache_control: Option<String>,
    size_bytes: i64,
    etag: String,
    last_modified: i64,
    generation: i64,
}

fn quote_etag(etag_hex: &str) -> String {
    format!("\"{etag_hex}\"")
}

/// `If-Match` handling shared by write, delete, and rename. A literal `*`
/// skips the comparison entirely.
fn check_if_match(existing: Option<&ObjectRow>, tag: Option<&str>) -> HubResult<()> {
    let Some(tag) = tag else { return Ok(()) };
    if tag == "*" {
        return Ok(());
    }
    match existing {
        Some(row) if quote_etag(&row.etag) == tag => Ok(()),
        Some(row) => Err(HubError::precondition(
            "etag does not match the current file",
            Some(quote_etag(&row.etag)),
        )),
        None => Err(HubError::precondition("file does not exist", None)),
    }
}

pub struct DiskDriver {
    db: Arc<SqlitePool>,
    base_path: PathBuf,
    read_url_prefix: String,
    page_size: u64,
}

impl DiskDriver {
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        read_url_prefix: impl Into<String>,
        page_size: u64,
    ) -> Self {
        let mut read_url_prefix = read_url_prefix.into();
        if !read_url_prefix.ends_with('/') {
            read_url_prefix.push('/');
        }
        DiskDriver {
            db,
            base_path: base_path.into(),
            read_url_prefix,
            page_size: page_size.max(1),
        }
    }

    /// Two-level shard identifiers for a key, from MD5(topLevel/path).
    fn object_shards(storage_top_level: &str, path: &str) -> (String, String) {
        let digest = md5::compute(format!("{storage_top_level}/{path}"));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, storage_top_level: &str, path: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(storage_top_level, path);
        let mut full = self.base_path.clone();
        full.push(storage_top_level);
        full.push(shard_a);
        full.push(shard_b);
        full.push(path);
        full
    }

    fn top_level_root(&self, storage_top_level: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(storage_top_level);
        path
    }

    async fn fetch_object(
        &self,
        storage_top_level: &str,
        path: &str,
    ) -> HubResult<Option<ObjectRow>> {
        let row = sqlx::query_as::<_, ObjectRow>(
            "SELECT path, content_type, cache_control, size_bytes, etag, last_modified, generation
             FROM objects WHERE storage_top_level = ? AND path = ?",
        )
        .bind(storage_top_level)
        .bind(path)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    /// Stream the body into a temp file next to its final location, computing
    /// MD5 and size incrementally. Returns (temp path, hex etag, size).
    async fn spool_to_temp(
        &self,
        file_path: &Path,
        mut stream: crate::services::driver::ByteStream,
    ) -> HubResult<(PathBuf, String, i64)> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            HubError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = stream.next().await {
            let chunk: Bytes = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(if is_size_limit_error(&err) {
                        HubError::PayloadTooLarge(err.to_string())
                    } else {
                        HubError::Io(err)
                    });
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(HubError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(HubError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(HubError::Io(err));
        }

        Ok((tmp_path, format!("{:x}", digest.compute()), size_bytes))
    }

    async fn move_into_place(&self, tmp_path: &Path, file_path: &Path) -> HubResult<()> {
        if let Err(err) = fs::rename(tmp_path, file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(file_path).await?;
                fs::rename(tmp_path, file_path).await?;
            } else {
                let _ = fs::remove_file(tmp_path).await;
                return Err(HubError::Io(err));
            }
        }
        Ok(())
    }

    /// Shared page query for the two list flavors.
    async fn list_rows(
        &self,
        args: &ListFilesArgs,
    ) -> HubResult<(Vec<ObjectRow>, Option<String>)> {
        let (top_level, sub_prefix) = match args.path_prefix.split_once('/') {
            Some((top, rest)) => (top.to_string(), rest.to_string()),
            None => (args.path_prefix.clone(), String::new()),
        };
        let page_size = args
            .page_size
            .unwrap_or(self.page_size)
            .clamp(1, self.page_size);
        let fetch_limit = page_size + 1;
        let after = args.page.as_deref().map(decode_continuation_token);

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT path, content_type, cache_control, size_bytes, etag, last_modified, generation \
             FROM objects WHERE storage_top_level = ",
        );
        builder.push_bind(top_level);
        if !sub_prefix.is_empty() {
            builder.push(" AND path LIKE ");
            builder.push_bind(format!("{sub_prefix}%"));
        }
        if let Some(after) = after {
            builder.push(" AND path > ");
            builder.push_bind(after);
        }
        builder.push(" ORDER BY path ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut rows: Vec<ObjectRow> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut page = None;
        if rows.len() as u64 == fetch_limit {
            rows.pop();
            if let Some(last) = rows.last() {
                page = Some(encode_continuation_token(&last.path));
            }
        }
        Ok((rows, page))
    }

    async fn try_write_auth_timestamp(
        &self,
        bucket_address: &str,
        timestamp: u64,
    ) -> HubResult<()> {
        let mut tx = self.db.begin().await?;
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT timestamp FROM auth_timestamps WHERE address = ?")
                .bind(bucket_address)
                .fetch_optional(&mut *tx)
                .await?;
        let now = Utc::now().timestamp();
        match existing {
            // max-wins: an equal or newer floor stays untouched
            Some((current,)) if timestamp as i64 <= current => {}
            Some(_) => {
                sqlx::query(
                    "UPDATE auth_timestamps SET timestamp = ?, update_date = ? WHERE address = ?",
                )
                .bind(timestamp as i64)
                .bind(now)
                .bind(bucket_address)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO auth_timestamps (address, timestamp, create_date, update_date)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(bucket_address)
                .bind(timestamp as i64)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn try_enqueue(
        &self,
        backup_paths: &[String],
        file_logs: &[FileLogRecord],
    ) -> HubResult<()> {
        let payload = serde_json::json!({
            "backupPaths": backup_paths,
            "fileLogs": file_logs,
        })
        .to_string();
        let now = Utc::now().timestamp();

        let mut tx = self.db.begin().await?;
        sqlx::query("INSERT INTO task_queue (payload, created_at) VALUES (?, ?)")
            .bind(&payload)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        for log in file_logs {
            sqlx::query(
                "INSERT INTO file_logs (path, asso_iss_address, action, size, size_change, create_dt)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&log.path)
            .bind(&log.asso_iss_address)
            .bind(log.action.as_str())
            .bind(log.size as i64)
            .bind(log.size_change)
            .bind(log.create_dt)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Remove empty shard directories up to (not including) the top level.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StorageDriver for DiskDriver {
    async fn ensure_initialized(&self) -> HubResult<()> {
        let sql = include_str!("../../migrations/0001_init.sql");
        for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    fn read_url_prefix(&self) -> String {
        self.read_url_prefix.clone()
    }

    async fn list_files(&self, args: ListFilesArgs) -> HubResult<ListFilesResult> {
        let (rows, page) = self.list_rows(&args).await?;
        Ok(ListFilesResult {
            entries: rows.into_iter().map(|row| row.path).collect(),
            page,
        })
    }

    async fn list_files_stat(&self, args: ListFilesArgs) -> HubResult<ListFilesStatResult> {
        let (rows, page) = self.list_rows(&args).await?;
        let entries = rows
            .into_iter()
            .map(|row| FileStatEntry {
                name: row.path,
                etag: quote_etag(&row.etag),
                content_type: row.content_type,
                content_length: row.size_bytes as u64,
                last_modified_date: row.last_modified,
                generation: row.generation,
            })
            .collect();
        Ok(ListFilesStatResult { entries, page })
    }

    async fn perform_stat(&self, storage_top_level: &str, path: &str) -> HubResult<ObjectStat> {
        match self.fetch_object(storage_top_level, path).await? {
            Some(row) => Ok(ObjectStat {
                exists: true,
                etag: Some(quote_etag(&row.etag)),
                content_type: row.content_type,
                content_length: Some(row.size_bytes as u64),
                last_modified_date: Some(row.last_modified),
                generation: Some(row.generation),
            }),
            None => Ok(ObjectStat::missing()),
        }
    }

    async fn perform_write(&self, args: WriteArgs) -> HubResult<WriteResult> {
        let existing = self
            .fetch_object(&args.storage_top_level, &args.path)
            .await?;
        check_if_match(existing.as_ref(), args.if_match_tag.as_deref())?;
        if args.if_none_match_tag.as_deref() == Some("*") {
            if let Some(row) = &existing {
                return Err(HubError::precondition(
                    "file already exists",
                    Some(quote_etag(&row.etag)),
                ));
            }
        }
        let generation = existing.as_ref().map(|r| r.generation).unwrap_or(0);
        let previous_size = existing.as_ref().map(|r| r.size_bytes).unwrap_or(0);

        let file_path = self.object_path(&args.storage_top_level, &args.path);
        let (tmp_path, etag_hex, size_bytes) = self.spool_to_temp(&file_path, args.stream).await?;
        let now = Utc::now().timestamp();

        // bind the write to the generation observed at stat time; a zero
        // generation means "create new"
        let affected = if generation == 0 {
            sqlx::query(
                "INSERT INTO objects (storage_top_level, path, content_type, cache_control,
                                      size_bytes, etag, last_modified, generation)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 1)
                 ON CONFLICT(storage_top_level, path) DO NOTHING",
            )
            .bind(&args.storage_top_level)
            .bind(&args.path)
            .bind(&args.content_type)
            .bind(&args.cache_control)
            .bind(size_bytes)
            .bind(&etag_hex)
            .bind(now)
            .execute(&*self.db)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE objects SET content_type = ?, cache_control = ?, size_bytes = ?,
                        etag = ?, last_modified = ?, generation = generation + 1
                 WHERE storage_top_level = ? AND path = ? AND generation = ?",
            )
            .bind(&args.content_type)
            .bind(&args.cache_control)
            .bind(size_bytes)
            .bind(&etag_hex)
            .bind(now)
            .bind(&args.storage_top_level)
            .bind(&args.path)
            .bind(generation)
            .execute(&*self.db)
            .await?
            .rows_affected()
        };
        if affected == 0 {
            let _ = fs::remove_file(&tmp_path).await;
            let current = self
                .fetch_object(&args.storage_top_level, &args.path)
                .await?;
            return Err(HubError::precondition(
                "file was modified by a concurrent request",
                current.map(|row| quote_etag(&row.etag)),
            ));
        }

        self.move_into_place(&tmp_path, &file_path).await?;

        Ok(WriteResult {
            public_url: format!(
                "{}{}/{}",
                self.read_url_prefix, args.storage_top_level, args.path
            ),
            etag: quote_etag(&etag_hex),
            size: size_bytes as u64,
            size_change: size_bytes - previous_size,
            created: generation == 0,
        })
    }

    async fn perform_delete(&self, args: DeleteArgs) -> HubResult<DeleteResult> {
        let existing = self
            .fetch_object(&args.storage_top_level, &args.path)
            .await?
            .ok_or_else(|| HubError::DoesNotExist("file not found".into()))?;
        check_if_match(Some(&existing), args.if_match_tag.as_deref())?;

        let affected = sqlx::query(
            "DELETE FROM objects WHERE storage_top_level = ? AND path = ? AND generation = ?",
        )
        .bind(&args.storage_top_level)
        .bind(&args.path)
        .bind(existing.generation)
        .execute(&*self.db)
        .await?
        .rows_affected();
        if affected == 0 {
            let current = self
                .fetch_object(&args.storage_top_level, &args.path)
                .await?;
            return Err(HubError::precondition(
                "file was modified by a concurrent request",
                current.map(|row| quote_etag(&row.etag)),
            ));
        }

        let file_path = self.object_path(&args.storage_top_level, &args.path);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed payload file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload file {} already missing", file_path.display());
            }
            Err(err) => return Err(HubError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            let root = self.top_level_root(&args.storage_top_level);
            self.prune_empty_dirs(parent, &root).await;
        }

        Ok(DeleteResult {
            size: existing.size_bytes as u64,
        })
    }

    async fn perform_rename(&self, args: RenameArgs) -> HubResult<RenameResult> {
        let existing = self
            .fetch_object(&args.storage_top_level, &args.path)
            .await?
            .ok_or_else(|| HubError::DoesNotExist("file not found".into()))?;
        check_if_match(Some(&existing), args.if_match_tag.as_deref())?;
        let now = Utc::now().timestamp();

        let mut tx = self.db.begin().await?;
        let affected = sqlx::query(
            "DELETE FROM objects WHERE storage_top_level = ? AND path = ? AND generation = ?",
        )
        .bind(&args.storage_top_level)
        .bind(&args.path)
        .bind(existing.generation)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if affected == 0 {
            drop(tx);
            let current = self
                .fetch_object(&args.storage_top_level, &args.path)
                .await?;
            return Err(HubError::precondition(
                "file was modified by a concurrent request",
                current.map(|row| quote_etag(&row.etag)),
            ));
        }
        sqlx::query(
            "INSERT INTO objects (storage_top_level, path, content_type, cache_control,
                                  size_bytes, etag, last_modified, generation)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1)
             ON CONFLICT(storage_top_level, path) DO UPDATE SET
                 content_type = excluded.content_type,
                 cache_control = excluded.cache_control,
                 size_bytes = excluded.size_bytes,
                 etag = excluded.etag,
                 last_modified = excluded.last_modified,
                 generation = objects.generation + 1",
        )
        .bind(&args.storage_top_level)
        .bind(&args.new_path)
        .bind(&existing.content_type)
        .bind(&existing.cache_control)
        .bind(existing.size_bytes)
        .bind(&existing.etag)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let old_path = self.object_path(&args.storage_top_level, &args.path);
        let new_path = self.object_path(&args.storage_top_level, &args.new_path);
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Err(err) = fs::rename(&old_path, &new_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&new_path).await?;
                fs::rename(&old_path, &new_path).await?;
            } else {
                return Err(HubError::Io(err));
            }
        }
        if let Some(parent) = old_path.parent() {
            let root = self.top_level_root(&args.storage_top_level);
            self.prune_empty_dirs(parent, &root).await;
        }

        Ok(RenameResult {
            size: existing.size_bytes as u64,
        })
    }

    async fn read_auth_timestamp(&self, bucket_address: &str) -> HubResult<u64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT timestamp FROM auth_timestamps WHERE address = ?")
                .bind(bucket_address)
                .fetch_optional(&*self.db)
                .await?;
        Ok(row.map(|(t,)| t.max(0) as u64).unwrap_or(0))
    }

    async fn write_auth_timestamp(&self, bucket_address: &str, timestamp: u64) -> HubResult<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.try_write_auth_timestamp(bucket_address, timestamp).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < AUTH_TIMESTAMP_WRITE_RETRIES => {
                    attempt += 1;
                    let backoff = rand::thread_rng().gen_range(100..=350);
                    debug!(
                        bucket_address,
                        attempt,
                        backoff,
                        error = %err,
                        "retrying auth timestamp write"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn read_blacklist_type(&self, address: &str) -> HubResult<BlacklistType> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT type FROM blacklist WHERE address = ?")
            .bind(address)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row.map(|(t,)| BlacklistType(t)).unwrap_or_default())
    }

    async fn add_task_to_queue(&self, backup_paths: &[String], file_logs: &[FileLogRecord]) {
        if backup_paths.is_empty() && file_logs.is_empty() {
            return;
        }
        if let Err(err) = self.try_enqueue(backup_paths, file_logs).await {
            tracing::error!(
                error = %err,
                backup_paths = backup_paths.len(),
                file_logs = file_logs.len(),
                "failed to enqueue backup task"
            );
        }
    }

    async fn health_check(&self) -> HubResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        let probe = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let bytes = fs::read(&probe).await?;
        let _ = fs::remove_file(&probe).await;
        if bytes != b"readyz" {
            return Err(HubError::Server("storage probe content mismatch".into()));
        }
        Ok(())
    }
}

fn encode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

fn decode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}
