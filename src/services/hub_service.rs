//! The hub policy core.
//!
//! Combines the token verifier, the revocation and blacklist caches, the
//! per-endpoint locks, and the storage driver into the write, delete, list,
//! and revoke operations. The archival policy lives here too: buckets whose
//! tokens carry write-archival scopes never overwrite or delete in place —
//! the current object is first renamed to a `.history.*` sibling.

use chrono::Utc;
use futures::StreamExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::HubConfig;
use crate::errors::{HubError, HubResult};
use crate::models::auth::AuthScopes;
use crate::models::metadata::FileStatEntry;
use crate::models::records::{FileAction, FileLogRecord, PerformType};
use crate::services::auth_timestamp_cache::AuthTimestampCache;
use crate::services::blacklist_cache::BlacklistCache;
use crate::services::driver::{
    ByteStream, DeleteArgs, ListFilesArgs, RenameArgs, StorageDriver, WriteArgs,
};
use crate::services::endpoint_locks::EndpointLocks;
use crate::services::stream_monitor::{monitor_stream, upload_cap};
use crate::services::token_verifier::{
    challenge_text, parse_auth_header, parsed_scopes, verify_token, VerifyOptions,
    LATEST_AUTH_VERSION,
};

const MAX_CONTENT_TYPE_LEN: usize = 1024;
const HISTORICAL_PREFIX: &str = ".history.";

/// Headers relevant to a streaming write.
#[derive(Debug, Clone, Default)]
pub struct WriteMeta {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteResponse {
    #[serde(rename = "publicURL")]
    pub public_url: String,
    pub etag: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesRequest {
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub stat: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ListEntry {
    Name(String),
    Stat(FileStatEntry),
}

/// Entries may contain a single `null` sentinel when the archival filter
/// empties a page that still has a continuation token.
#[derive(Debug, Clone, Serialize)]
pub struct ListFilesResponse {
    pub entries: Vec<Option<ListEntry>>,
    pub page: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubInfo {
    pub challenge_text: String,
    pub latest_auth_version: &'static str,
    pub max_file_upload_size_megabytes: u64,
    pub read_url_prefix: String,
}

/// Backup paths and file-log records accumulated over one request (or one
/// whole batch) and enqueued together.
#[derive(Debug, Default)]
pub(crate) struct TaskAccumulator {
    pub backup_paths: Vec<String>,
    pub file_logs: Vec<FileLogRecord>,
}

/// Successful authentication: the effective signer and the parsed scopes.
pub(crate) struct AuthContext {
    pub asso_iss_address: Option<String>,
    pub scopes: AuthScopes,
}

/// Only path-sanity rule: `..` must not appear anywhere in the path.
pub fn check_path(path: &str) -> HubResult<()> {
    if path.contains("..") {
        return Err(HubError::BadPath(format!(
            "path {path} is invalid, it must not contain \"..\""
        )));
    }
    Ok(())
}

/// Historical sibling for `path`: `<dir>/.history.<unixMillis>.<rand10>.<basename>`.
pub fn historical_name(path: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let rand_part: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    match path.rsplit_once('/') {
        Some((dir, base)) => format!("{dir}/{HISTORICAL_PREFIX}{millis}.{rand_part}.{base}"),
        None => format!("{HISTORICAL_PREFIX}{millis}.{rand_part}.{path}"),
    }
}

/// A name is historical iff its basename starts with `.history.`.
pub fn is_historical(path: &str) -> bool {
    path.rsplit_once('/')
        .map(|(_, base)| base)
        .unwrap_or(path)
        .starts_with(HISTORICAL_PREFIX)
}

#[derive(Clone)]
pub struct HubService {
    pub(crate) config: Arc<HubConfig>,
    pub(crate) driver: Arc<dyn StorageDriver>,
    pub(crate) auth_timestamps: Arc<AuthTimestampCache>,
    pub(crate) blacklist: Arc<BlacklistCache>,
    pub(crate) locks: EndpointLocks,
    challenges: Arc<Vec<String>>,
    valid_hub_urls: Arc<Vec<String>>,
}

impl HubService {
    pub fn new(config: HubConfig, driver: Arc<dyn StorageDriver>) -> Self {
        let challenges = vec![challenge_text(&config.server_name)];
        let mut valid_hub_urls = config.valid_hub_urls.clone();
        valid_hub_urls.push(format!("https://{}", config.server_name));
        let auth_timestamps = Arc::new(AuthTimestampCache::new(config.auth_timestamp_cache_size));
        let blacklist = Arc::new(BlacklistCache::new(config.blacklist_cache_size));
        HubService {
            config: Arc::new(config),
            driver,
            auth_timestamps,
            blacklist,
            locks: EndpointLocks::new(),
            challenges: Arc::new(challenges),
            valid_hub_urls: Arc::new(valid_hub_urls),
        }
    }

    pub fn hub_info(&self) -> HubInfo {
        HubInfo {
            challenge_text: self.challenges[0].clone(),
            latest_auth_version: LATEST_AUTH_VERSION,
            max_file_upload_size_megabytes: self.config.max_file_upload_size,
            read_url_prefix: self.read_url_prefix(),
        }
    }

    pub fn read_url_prefix(&self) -> String {
        self.config
            .read_url
            .clone()
            .unwrap_or_else(|| self.driver.read_url_prefix())
    }

    pub async fn health_check(&self) -> HubResult<()> {
        self.driver.health_check().await
    }

    /// Log and reset the cache eviction counters; called on a fixed cadence.
    pub fn report_cache_evictions(&self) {
        let auth_timestamps = self.auth_timestamps.take_eviction_count();
        let blacklist = self.blacklist.take_eviction_count();
        if auth_timestamps > 0 || blacklist > 0 {
            tracing::info!(auth_timestamps, blacklist, "cache evictions");
        }
    }

    /// Swap the driver's URL prefix for the configured public one.
    pub(crate) fn rewrite_public_url(&self, url: String) -> String {
        let Some(read_url) = &self.config.read_url else {
            return url;
        };
        let driver_prefix = self.driver.read_url_prefix();
        if *read_url != driver_prefix {
            if let Some(rest) = url.strip_prefix(&driver_prefix) {
                return format!("{read_url}{rest}");
            }
        }
        url
    }

    /// Full token check for one request: revocation floor and bucket
    /// blacklist are fetched concurrently, then the token is verified and
    /// the whitelist consulted against the effective signer.
    pub(crate) async fn authenticate(
        &self,
        bucket_address: &str,
        auth_header: Option<&str>,
        perform: Option<PerformType>,
        apply_revocation_floor: bool,
    ) -> HubResult<AuthContext> {
        let token = parse_auth_header(auth_header)?;

        let (floor, blocked) = tokio::join!(
            async {
                if apply_revocation_floor {
                    self.auth_timestamps
                        .get_auth_timestamp(self.driver.as_ref(), bucket_address)
                        .await
                } else {
                    Ok(0)
                }
            },
            async {
                match perform {
                    Some(perform) => {
                        self.blacklist
                            .is_blacklisted(self.driver.as_ref(), bucket_address, perform)
                            .await
                    }
                    None => Ok(false),
                }
            },
        );
        if blocked? {
            return Err(HubError::NotEnoughProof(
                "address is blocked from this operation".into(),
            ));
        }

        let opts = VerifyOptions {
            require_correct_hub_url: self.config.require_correct_hub_url,
            valid_hub_urls: &self.valid_hub_urls,
            oldest_valid_token_timestamp: floor?,
        };
        let asso_iss_address = verify_token(&token, bucket_address, &self.challenges, &opts)?;

        let effective_signer = asso_iss_address.as_deref().unwrap_or(bucket_address);
        if let Some(whitelist) = &self.config.whitelist {
            if !whitelist.iter().any(|a| a == effective_signer) {
                return Err(HubError::validation("address not authorized for writes"));
            }
        }
        if self.config.check_association_issuer_blacklist {
            if let (Some(asso), Some(perform)) = (&asso_iss_address, perform) {
                if self
                    .blacklist
                    .is_blacklisted(self.driver.as_ref(), asso, perform)
                    .await?
                {
                    return Err(HubError::NotEnoughProof(
                        "association issuer is blocked from this operation".into(),
                    ));
                }
            }
        }

        let scopes = parsed_scopes(&token);
        Ok(AuthContext {
            asso_iss_address,
            scopes,
        })
    }

    /// Rename the current object to a fresh historical name and record the
    /// matching file logs. Callers decide whether a missing object is an
    /// error (delete) or the first write (store).
    pub(crate) async fn rename_to_history(
        &self,
        bucket_address: &str,
        path: &str,
        if_match_tag: Option<String>,
        asso_iss_address: &Option<String>,
        tasks: &mut TaskAccumulator,
    ) -> HubResult<()> {
        let history_path = historical_name(path);
        let renamed = self
            .driver
            .perform_rename(RenameArgs {
                storage_top_level: bucket_address.to_string(),
                path: path.to_string(),
                new_path: history_path.clone(),
                if_match_tag,
            })
            .await?;
        let now = Utc::now().timestamp();
        tasks.file_logs.push(FileLogRecord {
            path: format!("{bucket_address}/{path}"),
            asso_iss_address: asso_iss_address.clone(),
            action: FileAction::Delete,
            size: renamed.size,
            size_change: -(renamed.size as i64),
            create_dt: now,
        });
        tasks.file_logs.push(FileLogRecord {
            path: format!("{bucket_address}/{history_path}"),
            asso_iss_address: asso_iss_address.clone(),
            action: FileAction::Create,
            size: renamed.size,
            size_change: renamed.size as i64,
            create_dt: now,
        });
        tasks.backup_paths.push(format!("{bucket_address}/{history_path}"));
        Ok(())
    }

    /// Streaming write with scope, precondition, and size enforcement.
    pub async fn handle_request(
        &self,
        bucket_address: &str,
        path: &str,
        auth_header: Option<&str>,
        meta: WriteMeta,
        body: ByteStream,
    ) -> HubResult<WriteResponse> {
        check_path(path)?;
        let _guard = self.locks.try_acquire(bucket_address, path)?;
        let ctx = self
            .authenticate(bucket_address, auth_header, Some(PerformType::Put), true)
            .await?;
        ctx.scopes.check_archival_write(path)?;
        ctx.scopes.check_write(path)?;

        if meta.if_match.is_some() && meta.if_none_match.is_some() {
            return Err(HubError::precondition(
                "request should not contain both if-match and if-none-match headers",
                None,
            ));
        }
        if let Some(tag) = meta.if_none_match.as_deref() {
            if tag != "*" {
                return Err(HubError::precondition(
                    "only `if-none-match: *` is supported",
                    None,
                ));
            }
        }

        let content_type = match meta.content_type {
            Some(ct) if !ct.is_empty() => {
                if ct.len() > MAX_CONTENT_TYPE_LEN {
                    return Err(HubError::validation("content-type header is too long"));
                }
                ct
            }
            _ => "application/octet-stream".to_string(),
        };

        let max_size = self.config.max_file_upload_size_bytes();
        if let Some(length) = meta.content_length {
            if length > max_size {
                return Err(HubError::PayloadTooLarge(format!(
                    "file size {length} exceeds the maximum of {max_size} bytes"
                )));
            }
        }

        let mut tasks = TaskAccumulator::default();
        if ctx.scopes.is_archival_restricted() {
            // a missing current object just means this is the first write
            match self
                .rename_to_history(bucket_address, path, None, &ctx.asso_iss_address, &mut tasks)
                .await
            {
                Ok(()) | Err(HubError::DoesNotExist(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let cap = upload_cap(meta.content_length, max_size);
        let stream = monitor_stream(body, cap).boxed();
        let result = self
            .driver
            .perform_write(WriteArgs {
                storage_top_level: bucket_address.to_string(),
                path: path.to_string(),
                stream,
                content_type,
                cache_control: self.config.cache_control.clone(),
                if_match_tag: meta.if_match,
                if_none_match_tag: meta.if_none_match,
            })
            .await?;

        let public_url = self.rewrite_public_url(result.public_url.clone());
        tasks.file_logs.push(FileLogRecord {
            path: format!("{bucket_address}/{path}"),
            asso_iss_address: ctx.asso_iss_address.clone(),
            action: if result.created {
                FileAction::Create
            } else {
                FileAction::Update
            },
            size: result.size,
            size_change: result.size_change,
            create_dt: Utc::now().timestamp(),
        });
        tasks.backup_paths.push(format!("{bucket_address}/{path}"));
        self.driver
            .add_task_to_queue(&tasks.backup_paths, &tasks.file_logs)
            .await;

        Ok(WriteResponse {
            public_url,
            etag: result.etag,
        })
    }

    pub async fn handle_delete(
        &self,
        bucket_address: &str,
        path: &str,
        auth_header: Option<&str>,
        if_match: Option<String>,
        if_none_match: Option<String>,
    ) -> HubResult<()> {
        check_path(path)?;
        let _guard = self.locks.try_acquire(bucket_address, path)?;
        let ctx = self
            .authenticate(bucket_address, auth_header, Some(PerformType::Delete), true)
            .await?;
        if if_none_match.is_some() {
            return Err(HubError::precondition(
                "if-none-match is not supported on delete",
                None,
            ));
        }
        ctx.scopes.check_archival_write(path)?;
        ctx.scopes.check_delete(path)?;

        let mut tasks = TaskAccumulator::default();
        if ctx.scopes.is_archival_restricted() {
            self.rename_to_history(
                bucket_address,
                path,
                if_match,
                &ctx.asso_iss_address,
                &mut tasks,
            )
            .await?;
        } else {
            let deleted = self
                .driver
                .perform_delete(DeleteArgs {
                    storage_top_level: bucket_address.to_string(),
                    path: path.to_string(),
                    if_match_tag: if_match,
                })
                .await?;
            tasks.file_logs.push(FileLogRecord {
                path: format!("{bucket_address}/{path}"),
                asso_iss_address: ctx.asso_iss_address.clone(),
                action: FileAction::Delete,
                size: deleted.size,
                size_change: -(deleted.size as i64),
                create_dt: Utc::now().timestamp(),
            });
        }
        self.driver
            .add_task_to_queue(&tasks.backup_paths, &tasks.file_logs)
            .await;
        Ok(())
    }

    /// List the bucket's keys; token verification only, no scope check.
    pub async fn handle_list_files(
        &self,
        bucket_address: &str,
        auth_header: Option<&str>,
        request: ListFilesRequest,
    ) -> HubResult<ListFilesResponse> {
        let ctx = self
            .authenticate(bucket_address, auth_header, Some(PerformType::List), true)
            .await?;

        // the trailing slash keeps a sibling `<bucket>-auth` namespace out
        let args = ListFilesArgs {
            path_prefix: format!("{bucket_address}/"),
            page: request.page,
            page_size: request.page_size,
        };
        let archival = ctx.scopes.is_archival_restricted();

        let (mut entries, page): (Vec<Option<ListEntry>>, Option<String>) = if request.stat {
            let result = self.driver.list_files_stat(args).await?;
            (
                result
                    .entries
                    .into_iter()
                    .filter(|entry| !archival || !is_historical(&entry.name))
                    .map(|entry| Some(ListEntry::Stat(entry)))
                    .collect(),
                result.page,
            )
        } else {
            let result = self.driver.list_files(args).await?;
            (
                result
                    .entries
                    .into_iter()
                    .filter(|name| !archival || !is_historical(name))
                    .map(|name| Some(ListEntry::Name(name)))
                    .collect(),
                result.page,
            )
        };

        // keep pagination moving when the filter consumed the whole page
        if entries.is_empty() && page.is_some() {
            entries.push(None);
        }

        Ok(ListFilesResponse { entries, page })
    }

    /// Raise the bucket's revocation floor. Verified without the current
    /// floor so an owner can never lock themselves out of raising it.
    pub async fn handle_auth_bump(
        &self,
        bucket_address: &str,
        auth_header: Option<&str>,
        oldest_valid_timestamp: u64,
    ) -> HubResult<()> {
        if oldest_valid_timestamp == 0 {
            return Err(HubError::InvalidInput(
                "oldestValidTimestamp must be a positive integer".into(),
            ));
        }
        self.authenticate(bucket_address, auth_header, None, false)
            .await?;
        self.auth_timestamps
            .set_auth_timestamp(self.driver.as_ref(), bucket_address, oldest_valid_timestamp)
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{default_fixture, service_fixture};
    use super::*;
    use crate::config::test_support::test_config;
    use crate::services::token_verifier::test_tokens::{bearer, keypair, sign_jwt};
    use crate::services::token_verifier::address_from_public_key;
    use bytes::Bytes;
    use futures::stream;
    use k256::ecdsa::SigningKey;
    use serde_json::{json, Value};
    use std::io;
    use std::task::Poll;

    fn byte_stream(data: &[u8]) -> ByteStream {
        stream::iter(vec![Ok(Bytes::copy_from_slice(data))]).boxed()
    }

    fn token_payload(pubkey_hex: &str) -> Value {
        json!({
            "iss": pubkey_hex,
            "gaiaChallenge": challenge_text("hub.example.com"),
            "iat": 1_700_000_000u64,
            "salt": "abcd",
        })
    }

    fn identity() -> (SigningKey, String, String) {
        let (key, pubkey_hex) = keypair();
        let address = address_from_public_key(&pubkey_hex).unwrap();
        (key, pubkey_hex, address)
    }

    fn archival_payload(pubkey_hex: &str, prefix: &str) -> Value {
        let mut payload = token_payload(pubkey_hex);
        payload["scopes"] = json!([{"scope": "putFileArchivalPrefix", "domain": prefix}]);
        payload
    }

    #[test]
    fn historical_names_wrap_the_basename() {
        let name = historical_name("photos/x.jpg");
        assert!(name.starts_with("photos/.history."));
        assert!(name.ends_with(".x.jpg"));
        assert!(is_historical(&name));

        let bare = historical_name("x.jpg");
        assert!(bare.starts_with(".history."));
        assert!(is_historical(&bare));

        assert!(!is_historical("photos/x.jpg"));
        assert!(!is_historical("history.x.jpg"));
    }

    #[tokio::test]
    async fn happy_write_returns_etag_and_rewritten_url() {
        let mut config = test_config();
        config.read_url = Some("https://cdn.example.com/".into());
        let (_dir, service, _pool) = service_fixture(config).await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&token_payload(&pubkey_hex), &key);

        let meta = WriteMeta {
            content_length: Some(5),
            ..WriteMeta::default()
        };
        let resp = service
            .handle_request(&address, "notes/a.txt", Some(&header), meta, byte_stream(b"hello"))
            .await
            .expect("write");
        assert_eq!(resp.etag, "\"5d41402abc4b2a76b9719d911017c592\"");
        assert_eq!(
            resp.public_url,
            format!("https://cdn.example.com/{address}/notes/a.txt")
        );
    }

    #[tokio::test]
    async fn dotdot_paths_are_rejected_everywhere() {
        let (_dir, service, _pool) = default_fixture().await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&token_payload(&pubkey_hex), &key);

        let err = service
            .handle_request(
                &address,
                "x/../y",
                Some(&header),
                WriteMeta::default(),
                byte_stream(b"hi"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::BadPath(_)));

        let err = service
            .handle_delete(&address, "x/../y", Some(&header), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::BadPath(_)));
    }

    #[tokio::test]
    async fn oversized_content_length_is_rejected_before_streaming() {
        let (_dir, service, _pool) = default_fixture().await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&token_payload(&pubkey_hex), &key);

        let body: ByteStream = stream::poll_fn(|_| -> Poll<Option<io::Result<Bytes>>> {
            panic!("body must not be read")
        })
        .boxed();
        let meta = WriteMeta {
            // one byte past the 1 MiB test limit
            content_length: Some(1024 * 1024 + 1),
            ..WriteMeta::default()
        };
        let err = service
            .handle_request(&address, "big.bin", Some(&header), meta, body)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::PayloadTooLarge(_)));
    }

    #[tokio::test]
    async fn stream_longer_than_reported_length_is_aborted() {
        let (_dir, service, _pool) = default_fixture().await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&token_payload(&pubkey_hex), &key);

        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from(vec![0u8; 100])),
            Ok(Bytes::from(vec![0u8; 100])),
        ])
        .boxed();
        let meta = WriteMeta {
            content_length: Some(100),
            ..WriteMeta::default()
        };
        let err = service
            .handle_request(&address, "liar.bin", Some(&header), meta, body)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::PayloadTooLarge(_)));
    }

    #[tokio::test]
    async fn conflicting_precondition_headers_are_rejected() {
        let (_dir, service, _pool) = default_fixture().await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&token_payload(&pubkey_hex), &key);

        let meta = WriteMeta {
            if_match: Some("\"abc\"".into()),
            if_none_match: Some("*".into()),
            ..WriteMeta::default()
        };
        let err = service
            .handle_request(&address, "a.txt", Some(&header), meta, byte_stream(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::PreconditionFailed { .. }));

        let meta = WriteMeta {
            if_none_match: Some("\"abc\"".into()),
            ..WriteMeta::default()
        };
        let err = service
            .handle_request(&address, "a.txt", Some(&header), meta, byte_stream(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn held_endpoint_lock_conflicts_concurrent_writes() {
        let (_dir, service, _pool) = default_fixture().await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&token_payload(&pubkey_hex), &key);

        let _guard = service.locks.try_acquire(&address, "a.txt").unwrap();
        let err = service
            .handle_request(
                &address,
                "a.txt",
                Some(&header),
                WriteMeta::default(),
                byte_stream(b"x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Conflict(_)));
    }

    #[tokio::test]
    async fn archival_overwrite_renames_then_writes_and_list_hides_history() {
        let (_dir, service, _pool) = default_fixture().await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&archival_payload(&pubkey_hex, "photos/"), &key);

        service
            .handle_request(
                &address,
                "photos/x.jpg",
                Some(&header),
                WriteMeta::default(),
                byte_stream(b"first"),
            )
            .await
            .expect("first write");
        service
            .handle_request(
                &address,
                "photos/x.jpg",
                Some(&header),
                WriteMeta::default(),
                byte_stream(b"second"),
            )
            .await
            .expect("overwrite");

        // the raw listing has the live object plus one history entry
        let raw = service
            .driver
            .list_files(ListFilesArgs {
                path_prefix: format!("{address}/"),
                page: None,
                page_size: None,
            })
            .await
            .unwrap();
        assert_eq!(raw.entries.len(), 2);
        assert!(raw.entries.iter().any(|e| is_historical(e)));

        // the authenticated listing filters the history entry
        let listed = service
            .handle_list_files(&address, Some(&header), ListFilesRequest::default())
            .await
            .unwrap();
        assert_eq!(listed.entries.len(), 1);
        match listed.entries[0].as_ref().expect("entry") {
            ListEntry::Name(name) => assert_eq!(name, "photos/x.jpg"),
            other => panic!("expected name entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn archival_delete_renames_instead_of_deleting() {
        let (_dir, service, _pool) = default_fixture().await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&archival_payload(&pubkey_hex, "photos/"), &key);

        service
            .handle_request(
                &address,
                "photos/x.jpg",
                Some(&header),
                WriteMeta::default(),
                byte_stream(b"data"),
            )
            .await
            .unwrap();
        service
            .handle_delete(&address, "photos/x.jpg", Some(&header), None, None)
            .await
            .expect("archival delete");

        let stat = service.driver.perform_stat(&address, "photos/x.jpg").await.unwrap();
        assert!(!stat.exists);
        let raw = service
            .driver
            .list_files(ListFilesArgs {
                path_prefix: format!("{address}/"),
                page: None,
                page_size: None,
            })
            .await
            .unwrap();
        assert_eq!(raw.entries.len(), 1);
        assert!(is_historical(&raw.entries[0]));

        // deleting a path that never existed surfaces the 404
        let err = service
            .handle_delete(&address, "photos/missing.jpg", Some(&header), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::DoesNotExist(_)));
    }

    #[tokio::test]
    async fn filtered_out_page_keeps_a_null_sentinel() {
        let mut config = test_config();
        config.page_size = 2;
        let (_dir, service, _pool) = service_fixture(config).await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&archival_payload(&pubkey_hex, "photos/"), &key);

        // three history entries sort before the live object, so the first
        // page is nothing but history
        for name in [
            "photos/.history.1.aaaaaaaaaa.x.jpg",
            "photos/.history.2.bbbbbbbbbb.x.jpg",
            "photos/.history.3.cccccccccc.x.jpg",
        ] {
            service
                .driver
                .perform_write(WriteArgs {
                    storage_top_level: address.clone(),
                    path: name.to_string(),
                    stream: byte_stream(b"old"),
                    content_type: "image/jpeg".into(),
                    cache_control: None,
                    if_match_tag: None,
                    if_none_match_tag: None,
                })
                .await
                .unwrap();
        }

        let listed = service
            .handle_list_files(&address, Some(&header), ListFilesRequest::default())
            .await
            .unwrap();
        assert!(listed.page.is_some());
        assert_eq!(listed.entries.len(), 1);
        assert!(listed.entries[0].is_none());
    }

    #[tokio::test]
    async fn revoke_all_invalidates_older_tokens() {
        let (_dir, service, _pool) = default_fixture().await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&token_payload(&pubkey_hex), &key);

        let floor = 2_000_000_000u64;
        service
            .handle_auth_bump(&address, Some(&header), floor)
            .await
            .expect("bump");

        // the original token has iat 1_700_000_000 < floor
        let err = service
            .handle_request(
                &address,
                "a.txt",
                Some(&header),
                WriteMeta::default(),
                byte_stream(b"x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HubError::AuthTokenTimestamp {
                oldest_valid_timestamp
            } if oldest_valid_timestamp == floor
        ));

        // a fresh token above the floor writes fine
        let mut payload = token_payload(&pubkey_hex);
        payload["iat"] = json!(floor + 1);
        let fresh = bearer(&payload, &key);
        service
            .handle_request(
                &address,
                "a.txt",
                Some(&fresh),
                WriteMeta::default(),
                byte_stream(b"x"),
            )
            .await
            .expect("fresh token write");
    }

    #[tokio::test]
    async fn zero_revocation_timestamp_is_invalid_input() {
        let (_dir, service, _pool) = default_fixture().await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&token_payload(&pubkey_hex), &key);
        let err = service
            .handle_auth_bump(&address, Some(&header), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn blacklisted_bucket_cannot_write() {
        let (_dir, service, pool) = default_fixture().await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&token_payload(&pubkey_hex), &key);

        sqlx::query("INSERT INTO blacklist (address, type) VALUES (?, 1)")
            .bind(&address)
            .execute(&*pool)
            .await
            .unwrap();

        let err = service
            .handle_request(
                &address,
                "a.txt",
                Some(&header),
                WriteMeta::default(),
                byte_stream(b"x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotEnoughProof(_)));
    }

    #[tokio::test]
    async fn write_blocked_bucket_can_still_list() {
        let (_dir, service, pool) = default_fixture().await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&token_payload(&pubkey_hex), &key);

        sqlx::query("INSERT INTO blacklist (address, type) VALUES (?, 2)")
            .bind(&address)
            .execute(&*pool)
            .await
            .unwrap();

        let err = service
            .handle_request(
                &address,
                "a.txt",
                Some(&header),
                WriteMeta::default(),
                byte_stream(b"x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotEnoughProof(_)));

        service
            .handle_list_files(&address, Some(&header), ListFilesRequest::default())
            .await
            .expect("list still allowed");
    }

    #[tokio::test]
    async fn whitelist_limits_the_effective_signer() {
        let mut config = test_config();
        config.whitelist = Some(vec!["1SomebodyElse".into()]);
        let (_dir, service, _pool) = service_fixture(config).await;
        let (key, pubkey_hex, address) = identity();
        let header = bearer(&token_payload(&pubkey_hex), &key);

        let err = service
            .handle_request(
                &address,
                "a.txt",
                Some(&header),
                WriteMeta::default(),
                byte_stream(b"x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
    }

    #[tokio::test]
    async fn whitelist_accepts_the_association_issuer() {
        let (app_key, app_pubkey) = keypair();
        let app_address = address_from_public_key(&app_pubkey).unwrap();
        let mut config = test_config();
        config.whitelist = Some(vec![app_address.clone()]);
        let (_dir, service, _pool) = service_fixture(config).await;

        let (bucket_key, bucket_pubkey, bucket_address) = identity();
        let association = sign_jwt(
            &json!({
                "iss": app_pubkey,
                "childToAssociate": bucket_pubkey,
                "exp": 4_000_000_000u64,
                "iat": 1_700_000_000u64,
                "salt": "00",
            }),
            &app_key,
        );
        let mut payload = token_payload(&bucket_pubkey);
        payload["associationToken"] = json!(association);
        let header = bearer(&payload, &bucket_key);

        service
            .handle_request(
                &bucket_address,
                "a.txt",
                Some(&header),
                WriteMeta::default(),
                byte_stream(b"x"),
            )
            .await
            .expect("association issuer is whitelisted");
    }

    #[tokio::test]
    async fn scoped_token_cannot_write_outside_its_paths() {
        let (_dir, service, _pool) = default_fixture().await;
        let (key, pubkey_hex, address) = identity();
        let mut payload = token_payload(&pubkey_hex);
        payload["scopes"] = json!([{"scope": "putFilePrefix", "domain": "notes/"}]);
        let header = bearer(&payload, &key);

        service
            .handle_request(
                &address,
                "notes/a.txt",
                Some(&header),
                WriteMeta::default(),
                byte_stream(b"x"),
            )
            .await
            .expect("in-scope write");
        let err = service
            .handle_request(
                &address,
                "photos/a.jpg",
                Some(&header),
                WriteMeta::default(),
                byte_stream(b"x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
    }
}
