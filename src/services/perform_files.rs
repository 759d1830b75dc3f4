//! The perform-files batch engine.
//!
//! Walks the request tree: sequential groups run children in order and stop
//! at the first failed leaf result; parallel groups run children in windows
//! of up to ten. Per-leaf errors become `{success: false}` results; only
//! failures above the leaves (token verification, the top-level blacklist
//! check) reject the whole batch. All accumulated backup paths and file
//! logs are enqueued once when the tree has been walked.

use bytes::Bytes;
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::stream;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::sync::Mutex;

use crate::errors::{HubError, HubResult};
use crate::models::perform::{LeafResult, PerformLeaf, PerformNode, PerformOpType};
use crate::models::records::{FileAction, FileLogRecord, PerformType};
use crate::services::driver::{DeleteArgs, StorageDriver, WriteArgs};
use crate::services::hub_service::{check_path, AuthContext, HubService, TaskAccumulator};

const PARALLEL_WINDOW: usize = 10;

/// Shared accumulator the concurrent leaves merge into.
struct TaskSink(Mutex<TaskAccumulator>);

impl TaskSink {
    fn merge(&self, tasks: TaskAccumulator) {
        let mut inner = self.0.lock().unwrap_or_else(|e| e.into_inner());
        inner.backup_paths.extend(tasks.backup_paths);
        inner.file_logs.extend(tasks.file_logs);
    }
}

/// String content keeps its declared type, JSON values are stringified;
/// anything else is invalid input.
fn coerce_content(leaf: &PerformLeaf) -> HubResult<(Vec<u8>, String)> {
    match &leaf.content {
        Some(Value::String(s)) => Ok((
            s.as_bytes().to_vec(),
            leaf.content_type
                .clone()
                .unwrap_or_else(|| "text/plain".into()),
        )),
        Some(value @ (Value::Object(_) | Value::Array(_))) => {
            let bytes = serde_json::to_vec(value)
                .map_err(|e| HubError::InvalidInput(format!("failed to serialize content: {e}")))?;
            Ok((
                bytes,
                leaf.content_type
                    .clone()
                    .unwrap_or_else(|| "application/json".into()),
            ))
        }
        _ => Err(HubError::InvalidInput(
            "put content must be a string or a JSON object".into(),
        )),
    }
}

impl HubService {
    pub async fn handle_perform_files(
        &self,
        bucket_address: &str,
        auth_header: Option<&str>,
        root: PerformNode,
    ) -> HubResult<Vec<LeafResult>> {
        let ctx = self
            .authenticate(
                bucket_address,
                auth_header,
                Some(PerformType::Perform),
                true,
            )
            .await?;

        let sink = TaskSink(Mutex::new(TaskAccumulator::default()));
        let results = self.perform_node(bucket_address, &ctx, &root, &sink).await;

        let tasks = sink.0.into_inner().unwrap_or_else(|e| e.into_inner());
        self.driver
            .add_task_to_queue(&tasks.backup_paths, &tasks.file_logs)
            .await;
        Ok(results)
    }

    fn perform_node<'a>(
        &'a self,
        bucket_address: &'a str,
        ctx: &'a AuthContext,
        node: &'a PerformNode,
        sink: &'a TaskSink,
    ) -> BoxFuture<'a, Vec<LeafResult>> {
        async move {
            match node {
                PerformNode::Group(group) if group.is_sequential => {
                    let mut out = Vec::new();
                    for child in &group.values {
                        let results = self.perform_node(bucket_address, ctx, child, sink).await;
                        let failed = results.iter().any(|r| !r.success);
                        out.extend(results);
                        if failed {
                            break;
                        }
                    }
                    out
                }
                PerformNode::Group(group) => {
                    let mut out = Vec::new();
                    for window in group.values.chunks(PARALLEL_WINDOW) {
                        let batch = join_all(
                            window
                                .iter()
                                .map(|child| self.perform_node(bucket_address, ctx, child, sink)),
                        )
                        .await;
                        out.extend(batch.into_iter().flatten());
                    }
                    out
                }
                PerformNode::Leaf(leaf) => {
                    let result = match self.perform_leaf(bucket_address, ctx, leaf, sink).await {
                        Ok(result) => result,
                        Err(err) => LeafResult::failed(leaf.id.clone(), &err),
                    };
                    vec![result]
                }
            }
        }
        .boxed()
    }

    async fn perform_leaf(
        &self,
        bucket_address: &str,
        ctx: &AuthContext,
        leaf: &PerformLeaf,
        sink: &TaskSink,
    ) -> HubResult<LeafResult> {
        check_path(&leaf.path)?;
        let _guard = self.locks.try_acquire(bucket_address, &leaf.path)?;
        match leaf.op {
            PerformOpType::Put => self.perform_put_leaf(bucket_address, ctx, leaf, sink).await,
            PerformOpType::Delete => {
                self.perform_delete_leaf(bucket_address, ctx, leaf, sink)
                    .await
            }
        }
    }

    async fn perform_put_leaf(
        &self,
        bucket_address: &str,
        ctx: &AuthContext,
        leaf: &PerformLeaf,
        sink: &TaskSink,
    ) -> HubResult<LeafResult> {
        if self
            .blacklist
            .is_blacklisted(self.driver.as_ref(), bucket_address, PerformType::Put)
            .await?
        {
            return Err(HubError::NotEnoughProof(
                "address is blocked from this operation".into(),
            ));
        }
        ctx.scopes.check_archival_write(&leaf.path)?;
        ctx.scopes.check_write(&leaf.path)?;

        let (bytes, content_type) = coerce_content(leaf)?;
        let max_size = self.config.max_file_upload_size_bytes();
        if bytes.len() as u64 > max_size {
            return Err(HubError::PayloadTooLarge(format!(
                "file size {} exceeds the maximum of {max_size} bytes",
                bytes.len()
            )));
        }

        let mut tasks = TaskAccumulator::default();
        if ctx.scopes.is_archival_restricted() {
            match self
                .rename_to_history(
                    bucket_address,
                    &leaf.path,
                    None,
                    &ctx.asso_iss_address,
                    &mut tasks,
                )
                .await
            {
                Ok(()) | Err(HubError::DoesNotExist(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let result = self
            .driver
            .perform_write(WriteArgs {
                storage_top_level: bucket_address.to_string(),
                path: leaf.path.clone(),
                stream: stream::iter(vec![Ok(Bytes::from(bytes))]).boxed(),
                content_type,
                cache_control: self.config.cache_control.clone(),
                if_match_tag: None,
                if_none_match_tag: None,
            })
            .await?;

        let public_url = self.rewrite_public_url(result.public_url.clone());
        tasks.file_logs.push(FileLogRecord {
            path: format!("{bucket_address}/{}", leaf.path),
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
        tasks
            .backup_paths
            .push(format!("{bucket_address}/{}", leaf.path));
        sink.merge(tasks);

        Ok(LeafResult::put_ok(leaf.id.clone(), public_url, result.etag))
    }

    async fn perform_delete_leaf(
        &self,
        bucket_address: &str,
        ctx: &AuthContext,
        leaf: &PerformLeaf,
        sink: &TaskSink,
    ) -> HubResult<LeafResult> {
        if self
            .blacklist
            .is_blacklisted(self.driver.as_ref(), bucket_address, PerformType::Delete)
            .await?
        {
            return Err(HubError::NotEnoughProof(
                "address is blocked from this operation".into(),
            ));
        }
        ctx.scopes.check_archival_write(&leaf.path)?;
        ctx.scopes.check_delete(&leaf.path)?;

        let mut tasks = TaskAccumulator::default();
        if ctx.scopes.is_archival_restricted() {
            match self
                .rename_to_history(
                    bucket_address,
                    &leaf.path,
                    None,
                    &ctx.asso_iss_address,
                    &mut tasks,
                )
                .await
            {
                Ok(()) => {}
                Err(HubError::DoesNotExist(_)) if leaf.do_ignore_does_not_exist_error => {}
                Err(err) => return Err(err),
            }
        } else {
            match self
                .driver
                .perform_delete(DeleteArgs {
                    storage_top_level: bucket_address.to_string(),
                    path: leaf.path.clone(),
                    if_match_tag: None,
                })
                .await
            {
                Ok(deleted) => {
                    tasks.file_logs.push(FileLogRecord {
                        path: format!("{bucket_address}/{}", leaf.path),
                        asso_iss_address: ctx.asso_iss_address.clone(),
                        action: FileAction::Delete,
                        size: deleted.size,
                        size_change: -(deleted.size as i64),
                        create_dt: Utc::now().timestamp(),
                    });
                }
                Err(HubError::DoesNotExist(_)) if leaf.do_ignore_does_not_exist_error => {}
                Err(err) => return Err(err),
            }
        }
        sink.merge(tasks);

        Ok(LeafResult::delete_ok(leaf.id.clone()))
    }
}
