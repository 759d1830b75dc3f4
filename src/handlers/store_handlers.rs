//! HTTP handlers for the hub's store, delete, list, revoke, and batch
//! endpoints. Bodies stream straight into the service layer; everything
//! else is header plumbing and JSON (de)serialization.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::io;

use crate::errors::HubError;
use crate::models::perform::PerformNode;
use crate::services::hub_service::{HubService, ListFilesRequest, WriteMeta};

/// Body accepted by `POST /revoke-all/{address}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeAllRequest {
    oldest_valid_timestamp: u64,
}

fn auth_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// A trailing `/` on the request path is stripped.
fn normalize_path(path: &str) -> &str {
    path.trim_end_matches('/')
}

/// POST `/store/{address}/{*path}` — streaming write.
pub async fn store(
    State(service): State<HubService>,
    Path((address, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, HubError> {
    let meta = WriteMeta {
        content_type: header_string(&headers, header::CONTENT_TYPE),
        content_length: headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok()),
        if_match: header_string(&headers, header::IF_MATCH),
        if_none_match: header_string(&headers, header::IF_NONE_MATCH),
    };
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)))
        .boxed();

    let response = service
        .handle_request(
            &address,
            normalize_path(&path),
            auth_header(&headers),
            meta,
            stream,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// DELETE `/delete/{address}/{*path}`.
pub async fn delete_file(
    State(service): State<HubService>,
    Path((address, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HubError> {
    service
        .handle_delete(
            &address,
            normalize_path(&path),
            auth_header(&headers),
            header_string(&headers, header::IF_MATCH),
            header_string(&headers, header::IF_NONE_MATCH),
        )
        .await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST `/list-files/{address}` — body is optional JSON
/// `{page?, pageSize?, stat?}`.
pub async fn list_files(
    State(service): State<HubService>,
    Path(address): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HubError> {
    let request: ListFilesRequest = if body.is_empty() {
        ListFilesRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| HubError::InvalidInput(format!("invalid list-files body: {e}")))?
    };
    let response = service
        .handle_list_files(&address, auth_header(&headers), request)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// POST `/revoke-all/{address}`.
pub async fn revoke_all(
    State(service): State<HubService>,
    Path(address): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HubError> {
    let request: RevokeAllRequest = serde_json::from_slice(&body).map_err(|e| {
        HubError::InvalidInput(format!("invalid revoke-all body: {e}"))
    })?;
    service
        .handle_auth_bump(
            &address,
            auth_header(&headers),
            request.oldest_valid_timestamp,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"status": "success"}))))
}

/// POST `/perform-files/{address}` — batch tree of PUT/DELETE leaves.
pub async fn perform_files(
    State(service): State<HubService>,
    Path(address): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HubError> {
    let root: PerformNode = serde_json::from_slice(&body)
        .map_err(|e| HubError::InvalidInput(format!("invalid perform-files body: {e}")))?;
    let results = service
        .handle_perform_files(&address, auth_header(&headers), root)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(results)))
}
