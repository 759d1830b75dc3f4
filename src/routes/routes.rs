//! Defines routes for all hub endpoints.
//!
//! ## Structure
//! - **Authenticated endpoints** (bearer `v1:` tokens)
//!   - `POST   /store/{address}/{*path}` — streaming write
//!   - `DELETE /delete/{address}/{*path}` — conditional delete
//!   - `POST   /list-files/{address}` — paginated listing (4 KiB body cap)
//!   - `POST   /perform-files/{address}` — batch PUT/DELETE tree
//!   - `POST   /revoke-all/{address}` — raise the revocation floor (4 KiB body cap)
//! - **Public endpoints**
//!   - `GET /hub_info/`, `GET /`, `GET /healthz`, `GET /readyz`
//!
//! The wildcard `*path` allows nested keys like `photos/2025/img.jpg`. The
//! three JSON POST endpoints are registered with and without a trailing
//! slash since clients send both forms.

use crate::handlers::{
    health_handlers::{healthz, readyz},
    info_handlers::{hub_info, welcome},
    store_handlers::{delete_file, list_files, perform_files, revoke_all, store},
};
use crate::services::hub_service::HubService;
use axum::{
    extract::DefaultBodyLimit,
    http::{header, Method},
    routing::{delete, get, post},
    Router,
};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

const SMALL_JSON_BODY_LIMIT: usize = 4096;

/// Build and return the router for all hub routes.
///
/// `max_batch_body` caps the perform-files body at the configured maximum
/// upload size. The router carries shared state (`HubService`) to all
/// handlers.
pub fn routes(max_batch_body: usize) -> Router<HubService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // public hub metadata
        .route("/", get(welcome))
        .route("/hub_info", get(hub_info))
        .route("/hub_info/", get(hub_info))
        // object mutations
        .route("/store/{address}/{*path}", post(store))
        .route("/delete/{address}/{*path}", delete(delete_file))
        // JSON endpoints
        .route(
            "/list-files/{address}",
            post(list_files).layer(DefaultBodyLimit::max(SMALL_JSON_BODY_LIMIT)),
        )
        .route(
            "/list-files/{address}/",
            post(list_files).layer(DefaultBodyLimit::max(SMALL_JSON_BODY_LIMIT)),
        )
        .route(
            "/revoke-all/{address}",
            post(revoke_all).layer(DefaultBodyLimit::max(SMALL_JSON_BODY_LIMIT)),
        )
        .route(
            "/revoke-all/{address}/",
            post(revoke_all).layer(DefaultBodyLimit::max(SMALL_JSON_BODY_LIMIT)),
        )
        .route(
            "/perform-files/{address}",
            post(perform_files).layer(DefaultBodyLimit::max(max_batch_body)),
        )
        .route(
            "/perform-files/{address}/",
            post(perform_files).layer(DefaultBodyLimit::max(max_batch_body)),
        )
        .layer(cors_layer())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::DELETE,
            Method::POST,
            Method::GET,
            Method::OPTIONS,
            Method::HEAD,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::IF_MATCH,
            header::IF_NONE_MATCH,
        ])
        .max_age(Duration::from_secs(86400))
}
