//! Hub metadata and welcome handlers.

use axum::{extract::State, response::Html, Json};

use crate::services::hub_service::{HubInfo, HubService};

/// GET `/hub_info/` — challenge text, auth version, and upload limits.
pub async fn hub_info(State(service): State<HubService>) -> Json<HubInfo> {
    Json(service.hub_info())
}

/// GET `/` — plain welcome page.
pub async fn welcome() -> Html<&'static str> {
    Html(
        "<html><body>\
         <h1>Storage hub</h1>\
         <p>This hub accepts authenticated writes. See <code>/hub_info/</code> \
         for the challenge text and limits.</p>\
         </body></html>",
    )
}
