//! Hub error taxonomy and its HTTP mapping.
//!
//! Every fallible path in the handlers and services returns [`HubError`];
//! the `IntoResponse` impl turns it into the JSON shape
//! `{message, error, etag?, oldestValidTokenTimestamp?}` with the status
//! code the error kind dictates.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("{0}")]
    Validation(String),

    /// The token's `iat` is older than the bucket's revocation floor.
    #[error("supplied token is older than the oldest valid token timestamp")]
    AuthTokenTimestamp { oldest_valid_timestamp: u64 },

    #[error("{0}")]
    BadPath(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    DoesNotExist(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotEnoughProof(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{message}")]
    PreconditionFailed {
        message: String,
        etag: Option<String>,
    },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Server(String),
}

pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    pub fn validation(msg: impl Into<String>) -> Self {
        HubError::Validation(msg.into())
    }

    pub fn precondition(msg: impl Into<String>, etag: Option<String>) -> Self {
        HubError::PreconditionFailed {
            message: msg.into(),
            etag,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            HubError::Validation(_) | HubError::AuthTokenTimestamp { .. } => {
                StatusCode::UNAUTHORIZED
            }
            HubError::BadPath(_) => StatusCode::FORBIDDEN,
            HubError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            HubError::DoesNotExist(_) => StatusCode::NOT_FOUND,
            HubError::Conflict(_) => StatusCode::CONFLICT,
            HubError::NotEnoughProof(_) => StatusCode::PAYMENT_REQUIRED,
            HubError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            HubError::PreconditionFailed { .. } => StatusCode::PRECONDITION_FAILED,
            HubError::Sqlx(_) | HubError::Io(_) | HubError::Server(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable error name carried in the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::Validation(_) => "ValidationError",
            HubError::AuthTokenTimestamp { .. } => "AuthTokenTimestampValidationError",
            HubError::BadPath(_) => "BadPathError",
            HubError::InvalidInput(_) => "InvalidInputError",
            HubError::DoesNotExist(_) => "DoesNotExistError",
            HubError::Conflict(_) => "ConflictError",
            HubError::NotEnoughProof(_) => "NotEnoughProofError",
            HubError::PayloadTooLarge(_) => "PayloadTooLargeError",
            HubError::PreconditionFailed { .. } => "PreconditionFailedError",
            HubError::Sqlx(_) | HubError::Io(_) | HubError::Server(_) => "ServerError",
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "request rejected");
        }

        let mut body = json!({
            "message": self.to_string(),
            "error": self.kind(),
        });
        match &self {
            HubError::AuthTokenTimestamp {
                oldest_valid_timestamp,
            } => {
                body["oldestValidTokenTimestamp"] = json!(oldest_valid_timestamp);
            }
            HubError::PreconditionFailed {
                etag: Some(etag), ..
            } => {
                body["etag"] = json!(etag);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
