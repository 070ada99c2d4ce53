/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sync_types::error_codes;

#[derive(Debug, thiserror::Error)]
pub enum SyncServerError {
    /// Malformed id, bad body shape, unparseable baseRevision, or an id
    /// mismatch between the path and the payload. The message is ours and
    /// safe to show to clients.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no authenticated user")]
    Unauthorized,

    #[error("conversation not found")]
    NotFound,

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    #[error("Error opening database: {0}")]
    OpenDatabaseError(#[from] sql_support::open_database::Error),

    #[error("Error parsing JSON data: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, SyncServerError>;

impl SyncServerError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            SyncServerError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, error_codes::INVALID_REQUEST)
            }
            SyncServerError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, error_codes::UNAUTHORIZED)
            }
            SyncServerError::NotFound => (StatusCode::NOT_FOUND, error_codes::NOT_FOUND),
            SyncServerError::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, error_codes::PAYLOAD_TOO_LARGE)
            }
            SyncServerError::SqlError(_)
            | SyncServerError::OpenDatabaseError(_)
            | SyncServerError::JsonError(_)
            | SyncServerError::TaskFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, error_codes::SERVER_ERROR)
            }
        }
    }
}

impl IntoResponse for SyncServerError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Unexpected errors never leak internals to clients.
            log::error!("request failed: {}", self);
            json!({ "error": code })
        } else {
            log::debug!("request rejected: {}", self);
            json!({ "error": code, "message": self.to_string() })
        };
        (status, Json(body)).into_response()
    }
}
