/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The request-level sync contract. Handlers assume a pre-authenticated
//! user (the [`AuthUser`] extractor consumes what the session middleware
//! injected); bodies are taken as raw bytes so the 400/413 taxonomy stays
//! ours rather than the framework's.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use conversation_id::ConversationId;
use serde_json::Value as JsonValue;
use sync_types::{
    ChangeEvent, ConflictBody, ConversationEnvelope, ConversationList, WriteAck, WriteRequest,
};

use crate::error::*;
use crate::events::{self, EventStreamConfig};
use crate::notifier::ChangeNotifier;
use crate::storage::{SyncStorage, WriteOutcome};

/// The header the session-gating middleware uses to hand us the
/// authenticated user. Authentication itself (cookies, tokens, same-origin
/// checks) is entirely outside this component.
pub const AUTH_USER_HEADER: &str = "x-sync-user";

/// User identifiers are opaque partition keys, capped at 64 bytes.
const MAX_USER_LEN: usize = 64;

pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<SyncStorage>,
    pub notifier: ChangeNotifier,
    pub events: EventStreamConfig,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(storage: SyncStorage) -> Self {
        Self {
            storage: Arc::new(storage),
            notifier: ChangeNotifier::new(),
            events: EventStreamConfig::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

pub struct AuthUser(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = SyncServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let user = parts
            .headers
            .get(AUTH_USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(SyncServerError::Unauthorized)?;
        if user.is_empty() || user.len() > MAX_USER_LEN {
            return Err(SyncServerError::Unauthorized);
        }
        Ok(AuthUser(user.to_string()))
    }
}

pub fn router(state: AppState) -> Router {
    let max_body = state.max_body_bytes;
    Router::new()
        .route("/sync/conversations", get(list_conversations))
        .route(
            "/sync/conversations/:id",
            get(get_conversation)
                .put(put_conversation)
                .delete(delete_conversation),
        )
        .route("/sync/events", get(events::events))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(axum::middleware::map_response(no_store))
        .with_state(state)
}

/// Every sync response is non-cacheable. The events handler sets its own
/// stricter value, which we leave alone.
async fn no_store(mut response: Response) -> Response {
    response
        .headers_mut()
        .entry(axum::http::header::CACHE_CONTROL)
        .or_insert(axum::http::HeaderValue::from_static("no-store"));
    response
}

async fn health() -> Json<JsonValue> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<ConversationList>> {
    let storage = Arc::clone(&state.storage);
    let items = run_blocking(move || storage.list(&user)).await?;
    Ok(Json(ConversationList { items }))
}

async fn get_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ConversationEnvelope>> {
    let id = parse_id(&id)?;
    let storage = Arc::clone(&state.storage);
    let record = {
        let id = id.clone();
        run_blocking(move || storage.get(&user, &id)).await?
    };
    match record {
        Some(record) => Ok(Json(ConversationEnvelope {
            conversation_id: id,
            revision: record.revision,
            deleted: record.deleted,
            data: record.data,
        })),
        None => Err(SyncServerError::NotFound),
    }
}

async fn put_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    body: std::result::Result<Bytes, axum::extract::rejection::BytesRejection>,
) -> Result<Response> {
    let id = parse_id(&id)?;
    let request = parse_write_request(body)?;
    let data = request
        .data
        .ok_or_else(|| SyncServerError::InvalidRequest("missing data".into()))?;
    validate_blob(&id, &data)?;

    let storage = Arc::clone(&state.storage);
    let outcome = {
        let (user, id) = (user.clone(), id.clone());
        run_blocking(move || storage.upsert(&user, &id, request.base_revision, &data)).await?
    };
    Ok(write_response(&state, &user, id, outcome, false))
}

async fn delete_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    body: std::result::Result<Bytes, axum::extract::rejection::BytesRejection>,
) -> Result<Response> {
    let id = parse_id(&id)?;
    // A missing body is fine and means `baseRevision: null`.
    let request = parse_write_request(body)?;
    if let Some(data) = &request.data {
        // Tolerated, but it must still be consistent with the path.
        validate_blob(&id, data)?;
    }

    let storage = Arc::clone(&state.storage);
    let outcome = {
        let (user, id) = (user.clone(), id.clone());
        run_blocking(move || storage.tombstone(&user, &id, request.base_revision)).await?
    };
    Ok(write_response(&state, &user, id, outcome, true))
}

fn write_response(
    state: &AppState,
    user: &str,
    id: ConversationId,
    outcome: WriteOutcome,
    deleted: bool,
) -> Response {
    match outcome {
        WriteOutcome::Written {
            revision,
            updated_at,
        } => {
            state.notifier.publish(
                user,
                ChangeEvent {
                    conversation_id: id.clone(),
                    revision,
                    deleted,
                    updated_at: Some(updated_at),
                },
            );
            Json(WriteAck {
                conversation_id: id,
                revision,
            })
            .into_response()
        }
        WriteOutcome::Conflict { revision, deleted } => (
            StatusCode::CONFLICT,
            Json(ConflictBody::new(id, revision, deleted)),
        )
            .into_response(),
        WriteOutcome::NotFound => SyncServerError::NotFound.into_response(),
    }
}

fn parse_id(raw: &str) -> Result<ConversationId> {
    ConversationId::parse(raw)
        .map_err(|_| SyncServerError::InvalidRequest("invalid conversation id".into()))
}

fn parse_write_request(
    body: std::result::Result<Bytes, axum::extract::rejection::BytesRejection>,
) -> Result<WriteRequest> {
    let bytes = match body {
        Ok(bytes) => bytes,
        Err(rejection) => {
            let status = rejection.into_response().status();
            return Err(if status == StatusCode::PAYLOAD_TOO_LARGE {
                SyncServerError::PayloadTooLarge
            } else {
                SyncServerError::InvalidRequest("unreadable request body".into())
            });
        }
    };
    if bytes.is_empty() {
        return Ok(WriteRequest::default());
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| SyncServerError::InvalidRequest(format!("malformed body: {}", e)))
}

fn validate_blob(id: &ConversationId, data: &JsonValue) -> Result<()> {
    let obj = data.as_object().ok_or_else(|| {
        SyncServerError::InvalidRequest("data must be a JSON object".into())
    })?;
    if let Some(blob_id) = obj.get("id") {
        if blob_id.as_str() != Some(id.as_str()) {
            return Err(SyncServerError::InvalidRequest(
                "data.id does not match the conversation id".into(),
            ));
        }
    }
    Ok(())
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncServerError::TaskFailed(e.to_string()))?
}
