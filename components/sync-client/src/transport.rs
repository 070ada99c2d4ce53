/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The engine's view of the server. Everything goes through the
//! [`SyncTransport`] trait so that the agent can start with a disabled
//! transport (intents queue up, nothing touches the network) and hot-swap
//! in the live HTTP implementation once the initial pull has established
//! revision knowledge.

use std::sync::{Arc, Once, RwLock};

use async_trait::async_trait;
use conversation_id::ConversationId;
use serde_json::Value as JsonValue;
use sync_types::{ConflictBody, ConversationEnvelope, ConversationMeta, WriteAck, WriteRequest};
use url::Url;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The initial pull hasn't completed yet. Not surfaced to the user.
    #[error("sync transport is disabled")]
    Disabled,

    #[error("conversation not found on the server")]
    NotFound,

    /// The server rejected an optimistic write; carries the current row.
    #[error("conflict: server has revision {revision}")]
    Conflict {
        conversation_id: ConversationId,
        revision: u64,
        deleted: bool,
    },

    #[error("unexpected status {status}: {code}")]
    Status { status: u16, code: String },

    #[error("network error: {0}")]
    Network(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn list_conversations(&self) -> TransportResult<Vec<ConversationMeta>>;

    async fn get_conversation(&self, id: &ConversationId)
        -> TransportResult<ConversationEnvelope>;

    async fn upsert_conversation(
        &self,
        id: &ConversationId,
        base_revision: Option<u64>,
        data: &JsonValue,
    ) -> TransportResult<WriteAck>;

    async fn delete_conversation(
        &self,
        id: &ConversationId,
        base_revision: Option<u64>,
    ) -> TransportResult<WriteAck>;
}

/// The transport the agent starts with: every call fails with `Disabled`.
/// The condition is logged once per process rather than per attempt.
pub struct DisabledTransport;

impl DisabledTransport {
    fn log_once() {
        static LOGGED: Once = Once::new();
        LOGGED.call_once(|| {
            log::info!("sync transport is disabled until the initial pull completes");
        });
    }
}

#[async_trait]
impl SyncTransport for DisabledTransport {
    async fn list_conversations(&self) -> TransportResult<Vec<ConversationMeta>> {
        Self::log_once();
        Err(TransportError::Disabled)
    }

    async fn get_conversation(
        &self,
        _id: &ConversationId,
    ) -> TransportResult<ConversationEnvelope> {
        Self::log_once();
        Err(TransportError::Disabled)
    }

    async fn upsert_conversation(
        &self,
        _id: &ConversationId,
        _base_revision: Option<u64>,
        _data: &JsonValue,
    ) -> TransportResult<WriteAck> {
        Self::log_once();
        Err(TransportError::Disabled)
    }

    async fn delete_conversation(
        &self,
        _id: &ConversationId,
        _base_revision: Option<u64>,
    ) -> TransportResult<WriteAck> {
        Self::log_once();
        Err(TransportError::Disabled)
    }
}

/// Holder for the current transport. Reads clone the inner `Arc` and
/// release the lock before awaiting, so the lock never crosses a
/// suspension point.
pub struct SwappableTransport {
    inner: RwLock<Arc<dyn SyncTransport>>,
    live: std::sync::atomic::AtomicBool,
}

impl SwappableTransport {
    pub fn disabled() -> Self {
        Self {
            inner: RwLock::new(Arc::new(DisabledTransport)),
            live: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Hot-swap in the live transport; from here on `is_live` reports true
    /// and queued intents may be flushed.
    pub fn swap(&self, transport: Arc<dyn SyncTransport>) {
        *self.inner.write().unwrap() = transport;
        self.live.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn current(&self) -> Arc<dyn SyncTransport> {
        Arc::clone(&self.inner.read().unwrap())
    }
}

/// The live implementation: plain JSON over HTTP. Authentication proper is
/// outside the engine; we carry whatever identification the deployment
/// uses (here, the pre-authenticated user header the dev server consumes).
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
    user: String,
}

const AUTH_USER_HEADER: &str = "x-sync-user";

impl HttpTransport {
    pub fn new(base_url: Url, user: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, user)
    }

    pub fn with_client(http: reqwest::Client, base_url: Url, user: impl Into<String>) -> Self {
        Self {
            http,
            base_url,
            user: user.into(),
        }
    }

    fn url(&self, path: &str) -> TransportResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| TransportError::Network(e.to_string()))
    }

    fn conversation_url(&self, id: &ConversationId) -> TransportResult<Url> {
        self.url(&format!("sync/conversations/{}", id))
    }

    async fn parse_ok<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> TransportResult<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| TransportError::Network(e.to_string()));
        }
        Err(Self::error_from_response(status, response).await)
    }

    async fn error_from_response(
        status: reqwest::StatusCode,
        response: reqwest::Response,
    ) -> TransportError {
        let body = response.bytes().await.unwrap_or_default();
        if status == reqwest::StatusCode::CONFLICT {
            if let Ok(conflict) = serde_json::from_slice::<ConflictBody>(&body) {
                return TransportError::Conflict {
                    conversation_id: conflict.conversation_id,
                    revision: conflict.revision,
                    deleted: conflict.deleted,
                };
            }
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return TransportError::NotFound;
        }
        let code = serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or_else(|| "unknown".to_string());
        TransportError::Status {
            status: status.as_u16(),
            code,
        }
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn list_conversations(&self) -> TransportResult<Vec<ConversationMeta>> {
        let response = self
            .http
            .get(self.url("sync/conversations")?)
            .header(AUTH_USER_HEADER, &self.user)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let list: sync_types::ConversationList = Self::parse_ok(response).await?;
        Ok(list.items)
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> TransportResult<ConversationEnvelope> {
        let response = self
            .http
            .get(self.conversation_url(id)?)
            .header(AUTH_USER_HEADER, &self.user)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Self::parse_ok(response).await
    }

    async fn upsert_conversation(
        &self,
        id: &ConversationId,
        base_revision: Option<u64>,
        data: &JsonValue,
    ) -> TransportResult<WriteAck> {
        let body = WriteRequest {
            base_revision,
            data: Some(data.clone()),
        };
        let response = self
            .http
            .put(self.conversation_url(id)?)
            .header(AUTH_USER_HEADER, &self.user)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Self::parse_ok(response).await
    }

    async fn delete_conversation(
        &self,
        id: &ConversationId,
        base_revision: Option<u64>,
    ) -> TransportResult<WriteAck> {
        let body = WriteRequest {
            base_revision,
            data: None,
        };
        let response = self
            .http
            .delete(self.conversation_url(id)?)
            .header(AUTH_USER_HEADER, &self.user)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Self::parse_ok(response).await
    }
}
