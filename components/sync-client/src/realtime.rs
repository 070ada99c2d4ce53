/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The realtime channel: a long-lived server-sent-events subscription that
//! turns `conversation_changed` notifications into targeted refetches.
//! Events are coalesced per conversation (highest revision wins) and
//! applied by a single drain loop, so a burst of revisions costs one GET.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conversation_id::ConversationId;
use futures::stream::BoxStream;
use futures::StreamExt;
use sync_types::{event_names, ChangeEvent, ConversationEnvelope};

use crate::engine::SyncCore;
use crate::transport::{TransportError, TransportResult};

/// One parsed server-sent event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
    pub retry: Option<u64>,
}

/// Incremental SSE framing parser. Frames are separated by a blank line;
/// fields are `event:`, `data:` (multi-line data joins with `\n`) and
/// `retry:`. Chunks may split frames - and UTF-8 sequences - anywhere, so
/// buffering happens on bytes.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(end) = find_frame_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&raw[..end]);
            if let Some(frame) = parse_frame(&text) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut saw_field = false;
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            frame.event = rest.trim_start().to_string();
            saw_field = true;
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !frame.data.is_empty() {
                frame.data.push('\n');
            }
            frame.data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
            saw_field = true;
        } else if let Some(rest) = line.strip_prefix("retry:") {
            frame.retry = rest.trim().parse().ok();
            saw_field = true;
        }
        // Comment lines (leading ':') and unknown fields are ignored.
    }
    saw_field.then_some(frame)
}

/// Where the stream of frames comes from. The HTTP implementation connects
/// to `/sync/events`; tests inject frames through a channel.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self) -> TransportResult<BoxStream<'static, TransportResult<SseFrame>>>;
}

/// The live `/sync/events` consumer.
pub struct HttpEventSource {
    http: reqwest::Client,
    url: url::Url,
    user: String,
}

impl HttpEventSource {
    pub fn new(base_url: &url::Url, user: impl Into<String>) -> TransportResult<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            url: base_url
                .join("sync/events")
                .map_err(|e| TransportError::Network(e.to_string()))?,
            user: user.into(),
        })
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn connect(&self) -> TransportResult<BoxStream<'static, TransportResult<SseFrame>>> {
        let response = self
            .http
            .get(self.url.clone())
            .header("x-sync-user", &self.user)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                code: "events".to_string(),
            });
        }
        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut parser = SseParser::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        for frame in parser.feed(&chunk) {
                            yield Ok(frame);
                        }
                    }
                    Err(e) => {
                        yield Err(TransportError::Network(e.to_string()));
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How long to wait before the single re-GET when a fetched revision
    /// lags the event that announced it.
    pub fetch_retry_delay: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            fetch_retry_delay: Duration::from_millis(200),
        }
    }
}

pub(crate) struct RealtimeChannel {
    core: Arc<SyncCore>,
    source: Box<dyn EventSource>,
    config: RealtimeConfig,
    /// Coalescing buffer: at most one pending event per id, keeping the
    /// highest revision seen.
    pending: Mutex<HashMap<ConversationId, ChangeEvent>>,
    draining: AtomicBool,
}

impl RealtimeChannel {
    pub(crate) fn new(
        core: Arc<SyncCore>,
        source: Box<dyn EventSource>,
        config: RealtimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            core,
            source,
            config,
            pending: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
        })
    }

    /// Connect-and-read loop with exponential backoff. Runs until the
    /// engine stops.
    pub(crate) async fn run(self: Arc<Self>) {
        let mut backoff = self.config.initial_backoff;
        loop {
            if self.core.is_stopped() {
                return;
            }
            match self.source.connect().await {
                Ok(mut stream) => {
                    log::debug!("realtime: connected");
                    backoff = self.config.initial_backoff;
                    while let Some(item) = stream.next().await {
                        if self.core.is_stopped() {
                            return;
                        }
                        match item {
                            Ok(frame) => self.handle_frame(frame),
                            Err(e) => {
                                log::debug!("realtime: stream error: {}", e);
                                break;
                            }
                        }
                    }
                    log::debug!("realtime: stream ended, reconnecting");
                }
                Err(e) => {
                    log::debug!("realtime: connect failed: {}", e);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    pub(crate) fn handle_frame(self: &Arc<Self>, frame: SseFrame) {
        match frame.event.as_str() {
            event_names::CONVERSATION_CHANGED => match serde_json::from_str::<ChangeEvent>(&frame.data) {
                Ok(event) => self.queue_event(event),
                Err(e) => log::warn!("realtime: unparseable change event: {}", e),
            },
            event_names::READY => log::debug!("realtime: ready"),
            event_names::PING => log::trace!("realtime: ping"),
            // `close` is advisory; the server is about to end the stream
            // and the read loop reconnects on its own.
            event_names::CLOSE => log::debug!("realtime: server close"),
            other => log::trace!("realtime: ignoring event {:?}", other),
        }
    }

    fn queue_event(self: &Arc<Self>, event: ChangeEvent) {
        {
            let mut pending = self.pending.lock().unwrap();
            pending
                .entry(event.conversation_id.clone())
                .and_modify(|existing| {
                    if event.revision > existing.revision {
                        *existing = event.clone();
                    }
                })
                .or_insert(event);
        }
        self.start_drain();
    }

    fn start_drain(self: &Arc<Self>) {
        if self.draining.swap(true, Ordering::SeqCst) {
            // Someone is already draining; the entry we just queued will
            // be picked up in a later iteration.
            return;
        }
        let channel = Arc::clone(self);
        tokio::spawn(async move { channel.drain().await });
    }

    /// Process pending entries serially, concurrency 1 across all ids.
    async fn drain(self: Arc<Self>) {
        loop {
            let next = {
                let mut pending = self.pending.lock().unwrap();
                let key = pending.keys().next().cloned();
                key.and_then(|key| pending.remove(&key))
            };
            match next {
                Some(event) => self.apply_event(event).await,
                None => {
                    self.draining.store(false, Ordering::SeqCst);
                    // An event may have slipped in between the final take
                    // and the flag flip; reclaim the drain if so.
                    if self.pending.lock().unwrap().is_empty()
                        || self.draining.swap(true, Ordering::SeqCst)
                    {
                        return;
                    }
                }
            }
        }
    }

    async fn apply_event(&self, event: ChangeEvent) {
        if self.core.is_stopped() {
            return;
        }
        let id = event.conversation_id.clone();
        let (dirty, known_revision) = self
            .core
            .read_state(|s| (s.dirty_op(&id).is_some(), s.remote_revision(&id)));
        if dirty {
            // Local wins until the push (and possibly the 409 path)
            // resolves it.
            log::trace!("realtime: {} is dirty, skipping", id);
            return;
        }
        if known_revision >= Some(event.revision) {
            log::trace!("realtime: already have {} @ {}", id, event.revision);
            return;
        }

        if event.deleted {
            self.core.accept_remote(
                &id,
                &ConversationEnvelope {
                    conversation_id: id.clone(),
                    revision: event.revision,
                    deleted: true,
                    data: None,
                },
            );
            return;
        }

        let transport = self.core.transport.current();
        let mut envelope = match transport.get_conversation(&id).await {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("realtime: fetch of {} failed: {}", id, e);
                self.core
                    .with_state(|s| s.set_error(&id, Some(format!("remote fetch failed: {}", e))));
                return;
            }
        };
        // Read-after-write lag: the event may announce a revision a read
        // replica hasn't caught up to. One short retry absorbs it.
        if envelope.revision < event.revision {
            tokio::time::sleep(self.config.fetch_retry_delay).await;
            match transport.get_conversation(&id).await {
                Ok(fresher) => envelope = fresher,
                Err(e) => {
                    log::warn!("realtime: refetch of {} failed: {}", id, e);
                    return;
                }
            }
        }
        self.core.accept_remote(&id, &envelope);
    }
}
