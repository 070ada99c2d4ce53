/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The `/sync/events` stream: server-sent events carrying
//! `conversation_changed` notifications, with keep-alive pings and a hard
//! TTL. The TTL is what lets the external session-gating middleware
//! re-check authorization - clients are told to reconnect (`retry:`) and
//! every reconnect passes through the gates again.

use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use sync_types::event_names;
use tokio::sync::broadcast;

use crate::api::{AppState, AuthUser};

#[derive(Clone, Debug)]
pub struct EventStreamConfig {
    /// Interval between `ping` events.
    pub keep_alive: Duration,
    /// How long a connection lives before the server sends `close` and
    /// drops it.
    pub ttl: Duration,
    /// The `retry:` reconnect-delay hint sent on connect.
    pub retry_hint: Duration,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(25),
            ttl: Duration::from_secs(60),
            retry_hint: Duration::from_secs(3),
        }
    }
}

pub async fn events(State(state): State<AppState>, AuthUser(user): AuthUser) -> Response {
    let mut sub = state.notifier.subscribe(&user);
    let cfg = state.events.clone();

    let stream = stream! {
        yield Ok::<_, Infallible>(Event::default().retry(cfg.retry_hint));
        yield Ok(Event::default().event(event_names::READY).data("{}"));

        let ttl = tokio::time::sleep(cfg.ttl);
        tokio::pin!(ttl);
        let mut ping =
            tokio::time::interval_at(tokio::time::Instant::now() + cfg.keep_alive, cfg.keep_alive);

        loop {
            tokio::select! {
                // The TTL fires even when the client is idle.
                _ = &mut ttl => {
                    yield Ok(Event::default().event(event_names::CLOSE).data("{}"));
                    break;
                }
                _ = ping.tick() => {
                    yield Ok(Event::default().event(event_names::PING).data("{}"));
                }
                recv = sub.rx.recv() => match recv {
                    Ok(change) => {
                        let json = serde_json::to_string(&change)
                            .expect("change events don't fail to serialize");
                        yield Ok(Event::default()
                            .event(event_names::CONVERSATION_CHANGED)
                            .data(json));
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // The client refetches from list state anyway, so
                        // dropped notifications are not a correctness issue.
                        log::warn!("events: subscriber lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        // `sub` drops here, which removes this subscriber from the
        // notifier registry. The same happens when the client disconnects
        // mid-stream and the generator is dropped.
    };

    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-transform"),
    );
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}
