/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The client half of conversation sync: a change watcher over the local
//! conversation store, a dirty-queue uploader with optimistic concurrency,
//! a conflict resolver that preserves losing edits as conflict copies, a
//! mute registry that breaks feedback loops, and a realtime channel that
//! refetches what other devices change.
//!
//! The embedding app provides two seams: a [`ConversationStore`] (where
//! conversations live) and a [`StateStore`] (where the engine persists its
//! bookkeeping blob). Everything else is wired up by [`SyncAgent::start`].

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

mod agent;
mod conflict;
mod engine;
pub mod error;
pub mod mute;
pub mod realtime;
pub mod record;
pub mod state;
pub mod store;
pub mod transport;
mod uploader;
mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::agent::{SyncAgent, SyncAgentConfig, SyncAgentHandle};
pub use crate::error::{Result, SyncClientError};
pub use crate::mute::{MuteGuard, MuteRegistry};
pub use crate::realtime::{EventSource, HttpEventSource, RealtimeConfig, SseFrame, SseParser};
pub use crate::record::{Conversation, Message, CONFLICT_COPY_SUFFIX};
pub use crate::state::{DirtyOp, MemoryStateStore, StateStore, SyncState};
pub use crate::store::{ConversationStore, MemoryConversationStore, StoreObserver, StoreSnapshot};
pub use crate::transport::{
    DisabledTransport, HttpTransport, SwappableTransport, SyncTransport, TransportError,
};
pub use crate::watcher::WatcherConfig;
