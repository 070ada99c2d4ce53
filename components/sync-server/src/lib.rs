/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The authoritative half of conversation sync: a per-user revision log
//! with optimistic concurrency and tombstone deletes, exposed over a small
//! JSON API plus a server-sent-events change feed.

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod error;
pub mod events;
pub mod notifier;
mod schema;
pub mod storage;

pub use crate::api::{router, AppState, AUTH_USER_HEADER, DEFAULT_MAX_BODY_BYTES};
pub use crate::error::{Result, SyncServerError};
pub use crate::events::EventStreamConfig;
pub use crate::notifier::ChangeNotifier;
pub use crate::storage::{ConversationRecord, SyncStorage, WriteOutcome};
