/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The revision store: a persistent `(user, conversation)` map with
//! optimistic-concurrency writes and tombstone deletes. All writes go
//! through the single guarded connection inside a transaction, which is
//! what makes the per-key monotonic-revision invariant hold under
//! concurrent request handlers.

use std::path::Path;
use std::sync::Mutex;

use conversation_id::ConversationId;
use rusqlite::{named_params, Connection};
use serde_json::Value as JsonValue;
use sql_support::open_database::{self, open_database_with_flags, DatabaseLocation};
use sql_support::ConnExt;
use sync_types::{ConversationMeta, Timestamp};

use crate::error::*;
use crate::schema;

/// The result of an upsert or tombstone attempt. `Conflict` carries the
/// current row so the API layer can build the stable 409 body without a
/// second read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { revision: u64, updated_at: Timestamp },
    Conflict { revision: u64, deleted: bool },
    NotFound,
}

/// A full record as returned by `get`. `data` is `None` for tombstones.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationRecord {
    pub conversation_id: ConversationId,
    pub revision: u64,
    pub deleted: bool,
    pub data: Option<JsonValue>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

pub struct SyncStorage {
    conn: Mutex<Connection>,
}

impl SyncStorage {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_database::open_database(
            db_path.as_ref().to_path_buf(),
            schema::migration_logic(),
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory store, used by tests and throwaway deployments.
    pub fn new_in_memory() -> Result<Self> {
        let conn = open_database_with_flags(
            DatabaseLocation::Memory,
            rusqlite::OpenFlags::default(),
            schema::migration_logic(),
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// All present keys for `user`, tombstones included, most recently
    /// updated first.
    pub fn list(&self, user: &str) -> Result<Vec<ConversationMeta>> {
        let conn = self.lock();
        conn.query_rows_and_then(
            "SELECT conversation_id, revision, deleted, updated_at
             FROM conversations
             WHERE user_id = :user
             ORDER BY updated_at DESC",
            named_params! { ":user": user },
            |row| -> Result<ConversationMeta> {
                Ok(ConversationMeta {
                    conversation_id: row.get(0)?,
                    revision: row.get::<_, i64>(1)? as u64,
                    deleted: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        )
    }

    pub fn get(&self, user: &str, id: &ConversationId) -> Result<Option<ConversationRecord>> {
        let conn = self.lock();
        conn.try_query_row(
            "SELECT revision, deleted, data, created_at, updated_at
             FROM conversations
             WHERE user_id = :user AND conversation_id = :id",
            named_params! { ":user": user, ":id": id },
            |row| -> Result<ConversationRecord> {
                let deleted: bool = row.get(1)?;
                let raw: Option<String> = row.get(2)?;
                let data = match raw {
                    Some(json) if !deleted => Some(serde_json::from_str(&json)?),
                    _ => None,
                };
                Ok(ConversationRecord {
                    conversation_id: id.clone(),
                    revision: row.get::<_, i64>(0)? as u64,
                    deleted,
                    data,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
    }

    /// Optimistic-concurrency write. `base_revision = None` has create
    /// semantics and never overwrites an existing row, whatever its state.
    pub fn upsert(
        &self,
        user: &str,
        id: &ConversationId,
        base_revision: Option<u64>,
        data: &JsonValue,
    ) -> Result<WriteOutcome> {
        let json = serde_json::to_string(data)?;
        let now = Timestamp::now();
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let outcome = match base_revision {
            None => {
                let inserted = tx.execute_cached(
                    "INSERT INTO conversations
                        (user_id, conversation_id, revision, deleted, data, created_at, updated_at)
                     VALUES (:user, :id, 1, 0, :data, :now, :now)
                     ON CONFLICT (user_id, conversation_id) DO NOTHING",
                    named_params! { ":user": user, ":id": id, ":data": json, ":now": now },
                )?;
                if inserted == 1 {
                    WriteOutcome::Written {
                        revision: 1,
                        updated_at: now,
                    }
                } else {
                    self.current_row_outcome(&tx, user, id)?
                }
            }
            Some(base) => {
                // Equality on the base revision is the whole trick: a
                // concurrent writer that got in first bumped the revision,
                // so this matches zero rows and we report the conflict.
                let new_revision: Option<i64> = tx.try_query_row(
                    "UPDATE conversations
                     SET revision = revision + 1, deleted = 0, data = :data, updated_at = :now
                     WHERE user_id = :user AND conversation_id = :id AND revision = :base
                     RETURNING revision",
                    named_params! {
                        ":user": user,
                        ":id": id,
                        ":data": json,
                        ":now": now,
                        ":base": base as i64,
                    },
                    |row| -> Result<i64> { Ok(row.get(0)?) },
                )?;
                match new_revision {
                    Some(revision) => WriteOutcome::Written {
                        revision: revision as u64,
                        updated_at: now,
                    },
                    None => self.current_row_outcome(&tx, user, id)?,
                }
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Delete by tombstoning: the row stays, `deleted` is set, `data` is
    /// cleared, and the revision moves up so other clients observe it.
    /// A null base on an absent key creates the tombstone at revision 1.
    pub fn tombstone(
        &self,
        user: &str,
        id: &ConversationId,
        base_revision: Option<u64>,
    ) -> Result<WriteOutcome> {
        let now = Timestamp::now();
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        let outcome = match base_revision {
            None => {
                let inserted = tx.execute_cached(
                    "INSERT INTO conversations
                        (user_id, conversation_id, revision, deleted, data, created_at, updated_at)
                     VALUES (:user, :id, 1, 1, NULL, :now, :now)
                     ON CONFLICT (user_id, conversation_id) DO NOTHING",
                    named_params! { ":user": user, ":id": id, ":now": now },
                )?;
                if inserted == 1 {
                    WriteOutcome::Written {
                        revision: 1,
                        updated_at: now,
                    }
                } else {
                    self.current_row_outcome(&tx, user, id)?
                }
            }
            Some(base) => {
                let new_revision: Option<i64> = tx.try_query_row(
                    "UPDATE conversations
                     SET revision = revision + 1, deleted = 1, data = NULL, updated_at = :now
                     WHERE user_id = :user AND conversation_id = :id AND revision = :base
                     RETURNING revision",
                    named_params! {
                        ":user": user,
                        ":id": id,
                        ":now": now,
                        ":base": base as i64,
                    },
                    |row| -> Result<i64> { Ok(row.get(0)?) },
                )?;
                match new_revision {
                    Some(revision) => WriteOutcome::Written {
                        revision: revision as u64,
                        updated_at: now,
                    },
                    None => self.current_row_outcome(&tx, user, id)?,
                }
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Administrative cleanup: physically remove tombstones older than
    /// `older_than`. This is the only path that ever deletes a row, and it
    /// is deliberately not reachable over HTTP.
    pub fn purge_tombstones(&self, user: &str, older_than: Timestamp) -> Result<usize> {
        let conn = self.lock();
        let purged = conn.execute_cached(
            "DELETE FROM conversations
             WHERE user_id = :user AND deleted = 1 AND updated_at < :cutoff",
            named_params! { ":user": user, ":cutoff": older_than },
        )?;
        if purged > 0 {
            log::info!("purged {} tombstones for user", purged);
        }
        Ok(purged)
    }

    fn current_row_outcome(
        &self,
        conn: &impl ConnExt,
        user: &str,
        id: &ConversationId,
    ) -> Result<WriteOutcome> {
        let current: Option<(i64, bool)> = conn.try_query_row(
            "SELECT revision, deleted FROM conversations
             WHERE user_id = :user AND conversation_id = :id",
            named_params! { ":user": user, ":id": id },
            |row| -> Result<(i64, bool)> { Ok((row.get(0)?, row.get(1)?)) },
        )?;
        Ok(match current {
            Some((revision, deleted)) => WriteOutcome::Conflict {
                revision: revision as u64,
                deleted,
            },
            None => WriteOutcome::NotFound,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            // A poisoned lock means another writer panicked mid-statement;
            // the transaction it was in rolled back, so the data is fine.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
