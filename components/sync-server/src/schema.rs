/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::Connection;
use sql_support::open_database::{ErrorHandling, MigrationLogic, Result as MigrationResult};
use sql_support::ConnExt;

// One row per (user, conversation). `data` is the caller's opaque JSON
// blob; it is NULL exactly when `deleted` is set. `revision` starts at 1
// and only ever moves up - tombstoned rows stay around so that other
// clients observe the delete.
const CREATE_SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS conversations (
        user_id          TEXT NOT NULL,
        conversation_id  TEXT NOT NULL,
        revision         INTEGER NOT NULL CHECK (revision >= 1),
        deleted          INTEGER NOT NULL DEFAULT 0,
        data             TEXT,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL,
        PRIMARY KEY (user_id, conversation_id)
    );
";

// list() is always "everything for one user, most recently touched first".
const CREATE_INDEX_SQL: &str = "
    CREATE INDEX IF NOT EXISTS idx_conversations_user_updated
        ON conversations (user_id, updated_at DESC);
";

fn prepare(conn: &Connection) -> MigrationResult<()> {
    let initial_pragmas = "
        -- We don't care about temp tables being persisted to disk.
        PRAGMA temp_store = 2;
        -- we unconditionally want write-ahead-logging mode.
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
    ";
    conn.execute_batch(initial_pragmas)?;
    conn.set_prepared_statement_cache_capacity(128);
    Ok(())
}

fn init(conn: &Connection) -> MigrationResult<()> {
    log::debug!("Creating schema");
    conn.execute_all(&[CREATE_SCHEMA_SQL, CREATE_INDEX_SQL])?;
    Ok(())
}

pub fn migration_logic() -> MigrationLogic {
    MigrationLogic {
        name: "conversations db".to_string(),
        start_version: 1,
        end_version: 1,
        prepare: Some(prepare),
        init,
        upgrades: vec![],
        finish: None,
        // This is the server's source of truth; losing it is never an
        // acceptable recovery strategy.
        error_handling: ErrorHandling::ReturnError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sql_support::open_database::test_utils::open_memory_database;

    #[test]
    fn test_create_schema_twice() {
        let conn = open_memory_database(migration_logic()).unwrap();
        conn.execute_batch(CREATE_SCHEMA_SQL)
            .expect("should allow running twice");
    }

    #[test]
    fn test_revision_check_constraint() {
        let conn = open_memory_database(migration_logic()).unwrap();
        let res = conn.execute(
            "INSERT INTO conversations
                (user_id, conversation_id, revision, deleted, data, created_at, updated_at)
             VALUES ('u', 'c', 0, 0, NULL, 1, 1)",
            [],
        );
        assert!(res.is_err(), "revision 0 should violate the check");
    }
}
