//! `SQLite`-backed store.
//!
//! A single `kv` table keyed by `(scope, key)` holds every scope. The
//! connection runs in WAL mode so replication reads do not block commit
//! writes. All access funnels through one connection guarded by a mutex;
//! the striped object locks above this layer keep contention per-object,
//! not per-statement.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use super::{KeyValueStore, Scope, StorageError, prefix_upper_bound};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv (
    scope INTEGER NOT NULL,
    key   BLOB    NOT NULL,
    value BLOB    NOT NULL,
    PRIMARY KEY (scope, key)
) WITHOUT ROWID;
";

/// A [`KeyValueStore`] over an `SQLite` file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a private in-memory database, mainly for tests.
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, scope: Scope, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.conn.lock().expect("storage lock poisoned");
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE scope = ?1 AND key = ?2",
                params![scope.tag(), key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, scope: Scope, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("storage lock poisoned");
        conn.execute(
            "INSERT INTO kv (scope, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (scope, key) DO UPDATE SET value = excluded.value",
            params![scope.tag(), key, value],
        )?;
        Ok(())
    }

    fn delete(&self, scope: Scope, key: &[u8]) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("storage lock poisoned");
        conn.execute(
            "DELETE FROM kv WHERE scope = ?1 AND key = ?2",
            params![scope.tag(), key],
        )?;
        Ok(())
    }

    fn scan_prefix(
        &self,
        scope: Scope,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let conn = self.conn.lock().expect("storage lock poisoned");
        let mut pairs = Vec::new();
        match prefix_upper_bound(prefix) {
            Some(upper) => {
                let mut stmt = conn.prepare(
                    "SELECT key, value FROM kv
                     WHERE scope = ?1 AND key >= ?2 AND key < ?3
                     ORDER BY key",
                )?;
                let rows = stmt.query_map(params![scope.tag(), prefix, upper], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;
                for row in rows {
                    pairs.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT key, value FROM kv
                     WHERE scope = ?1 AND key >= ?2
                     ORDER BY key",
                )?;
                let rows = stmt.query_map(params![scope.tag(), prefix], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;
                for row in rows {
                    pairs.push(row?);
                }
            }
        }
        Ok(pairs)
    }
}
