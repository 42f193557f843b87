//! Scoped key-value persistence.
//!
//! The core's only durable resource is a key-value store partitioned by
//! [`Scope`]. Components own disjoint scopes and never write into each
//! other's. The [`KeyValueStore`] trait has two backends: an SQLite file in
//! WAL mode for nodes and an in-memory map for tests.
//!
//! Semantics every backend must provide: read-your-writes, single writer per
//! key, and lexicographic key order within a scope for prefix scans.

mod memory;
mod sqlite;

#[cfg(test)]
mod tests;

use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage partitions. The numeric value is part of the on-disk layout and
/// must never be reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Scope {
    /// Pulse log entries, keyed by pulse number.
    Pulse = 1,
    /// Immutable record bytes, keyed by record id.
    Record = 2,
    /// Lifeline/filament buckets, keyed by pulse then object id.
    Index = 3,
    /// Last pulse with an index snapshot per object, keyed by object id.
    LastKnownIndexPulse = 4,
    /// Jet-keeper ack state and the top-sync cursor.
    JetKeeper = 5,
    /// Blob payloads, keyed by blob id.
    Blob = 6,
    /// Per-(jet, pulse) drop commitments.
    Drop = 7,
}

impl Scope {
    /// The scope's byte tag in backend keys.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

/// Errors from the storage layer.
///
/// Everything here is an invariant violation or an environment fault; callers
/// generally map these to the fatal kind.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing database reported an error.
    #[error("storage backend error: {details}")]
    Backend {
        /// Backend-specific description.
        details: String,
    },

    /// Stored bytes failed validation on read.
    #[error("corrupt value under scope {scope:?}: {details}")]
    Corrupt {
        /// The scope holding the bad value.
        scope: Scope,
        /// What failed to parse or verify.
        details: String,
    },
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend {
            details: err.to_string(),
        }
    }
}

impl From<StorageError> for crate::error::CoreError {
    fn from(err: StorageError) -> Self {
        Self::fatal(err.to_string())
    }
}

/// A scoped key-value store.
///
/// Object-safe so components can share one backend behind
/// `Arc<dyn KeyValueStore>`.
pub trait KeyValueStore: Send + Sync {
    /// Reads the value under (`scope`, `key`), if present.
    fn get(&self, scope: Scope, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Writes the value under (`scope`, `key`), replacing any previous one.
    fn set(&self, scope: Scope, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Deletes the value under (`scope`, `key`). Deleting a missing key is
    /// not an error.
    fn delete(&self, scope: Scope, key: &[u8]) -> Result<(), StorageError>;

    /// Returns all `(key, value)` pairs whose key starts with `prefix`,
    /// ordered by key. An empty prefix scans the whole scope.
    fn scan_prefix(
        &self,
        scope: Scope,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
}

/// Smallest byte string strictly greater than every key with `prefix`, or
/// `None` when the prefix is all `0xff` and no upper bound exists.
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(bound);
        }
        bound.pop();
    }
    None
}
