//! In-memory store backend for tests and light-weight components.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{KeyValueStore, Scope, StorageError};

/// A [`KeyValueStore`] over a sorted in-memory map.
///
/// Mutex poisoning indicates a panic in another thread, which is
/// unrecoverable; lock acquisitions unwrap.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<BTreeMap<(u8, Vec<u8>), Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, scope: Scope, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.inner.read().expect("storage lock poisoned");
        Ok(inner.get(&(scope.tag(), key.to_vec())).cloned())
    }

    fn set(&self, scope: Scope, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().expect("storage lock poisoned");
        inner.insert((scope.tag(), key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, scope: Scope, key: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().expect("storage lock poisoned");
        inner.remove(&(scope.tag(), key.to_vec()));
        Ok(())
    }

    fn scan_prefix(
        &self,
        scope: Scope,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let inner = self.inner.read().expect("storage lock poisoned");
        let pairs = inner
            .range((scope.tag(), prefix.to_vec())..)
            .take_while(|((tag, key), _)| *tag == scope.tag() && key.starts_with(prefix))
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect();
        Ok(pairs)
    }
}
