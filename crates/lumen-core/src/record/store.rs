//! Append-only record and blob stores (C1).
//!
//! Records are keyed by id under the Record scope. Content addressing makes
//! commits idempotent: re-storing identical bytes under the same id is a
//! no-op, storing different bytes under the same id is a collision error.
//! Records are never mutated; the only removal path is pulse-range eviction
//! after the jet keeper confirms the pulse synced to heavy.

use std::sync::Arc;

use tracing::debug;

use crate::error::CoreError;
use crate::id::ObjectId;
use crate::jet::JetId;
use crate::pulse::PulseNumber;
use crate::storage::{KeyValueStore, Scope};

use super::MaterialRecord;

/// The record store.
pub struct RecordStore {
    store: Arc<dyn KeyValueStore>,
}

impl RecordStore {
    /// Builds a record store over the shared backend.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Commits a record under `id`.
    ///
    /// Returns `true` when the record is new, `false` when identical bytes
    /// were already stored (idempotent re-commit).
    ///
    /// # Errors
    ///
    /// [`CoreError::DuplicateRecord`] when `id` is taken by different bytes.
    pub fn set(&self, id: &ObjectId, record: &MaterialRecord) -> Result<bool, CoreError> {
        let bytes = record.marshal();
        if let Some(existing) = self.store.get(Scope::Record, id.as_bytes())? {
            if existing == bytes {
                debug!(%id, "record re-commit is idempotent");
                return Ok(false);
            }
            return Err(CoreError::DuplicateRecord { id: *id });
        }
        self.store.set(Scope::Record, id.as_bytes(), &bytes)?;
        Ok(true)
    }

    /// Loads the record stored under `id`.
    pub fn for_id(&self, id: &ObjectId) -> Result<MaterialRecord, CoreError> {
        let bytes = self
            .store
            .get(Scope::Record, id.as_bytes())?
            .ok_or(CoreError::not_found("record"))?;
        Ok(MaterialRecord::unmarshal(&bytes)?)
    }

    /// All records committed under `jet` at `pulse`, ordered by id.
    ///
    /// Record ids start with their creation pulse, so this is one prefix
    /// scan plus a jet filter.
    pub fn for_pulse(
        &self,
        jet: &JetId,
        pulse: PulseNumber,
    ) -> Result<Vec<(ObjectId, MaterialRecord)>, CoreError> {
        let mut records = Vec::new();
        for (key, value) in self
            .store
            .scan_prefix(Scope::Record, &pulse.to_be_bytes())?
        {
            let id = ObjectId::try_from_slice(&key)
                .map_err(|err| CoreError::fatal(format!("bad record key: {err}")))?;
            let material = MaterialRecord::unmarshal(&value)?;
            if material.jet == *jet {
                records.push((id, material));
            }
        }
        Ok(records)
    }

    /// Removes every record of `pulse`. Light eviction only; callers must
    /// have seen `TopSyncPulse >= pulse` first.
    pub fn delete_for_pulse(&self, pulse: PulseNumber) -> Result<usize, CoreError> {
        let keys: Vec<_> = self
            .store
            .scan_prefix(Scope::Record, &pulse.to_be_bytes())?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.store.delete(Scope::Record, key)?;
        }
        Ok(keys.len())
    }
}

/// State-memory payloads, stored out of line from their records.
pub struct BlobStore {
    store: Arc<dyn KeyValueStore>,
}

impl BlobStore {
    /// Builds a blob store over the shared backend.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Stores blob bytes under `id`. Idempotent like records.
    pub fn set(&self, id: &ObjectId, value: &[u8]) -> Result<(), CoreError> {
        if let Some(existing) = self.store.get(Scope::Blob, id.as_bytes())? {
            if existing == value {
                return Ok(());
            }
            return Err(CoreError::DuplicateRecord { id: *id });
        }
        self.store.set(Scope::Blob, id.as_bytes(), value)?;
        Ok(())
    }

    /// Loads the blob stored under `id`.
    pub fn for_id(&self, id: &ObjectId) -> Result<Vec<u8>, CoreError> {
        self.store
            .get(Scope::Blob, id.as_bytes())?
            .ok_or(CoreError::not_found("blob"))
    }

    /// All blobs of `pulse`, ordered by id.
    pub fn for_pulse(&self, pulse: PulseNumber) -> Result<Vec<(ObjectId, Vec<u8>)>, CoreError> {
        let mut blobs = Vec::new();
        for (key, value) in self.store.scan_prefix(Scope::Blob, &pulse.to_be_bytes())? {
            let id = ObjectId::try_from_slice(&key)
                .map_err(|err| CoreError::fatal(format!("bad blob key: {err}")))?;
            blobs.push((id, value));
        }
        Ok(blobs)
    }

    /// Removes every blob of `pulse`.
    pub fn delete_for_pulse(&self, pulse: PulseNumber) -> Result<usize, CoreError> {
        let keys: Vec<_> = self
            .store
            .scan_prefix(Scope::Blob, &pulse.to_be_bytes())?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.store.delete(Scope::Blob, key)?;
        }
        Ok(keys.len())
    }
}
