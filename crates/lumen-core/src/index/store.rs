//! The index store (C2): bucket persistence and filament traversal.
//!
//! Buckets live under the Index scope keyed by pulse then object id, so one
//! prefix scan yields everything the replication gatherer needs for a
//! pulse. Lookups that miss the current pulse fall back through the
//! last-known-pulse pointer, which is maintained on every write.

use std::sync::Arc;

use tracing::debug;

use crate::error::CoreError;
use crate::id::ObjectId;
use crate::pulse::{PULSE_NUMBER_SIZE, PulseNumber};
use crate::record::{PendingFilament, Record, RecordStore};
use crate::storage::{KeyValueStore, Scope};

use super::{FilamentBucket, Lifeline};

/// One resolved filament link: the meta record and the record it threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilamentEntry {
    /// Id of the filament link record.
    pub meta_id: ObjectId,
    /// The filament link itself.
    pub meta: PendingFilament,
    /// Id of the threaded request or result.
    pub record_id: ObjectId,
    /// The threaded request or result.
    pub record: Record,
}

/// The index store.
pub struct IndexStore {
    store: Arc<dyn KeyValueStore>,
    records: Arc<RecordStore>,
}

impl IndexStore {
    /// Builds an index store; filament traversal resolves links through
    /// `records`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, records: Arc<RecordStore>) -> Self {
        Self { store, records }
    }

    /// Persists `bucket` as the snapshot for `pulse` and bumps the
    /// last-known-pulse pointer.
    pub fn set_bucket(&self, pulse: PulseNumber, bucket: &FilamentBucket) -> Result<(), CoreError> {
        self.store.set(
            Scope::Index,
            &index_key(pulse, &bucket.object),
            &bucket.encode(),
        )?;
        self.store.set(
            Scope::LastKnownIndexPulse,
            bucket.object.as_bytes(),
            &pulse.to_be_bytes(),
        )?;
        debug!(object = %bucket.object, %pulse, "index bucket stored");
        Ok(())
    }

    /// Overwrites just the lifeline inside the snapshot for `pulse`,
    /// creating the bucket when absent.
    pub fn set_lifeline(
        &self,
        pulse: PulseNumber,
        object: &ObjectId,
        lifeline: Lifeline,
    ) -> Result<(), CoreError> {
        let mut bucket = match self.bucket(pulse, object) {
            Ok(bucket) => bucket,
            Err(CoreError::NotFound { .. }) => FilamentBucket::new(*object),
            Err(err) => return Err(err),
        };
        bucket.lifeline = lifeline;
        self.set_bucket(pulse, &bucket)
    }

    /// The snapshot stored exactly at (`pulse`, `object`).
    pub fn bucket(&self, pulse: PulseNumber, object: &ObjectId) -> Result<FilamentBucket, CoreError> {
        let bytes = self
            .store
            .get(Scope::Index, &index_key(pulse, object))?
            .ok_or(CoreError::not_found("index bucket"))?;
        Ok(FilamentBucket::decode(&bytes)?)
    }

    /// The snapshot for `object` addressed by `pulse`, falling back to the
    /// last known pulse when the current one has no snapshot yet.
    pub fn bucket_or_latest(
        &self,
        pulse: PulseNumber,
        object: &ObjectId,
    ) -> Result<FilamentBucket, CoreError> {
        match self.bucket(pulse, object) {
            Ok(bucket) => Ok(bucket),
            Err(CoreError::NotFound { .. }) => {
                let last = self
                    .last_known_pulse(object)?
                    .ok_or(CoreError::not_found("lifeline"))?;
                self.bucket(last, object)
            }
            Err(err) => Err(err),
        }
    }

    /// The lifeline for `object` at `pulse` (with fallback).
    pub fn for_id(&self, pulse: PulseNumber, object: &ObjectId) -> Result<Lifeline, CoreError> {
        Ok(self.bucket_or_latest(pulse, object)?.lifeline)
    }

    /// The most recent pulse with a snapshot for `object`.
    pub fn last_known_pulse(&self, object: &ObjectId) -> Result<Option<PulseNumber>, CoreError> {
        let Some(bytes) = self
            .store
            .get(Scope::LastKnownIndexPulse, object.as_bytes())?
        else {
            return Ok(None);
        };
        PulseNumber::from_be_slice(&bytes)
            .map(Some)
            .ok_or_else(|| CoreError::fatal("bad last-known-pulse value"))
    }

    /// Every bucket snapshotted at `pulse`, ordered by object id.
    pub fn for_pulse(&self, pulse: PulseNumber) -> Result<Vec<FilamentBucket>, CoreError> {
        let mut buckets = Vec::new();
        for (_, value) in self
            .store
            .scan_prefix(Scope::Index, &pulse.to_be_bytes())?
        {
            buckets.push(FilamentBucket::decode(&value)?);
        }
        Ok(buckets)
    }

    /// Walks the pending filament of `object` from `read_from` back to
    /// `read_until` (inclusive), oldest entry first.
    ///
    /// Each pulse's bucket lists its filament links; the `previous` pointer
    /// of the oldest link names the pulse to continue from.
    pub fn records(
        &self,
        read_from: PulseNumber,
        read_until: PulseNumber,
        object: &ObjectId,
    ) -> Result<Vec<FilamentEntry>, CoreError> {
        if read_until > read_from {
            return Err(CoreError::InvalidState {
                details: "read_until must not exceed read_from".to_owned(),
            });
        }

        let mut entries = Vec::new();
        let mut current = Some(read_from);
        while let Some(pulse) = current.filter(|p| *p >= read_until) {
            let bucket = self.bucket(pulse, object)?;
            if bucket.pending_records.is_empty() {
                return Err(CoreError::not_found("filament segment"));
            }

            let mut segment = Vec::with_capacity(bucket.pending_records.len());
            for meta_id in &bucket.pending_records {
                segment.push(self.resolve_link(meta_id)?);
            }

            current = segment
                .first()
                .and_then(|entry| entry.meta.previous)
                .map(|prev| prev.pulse());
            segment.extend(entries);
            entries = segment;
        }
        Ok(entries)
    }

    fn resolve_link(&self, meta_id: &ObjectId) -> Result<FilamentEntry, CoreError> {
        let meta_material = self.records.for_id(meta_id)?;
        let Record::PendingFilament(meta) = meta_material.record else {
            return Err(CoreError::fatal(format!(
                "filament link {meta_id} is not a pending-filament record"
            )));
        };
        let target = self.records.for_id(&meta.record_id)?;
        Ok(FilamentEntry {
            meta_id: *meta_id,
            record_id: meta.record_id,
            record: target.record,
            meta,
        })
    }
}

fn index_key(pulse: PulseNumber, object: &ObjectId) -> Vec<u8> {
    let mut key = Vec::with_capacity(PULSE_NUMBER_SIZE + object.as_bytes().len());
    key.extend_from_slice(&pulse.to_be_bytes());
    key.extend_from_slice(object.as_bytes());
    key
}
