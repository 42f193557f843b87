//! The append-only pulse log.
//!
//! Total-ordered, never forked. Appends are gap-checked against the previous
//! entry; navigation is positional over the entries actually present.
//!
//! Each persisted entry carries a digest over its encoding. A torn write
//! (process killed mid-append) fails the digest check and the entry is
//! discarded on open, which makes append atomic from the reader's point of
//! view.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::crypto::record_hash;
use crate::error::CoreError;
use crate::id::RECORD_HASH_SIZE;
use crate::storage::{KeyValueStore, Scope};

use super::{Pulse, PulseNumber};

/// The pulse log (C3).
pub struct PulseLog {
    store: Arc<dyn KeyValueStore>,
    cache: RwLock<BTreeMap<u32, Pulse>>,
}

impl PulseLog {
    /// Opens the log, loading and verifying every persisted entry.
    ///
    /// Entries whose digest does not match are dropped from storage and
    /// skipped; this is how a torn append is healed.
    pub fn open(store: Arc<dyn KeyValueStore>) -> Result<Self, CoreError> {
        let mut cache = BTreeMap::new();
        for (key, value) in store.scan_prefix(Scope::Pulse, &[])? {
            match decode_entry(&value) {
                Some(pulse) => {
                    cache.insert(pulse.number.get(), pulse);
                }
                None => {
                    warn!(key = ?key, "discarding pulse entry with bad digest");
                    store.delete(Scope::Pulse, &key)?;
                }
            }
        }
        Ok(Self {
            store,
            cache: RwLock::new(cache),
        })
    }

    /// Appends a pulse to the log.
    ///
    /// # Errors
    ///
    /// [`CoreError::OutOfOrder`] when the number does not increase or the
    /// pulse's `prev` does not name the current latest. The genesis pulse is
    /// exempt from the `prev` check.
    pub fn append(&self, pulse: Pulse) -> Result<(), CoreError> {
        let mut cache = self.cache.write().expect("pulse log lock poisoned");
        if let Some((&last_number, last)) = cache.iter().next_back() {
            if pulse.number.get() <= last_number {
                return Err(CoreError::OutOfOrder {
                    last: last.number,
                    got: pulse.number,
                });
            }
            if !pulse.number.is_genesis() && pulse.prev != last.number {
                return Err(CoreError::OutOfOrder {
                    last: last.number,
                    got: pulse.number,
                });
            }
        }
        self.store.set(
            Scope::Pulse,
            &pulse.number.to_be_bytes(),
            &encode_entry(&pulse),
        )?;
        cache.insert(pulse.number.get(), pulse);
        Ok(())
    }

    /// The most recently appended pulse.
    pub fn latest(&self) -> Result<Pulse, CoreError> {
        let cache = self.cache.read().expect("pulse log lock poisoned");
        cache
            .values()
            .next_back()
            .copied()
            .ok_or(CoreError::not_found("pulse"))
    }

    /// The pulse with exactly the given number.
    pub fn for_pulse(&self, number: PulseNumber) -> Result<Pulse, CoreError> {
        let cache = self.cache.read().expect("pulse log lock poisoned");
        cache
            .get(&number.get())
            .copied()
            .ok_or(CoreError::not_found("pulse"))
    }

    /// The pulse `steps` entries after `from` in the log.
    pub fn forwards(&self, from: PulseNumber, steps: usize) -> Result<Pulse, CoreError> {
        let cache = self.cache.read().expect("pulse log lock poisoned");
        if !cache.contains_key(&from.get()) {
            return Err(CoreError::not_found("pulse"));
        }
        cache
            .range(from.get()..)
            .nth(steps)
            .map(|(_, pulse)| *pulse)
            .ok_or(CoreError::not_found("pulse"))
    }

    /// The pulse `steps` entries before `from` in the log.
    ///
    /// Stepping backwards past the first entry (genesis) yields `NotFound`.
    pub fn backwards(&self, from: PulseNumber, steps: usize) -> Result<Pulse, CoreError> {
        let cache = self.cache.read().expect("pulse log lock poisoned");
        if !cache.contains_key(&from.get()) {
            return Err(CoreError::not_found("pulse"));
        }
        cache
            .range(..=from.get())
            .rev()
            .nth(steps)
            .map(|(_, pulse)| *pulse)
            .ok_or(CoreError::not_found("pulse"))
    }
}

fn encode_entry(pulse: &Pulse) -> Vec<u8> {
    let body = pulse.encode();
    let mut entry = Vec::with_capacity(RECORD_HASH_SIZE + body.len());
    entry.extend_from_slice(&record_hash(&body));
    entry.extend_from_slice(&body);
    entry
}

fn decode_entry(entry: &[u8]) -> Option<Pulse> {
    if entry.len() < RECORD_HASH_SIZE {
        return None;
    }
    let (digest, body) = entry.split_at(RECORD_HASH_SIZE);
    if digest != record_hash(body) {
        return None;
    }
    Pulse::decode(body).ok()
}
