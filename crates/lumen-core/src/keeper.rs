//! The jet keeper (C9): pulse-completion consensus and TopSyncPulse.
//!
//! Light replicators report two acks per (pulse, jet): data uploaded
//! (`add_jet`) and hot objects handed off (`add_hot_confirmation`). A pulse
//! is complete when every leaf the jet tree expects has both acks and the
//! previous pulse is already synced (or genesis). Completion raises
//! TopSyncPulse and cascades forward through successors that were already
//! complete and waiting; an in-flight early pulse must not strand a
//! finished later one.
//!
//! TopSyncPulse is monotone non-decreasing and durable. Once it reaches P,
//! light data of every pulse up to P may be discarded.

use std::sync::{Arc, RwLock};

use prost::Message;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::jet::{JetId, TreeStore};
use crate::pulse::{GENESIS_PULSE, PulseLog, PulseNumber};
use crate::storage::{KeyValueStore, Scope};

const ACKS_KEY_PREFIX: u8 = 0x01;
const SYNC_KEY_PREFIX: u8 = 0x02;

/// Ack state of one jet within a pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JetAck {
    jet: JetId,
    jet_confirmed: bool,
    hot_confirmed: bool,
}

impl JetAck {
    const fn is_confirmed(&self) -> bool {
        self.jet_confirmed && self.hot_confirmed
    }
}

/// The jet keeper.
pub struct JetKeeper {
    store: Arc<dyn KeyValueStore>,
    trees: Arc<TreeStore>,
    pulses: Arc<PulseLog>,
    lock: RwLock<()>,
    notify: watch::Sender<PulseNumber>,
}

impl JetKeeper {
    /// Opens the keeper, restoring the persisted TopSyncPulse cursor.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        trees: Arc<TreeStore>,
        pulses: Arc<PulseLog>,
    ) -> Result<Self, CoreError> {
        let top = read_top(store.as_ref())?;
        let (notify, _) = watch::channel(top);
        Ok(Self {
            store,
            trees,
            pulses,
            lock: RwLock::new(()),
            notify,
        })
    }

    /// Records that `jet`'s data of `pulse` reached the heavy store, then
    /// checks pulse completion.
    pub fn add_jet(&self, pulse: PulseNumber, jet: JetId) -> Result<(), CoreError> {
        let _guard = self.lock.write().expect("keeper lock poisoned");
        debug!(%pulse, %jet, "data-sync ack");
        self.update_jet(pulse, jet, true, false)?;
        self.propagate(pulse)
    }

    /// Records that `jet`'s hot objects of `pulse` were handed off, then
    /// checks pulse completion.
    pub fn add_hot_confirmation(&self, pulse: PulseNumber, jet: JetId) -> Result<(), CoreError> {
        let _guard = self.lock.write().expect("keeper lock poisoned");
        debug!(%pulse, %jet, "hot-confirmation ack");
        self.update_jet(pulse, jet, false, true)?;
        self.propagate(pulse)
    }

    /// The highest fully synced pulse.
    #[must_use]
    pub fn top_sync_pulse(&self) -> PulseNumber {
        let _guard = self.lock.read().expect("keeper lock poisoned");
        read_top(self.store.as_ref()).unwrap_or(GENESIS_PULSE)
    }

    /// Subscribes to TopSyncPulse advances. Delivery is at-least-once of
    /// the monotonically non-decreasing current value.
    #[must_use]
    pub fn watch_top_sync(&self) -> watch::Receiver<PulseNumber> {
        self.notify.subscribe()
    }

    fn update_jet(
        &self,
        pulse: PulseNumber,
        jet: JetId,
        jet_confirmed: bool,
        hot_confirmed: bool,
    ) -> Result<(), CoreError> {
        let mut acks = self.acks(pulse)?;
        match acks.iter_mut().find(|ack| ack.jet == jet) {
            Some(ack) => {
                ack.jet_confirmed |= jet_confirmed;
                ack.hot_confirmed |= hot_confirmed;
            }
            None => acks.push(JetAck {
                jet,
                jet_confirmed,
                hot_confirmed,
            }),
        }
        self.set_acks(pulse, &acks)
    }

    /// Raises TopSyncPulse as far as completed pulses allow, starting at
    /// `pulse`.
    fn propagate(&self, pulse: PulseNumber) -> Result<(), CoreError> {
        let prev = self.pulses.backwards(pulse, 1)?.number;
        let top = read_top(self.store.as_ref())?;
        if prev != top && !prev.is_genesis() {
            return Ok(());
        }

        let mut current = pulse;
        while self.pulse_complete(current)? {
            write_top(self.store.as_ref(), current)?;
            self.notify.send_replace(current);
            debug!(pulse = %current, "pulse completed, top-sync advanced");

            match self.pulses.forwards(current, 1) {
                Ok(next) => current = next.number,
                Err(CoreError::NotFound { .. }) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Whether every expected leaf of `pulse` has both acks.
    fn pulse_complete(&self, pulse: PulseNumber) -> Result<bool, CoreError> {
        let expected = self.trees.all(pulse);
        let acks = self.acks(pulse)?;

        if expected.len() != acks.len() {
            if acks.len() > expected.len() {
                warn!(
                    %pulse,
                    expected = expected.len(),
                    actual = acks.len(),
                    "more confirmed jets than the tree expects"
                );
            }
            return Ok(false);
        }
        if acks.iter().any(|ack| !ack.is_confirmed()) {
            return Ok(false);
        }
        for jet in &expected {
            if !acks.iter().any(|ack| ack.jet == *jet) {
                warn!(%pulse, %jet, "ack set diverges from the tree");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn acks(&self, pulse: PulseNumber) -> Result<Vec<JetAck>, CoreError> {
        let Some(bytes) = self.store.get(Scope::JetKeeper, &acks_key(pulse))? else {
            return Ok(Vec::new());
        };
        let proto = JetAckListProto::decode(bytes.as_slice())
            .map_err(|err| CoreError::fatal(format!("corrupt keeper acks: {err}")))?;
        proto
            .acks
            .into_iter()
            .map(|ack| {
                Ok(JetAck {
                    jet: JetId::from_wire(&ack.jet)
                        .ok_or_else(|| CoreError::fatal("corrupt keeper jet id"))?,
                    jet_confirmed: ack.jet_confirmed,
                    hot_confirmed: ack.hot_confirmed,
                })
            })
            .collect()
    }

    fn set_acks(&self, pulse: PulseNumber, acks: &[JetAck]) -> Result<(), CoreError> {
        let proto = JetAckListProto {
            acks: acks
                .iter()
                .map(|ack| JetAckProto {
                    jet: ack.jet.to_wire(),
                    jet_confirmed: ack.jet_confirmed,
                    hot_confirmed: ack.hot_confirmed,
                })
                .collect(),
        };
        self.store
            .set(Scope::JetKeeper, &acks_key(pulse), &proto.encode_to_vec())?;
        Ok(())
    }
}

fn acks_key(pulse: PulseNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(ACKS_KEY_PREFIX);
    key.extend_from_slice(&pulse.to_be_bytes());
    key
}

fn sync_key() -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(SYNC_KEY_PREFIX);
    key.extend_from_slice(&GENESIS_PULSE.to_be_bytes());
    key
}

fn read_top(store: &dyn KeyValueStore) -> Result<PulseNumber, CoreError> {
    match store.get(Scope::JetKeeper, &sync_key())? {
        Some(bytes) => PulseNumber::from_be_slice(&bytes)
            .ok_or_else(|| CoreError::fatal("corrupt top-sync cursor")),
        None => Ok(GENESIS_PULSE),
    }
}

fn write_top(store: &dyn KeyValueStore, pulse: PulseNumber) -> Result<(), CoreError> {
    store.set(Scope::JetKeeper, &sync_key(), &pulse.to_be_bytes())?;
    Ok(())
}

#[derive(Clone, PartialEq, Message)]
struct JetAckProto {
    #[prost(bytes = "vec", tag = "1")]
    jet: Vec<u8>,
    #[prost(bool, tag = "2")]
    jet_confirmed: bool,
    #[prost(bool, tag = "3")]
    hot_confirmed: bool,
}

#[derive(Clone, PartialEq, Message)]
struct JetAckListProto {
    #[prost(message, repeated, tag = "1")]
    acks: Vec<JetAckProto>,
}
