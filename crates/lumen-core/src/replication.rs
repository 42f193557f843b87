//! Replication (C10): streaming a pulse from light to heavy.
//!
//! The gatherer packages everything a (pulse, jet) pair produced (records,
//! index buckets, the drop commitment and blob payloads) into one
//! `HeavyPayload`. Serialization is deterministic: records sort by hash,
//! indices by object id, so two gathers of the same data are byte-equal.
//!
//! The heavy side verifies the drop against the records it received, stores
//! everything, and acks its jet keeper. Hot-object handoff rides the same
//! module: the closing executor sends open lifelines to the next executor,
//! which installs them and marks its tree leaf actual.

use std::sync::Arc;

use prost::Message;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto::digest32;
use crate::error::CoreError;
use crate::id::ObjectId;
use crate::index::{FilamentBucket, IndexStore};
use crate::jet::{JetId, TreeStore};
use crate::keeper::JetKeeper;
use crate::message::{HeavyPayload, HotObjects};
use crate::pulse::{GENESIS_PULSE, PulseLog, PulseNumber};
use crate::record::{BlobStore, MaterialRecord, RecordStore};
use crate::storage::{KeyValueStore, Scope};

/// The per-(jet, pulse) Merkle commitment over records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drop {
    /// The committed pulse.
    pub pulse: PulseNumber,
    /// The committed jet.
    pub jet: JetId,
    /// Merkle root over the sorted record encodings.
    pub root: [u8; 32],
}

impl Drop {
    /// Serializes the drop.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        DropProto {
            pulse: self.pulse.get(),
            jet: self.jet.to_wire(),
            root: self.root.to_vec(),
        }
        .encode_to_vec()
    }

    /// Deserializes a drop.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        let proto = DropProto::decode(bytes).map_err(|err| CoreError::InvalidState {
            details: format!("malformed drop: {err}"),
        })?;
        Ok(Self {
            pulse: PulseNumber::new(proto.pulse),
            jet: JetId::from_wire(&proto.jet).ok_or_else(|| CoreError::InvalidState {
                details: "malformed drop jet".to_owned(),
            })?,
            root: proto
                .root
                .as_slice()
                .try_into()
                .map_err(|_| CoreError::InvalidState {
                    details: "malformed drop root".to_owned(),
                })?,
        })
    }
}

#[derive(Clone, PartialEq, Message)]
struct DropProto {
    #[prost(uint32, tag = "1")]
    pulse: u32,
    #[prost(bytes = "vec", tag = "2")]
    jet: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    root: Vec<u8>,
}

/// One blob riding in a heavy payload: the owning state record id plus the
/// bytes.
#[derive(Clone, PartialEq, Message)]
pub struct BlobEntry {
    /// The state record the blob belongs to.
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    /// The blob bytes.
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Merkle root over record encodings. An empty jet commits to the digest of
/// the empty string, which is still pulse-independent and deterministic.
#[must_use]
pub fn merkle_root(leaves: &[Vec<u8>]) -> [u8; 32] {
    if leaves.is_empty() {
        return digest32(&[]);
    }
    let mut level: Vec<[u8; 32]> = leaves.iter().map(|leaf| digest32(leaf)).collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                if let [left, right] = pair {
                    let mut buf = [0u8; 64];
                    buf[..32].copy_from_slice(left);
                    buf[32..].copy_from_slice(right);
                    digest32(&buf)
                } else {
                    // odd node is promoted unchanged
                    pair[0]
                }
            })
            .collect();
    }
    level[0]
}

/// Persistence for drops, keyed by pulse then jet.
pub struct DropStore {
    store: Arc<dyn KeyValueStore>,
}

impl DropStore {
    /// Builds a drop store over the shared backend.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Persists a drop.
    pub fn set(&self, drop: &Drop) -> Result<(), CoreError> {
        self.store
            .set(Scope::Drop, &drop_key(drop.pulse, &drop.jet), &drop.encode())?;
        Ok(())
    }

    /// Loads the drop for (`pulse`, `jet`).
    pub fn for_pulse_and_jet(&self, pulse: PulseNumber, jet: &JetId) -> Result<Drop, CoreError> {
        let bytes = self
            .store
            .get(Scope::Drop, &drop_key(pulse, jet))?
            .ok_or(CoreError::not_found("drop"))?;
        Drop::decode(&bytes)
    }
}

fn drop_key(pulse: PulseNumber, jet: &JetId) -> Vec<u8> {
    let mut key = pulse.to_be_bytes().to_vec();
    key.extend_from_slice(&jet.to_wire());
    key
}

/// The light-side gatherer.
pub struct DataGatherer {
    records: Arc<RecordStore>,
    indices: Arc<IndexStore>,
    blobs: Arc<BlobStore>,
    drops: Arc<DropStore>,
    tree: Arc<TreeStore>,
}

impl DataGatherer {
    /// Wires the gatherer to the light stores.
    #[must_use]
    pub fn new(
        records: Arc<RecordStore>,
        indices: Arc<IndexStore>,
        blobs: Arc<BlobStore>,
        drops: Arc<DropStore>,
        tree: Arc<TreeStore>,
    ) -> Self {
        Self {
            records,
            indices,
            blobs,
            drops,
            tree,
        }
    }

    /// Packages everything (`pulse`, `jet`) produced, computing and
    /// persisting the drop on the way.
    pub fn for_pulse_and_jet(
        &self,
        pulse: PulseNumber,
        jet: &JetId,
    ) -> Result<HeavyPayload, CoreError> {
        let records = self.records.for_pulse(jet, pulse)?;
        let record_bytes: Vec<Vec<u8>> = records
            .iter()
            .map(|(_, material)| material.marshal())
            .collect();

        let drop = Drop {
            pulse,
            jet: *jet,
            root: merkle_root(&record_bytes),
        };
        self.drops.set(&drop)?;

        let indexes: Vec<Vec<u8>> = self
            .indices
            .for_pulse(pulse)?
            .into_iter()
            .filter(|bucket| self.tree.find(pulse, &bucket.object).0 == *jet)
            .map(|bucket| bucket.encode())
            .collect();

        let mut blobs = Vec::new();
        for (id, material) in &records {
            if !material.record.is_state() {
                continue;
            }
            match self.blobs.for_id(id) {
                Ok(value) => blobs.push(
                    BlobEntry {
                        id: id.to_vec(),
                        value,
                    }
                    .encode_to_vec(),
                ),
                Err(CoreError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        debug!(
            %pulse,
            %jet,
            records = record_bytes.len(),
            indexes = indexes.len(),
            blobs = blobs.len(),
            "gathered heavy payload"
        );
        Ok(HeavyPayload {
            pulse: pulse.get(),
            jet: jet.to_wire(),
            records: record_bytes,
            indexes,
            drop: drop.encode(),
            blobs,
        })
    }

    /// Packages the hot lifelines of (`closing`, `jet`) for the node that
    /// executes the jet at `next`.
    pub fn gather_hot(
        &self,
        closing: PulseNumber,
        next: PulseNumber,
        jet: &JetId,
    ) -> Result<HotObjects, CoreError> {
        let drop = match self.drops.for_pulse_and_jet(closing, jet) {
            Ok(drop) => drop.encode(),
            Err(CoreError::NotFound { .. }) => Vec::new(),
            Err(err) => return Err(err),
        };
        let indexes: Vec<Vec<u8>> = self
            .indices
            .for_pulse(closing)?
            .into_iter()
            .filter(|bucket| self.tree.find(closing, &bucket.object).0 == *jet)
            .map(|bucket| bucket.encode())
            .collect();
        Ok(HotObjects {
            pulse: next.get(),
            jet: jet.to_wire(),
            drop,
            indexes,
        })
    }
}

/// The heavy-side receiver.
pub struct HeavyReplicator {
    records: Arc<RecordStore>,
    indices: Arc<IndexStore>,
    blobs: Arc<BlobStore>,
    drops: Arc<DropStore>,
    keeper: Arc<JetKeeper>,
}

impl HeavyReplicator {
    /// Wires the replicator to the heavy stores and keeper.
    #[must_use]
    pub fn new(
        records: Arc<RecordStore>,
        indices: Arc<IndexStore>,
        blobs: Arc<BlobStore>,
        drops: Arc<DropStore>,
        keeper: Arc<JetKeeper>,
    ) -> Self {
        Self {
            records,
            indices,
            blobs,
            drops,
            keeper,
        }
    }

    /// Verifies and stores one heavy payload, then acks the keeper.
    pub fn apply(&self, payload: &HeavyPayload) -> Result<(), CoreError> {
        let pulse = PulseNumber::new(payload.pulse);
        let jet = JetId::from_wire(&payload.jet).ok_or_else(|| CoreError::InvalidState {
            details: "heavy payload names a malformed jet".to_owned(),
        })?;

        let drop = Drop::decode(&payload.drop)?;
        if drop.root != merkle_root(&payload.records) {
            return Err(CoreError::InvalidState {
                details: format!("drop root mismatch for {jet} at {pulse}"),
            });
        }

        for bytes in &payload.records {
            let material = MaterialRecord::unmarshal(bytes)?;
            let id = material.record.id_at(pulse);
            self.records.set(&id, &material)?;
        }
        for bytes in &payload.indexes {
            let bucket = FilamentBucket::decode(bytes)?;
            self.indices.set_bucket(pulse, &bucket)?;
        }
        for bytes in &payload.blobs {
            let entry = BlobEntry::decode(bytes.as_slice()).map_err(|err| {
                CoreError::InvalidState {
                    details: format!("malformed blob entry: {err}"),
                }
            })?;
            let id = ObjectId::try_from_slice(&entry.id).map_err(|err| {
                CoreError::InvalidState {
                    details: format!("malformed blob id: {err}"),
                }
            })?;
            self.blobs.set(&id, &entry.value)?;
        }
        self.drops.set(&drop)?;

        info!(%pulse, %jet, records = payload.records.len(), "heavy payload stored");
        self.keeper.add_jet(pulse, jet)
    }

    /// Records a light executor's hot handoff confirmation.
    pub fn confirm_hot(&self, pulse: PulseNumber, jet: JetId) -> Result<(), CoreError> {
        self.keeper.add_hot_confirmation(pulse, jet)
    }
}

/// Installs a hot-objects handoff on the receiving light node: buckets are
/// carried into the new pulse and the tree leaf becomes actual.
pub fn apply_hot_objects(
    indices: &IndexStore,
    tree: &TreeStore,
    msg: &HotObjects,
) -> Result<JetId, CoreError> {
    let pulse = PulseNumber::new(msg.pulse);
    let jet = JetId::from_wire(&msg.jet).ok_or_else(|| CoreError::InvalidState {
        details: "hot objects name a malformed jet".to_owned(),
    })?;

    for bytes in &msg.indexes {
        let bucket = FilamentBucket::decode(bytes)?;
        indices.set_bucket(pulse, &bucket.carried_forward())?;
    }
    tree.update(pulse, jet, true)?;
    debug!(%pulse, %jet, buckets = msg.indexes.len(), "hot objects installed");
    Ok(jet)
}

/// Evicts light data for pulses the keeper has confirmed synced.
pub struct LightCleaner {
    records: Arc<RecordStore>,
    blobs: Arc<BlobStore>,
    trees: Arc<TreeStore>,
    pulses: Arc<PulseLog>,
    evicted_up_to: std::sync::Mutex<PulseNumber>,
}

impl LightCleaner {
    /// Builds a cleaner; nothing below genesis is ever evicted twice.
    #[must_use]
    pub fn new(
        records: Arc<RecordStore>,
        blobs: Arc<BlobStore>,
        trees: Arc<TreeStore>,
        pulses: Arc<PulseLog>,
    ) -> Self {
        Self {
            records,
            blobs,
            trees,
            pulses,
            evicted_up_to: std::sync::Mutex::new(GENESIS_PULSE),
        }
    }

    /// Drops records, blobs and trees for every log pulse in
    /// `(last evicted, top]`.
    pub fn evict_up_to(&self, top: PulseNumber) -> Result<usize, CoreError> {
        let mut cursor = self.evicted_up_to.lock().expect("cleaner lock poisoned");
        let mut evicted = 0usize;
        let mut current = *cursor;
        loop {
            let next = match self.pulses.forwards(current, 1) {
                Ok(pulse) => pulse.number,
                Err(CoreError::NotFound { .. }) => break,
                Err(err) => return Err(err),
            };
            if next > top {
                break;
            }
            evicted += self.records.delete_for_pulse(next)?;
            evicted += self.blobs.delete_for_pulse(next)?;
            self.trees.remove(next);
            current = next;
        }
        if current > *cursor {
            info!(up_to = %current, items = evicted, "evicted synced light data");
        }
        *cursor = current;
        Ok(evicted)
    }

    /// Drives eviction from keeper notifications until `ctx` cancels.
    pub async fn run(
        &self,
        mut top_sync: watch::Receiver<PulseNumber>,
        ctx: CancellationToken,
    ) {
        loop {
            let top = *top_sync.borrow_and_update();
            if let Err(err) = self.evict_up_to(top) {
                warn!(%err, "light eviction failed, will retry on next advance");
            }
            tokio::select! {
                changed = top_sync.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                () = ctx.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::id::{RECORD_HASH_SIZE, Reference};
    use crate::index::Lifeline;
    use crate::pulse::{ENTROPY_SIZE, Pulse};
    use crate::record::{ActivateRecord, Record, ResultRecord};
    use crate::storage::MemoryStore;

    use super::*;

    const P1: PulseNumber = PulseNumber::new(65636);
    const P2: PulseNumber = PulseNumber::new(65646);

    struct Side {
        records: Arc<RecordStore>,
        indices: Arc<IndexStore>,
        blobs: Arc<BlobStore>,
        drops: Arc<DropStore>,
        tree: Arc<TreeStore>,
        pulses: Arc<PulseLog>,
        store: Arc<MemoryStore>,
    }

    fn side() -> Side {
        let store = Arc::new(MemoryStore::new());
        let records = Arc::new(RecordStore::new(store.clone()));
        let indices = Arc::new(IndexStore::new(store.clone(), records.clone()));
        let blobs = Arc::new(BlobStore::new(store.clone()));
        let drops = Arc::new(DropStore::new(store.clone()));
        let tree = Arc::new(TreeStore::new());
        let pulses = Arc::new(PulseLog::open(store.clone()).expect("open log"));
        pulses.append(Pulse::genesis()).expect("genesis");
        pulses
            .append(Pulse {
                number: P1,
                prev: GENESIS_PULSE,
                next: P2,
                unix_time: 0,
                entropy: [0u8; ENTROPY_SIZE],
            })
            .expect("p1");
        Side {
            records,
            indices,
            blobs,
            drops,
            tree,
            pulses,
            store,
        }
    }

    fn gatherer(side: &Side) -> DataGatherer {
        DataGatherer::new(
            side.records.clone(),
            side.indices.clone(),
            side.blobs.clone(),
            side.drops.clone(),
            side.tree.clone(),
        )
    }

    fn oid(seed: u8) -> ObjectId {
        ObjectId::new(P1, [seed; RECORD_HASH_SIZE])
    }

    /// Seeds one result record, one activation (with blob) and one bucket.
    fn seed_light(side: &Side) -> (ObjectId, ObjectId) {
        let result = Record::Result(ResultRecord {
            object: oid(1),
            request: oid(2),
            payload: vec![5],
        });
        let result_id = result.id_at(P1);
        side.records
            .set(&result_id, &MaterialRecord { record: result, jet: JetId::ROOT })
            .expect("store result");

        let activate = Record::Activate(ActivateRecord {
            request: Reference::from_object(oid(3)),
            memory: vec![0xaa, 0xbb],
            parent: Reference::from_object(oid(4)),
        });
        let activate_id = activate.id_at(P1);
        side.records
            .set(
                &activate_id,
                &MaterialRecord { record: activate, jet: JetId::ROOT },
            )
            .expect("store activate");
        side.blobs.set(&activate_id, &[0xaa, 0xbb]).expect("blob");

        let mut bucket = FilamentBucket::new(oid(1));
        bucket.lifeline = Lifeline {
            latest_state: Some(activate_id),
            ..Lifeline::default()
        };
        bucket.open_requests = vec![oid(2)];
        side.indices.set_bucket(P1, &bucket).expect("bucket");

        (result_id, activate_id)
    }

    #[test]
    fn merkle_root_is_deterministic_and_order_sensitive() {
        let a = vec![vec![1u8], vec![2u8], vec![3u8]];
        let b = vec![vec![1u8], vec![2u8], vec![3u8]];
        let c = vec![vec![3u8], vec![2u8], vec![1u8]];
        assert_eq!(merkle_root(&a), merkle_root(&b));
        assert_ne!(merkle_root(&a), merkle_root(&c));
        assert_eq!(merkle_root(&[]), merkle_root(&[]));
    }

    #[test]
    fn gather_is_deterministic() {
        let side = side();
        seed_light(&side);
        let g = gatherer(&side);
        let one = g.for_pulse_and_jet(P1, &JetId::ROOT).expect("gather");
        let two = g.for_pulse_and_jet(P1, &JetId::ROOT).expect("gather");
        assert_eq!(one, two);
        assert_eq!(one.records.len(), 2);
        assert_eq!(one.indexes.len(), 1);
        assert_eq!(one.blobs.len(), 1);
    }

    #[test]
    fn heavy_apply_round_trips_and_acks_the_keeper() {
        let light = side();
        let (result_id, activate_id) = seed_light(&light);
        let payload = gatherer(&light)
            .for_pulse_and_jet(P1, &JetId::ROOT)
            .expect("gather");

        let heavy = side();
        let keeper = Arc::new(
            JetKeeper::new(heavy.store.clone(), heavy.tree.clone(), heavy.pulses.clone())
                .expect("keeper"),
        );
        let replicator = HeavyReplicator::new(
            heavy.records.clone(),
            heavy.indices.clone(),
            heavy.blobs.clone(),
            heavy.drops.clone(),
            keeper.clone(),
        );
        replicator.apply(&payload).expect("apply");

        assert!(heavy.records.for_id(&result_id).is_ok());
        assert!(heavy.records.for_id(&activate_id).is_ok());
        assert_eq!(heavy.blobs.for_id(&activate_id).expect("blob"), vec![0xaa, 0xbb]);
        assert!(heavy.indices.bucket(P1, &oid(1)).is_ok());
        assert!(heavy.drops.for_pulse_and_jet(P1, &JetId::ROOT).is_ok());

        // data ack landed; the pulse completes once hot is confirmed too
        assert_eq!(keeper.top_sync_pulse(), GENESIS_PULSE);
        replicator.confirm_hot(P1, JetId::ROOT).expect("hot");
        assert_eq!(keeper.top_sync_pulse(), P1);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let light = side();
        seed_light(&light);
        let mut payload = gatherer(&light)
            .for_pulse_and_jet(P1, &JetId::ROOT)
            .expect("gather");
        payload.records[0].push(0xff);

        let heavy = side();
        let keeper = Arc::new(
            JetKeeper::new(heavy.store.clone(), heavy.tree.clone(), heavy.pulses.clone())
                .expect("keeper"),
        );
        let replicator = HeavyReplicator::new(
            heavy.records,
            heavy.indices,
            heavy.blobs,
            heavy.drops,
            keeper.clone(),
        );
        assert!(matches!(
            replicator.apply(&payload),
            Err(CoreError::InvalidState { .. })
        ));
        assert_eq!(keeper.top_sync_pulse(), GENESIS_PULSE);
    }

    #[test]
    fn hot_handoff_installs_buckets_and_marks_the_leaf_actual() {
        let side = side();
        seed_light(&side);
        let hot = gatherer(&side)
            .gather_hot(P1, P2, &JetId::ROOT)
            .expect("gather hot");
        assert_eq!(hot.indexes.len(), 1);

        let receiver = self::side();
        let jet = apply_hot_objects(&receiver.indices, &receiver.tree, &hot).expect("apply");
        assert_eq!(jet, JetId::ROOT);

        let bucket = receiver.indices.bucket(P2, &oid(1)).expect("bucket");
        assert!(bucket.pending_records.is_empty(), "per-pulse links reset");
        assert_eq!(bucket.open_requests, vec![oid(2)], "open work survives");
        let (_, actual) = receiver.tree.find(P2, &oid(1));
        assert!(actual);
    }

    #[test]
    fn cleaner_evicts_only_synced_pulses() {
        let side = side();
        seed_light(&side);
        side.pulses
            .append(Pulse {
                number: P2,
                prev: P1,
                next: PulseNumber::new(65656),
                unix_time: 0,
                entropy: [0u8; ENTROPY_SIZE],
            })
            .expect("p2");
        let late = Record::Result(ResultRecord {
            object: oid(9),
            request: oid(8),
            payload: Vec::new(),
        });
        let late_id = late.id_at(P2);
        side.records
            .set(&late_id, &MaterialRecord { record: late, jet: JetId::ROOT })
            .expect("late record");

        let cleaner = LightCleaner::new(
            side.records.clone(),
            side.blobs.clone(),
            side.tree.clone(),
            side.pulses.clone(),
        );

        // nothing synced yet
        assert_eq!(cleaner.evict_up_to(GENESIS_PULSE).expect("noop"), 0);
        assert!(side.records.for_pulse(&JetId::ROOT, P1).expect("scan").len() > 0);

        // P1 synced: its records and blobs go, P2 stays
        let evicted = cleaner.evict_up_to(P1).expect("evict");
        assert!(evicted > 0);
        assert!(side.records.for_pulse(&JetId::ROOT, P1).expect("scan").is_empty());
        assert!(side.records.for_id(&late_id).is_ok());

        // re-running does not re-evict
        assert_eq!(cleaner.evict_up_to(P1).expect("noop"), 0);
    }
}
