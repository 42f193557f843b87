//! Lifelines and filament buckets.
//!
//! A lifeline is the mutable head summarizing an object's immutable
//! history. It is snapshotted per pulse: the bucket stored under
//! (pulse, object) carries the lifeline plus the filament bookkeeping for
//! that pulse. Encoding preserves empty collections so a decoded bucket
//! compares equal to what was stored.

mod store;

pub use store::{FilamentEntry, IndexStore};

use prost::Message;

use crate::id::{ObjectId, Reference};
use crate::record::{RecordError, RecordKind};
use crate::pulse::PulseNumber;

/// The kind of the record a lifeline's latest state points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateKind {
    /// No state yet (lifeline being created).
    #[default]
    Unset,
    /// Latest state is an activation.
    Activate,
    /// Latest state is an amendment.
    Amend,
    /// Latest state is a deactivation; the lifeline is closed.
    Deactivate,
}

impl StateKind {
    fn to_wire(self) -> u32 {
        match self {
            Self::Unset => 0,
            Self::Activate => RecordKind::Activate as u32,
            Self::Amend => RecordKind::Amend as u32,
            Self::Deactivate => RecordKind::Deactivate as u32,
        }
    }

    fn from_wire(value: u32) -> Result<Self, RecordError> {
        match value {
            0 => Ok(Self::Unset),
            v if v == RecordKind::Activate as u32 => Ok(Self::Activate),
            v if v == RecordKind::Amend as u32 => Ok(Self::Amend),
            v if v == RecordKind::Deactivate as u32 => Ok(Self::Deactivate),
            other => Err(RecordError::BadStateKind(other)),
        }
    }
}

/// The mutable head of an object's history.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Lifeline {
    /// Id of the latest state record.
    pub latest_state: Option<ObjectId>,
    /// Id of the latest state a validator approved.
    pub latest_state_approved: Option<ObjectId>,
    /// Kind of the latest state record.
    pub latest_state_kind: StateKind,
    /// Id of the most recent child registration.
    pub child_pointer: Option<ObjectId>,
    /// Delegation table: type reference to delegate reference.
    pub delegates: Vec<(Reference, Reference)>,
    /// Head of the pending filament.
    pub pending_pointer: Option<ObjectId>,
    /// Earliest pulse with a still-open request.
    pub earliest_open_request: Option<PulseNumber>,
    /// The parent lifeline.
    pub parent: Reference,
}

impl Lifeline {
    /// Whether the lifeline was closed by a deactivation.
    #[must_use]
    pub fn is_deactivated(&self) -> bool {
        self.latest_state_kind == StateKind::Deactivate
    }

    /// Encodes the lifeline. Delegates are sorted by type reference first so
    /// the encoding is canonical.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.to_wire().encode_to_vec()
    }

    /// Decodes a lifeline, preserving empty collections.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        Self::from_wire(&LifelineProto::decode(bytes)?)
    }

    fn to_wire(&self) -> LifelineProto {
        let mut delegates: Vec<_> = self
            .delegates
            .iter()
            .map(|(type_ref, delegate)| DelegateProto {
                type_ref: encode_ref(type_ref),
                delegate: encode_ref(delegate),
            })
            .collect();
        delegates.sort_by(|a, b| a.type_ref.cmp(&b.type_ref));
        LifelineProto {
            latest_state: encode_opt_id(self.latest_state.as_ref()),
            latest_state_approved: encode_opt_id(self.latest_state_approved.as_ref()),
            latest_state_kind: self.latest_state_kind.to_wire(),
            child_pointer: encode_opt_id(self.child_pointer.as_ref()),
            delegates,
            pending_pointer: encode_opt_id(self.pending_pointer.as_ref()),
            earliest_open_request: self.earliest_open_request.map_or(0, PulseNumber::get),
            parent: encode_ref(&self.parent),
        }
    }

    fn from_wire(proto: &LifelineProto) -> Result<Self, RecordError> {
        Ok(Self {
            latest_state: decode_opt_id(&proto.latest_state)?,
            latest_state_approved: decode_opt_id(&proto.latest_state_approved)?,
            latest_state_kind: StateKind::from_wire(proto.latest_state_kind)?,
            child_pointer: decode_opt_id(&proto.child_pointer)?,
            delegates: proto
                .delegates
                .iter()
                .map(|delegate| {
                    Ok((
                        decode_ref(&delegate.type_ref)?,
                        decode_ref(&delegate.delegate)?,
                    ))
                })
                .collect::<Result<_, RecordError>>()?,
            pending_pointer: decode_opt_id(&proto.pending_pointer)?,
            earliest_open_request: match proto.earliest_open_request {
                0 => None,
                n => Some(PulseNumber::new(n)),
            },
            parent: decode_ref(&proto.parent)?,
        })
    }
}

/// The per-(pulse, object) index snapshot: lifeline plus filament state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilamentBucket {
    /// The object this bucket indexes.
    pub object: ObjectId,
    /// The lifeline snapshot.
    pub lifeline: Lifeline,
    /// Filament link records added during this pulse, oldest first.
    pub pending_records: Vec<ObjectId>,
    /// Requests still unclosed, oldest first.
    pub open_requests: Vec<ObjectId>,
}

impl FilamentBucket {
    /// A fresh bucket for `object` with an empty lifeline.
    #[must_use]
    pub fn new(object: ObjectId) -> Self {
        Self {
            object,
            lifeline: Lifeline::default(),
            pending_records: Vec::new(),
            open_requests: Vec::new(),
        }
    }

    /// Carries the bucket into a new pulse: the lifeline and open requests
    /// survive, per-pulse filament links start empty.
    #[must_use]
    pub fn carried_forward(&self) -> Self {
        Self {
            object: self.object,
            lifeline: self.lifeline.clone(),
            pending_records: Vec::new(),
            open_requests: self.open_requests.clone(),
        }
    }

    /// Serializes the bucket.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        BucketProto {
            object: self.object.to_vec(),
            lifeline: Some(self.lifeline.to_wire()),
            pending_records: self.pending_records.iter().map(ObjectId::to_vec).collect(),
            open_requests: self.open_requests.iter().map(ObjectId::to_vec).collect(),
        }
        .encode_to_vec()
    }

    /// Deserializes a bucket.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let proto = BucketProto::decode(bytes)?;
        let lifeline = proto
            .lifeline
            .as_ref()
            .map(Lifeline::from_wire)
            .transpose()?
            .unwrap_or_default();
        Ok(Self {
            object: ObjectId::try_from_slice(&proto.object)?,
            lifeline,
            pending_records: proto
                .pending_records
                .iter()
                .map(|bytes| ObjectId::try_from_slice(bytes))
                .collect::<Result<_, _>>()?,
            open_requests: proto
                .open_requests
                .iter()
                .map(|bytes| ObjectId::try_from_slice(bytes))
                .collect::<Result<_, _>>()?,
        })
    }
}

#[derive(Clone, PartialEq, Message)]
struct LifelineProto {
    #[prost(bytes = "vec", tag = "1")]
    latest_state: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    latest_state_approved: Vec<u8>,
    #[prost(uint32, tag = "3")]
    latest_state_kind: u32,
    #[prost(bytes = "vec", tag = "4")]
    child_pointer: Vec<u8>,
    #[prost(message, repeated, tag = "5")]
    delegates: Vec<DelegateProto>,
    #[prost(bytes = "vec", tag = "6")]
    pending_pointer: Vec<u8>,
    #[prost(uint32, tag = "7")]
    earliest_open_request: u32,
    #[prost(bytes = "vec", tag = "8")]
    parent: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct DelegateProto {
    #[prost(bytes = "vec", tag = "1")]
    type_ref: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    delegate: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct BucketProto {
    #[prost(bytes = "vec", tag = "1")]
    object: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    lifeline: Option<LifelineProto>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pending_records: Vec<Vec<u8>>,
    #[prost(bytes = "vec", repeated, tag = "4")]
    open_requests: Vec<Vec<u8>>,
}

fn encode_ref(reference: &Reference) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(reference.object.as_bytes());
    bytes.extend_from_slice(reference.domain.as_bytes());
    bytes
}

fn decode_ref(bytes: &[u8]) -> Result<Reference, RecordError> {
    if bytes.len() != 64 {
        return Err(RecordError::Id(crate::id::IdError::BadLength {
            expected: 64,
            actual: bytes.len(),
        }));
    }
    Ok(Reference::new(
        ObjectId::try_from_slice(&bytes[..32])?,
        ObjectId::try_from_slice(&bytes[32..])?,
    ))
}

fn encode_opt_id(id: Option<&ObjectId>) -> Vec<u8> {
    id.map_or_else(Vec::new, ObjectId::to_vec)
}

fn decode_opt_id(bytes: &[u8]) -> Result<Option<ObjectId>, RecordError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(ObjectId::try_from_slice(bytes)?))
}

#[cfg(test)]
mod tests {
    use crate::id::RECORD_HASH_SIZE;

    use super::*;

    fn oid(seed: u8) -> ObjectId {
        ObjectId::new(PulseNumber::new(65636), [seed; RECORD_HASH_SIZE])
    }

    fn rref(seed: u8) -> Reference {
        Reference::new(oid(seed), oid(seed.wrapping_add(1)))
    }

    #[test]
    fn lifeline_encode_decode_identity() {
        let lifeline = Lifeline {
            latest_state: Some(oid(1)),
            latest_state_approved: None,
            latest_state_kind: StateKind::Amend,
            child_pointer: Some(oid(3)),
            delegates: vec![(rref(10), rref(20)), (rref(4), rref(5))],
            pending_pointer: Some(oid(6)),
            earliest_open_request: Some(PulseNumber::new(65636)),
            parent: rref(8),
        };
        let mut expected = lifeline.clone();
        // canonical encoding sorts the delegate table
        expected.delegates.sort_by(|a, b| {
            encode_ref(&a.0).cmp(&encode_ref(&b.0))
        });
        assert_eq!(Lifeline::decode(&lifeline.encode()).expect("decode"), expected);
    }

    #[test]
    fn empty_lifeline_stays_empty() {
        let lifeline = Lifeline::default();
        let decoded = Lifeline::decode(&lifeline.encode()).expect("decode");
        assert_eq!(decoded, lifeline);
        assert!(decoded.delegates.is_empty());
        assert_eq!(decoded.latest_state, None);
        assert_eq!(decoded.earliest_open_request, None);
        assert!(!decoded.is_deactivated());
    }

    #[test]
    fn bucket_round_trip_preserves_empty_collections() {
        let bucket = FilamentBucket::new(oid(9));
        let decoded = FilamentBucket::decode(&bucket.encode()).expect("decode");
        assert_eq!(decoded, bucket);
        assert!(decoded.pending_records.is_empty());
        assert!(decoded.open_requests.is_empty());

        let mut filled = bucket;
        filled.pending_records = vec![oid(1), oid(2)];
        filled.open_requests = vec![oid(3)];
        filled.lifeline.latest_state_kind = StateKind::Activate;
        let decoded = FilamentBucket::decode(&filled.encode()).expect("decode");
        assert_eq!(decoded, filled);
    }

    #[test]
    fn carried_forward_resets_per_pulse_links() {
        let mut bucket = FilamentBucket::new(oid(9));
        bucket.pending_records = vec![oid(1)];
        bucket.open_requests = vec![oid(2)];
        bucket.lifeline.latest_state = Some(oid(3));

        let next = bucket.carried_forward();
        assert!(next.pending_records.is_empty());
        assert_eq!(next.open_requests, bucket.open_requests);
        assert_eq!(next.lifeline, bucket.lifeline);
    }

    #[test]
    fn deactivated_flag_tracks_state_kind() {
        let mut lifeline = Lifeline::default();
        lifeline.latest_state_kind = StateKind::Deactivate;
        assert!(lifeline.is_deactivated());
        let decoded = Lifeline::decode(&lifeline.encode()).expect("decode");
        assert!(decoded.is_deactivated());
    }
}
