//! Records: the immutable units of object history.
//!
//! A record is a tagged union with a fixed variant list; adding or dropping
//! a variant is a versioned wire change. Records are encoded canonically
//! with explicit field tags so the content hash is stable across nodes: the
//! record id is the creation pulse plus the first 28 bytes of SHA-256 over
//! the canonical bytes.
//!
//! The domain types here carry checked identifiers; the `*Proto` structs
//! mirror them field-for-field in wire-friendly form and exist only at the
//! encode/decode boundary.

mod store;

pub use store::{BlobStore, RecordStore};

use prost::Message;

use crate::crypto::record_hash;
use crate::error::CoreError;
use crate::id::{IdError, ObjectId, RECORD_HASH_SIZE, Reference};
use crate::jet::JetId;
use crate::pulse::PulseNumber;

/// Errors raised while decoding record bytes.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The bytes were not a valid encoding.
    #[error("malformed record encoding: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The union carried no variant.
    #[error("record body missing")]
    MissingBody,

    /// An embedded identifier had the wrong shape.
    #[error(transparent)]
    Id(#[from] IdError),

    /// An embedded jet id had the wrong shape.
    #[error("bad jet encoding")]
    BadJet,

    /// The return-mode discriminant is not in the table.
    #[error("unknown return mode {0}")]
    BadReturnMode(u32),

    /// The state-kind discriminant is not in the table.
    #[error("unknown state kind {0}")]
    BadStateKind(u32),
}

impl From<RecordError> for CoreError {
    fn from(err: RecordError) -> Self {
        Self::InvalidState {
            details: err.to_string(),
        }
    }
}

/// How the caller of a request wants its result delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnMode {
    /// Block until the matching result arrives.
    #[default]
    Wait = 0,
    /// Fire and forget; only the registration ack is returned.
    NoWait = 1,
}

impl TryFrom<u32> for ReturnMode {
    type Error = RecordError;

    fn try_from(value: u32) -> Result<Self, RecordError> {
        match value {
            0 => Ok(Self::Wait),
            1 => Ok(Self::NoWait),
            other => Err(RecordError::BadReturnMode(other)),
        }
    }
}

/// Numeric record discriminants. Values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecordKind {
    /// The unique genesis record.
    Genesis = 1,
    /// Registration of a child object under a parent lifeline.
    Child = 2,
    /// Marks a jet split in the record history.
    Jet = 3,
    /// A request arriving at an object.
    IncomingRequest = 4,
    /// A request leaving an object.
    OutgoingRequest = 5,
    /// The result closing a request.
    Result = 6,
    /// Immutable contract code.
    Code = 7,
    /// First state of a lifeline.
    Activate = 8,
    /// A state amendment chained to the previous state.
    Amend = 9,
    /// Terminal state of a lifeline.
    Deactivate = 10,
    /// A link in an object's pending filament.
    PendingFilament = 11,
}

/// The genesis record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenesisRecord {
    /// Seed hash of the deployment.
    pub hash: Vec<u8>,
}

/// Registration of a child object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRecord {
    /// The previous child registration, if any.
    pub prev_child: Option<ObjectId>,
    /// The child being registered.
    pub child: Reference,
}

/// Marks that a jet was split at this point of history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JetRecord {
    /// The jet that split.
    pub jet: JetId,
}

/// A request arriving at an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    /// Who calls.
    pub caller: Reference,
    /// The called object; `None` for constructor calls.
    pub object: Option<Reference>,
    /// Method name.
    pub method: String,
    /// Serialized call arguments.
    pub arguments: Vec<u8>,
    /// The record that caused this request.
    pub reason: Reference,
    /// Correlates the request with an API call.
    pub api_request_id: String,
    /// Result delivery mode.
    pub return_mode: ReturnMode,
    /// Caller-chosen uniqueness salt.
    pub nonce: u64,
}

/// A request leaving an object toward another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRequest {
    /// Who calls.
    pub caller: Reference,
    /// The callee, if already known.
    pub object: Option<Reference>,
    /// Method name.
    pub method: String,
    /// Serialized call arguments.
    pub arguments: Vec<u8>,
    /// The incoming request that caused this one.
    pub reason: Reference,
    /// Result delivery mode.
    pub return_mode: ReturnMode,
    /// Caller-chosen uniqueness salt.
    pub nonce: u64,
}

/// The result closing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    /// The object the result belongs to.
    pub object: ObjectId,
    /// The request being closed.
    pub request: ObjectId,
    /// Serialized result payload.
    pub payload: Vec<u8>,
}

/// Immutable contract code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRecord {
    /// The code blob.
    pub code: Vec<u8>,
    /// Machine type discriminant for the executor.
    pub machine: u32,
}

/// First state of a lifeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateRecord {
    /// The request that activates the object.
    pub request: Reference,
    /// Initial object memory.
    pub memory: Vec<u8>,
    /// The parent lifeline.
    pub parent: Reference,
}

/// A state amendment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmendRecord {
    /// The request that caused the amendment.
    pub request: Reference,
    /// New object memory.
    pub memory: Vec<u8>,
    /// The state this amendment supersedes.
    pub prev_state: ObjectId,
}

/// Terminal state of a lifeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeactivateRecord {
    /// The request that deactivates the object.
    pub request: Reference,
    /// The state being closed out.
    pub prev_state: ObjectId,
}

/// One link of a pending filament.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFilament {
    /// The request or result record this link threads.
    pub record_id: ObjectId,
    /// The previous filament link, if any.
    pub previous: Option<ObjectId>,
}

/// The record union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// See [`GenesisRecord`].
    Genesis(GenesisRecord),
    /// See [`ChildRecord`].
    Child(ChildRecord),
    /// See [`JetRecord`].
    Jet(JetRecord),
    /// See [`IncomingRequest`].
    IncomingRequest(IncomingRequest),
    /// See [`OutgoingRequest`].
    OutgoingRequest(OutgoingRequest),
    /// See [`ResultRecord`].
    Result(ResultRecord),
    /// See [`CodeRecord`].
    Code(CodeRecord),
    /// See [`ActivateRecord`].
    Activate(ActivateRecord),
    /// See [`AmendRecord`].
    Amend(AmendRecord),
    /// See [`DeactivateRecord`].
    Deactivate(DeactivateRecord),
    /// See [`PendingFilament`].
    PendingFilament(PendingFilament),
}

impl Record {
    /// The variant's numeric discriminant.
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::Genesis(_) => RecordKind::Genesis,
            Self::Child(_) => RecordKind::Child,
            Self::Jet(_) => RecordKind::Jet,
            Self::IncomingRequest(_) => RecordKind::IncomingRequest,
            Self::OutgoingRequest(_) => RecordKind::OutgoingRequest,
            Self::Result(_) => RecordKind::Result,
            Self::Code(_) => RecordKind::Code,
            Self::Activate(_) => RecordKind::Activate,
            Self::Amend(_) => RecordKind::Amend,
            Self::Deactivate(_) => RecordKind::Deactivate,
            Self::PendingFilament(_) => RecordKind::PendingFilament,
        }
    }

    /// Whether this record opens a request.
    #[must_use]
    pub const fn is_request(&self) -> bool {
        matches!(self, Self::IncomingRequest(_) | Self::OutgoingRequest(_))
    }

    /// Whether this record is a lifeline state.
    #[must_use]
    pub const fn is_state(&self) -> bool {
        matches!(
            self,
            Self::Activate(_) | Self::Amend(_) | Self::Deactivate(_)
        )
    }

    /// Canonical bytes: the encoding that is hashed and signed.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.to_wire().encode_to_vec()
    }

    /// The 28-byte content hash over the canonical bytes.
    #[must_use]
    pub fn content_hash(&self) -> [u8; RECORD_HASH_SIZE] {
        record_hash(&self.canonical_bytes())
    }

    /// The record's id when created at `pulse`.
    #[must_use]
    pub fn id_at(&self, pulse: PulseNumber) -> ObjectId {
        ObjectId::new(pulse, self.content_hash())
    }

    /// Serializes the record for wire or storage.
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        self.canonical_bytes()
    }

    /// Deserializes a record, validating identifiers.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, RecordError> {
        Self::from_wire(&VirtualRecord::decode(bytes)?)
    }

    fn to_wire(&self) -> VirtualRecord {
        let body = match self {
            Self::Genesis(rec) => RecordBody::Genesis(GenesisProto {
                hash: rec.hash.clone(),
            }),
            Self::Child(rec) => RecordBody::Child(ChildProto {
                prev_child: encode_opt_id(rec.prev_child.as_ref()),
                child: encode_ref(&rec.child),
            }),
            Self::Jet(rec) => RecordBody::Jet(JetProto {
                jet: rec.jet.to_wire(),
            }),
            Self::IncomingRequest(rec) => RecordBody::Incoming(IncomingRequestProto {
                caller: encode_ref(&rec.caller),
                object: encode_opt_ref(rec.object.as_ref()),
                method: rec.method.clone(),
                arguments: rec.arguments.clone(),
                reason: encode_ref(&rec.reason),
                api_request_id: rec.api_request_id.clone(),
                return_mode: rec.return_mode as u32,
                nonce: rec.nonce,
            }),
            Self::OutgoingRequest(rec) => RecordBody::Outgoing(OutgoingRequestProto {
                caller: encode_ref(&rec.caller),
                object: encode_opt_ref(rec.object.as_ref()),
                method: rec.method.clone(),
                arguments: rec.arguments.clone(),
                reason: encode_ref(&rec.reason),
                return_mode: rec.return_mode as u32,
                nonce: rec.nonce,
            }),
            Self::Result(rec) => RecordBody::Result(ResultProto {
                object: rec.object.to_vec(),
                request: rec.request.to_vec(),
                payload: rec.payload.clone(),
            }),
            Self::Code(rec) => RecordBody::Code(CodeProto {
                code: rec.code.clone(),
                machine: rec.machine,
            }),
            Self::Activate(rec) => RecordBody::Activate(ActivateProto {
                request: encode_ref(&rec.request),
                memory: rec.memory.clone(),
                parent: encode_ref(&rec.parent),
            }),
            Self::Amend(rec) => RecordBody::Amend(AmendProto {
                request: encode_ref(&rec.request),
                memory: rec.memory.clone(),
                prev_state: rec.prev_state.to_vec(),
            }),
            Self::Deactivate(rec) => RecordBody::Deactivate(DeactivateProto {
                request: encode_ref(&rec.request),
                prev_state: rec.prev_state.to_vec(),
            }),
            Self::PendingFilament(rec) => RecordBody::Pending(PendingFilamentProto {
                record_id: rec.record_id.to_vec(),
                previous: encode_opt_id(rec.previous.as_ref()),
            }),
        };
        VirtualRecord { body: Some(body) }
    }

    fn from_wire(wire: &VirtualRecord) -> Result<Self, RecordError> {
        let body = wire.body.as_ref().ok_or(RecordError::MissingBody)?;
        Ok(match body {
            RecordBody::Genesis(proto) => Self::Genesis(GenesisRecord {
                hash: proto.hash.clone(),
            }),
            RecordBody::Child(proto) => Self::Child(ChildRecord {
                prev_child: decode_opt_id(&proto.prev_child)?,
                child: decode_ref(&proto.child)?,
            }),
            RecordBody::Jet(proto) => Self::Jet(JetRecord {
                jet: JetId::from_wire(&proto.jet).ok_or(RecordError::BadJet)?,
            }),
            RecordBody::Incoming(proto) => Self::IncomingRequest(IncomingRequest {
                caller: decode_ref(&proto.caller)?,
                object: decode_opt_ref(&proto.object)?,
                method: proto.method.clone(),
                arguments: proto.arguments.clone(),
                reason: decode_ref(&proto.reason)?,
                api_request_id: proto.api_request_id.clone(),
                return_mode: proto.return_mode.try_into()?,
                nonce: proto.nonce,
            }),
            RecordBody::Outgoing(proto) => Self::OutgoingRequest(OutgoingRequest {
                caller: decode_ref(&proto.caller)?,
                object: decode_opt_ref(&proto.object)?,
                method: proto.method.clone(),
                arguments: proto.arguments.clone(),
                reason: decode_ref(&proto.reason)?,
                return_mode: proto.return_mode.try_into()?,
                nonce: proto.nonce,
            }),
            RecordBody::Result(proto) => Self::Result(ResultRecord {
                object: ObjectId::try_from_slice(&proto.object)?,
                request: ObjectId::try_from_slice(&proto.request)?,
                payload: proto.payload.clone(),
            }),
            RecordBody::Code(proto) => Self::Code(CodeRecord {
                code: proto.code.clone(),
                machine: proto.machine,
            }),
            RecordBody::Activate(proto) => Self::Activate(ActivateRecord {
                request: decode_ref(&proto.request)?,
                memory: proto.memory.clone(),
                parent: decode_ref(&proto.parent)?,
            }),
            RecordBody::Amend(proto) => Self::Amend(AmendRecord {
                request: decode_ref(&proto.request)?,
                memory: proto.memory.clone(),
                prev_state: ObjectId::try_from_slice(&proto.prev_state)?,
            }),
            RecordBody::Deactivate(proto) => Self::Deactivate(DeactivateRecord {
                request: decode_ref(&proto.request)?,
                prev_state: ObjectId::try_from_slice(&proto.prev_state)?,
            }),
            RecordBody::Pending(proto) => Self::PendingFilament(PendingFilament {
                record_id: ObjectId::try_from_slice(&proto.record_id)?,
                previous: decode_opt_id(&proto.previous)?,
            }),
        })
    }
}

/// A record as stored: the union plus the jet it was committed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialRecord {
    /// The record itself.
    pub record: Record,
    /// The jet the record was committed under.
    pub jet: JetId,
}

impl MaterialRecord {
    /// Serializes for storage and replication.
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        MaterialProto {
            body: Some(self.record.to_wire()),
            jet: self.jet.to_wire(),
        }
        .encode_to_vec()
    }

    /// Deserializes a stored record.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, RecordError> {
        let proto = MaterialProto::decode(bytes)?;
        Ok(Self {
            record: Record::from_wire(proto.body.as_ref().ok_or(RecordError::MissingBody)?)?,
            jet: JetId::from_wire(&proto.jet).ok_or(RecordError::BadJet)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Wire mirror types
// ---------------------------------------------------------------------------

/// Wire form of the record union. Oneof tags match [`RecordKind`] values.
#[derive(Clone, PartialEq, Message)]
pub struct VirtualRecord {
    /// The variant payload.
    #[prost(
        oneof = "RecordBody",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11"
    )]
    pub body: Option<RecordBody>,
}

/// Wire variants of [`VirtualRecord`].
#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum RecordBody {
    /// Genesis.
    #[prost(message, tag = "1")]
    Genesis(GenesisProto),
    /// Child registration.
    #[prost(message, tag = "2")]
    Child(ChildProto),
    /// Jet split marker.
    #[prost(message, tag = "3")]
    Jet(JetProto),
    /// Incoming request.
    #[prost(message, tag = "4")]
    Incoming(IncomingRequestProto),
    /// Outgoing request.
    #[prost(message, tag = "5")]
    Outgoing(OutgoingRequestProto),
    /// Result.
    #[prost(message, tag = "6")]
    Result(ResultProto),
    /// Code.
    #[prost(message, tag = "7")]
    Code(CodeProto),
    /// Activation.
    #[prost(message, tag = "8")]
    Activate(ActivateProto),
    /// Amendment.
    #[prost(message, tag = "9")]
    Amend(AmendProto),
    /// Deactivation.
    #[prost(message, tag = "10")]
    Deactivate(DeactivateProto),
    /// Pending filament link.
    #[prost(message, tag = "11")]
    Pending(PendingFilamentProto),
}

/// Wire form of [`GenesisRecord`].
#[derive(Clone, PartialEq, Message)]
pub struct GenesisProto {
    /// Seed hash.
    #[prost(bytes = "vec", tag = "1")]
    pub hash: Vec<u8>,
}

/// Wire form of [`ChildRecord`].
#[derive(Clone, PartialEq, Message)]
pub struct ChildProto {
    /// Previous child id or empty.
    #[prost(bytes = "vec", tag = "1")]
    pub prev_child: Vec<u8>,
    /// Child reference (64 bytes).
    #[prost(bytes = "vec", tag = "2")]
    pub child: Vec<u8>,
}

/// Wire form of [`JetRecord`].
#[derive(Clone, PartialEq, Message)]
pub struct JetProto {
    /// Jet id in wire form.
    #[prost(bytes = "vec", tag = "1")]
    pub jet: Vec<u8>,
}

/// Wire form of [`IncomingRequest`].
#[derive(Clone, PartialEq, Message)]
pub struct IncomingRequestProto {
    /// Caller reference.
    #[prost(bytes = "vec", tag = "1")]
    pub caller: Vec<u8>,
    /// Callee reference or empty.
    #[prost(bytes = "vec", tag = "2")]
    pub object: Vec<u8>,
    /// Method name.
    #[prost(string, tag = "3")]
    pub method: String,
    /// Serialized arguments.
    #[prost(bytes = "vec", tag = "4")]
    pub arguments: Vec<u8>,
    /// Reason reference.
    #[prost(bytes = "vec", tag = "5")]
    pub reason: Vec<u8>,
    /// API correlation id.
    #[prost(string, tag = "6")]
    pub api_request_id: String,
    /// Return mode discriminant.
    #[prost(uint32, tag = "7")]
    pub return_mode: u32,
    /// Uniqueness salt.
    #[prost(uint64, tag = "8")]
    pub nonce: u64,
}

/// Wire form of [`OutgoingRequest`].
#[derive(Clone, PartialEq, Message)]
pub struct OutgoingRequestProto {
    /// Caller reference.
    #[prost(bytes = "vec", tag = "1")]
    pub caller: Vec<u8>,
    /// Callee reference or empty.
    #[prost(bytes = "vec", tag = "2")]
    pub object: Vec<u8>,
    /// Method name.
    #[prost(string, tag = "3")]
    pub method: String,
    /// Serialized arguments.
    #[prost(bytes = "vec", tag = "4")]
    pub arguments: Vec<u8>,
    /// Reason reference.
    #[prost(bytes = "vec", tag = "5")]
    pub reason: Vec<u8>,
    /// Return mode discriminant.
    #[prost(uint32, tag = "6")]
    pub return_mode: u32,
    /// Uniqueness salt.
    #[prost(uint64, tag = "7")]
    pub nonce: u64,
}

/// Wire form of [`ResultRecord`].
#[derive(Clone, PartialEq, Message)]
pub struct ResultProto {
    /// Object id.
    #[prost(bytes = "vec", tag = "1")]
    pub object: Vec<u8>,
    /// Closed request id.
    #[prost(bytes = "vec", tag = "2")]
    pub request: Vec<u8>,
    /// Result payload.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

/// Wire form of [`CodeRecord`].
#[derive(Clone, PartialEq, Message)]
pub struct CodeProto {
    /// Code blob.
    #[prost(bytes = "vec", tag = "1")]
    pub code: Vec<u8>,
    /// Machine type.
    #[prost(uint32, tag = "2")]
    pub machine: u32,
}

/// Wire form of [`ActivateRecord`].
#[derive(Clone, PartialEq, Message)]
pub struct ActivateProto {
    /// Activating request reference.
    #[prost(bytes = "vec", tag = "1")]
    pub request: Vec<u8>,
    /// Initial memory.
    #[prost(bytes = "vec", tag = "2")]
    pub memory: Vec<u8>,
    /// Parent reference.
    #[prost(bytes = "vec", tag = "3")]
    pub parent: Vec<u8>,
}

/// Wire form of [`AmendRecord`].
#[derive(Clone, PartialEq, Message)]
pub struct AmendProto {
    /// Causing request reference.
    #[prost(bytes = "vec", tag = "1")]
    pub request: Vec<u8>,
    /// New memory.
    #[prost(bytes = "vec", tag = "2")]
    pub memory: Vec<u8>,
    /// Superseded state id.
    #[prost(bytes = "vec", tag = "3")]
    pub prev_state: Vec<u8>,
}

/// Wire form of [`DeactivateRecord`].
#[derive(Clone, PartialEq, Message)]
pub struct DeactivateProto {
    /// Causing request reference.
    #[prost(bytes = "vec", tag = "1")]
    pub request: Vec<u8>,
    /// Closed state id.
    #[prost(bytes = "vec", tag = "2")]
    pub prev_state: Vec<u8>,
}

/// Wire form of [`PendingFilament`].
#[derive(Clone, PartialEq, Message)]
pub struct PendingFilamentProto {
    /// Threaded record id.
    #[prost(bytes = "vec", tag = "1")]
    pub record_id: Vec<u8>,
    /// Previous link id or empty.
    #[prost(bytes = "vec", tag = "2")]
    pub previous: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct MaterialProto {
    #[prost(message, optional, tag = "1")]
    body: Option<VirtualRecord>,
    #[prost(bytes = "vec", tag = "2")]
    jet: Vec<u8>,
}

fn encode_ref(reference: &Reference) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(reference.object.as_bytes());
    bytes.extend_from_slice(reference.domain.as_bytes());
    bytes
}

fn decode_ref(bytes: &[u8]) -> Result<Reference, RecordError> {
    if bytes.len() != 64 {
        return Err(RecordError::Id(IdError::BadLength {
            expected: 64,
            actual: bytes.len(),
        }));
    }
    Ok(Reference::new(
        ObjectId::try_from_slice(&bytes[..32])?,
        ObjectId::try_from_slice(&bytes[32..])?,
    ))
}

fn encode_opt_ref(reference: Option<&Reference>) -> Vec<u8> {
    reference.map_or_else(Vec::new, encode_ref)
}

fn decode_opt_ref(bytes: &[u8]) -> Result<Option<Reference>, RecordError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    decode_ref(bytes).map(Some)
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
