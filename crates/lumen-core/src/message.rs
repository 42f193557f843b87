//! Wire messages: a self-describing tagged union.
//!
//! Every message kind has an explicit numeric discriminant in
//! [`MessageKind`]; the same table drives the encoder and the dispatcher,
//! so an unhandled kind is a compile-time hole, not a runtime surprise.
//!
//! Messages travel inside a [`Meta`] envelope carrying the sender's node
//! reference, the pulse the sender saw, and an ed25519 signature over the
//! kind, pulse and payload bytes. Framing (length prefixes, sockets) is the
//! transport's business, not this module's.

use prost::Message as ProstMessage;

use crate::crypto::{NodeKeypair, verify_signature};
use crate::error::CoreError;
use crate::id::NodeRef;
use crate::pulse::PulseNumber;

/// Message discriminants. Values are part of the wire format and are never
/// reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    /// Read an object's state.
    GetObject = 1,
    /// Object state reply.
    State = 2,
    /// Read contract code.
    GetCode = 3,
    /// Code reply.
    Code = 4,
    /// Commit an incoming request.
    SetIncomingRequest = 5,
    /// Commit an outgoing request.
    SetOutgoingRequest = 6,
    /// Commit a result.
    SetResult = 7,
    /// Commit an activation.
    Activate = 8,
    /// Commit an amendment.
    Amend = 9,
    /// Commit a deactivation.
    Deactivate = 10,
    /// Commit a state update (amendment alias used by the object surface).
    Update = 11,
    /// Request registration info reply (duplicate requests).
    RequestInfo = 12,
    /// Result registration info reply.
    ResultInfo = 13,
    /// Bare id reply.
    Id = 14,
    /// Error reply with a stable code.
    Error = 15,
    /// Redirect: another node is authoritative.
    Pass = 16,
    /// State handed over alongside a redirect.
    PassState = 17,
    /// Read one request record.
    GetRequest = 18,
    /// Request record reply.
    Request = 19,
    /// Read a filament range.
    GetFilament = 20,
    /// Filament range reply.
    FilamentSegment = 21,
    /// Read open requests.
    GetPendings = 22,
    /// Id list reply.
    Ids = 23,
    /// Hot objects handed to the next executor.
    HotObjects = 24,
    /// A pulse's data for the heavy store.
    HeavyPayload = 25,
    /// Asynchronous call results coming home.
    ReturnResults = 26,
    /// A contract method call.
    CallMethod = 27,
    /// A new pulse from the pulsar.
    Pulse = 28,
    /// Ask a peer for the actual jet.
    GetJet = 29,
    /// Actual-jet reply.
    Jet = 30,
}

impl MessageKind {
    /// Every kind, in discriminant order.
    pub const ALL: [Self; 30] = [
        Self::GetObject,
        Self::State,
        Self::GetCode,
        Self::Code,
        Self::SetIncomingRequest,
        Self::SetOutgoingRequest,
        Self::SetResult,
        Self::Activate,
        Self::Amend,
        Self::Deactivate,
        Self::Update,
        Self::RequestInfo,
        Self::ResultInfo,
        Self::Id,
        Self::Error,
        Self::Pass,
        Self::PassState,
        Self::GetRequest,
        Self::Request,
        Self::GetFilament,
        Self::FilamentSegment,
        Self::GetPendings,
        Self::Ids,
        Self::HotObjects,
        Self::HeavyPayload,
        Self::ReturnResults,
        Self::CallMethod,
        Self::Pulse,
        Self::GetJet,
        Self::Jet,
    ];

    /// Looks a kind up by discriminant.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| *kind as u32 == value)
    }

    /// The kind's wire name, for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GetObject => "GetObject",
            Self::State => "State",
            Self::GetCode => "GetCode",
            Self::Code => "Code",
            Self::SetIncomingRequest => "SetIncomingRequest",
            Self::SetOutgoingRequest => "SetOutgoingRequest",
            Self::SetResult => "SetResult",
            Self::Activate => "Activate",
            Self::Amend => "Amend",
            Self::Deactivate => "Deactivate",
            Self::Update => "Update",
            Self::RequestInfo => "RequestInfo",
            Self::ResultInfo => "ResultInfo",
            Self::Id => "ID",
            Self::Error => "Error",
            Self::Pass => "Pass",
            Self::PassState => "PassState",
            Self::GetRequest => "GetRequest",
            Self::Request => "Request",
            Self::GetFilament => "GetFilament",
            Self::FilamentSegment => "FilamentSegment",
            Self::GetPendings => "GetPendings",
            Self::Ids => "IDs",
            Self::HotObjects => "HotObjects",
            Self::HeavyPayload => "HeavyPayload",
            Self::ReturnResults => "ReturnResults",
            Self::CallMethod => "CallMethod",
            Self::Pulse => "Pulse",
            Self::GetJet => "GetJet",
            Self::Jet => "Jet",
        }
    }
}

/// Read an object's state.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct GetObject {
    /// The object to read.
    #[prost(bytes = "vec", tag = "1")]
    pub object: Vec<u8>,
}

/// Object state reply.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct State {
    /// Encoded lifeline.
    #[prost(bytes = "vec", tag = "1")]
    pub lifeline: Vec<u8>,
    /// Encoded latest state record.
    #[prost(bytes = "vec", tag = "2")]
    pub state_record: Vec<u8>,
    /// State memory blob.
    #[prost(bytes = "vec", tag = "3")]
    pub memory: Vec<u8>,
}

/// Read contract code.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct GetCode {
    /// The code record id.
    #[prost(bytes = "vec", tag = "1")]
    pub code_id: Vec<u8>,
}

/// Code reply.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Code {
    /// Encoded code record.
    #[prost(bytes = "vec", tag = "1")]
    pub record: Vec<u8>,
}

/// Commit an incoming request.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct SetIncomingRequest {
    /// Encoded request record.
    #[prost(bytes = "vec", tag = "1")]
    pub record: Vec<u8>,
}

/// Commit an outgoing request.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct SetOutgoingRequest {
    /// Encoded request record.
    #[prost(bytes = "vec", tag = "1")]
    pub record: Vec<u8>,
}

/// Commit a result.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct SetResult {
    /// Encoded result record.
    #[prost(bytes = "vec", tag = "1")]
    pub record: Vec<u8>,
}

/// Commit an activation.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Activate {
    /// Encoded activation record.
    #[prost(bytes = "vec", tag = "1")]
    pub record: Vec<u8>,
    /// The object being activated.
    #[prost(bytes = "vec", tag = "2")]
    pub object: Vec<u8>,
}

/// Commit an amendment.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Amend {
    /// Encoded amendment record.
    #[prost(bytes = "vec", tag = "1")]
    pub record: Vec<u8>,
    /// The amended object.
    #[prost(bytes = "vec", tag = "2")]
    pub object: Vec<u8>,
}

/// Commit a deactivation.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Deactivate {
    /// Encoded deactivation record.
    #[prost(bytes = "vec", tag = "1")]
    pub record: Vec<u8>,
    /// The deactivated object.
    #[prost(bytes = "vec", tag = "2")]
    pub object: Vec<u8>,
}

/// Commit a state update. Same shape as [`Amend`]; kept as its own kind on
/// the object surface.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Update {
    /// Encoded amendment record.
    #[prost(bytes = "vec", tag = "1")]
    pub record: Vec<u8>,
    /// The updated object.
    #[prost(bytes = "vec", tag = "2")]
    pub object: Vec<u8>,
}

/// Reply describing an already-registered request.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct RequestInfo {
    /// The object the request targets.
    #[prost(bytes = "vec", tag = "1")]
    pub object: Vec<u8>,
    /// The registered request id.
    #[prost(bytes = "vec", tag = "2")]
    pub request_id: Vec<u8>,
    /// Encoded request record, when the caller asked for bodies.
    #[prost(bytes = "vec", tag = "3")]
    pub request: Vec<u8>,
    /// Encoded result record, when one already closed the request.
    #[prost(bytes = "vec", tag = "4")]
    pub result: Vec<u8>,
}

/// Reply describing a registered result.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct ResultInfo {
    /// The object the result belongs to.
    #[prost(bytes = "vec", tag = "1")]
    pub object: Vec<u8>,
    /// The registered result id.
    #[prost(bytes = "vec", tag = "2")]
    pub result_id: Vec<u8>,
}

/// Bare id reply.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Id {
    /// The id.
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
}

/// Error reply.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct ErrorPayload {
    /// Stable numeric code (see [`CoreError::wire_code`]).
    #[prost(uint32, tag = "1")]
    pub code: u32,
    /// Free-text description.
    #[prost(string, tag = "2")]
    pub text: String,
}

/// Redirect reply: resend the original message to `target`.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Pass {
    /// The authoritative node.
    #[prost(bytes = "vec", tag = "1")]
    pub target: Vec<u8>,
    /// Kind of the redirected message.
    #[prost(uint32, tag = "2")]
    pub origin_kind: u32,
    /// Payload of the redirected message.
    #[prost(bytes = "vec", tag = "3")]
    pub origin_payload: Vec<u8>,
}

/// State pushed along with a redirect.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct PassState {
    /// The original message this state belongs to.
    #[prost(bytes = "vec", tag = "1")]
    pub origin: Vec<u8>,
    /// The state record id being handed over.
    #[prost(bytes = "vec", tag = "2")]
    pub state_id: Vec<u8>,
}

/// Read one request record.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct GetRequest {
    /// The object whose request is read.
    #[prost(bytes = "vec", tag = "1")]
    pub object: Vec<u8>,
    /// The request id.
    #[prost(bytes = "vec", tag = "2")]
    pub request_id: Vec<u8>,
}

/// Request record reply.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Request {
    /// The request id.
    #[prost(bytes = "vec", tag = "1")]
    pub request_id: Vec<u8>,
    /// Encoded request record.
    #[prost(bytes = "vec", tag = "2")]
    pub record: Vec<u8>,
}

/// Read a filament range.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct GetFilament {
    /// The object whose filament is read.
    #[prost(bytes = "vec", tag = "1")]
    pub object: Vec<u8>,
    /// Pulse to start from (walking backwards).
    #[prost(uint32, tag = "2")]
    pub start_from: u32,
    /// Oldest pulse to include.
    #[prost(uint32, tag = "3")]
    pub read_until: u32,
}

/// Filament range reply.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct FilamentSegment {
    /// The object the segment belongs to.
    #[prost(bytes = "vec", tag = "1")]
    pub object: Vec<u8>,
    /// Encoded filament records, oldest first.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub records: Vec<Vec<u8>>,
}

/// Read open requests.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct GetPendings {
    /// The object whose pendings are read.
    #[prost(bytes = "vec", tag = "1")]
    pub object: Vec<u8>,
    /// Maximum ids to return.
    #[prost(uint32, tag = "2")]
    pub count: u32,
}

/// Id list reply.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Ids {
    /// The ids.
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub ids: Vec<Vec<u8>>,
}

/// Hot objects handed to the next pulse's executor.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct HotObjects {
    /// The pulse the receiver becomes executor for.
    #[prost(uint32, tag = "1")]
    pub pulse: u32,
    /// The jet being handed over, wire form.
    #[prost(bytes = "vec", tag = "2")]
    pub jet: Vec<u8>,
    /// Encoded drop of the closing pulse.
    #[prost(bytes = "vec", tag = "3")]
    pub drop: Vec<u8>,
    /// Encoded index buckets with open work.
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub indexes: Vec<Vec<u8>>,
}

/// A pulse's records, indices, drop and blobs for the heavy store.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct HeavyPayload {
    /// The replicated pulse.
    #[prost(uint32, tag = "1")]
    pub pulse: u32,
    /// The replicated jet, wire form.
    #[prost(bytes = "vec", tag = "2")]
    pub jet: Vec<u8>,
    /// Encoded records, sorted by hash.
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub records: Vec<Vec<u8>>,
    /// Encoded index buckets, sorted by object id.
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub indexes: Vec<Vec<u8>>,
    /// Encoded drop commitment.
    #[prost(bytes = "vec", tag = "5")]
    pub drop: Vec<u8>,
    /// Blob payloads keyed by their state record ids.
    #[prost(bytes = "vec", repeated, tag = "6")]
    pub blobs: Vec<Vec<u8>>,
}

/// Asynchronous call results delivered back to the caller node.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct ReturnResults {
    /// Id of the request these results answer.
    #[prost(bytes = "vec", tag = "1")]
    pub request_id: Vec<u8>,
    /// Error text; empty on success.
    #[prost(string, tag = "2")]
    pub error: String,
    /// Serialized reply payload.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

/// A contract method call.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct CallMethod {
    /// Encoded incoming-request record.
    #[prost(bytes = "vec", tag = "1")]
    pub record: Vec<u8>,
}

/// A new pulse pushed by the pulsar.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct PulseMessage {
    /// The encoded pulse.
    #[prost(bytes = "vec", tag = "1")]
    pub pulse: Vec<u8>,
}

/// Ask a peer which jet covers an object.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct GetJet {
    /// The object in question.
    #[prost(bytes = "vec", tag = "1")]
    pub object: Vec<u8>,
    /// The pulse in question.
    #[prost(uint32, tag = "2")]
    pub pulse: u32,
}

/// Actual-jet reply.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Jet {
    /// The jet, wire form.
    #[prost(bytes = "vec", tag = "1")]
    pub jet: Vec<u8>,
    /// Whether the answering node holds it actual.
    #[prost(bool, tag = "2")]
    pub actual: bool,
}

/// The decoded message union.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// See [`GetObject`].
    GetObject(GetObject),
    /// See [`State`].
    State(State),
    /// See [`GetCode`].
    GetCode(GetCode),
    /// See [`Code`].
    Code(Code),
    /// See [`SetIncomingRequest`].
    SetIncomingRequest(SetIncomingRequest),
    /// See [`SetOutgoingRequest`].
    SetOutgoingRequest(SetOutgoingRequest),
    /// See [`SetResult`].
    SetResult(SetResult),
    /// See [`Activate`].
    Activate(Activate),
    /// See [`Amend`].
    Amend(Amend),
    /// See [`Deactivate`].
    Deactivate(Deactivate),
    /// See [`Update`].
    Update(Update),
    /// See [`RequestInfo`].
    RequestInfo(RequestInfo),
    /// See [`ResultInfo`].
    ResultInfo(ResultInfo),
    /// See [`Id`].
    Id(Id),
    /// See [`ErrorPayload`].
    Error(ErrorPayload),
    /// See [`Pass`].
    Pass(Pass),
    /// See [`PassState`].
    PassState(PassState),
    /// See [`GetRequest`].
    GetRequest(GetRequest),
    /// See [`Request`].
    Request(Request),
    /// See [`GetFilament`].
    GetFilament(GetFilament),
    /// See [`FilamentSegment`].
    FilamentSegment(FilamentSegment),
    /// See [`GetPendings`].
    GetPendings(GetPendings),
    /// See [`Ids`].
    Ids(Ids),
    /// See [`HotObjects`].
    HotObjects(HotObjects),
    /// See [`HeavyPayload`].
    HeavyPayload(HeavyPayload),
    /// See [`ReturnResults`].
    ReturnResults(ReturnResults),
    /// See [`CallMethod`].
    CallMethod(CallMethod),
    /// See [`PulseMessage`].
    Pulse(PulseMessage),
    /// See [`GetJet`].
    GetJet(GetJet),
    /// See [`Jet`].
    Jet(Jet),
}

impl Payload {
    /// The payload's kind. One table with the encoder and the dispatcher.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::GetObject(_) => MessageKind::GetObject,
            Self::State(_) => MessageKind::State,
            Self::GetCode(_) => MessageKind::GetCode,
            Self::Code(_) => MessageKind::Code,
            Self::SetIncomingRequest(_) => MessageKind::SetIncomingRequest,
            Self::SetOutgoingRequest(_) => MessageKind::SetOutgoingRequest,
            Self::SetResult(_) => MessageKind::SetResult,
            Self::Activate(_) => MessageKind::Activate,
            Self::Amend(_) => MessageKind::Amend,
            Self::Deactivate(_) => MessageKind::Deactivate,
            Self::Update(_) => MessageKind::Update,
            Self::RequestInfo(_) => MessageKind::RequestInfo,
            Self::ResultInfo(_) => MessageKind::ResultInfo,
            Self::Id(_) => MessageKind::Id,
            Self::Error(_) => MessageKind::Error,
            Self::Pass(_) => MessageKind::Pass,
            Self::PassState(_) => MessageKind::PassState,
            Self::GetRequest(_) => MessageKind::GetRequest,
            Self::Request(_) => MessageKind::Request,
            Self::GetFilament(_) => MessageKind::GetFilament,
            Self::FilamentSegment(_) => MessageKind::FilamentSegment,
            Self::GetPendings(_) => MessageKind::GetPendings,
            Self::Ids(_) => MessageKind::Ids,
            Self::HotObjects(_) => MessageKind::HotObjects,
            Self::HeavyPayload(_) => MessageKind::HeavyPayload,
            Self::ReturnResults(_) => MessageKind::ReturnResults,
            Self::CallMethod(_) => MessageKind::CallMethod,
            Self::Pulse(_) => MessageKind::Pulse,
            Self::GetJet(_) => MessageKind::GetJet,
            Self::Jet(_) => MessageKind::Jet,
        }
    }

    /// Encodes just the payload bytes (no envelope).
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        match self {
            Self::GetObject(p) => p.encode_to_vec(),
            Self::State(p) => p.encode_to_vec(),
            Self::GetCode(p) => p.encode_to_vec(),
            Self::Code(p) => p.encode_to_vec(),
            Self::SetIncomingRequest(p) => p.encode_to_vec(),
            Self::SetOutgoingRequest(p) => p.encode_to_vec(),
            Self::SetResult(p) => p.encode_to_vec(),
            Self::Activate(p) => p.encode_to_vec(),
            Self::Amend(p) => p.encode_to_vec(),
            Self::Deactivate(p) => p.encode_to_vec(),
            Self::Update(p) => p.encode_to_vec(),
            Self::RequestInfo(p) => p.encode_to_vec(),
            Self::ResultInfo(p) => p.encode_to_vec(),
            Self::Id(p) => p.encode_to_vec(),
            Self::Error(p) => p.encode_to_vec(),
            Self::Pass(p) => p.encode_to_vec(),
            Self::PassState(p) => p.encode_to_vec(),
            Self::GetRequest(p) => p.encode_to_vec(),
            Self::Request(p) => p.encode_to_vec(),
            Self::GetFilament(p) => p.encode_to_vec(),
            Self::FilamentSegment(p) => p.encode_to_vec(),
            Self::GetPendings(p) => p.encode_to_vec(),
            Self::Ids(p) => p.encode_to_vec(),
            Self::HotObjects(p) => p.encode_to_vec(),
            Self::HeavyPayload(p) => p.encode_to_vec(),
            Self::ReturnResults(p) => p.encode_to_vec(),
            Self::CallMethod(p) => p.encode_to_vec(),
            Self::Pulse(p) => p.encode_to_vec(),
            Self::GetJet(p) => p.encode_to_vec(),
            Self::Jet(p) => p.encode_to_vec(),
        }
    }

    /// Decodes payload bytes for a known kind.
    pub fn unmarshal(kind: MessageKind, bytes: &[u8]) -> Result<Self, CoreError> {
        let decode_err =
            |err: prost::DecodeError| CoreError::InvalidState {
                details: format!("malformed {} payload: {err}", kind.name()),
            };
        Ok(match kind {
            MessageKind::GetObject => Self::GetObject(GetObject::decode(bytes).map_err(decode_err)?),
            MessageKind::State => Self::State(State::decode(bytes).map_err(decode_err)?),
            MessageKind::GetCode => Self::GetCode(GetCode::decode(bytes).map_err(decode_err)?),
            MessageKind::Code => Self::Code(Code::decode(bytes).map_err(decode_err)?),
            MessageKind::SetIncomingRequest => {
                Self::SetIncomingRequest(SetIncomingRequest::decode(bytes).map_err(decode_err)?)
            }
            MessageKind::SetOutgoingRequest => {
                Self::SetOutgoingRequest(SetOutgoingRequest::decode(bytes).map_err(decode_err)?)
            }
            MessageKind::SetResult => Self::SetResult(SetResult::decode(bytes).map_err(decode_err)?),
            MessageKind::Activate => Self::Activate(Activate::decode(bytes).map_err(decode_err)?),
            MessageKind::Amend => Self::Amend(Amend::decode(bytes).map_err(decode_err)?),
            MessageKind::Deactivate => {
                Self::Deactivate(Deactivate::decode(bytes).map_err(decode_err)?)
            }
            MessageKind::Update => Self::Update(Update::decode(bytes).map_err(decode_err)?),
            MessageKind::RequestInfo => {
                Self::RequestInfo(RequestInfo::decode(bytes).map_err(decode_err)?)
            }
            MessageKind::ResultInfo => {
                Self::ResultInfo(ResultInfo::decode(bytes).map_err(decode_err)?)
            }
            MessageKind::Id => Self::Id(Id::decode(bytes).map_err(decode_err)?),
            MessageKind::Error => Self::Error(ErrorPayload::decode(bytes).map_err(decode_err)?),
            MessageKind::Pass => Self::Pass(Pass::decode(bytes).map_err(decode_err)?),
            MessageKind::PassState => Self::PassState(PassState::decode(bytes).map_err(decode_err)?),
            MessageKind::GetRequest => {
                Self::GetRequest(GetRequest::decode(bytes).map_err(decode_err)?)
            }
            MessageKind::Request => Self::Request(Request::decode(bytes).map_err(decode_err)?),
            MessageKind::GetFilament => {
                Self::GetFilament(GetFilament::decode(bytes).map_err(decode_err)?)
            }
            MessageKind::FilamentSegment => {
                Self::FilamentSegment(FilamentSegment::decode(bytes).map_err(decode_err)?)
            }
            MessageKind::GetPendings => {
                Self::GetPendings(GetPendings::decode(bytes).map_err(decode_err)?)
            }
            MessageKind::Ids => Self::Ids(Ids::decode(bytes).map_err(decode_err)?),
            MessageKind::HotObjects => {
                Self::HotObjects(HotObjects::decode(bytes).map_err(decode_err)?)
            }
            MessageKind::HeavyPayload => {
                Self::HeavyPayload(HeavyPayload::decode(bytes).map_err(decode_err)?)
            }
            MessageKind::ReturnResults => {
                Self::ReturnResults(ReturnResults::decode(bytes).map_err(decode_err)?)
            }
            MessageKind::CallMethod => {
                Self::CallMethod(CallMethod::decode(bytes).map_err(decode_err)?)
            }
            MessageKind::Pulse => Self::Pulse(PulseMessage::decode(bytes).map_err(decode_err)?),
            MessageKind::GetJet => Self::GetJet(GetJet::decode(bytes).map_err(decode_err)?),
            MessageKind::Jet => Self::Jet(Jet::decode(bytes).map_err(decode_err)?),
        })
    }

    /// Builds the error reply for a fault.
    #[must_use]
    pub fn from_error(err: &CoreError) -> Self {
        Self::Error(ErrorPayload {
            code: err.wire_code(),
            text: err.to_string(),
        })
    }
}

/// The signed envelope every message travels in.
#[derive(Clone, PartialEq, ProstMessage)]
pub struct Meta {
    /// Payload kind discriminant.
    #[prost(uint32, tag = "1")]
    pub kind: u32,
    /// Encoded payload.
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    /// Sender node reference (its verifying key).
    #[prost(bytes = "vec", tag = "3")]
    pub sender: Vec<u8>,
    /// The pulse the sender saw when sending.
    #[prost(uint32, tag = "4")]
    pub pulse: u32,
    /// ed25519 signature over kind, pulse and payload.
    #[prost(bytes = "vec", tag = "5")]
    pub signature: Vec<u8>,
}

impl Meta {
    /// Seals `payload` into a signed envelope.
    #[must_use]
    pub fn seal(payload: &Payload, pulse: PulseNumber, keys: &NodeKeypair) -> Self {
        let kind = payload.kind() as u32;
        let bytes = payload.marshal();
        let signature = keys.sign(&signing_bytes(kind, pulse.get(), &bytes));
        Self {
            kind,
            payload: bytes,
            sender: keys.reference().to_vec(),
            pulse: pulse.get(),
            signature,
        }
    }

    /// The sender's node reference.
    pub fn sender_ref(&self) -> Result<NodeRef, CoreError> {
        NodeRef::try_from_slice(&self.sender).map_err(|err| CoreError::InvalidState {
            details: format!("bad sender reference: {err}"),
        })
    }

    /// Verifies the signature and decodes the payload.
    pub fn open(&self) -> Result<Payload, CoreError> {
        let sender = self.sender_ref()?;
        verify_signature(
            &sender,
            &signing_bytes(self.kind, self.pulse, &self.payload),
            &self.signature,
        )
        .map_err(|err| CoreError::InvalidState {
            details: format!("envelope signature rejected: {err}"),
        })?;
        let kind = MessageKind::from_u32(self.kind).ok_or_else(|| CoreError::InvalidState {
            details: format!("unknown message kind {}", self.kind),
        })?;
        Payload::unmarshal(kind, &self.payload)
    }

    /// Serializes the envelope for the transport.
    #[must_use]
    pub fn encode_frame(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Deserializes an envelope from transport bytes.
    pub fn decode_frame(bytes: &[u8]) -> Result<Self, CoreError> {
        Self::decode(bytes).map_err(|err| CoreError::InvalidState {
            details: format!("malformed envelope: {err}"),
        })
    }
}

fn signing_bytes(kind: u32, pulse: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + payload.len());
    bytes.extend_from_slice(&kind.to_be_bytes());
    bytes.extend_from_slice(&pulse.to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

#[cfg(test)]
mod tests {
    use crate::pulse::GENESIS_PULSE;

    use super::*;

    #[test]
    fn kind_table_is_dense_and_stable() {
        for (index, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(*kind as usize, index + 1, "{} moved", kind.name());
            assert_eq!(MessageKind::from_u32(*kind as u32), Some(*kind));
        }
        assert_eq!(MessageKind::from_u32(0), None);
        assert_eq!(MessageKind::from_u32(31), None);
    }

    #[test]
    fn payload_round_trips_through_kind_and_bytes() {
        let samples = vec![
            Payload::GetObject(GetObject {
                object: vec![1; 32],
            }),
            Payload::Error(ErrorPayload {
                code: 3,
                text: "stale".to_owned(),
            }),
            Payload::Ids(Ids {
                ids: vec![vec![2; 32], vec![3; 32]],
            }),
            Payload::HeavyPayload(HeavyPayload {
                pulse: 65636,
                jet: vec![0; 33],
                records: vec![vec![1], vec![2]],
                indexes: Vec::new(),
                drop: vec![9],
                blobs: Vec::new(),
            }),
            Payload::Jet(Jet {
                jet: vec![0; 33],
                actual: true,
            }),
        ];
        for payload in samples {
            let decoded =
                Payload::unmarshal(payload.kind(), &payload.marshal()).expect("unmarshal");
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn sealed_envelope_opens_and_rejects_tampering() {
        let keys = NodeKeypair::generate();
        let payload = Payload::GetJet(GetJet {
            object: vec![7; 32],
            pulse: 65636,
        });
        let meta = Meta::seal(&payload, GENESIS_PULSE, &keys);

        assert_eq!(meta.sender_ref().expect("sender"), keys.reference());
        assert_eq!(meta.open().expect("open"), payload);

        let mut forged = meta.clone();
        forged.payload[0] ^= 0xff;
        assert!(forged.open().is_err());

        let mut wrong_pulse = meta;
        wrong_pulse.pulse += 1;
        assert!(wrong_pulse.open().is_err());
    }

    #[test]
    fn frame_round_trip() {
        let keys = NodeKeypair::generate();
        let meta = Meta::seal(
            &Payload::Id(Id { id: vec![4; 32] }),
            GENESIS_PULSE,
            &keys,
        );
        let decoded = Meta::decode_frame(&meta.encode_frame()).expect("decode");
        assert_eq!(decoded, meta);
        assert!(Meta::decode_frame(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn error_payload_carries_wire_code() {
        let err = CoreError::not_found("record");
        let Payload::Error(payload) = Payload::from_error(&err) else {
            panic!("expected error payload");
        };
        assert_eq!(payload.code, err.wire_code());
        let mapped = CoreError::from_wire(payload.code, &payload.text);
        assert_eq!(mapped.wire_code(), err.wire_code());
    }
}
