//! Message dispatch and component wiring.
//!
//! [`Node`] owns the component lifetimes and is the only process-wide
//! state; every component receives its collaborators through its
//! constructor. Incoming envelopes are verified, decoded and routed through
//! one exhaustive match over the message-kind table, the same table the
//! encoder uses, so adding a kind without a handler does not compile.
//!
//! Request/response kinds produce a reply payload. Reply kinds arriving
//! here unsolicited are logged and dropped (the transport correlates
//! replies to callers; the dispatcher never sees them in normal
//! operation). One-way kinds (`Pulse`, `ReturnResults`, `HotObjects`,
//! `HeavyPayload`) reply only on failure.

use std::sync::Arc;

use lumen_core::error::CoreError;
use lumen_core::id::{NodeRef, ObjectId};
use lumen_core::index::IndexStore;
use lumen_core::jet::{Coordinator, JetFetcher, JetId, JetQuery, Role, TreeStore};
use lumen_core::keeper::JetKeeper;
use lumen_core::lifeline::{EngineReply, LifelineEngine, Submission};
use lumen_core::message::{self, CallMethod, Id, Jet, Meta, Payload, PulseMessage};
use lumen_core::pulse::{Pulse, PulseLog, PulseNumber};
use lumen_core::record::{
    ActivateRecord, AmendRecord, BlobStore, DeactivateRecord, IncomingRequest, OutgoingRequest,
    Record, RecordStore, ResultRecord,
};
use lumen_core::replication::{
    DataGatherer, DropStore, HeavyReplicator, LightCleaner, apply_hot_objects,
};
use lumen_core::requester::{CallSender, ContractRequester, RegisterAck};
use lumen_core::storage::KeyValueStore;
use lumen_core::{BoxFuture, crypto::NodeKeypair};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// What handling one envelope produced.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Reply to send back to the envelope's sender, if any.
    pub reply: Option<Payload>,
    /// Messages to send elsewhere (replication fan-out on pulse turn).
    pub outbound: Vec<(NodeRef, Payload)>,
}

impl DispatchOutcome {
    fn reply(payload: Payload) -> Self {
        Self {
            reply: Some(payload),
            outbound: Vec::new(),
        }
    }

    fn none() -> Self {
        Self::default()
    }
}

/// A jet query for nodes running without a peer transport: the fetch seam
/// exists, but there is never a peer to ask.
pub struct LocalOnlyJetQuery;

impl JetQuery for LocalOnlyJetQuery {
    fn get_jet<'a>(
        &'a self,
        _node: NodeRef,
        _object: ObjectId,
        pulse: PulseNumber,
    ) -> BoxFuture<'a, Result<lumen_core::jet::FetchedJet, CoreError>> {
        Box::pin(async move {
            Err(CoreError::StaleTree {
                pulse,
                jet: JetId::ROOT,
            })
        })
    }
}

/// Routes contract calls into the local engine. The production transport
/// replaces this with a network sender toward the responsible executor.
pub struct LocalCallSender {
    engine: Arc<LifelineEngine>,
    shutdown: CancellationToken,
}

impl CallSender for LocalCallSender {
    fn send_call<'a>(
        &'a self,
        msg: &'a CallMethod,
        _pulse: PulseNumber,
    ) -> BoxFuture<'a, Result<RegisterAck, CoreError>> {
        Box::pin(async move {
            let request = decode_incoming_request(&msg.record)?;
            match self
                .engine
                .submit(Submission::SetIncomingRequest(request), &self.shutdown)
                .await?
            {
                EngineReply::Record { id } => Ok(RegisterAck { request_id: id }),
                EngineReply::Pass { target } => Err(CoreError::NotExecutor { target }),
            }
        })
    }
}

/// The assembled node: component lifetimes plus the dispatcher.
pub struct Node {
    /// The versioned jet trees.
    pub tree: Arc<TreeStore>,
    /// The pulse log.
    pub pulses: Arc<PulseLog>,
    /// The record store.
    pub records: Arc<RecordStore>,
    /// The blob store.
    pub blobs: Arc<BlobStore>,
    /// The index store.
    pub indices: Arc<IndexStore>,
    /// The drop store.
    pub drops: Arc<DropStore>,
    /// The role coordinator.
    pub coordinator: Arc<Coordinator>,
    /// The lifeline engine.
    pub engine: Arc<LifelineEngine>,
    /// The jet keeper.
    pub keeper: Arc<JetKeeper>,
    /// The replication gatherer.
    pub gatherer: Arc<DataGatherer>,
    /// The heavy-side replicator.
    pub heavy: Arc<HeavyReplicator>,
    /// The light-side eviction driver.
    pub cleaner: Arc<LightCleaner>,
    /// The contract requester.
    pub requester: Arc<ContractRequester>,
    /// The node's signing identity.
    pub keys: Arc<NodeKeypair>,
    roles: Vec<Role>,
    shutdown: CancellationToken,
}

/// Everything [`Node::build`] needs beyond the shared storage backend.
pub struct NodeDeps {
    /// The node's signing identity.
    pub keys: Arc<NodeKeypair>,
    /// Membership input.
    pub roster: Arc<dyn lumen_core::jet::RosterProvider>,
    /// Roles the local node runs with.
    pub roles: Vec<Role>,
    /// Transport seam for jet queries.
    pub jet_query: Arc<dyn JetQuery>,
    /// Transport seam for contract calls; `None` wires the local loopback.
    pub call_sender: Option<Arc<dyn CallSender>>,
    /// Deadline for one jet-fetch round.
    pub jet_fetch_timeout: std::time::Duration,
    /// Deadline for a waiting contract call.
    pub call_timeout: std::time::Duration,
    /// Cap on open requests per object.
    pub pending_limit: usize,
    /// Cooperative shutdown token.
    pub shutdown: CancellationToken,
}

impl Node {
    /// Wires every component over the shared storage backend.
    pub fn build(store: Arc<dyn KeyValueStore>, deps: NodeDeps) -> Result<Self, CoreError> {
        let tree = Arc::new(TreeStore::new());
        let pulses = Arc::new(PulseLog::open(store.clone())?);
        let records = Arc::new(RecordStore::new(store.clone()));
        let blobs = Arc::new(BlobStore::new(store.clone()));
        let indices = Arc::new(IndexStore::new(store.clone(), records.clone()));
        let drops = Arc::new(DropStore::new(store.clone()));

        let coordinator = Arc::new(Coordinator::new(
            deps.roster,
            tree.clone(),
            deps.keys.reference(),
        ));
        let fetcher = Arc::new(JetFetcher::new(
            tree.clone(),
            coordinator.clone(),
            deps.jet_query,
            deps.jet_fetch_timeout,
        ));
        let engine = Arc::new(LifelineEngine::new(
            tree.clone(),
            fetcher,
            coordinator.clone(),
            records.clone(),
            blobs.clone(),
            indices.clone(),
            pulses.clone(),
            deps.pending_limit,
        ));
        let keeper = Arc::new(JetKeeper::new(store, tree.clone(), pulses.clone())?);
        let gatherer = Arc::new(DataGatherer::new(
            records.clone(),
            indices.clone(),
            blobs.clone(),
            drops.clone(),
            tree.clone(),
        ));
        let heavy = Arc::new(HeavyReplicator::new(
            records.clone(),
            indices.clone(),
            blobs.clone(),
            drops.clone(),
            keeper.clone(),
        ));
        let cleaner = Arc::new(LightCleaner::new(
            records.clone(),
            blobs.clone(),
            tree.clone(),
            pulses.clone(),
        ));
        let call_sender = deps.call_sender.unwrap_or_else(|| {
            Arc::new(LocalCallSender {
                engine: engine.clone(),
                shutdown: deps.shutdown.clone(),
            })
        });
        let requester = Arc::new(ContractRequester::with_timeout(
            call_sender,
            pulses.clone(),
            deps.call_timeout,
        ));

        Ok(Self {
            tree,
            pulses,
            records,
            blobs,
            indices,
            drops,
            coordinator,
            engine,
            keeper,
            gatherer,
            heavy,
            cleaner,
            requester,
            keys: deps.keys,
            roles: deps.roles,
            shutdown: deps.shutdown,
        })
    }

    /// Whether the local certificate carries `role`.
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Verifies, decodes and dispatches one envelope.
    pub async fn handle(&self, meta: &Meta) -> DispatchOutcome {
        let payload = match meta.open() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, kind = meta.kind, "rejected envelope");
                return DispatchOutcome::reply(Payload::from_error(&err));
            }
        };
        trace!(kind = payload.kind().name(), "dispatching");
        self.handle_payload(payload).await
    }

    /// Dispatches a decoded payload. One arm per message kind.
    pub async fn handle_payload(&self, payload: Payload) -> DispatchOutcome {
        let kind = payload.kind();
        match payload {
            // reads
            Payload::GetObject(msg) => self.reply_result(self.on_get_object(&msg)),
            Payload::GetCode(msg) => self.reply_result(self.on_get_code(&msg)),
            Payload::GetRequest(msg) => self.reply_result(self.on_get_request(&msg)),
            Payload::GetFilament(msg) => self.reply_result(self.on_get_filament(&msg)),
            Payload::GetPendings(msg) => self.reply_result(self.on_get_pendings(&msg)),
            Payload::GetJet(msg) => self.reply_result(self.on_get_jet(&msg)),

            // writes
            Payload::SetIncomingRequest(msg) => {
                let submission = decode_incoming_request(&msg.record)
                    .map(Submission::SetIncomingRequest);
                self.submit_reply(submission).await
            }
            Payload::SetOutgoingRequest(msg) => {
                let submission = decode_outgoing_request(&msg.record)
                    .map(Submission::SetOutgoingRequest);
                self.submit_reply(submission).await
            }
            Payload::SetResult(msg) => {
                let submission = decode_result(&msg.record).map(Submission::SetResult);
                self.submit_reply(submission).await
            }
            Payload::Activate(msg) => {
                let submission = decode_state_target(&msg.object).and_then(|object| {
                    decode_activate(&msg.record)
                        .map(|record| Submission::Activate { object, record })
                });
                self.submit_reply(submission).await
            }
            Payload::Amend(msg) => {
                let submission = decode_state_target(&msg.object).and_then(|object| {
                    decode_amend(&msg.record).map(|record| Submission::Amend { object, record })
                });
                self.submit_reply(submission).await
            }
            Payload::Update(msg) => {
                // the object surface's state update is an amendment
                let submission = decode_state_target(&msg.object).and_then(|object| {
                    decode_amend(&msg.record).map(|record| Submission::Amend { object, record })
                });
                self.submit_reply(submission).await
            }
            Payload::Deactivate(msg) => {
                let submission = decode_state_target(&msg.object).and_then(|object| {
                    decode_deactivate(&msg.record)
                        .map(|record| Submission::Deactivate { object, record })
                });
                self.submit_reply(submission).await
            }
            Payload::CallMethod(msg) => {
                let submission =
                    decode_incoming_request(&msg.record).map(Submission::SetIncomingRequest);
                self.submit_reply(submission).await
            }

            // one-way
            Payload::Pulse(msg) => match self.on_pulse_message(&msg) {
                Ok(outbound) => DispatchOutcome {
                    reply: None,
                    outbound,
                },
                Err(err) => {
                    warn!(%err, "pulse rejected");
                    DispatchOutcome::reply(Payload::from_error(&err))
                }
            },
            Payload::ReturnResults(msg) => {
                self.requester.receive_result(msg);
                DispatchOutcome::none()
            }
            Payload::HotObjects(msg) => match self.on_hot_objects(&msg) {
                Ok(()) => DispatchOutcome::none(),
                Err(err) => {
                    warn!(%err, "hot objects rejected");
                    DispatchOutcome::reply(Payload::from_error(&err))
                }
            },
            Payload::HeavyPayload(msg) => match self.heavy.apply(&msg) {
                Ok(()) => DispatchOutcome::none(),
                Err(err) => {
                    warn!(%err, "heavy payload rejected");
                    DispatchOutcome::reply(Payload::from_error(&err))
                }
            },

            // reply kinds have no business arriving at the dispatcher
            Payload::State(_)
            | Payload::Code(_)
            | Payload::RequestInfo(_)
            | Payload::ResultInfo(_)
            | Payload::Id(_)
            | Payload::Error(_)
            | Payload::Pass(_)
            | Payload::PassState(_)
            | Payload::Request(_)
            | Payload::FilamentSegment(_)
            | Payload::Ids(_)
            | Payload::Jet(_) => {
                debug!(kind = kind.name(), "unsolicited reply, dropping");
                DispatchOutcome::none()
            }
        }
    }

    /// Installs a new pulse: appends it to the log, clones the jet tree,
    /// and replicates the pulse that just closed.
    pub fn on_pulse(&self, pulse: Pulse) -> Result<Vec<(NodeRef, Payload)>, CoreError> {
        let previous = match self.pulses.latest() {
            Ok(previous) => Some(previous),
            Err(CoreError::NotFound { .. }) => None,
            Err(err) => return Err(err),
        };
        self.pulses.append(pulse)?;
        info!(pulse = %pulse.number, "pulse installed");

        let Some(previous) = previous else {
            return Ok(Vec::new());
        };
        self.tree.clone_tree(previous.number, pulse.number, false);

        if !self.has_role(Role::LightExecutor) {
            return Ok(Vec::new());
        }
        self.replicate_closed_pulse(&previous, &pulse)
    }

    /// Streams every jet this node executed in `closed` toward the heavy
    /// store and the next executors. Messages addressed to the local node
    /// are applied in place.
    ///
    /// Closing the genesis pulse only hands jets to their first real
    /// executors; genesis data is seeded at bootstrap and never acked.
    fn replicate_closed_pulse(
        &self,
        closed: &Pulse,
        new: &Pulse,
    ) -> Result<Vec<(NodeRef, Payload)>, CoreError> {
        let me = self.coordinator.me();
        let bootstrap = closed.number.is_genesis();
        let mut outbound = Vec::new();
        for jet in self.tree.all(closed.number) {
            if self
                .coordinator
                .executor_for_jet(Role::LightExecutor, &jet, closed)?
                != me
            {
                continue;
            }

            let hot = self.gatherer.gather_hot(closed.number, new.number, &jet)?;
            let next_ref = self
                .coordinator
                .executor_for_jet(Role::LightExecutor, &jet, new)?;

            let mut batch = Vec::new();
            if !bootstrap {
                let payload = self.gatherer.for_pulse_and_jet(closed.number, &jet)?;
                let heavy_ref =
                    self.coordinator
                        .executor_for_jet(Role::HeavyExecutor, &jet, closed)?;
                batch.push((heavy_ref, Payload::HeavyPayload(payload)));
                batch.push((heavy_ref, Payload::HotObjects(hot.clone())));
            }
            batch.push((next_ref, Payload::HotObjects(hot)));

            for (target, message) in batch {
                if target == me {
                    self.apply_local(message)?;
                } else {
                    outbound.push((target, message));
                }
            }
        }
        Ok(outbound)
    }

    fn apply_local(&self, payload: Payload) -> Result<(), CoreError> {
        match payload {
            Payload::HeavyPayload(msg) => self.heavy.apply(&msg),
            Payload::HotObjects(msg) => self.on_hot_objects(&msg),
            other => Err(CoreError::fatal(format!(
                "no local application for {}",
                other.kind().name()
            ))),
        }
    }

    fn on_pulse_message(&self, msg: &PulseMessage) -> Result<Vec<(NodeRef, Payload)>, CoreError> {
        let pulse = Pulse::decode(&msg.pulse).map_err(|err| CoreError::InvalidState {
            details: format!("malformed pulse: {err}"),
        })?;
        self.on_pulse(pulse)
    }

    /// Hot objects mean different things per role: a light executor
    /// installs them for the new pulse, a heavy node books the hot
    /// confirmation for the pulse that closed.
    fn on_hot_objects(&self, msg: &message::HotObjects) -> Result<(), CoreError> {
        if self.has_role(Role::LightExecutor) {
            apply_hot_objects(&self.indices, &self.tree, msg)?;
        }
        if self.has_role(Role::HeavyExecutor) {
            let next = PulseNumber::new(msg.pulse);
            let closed = self.pulses.backwards(next, 1)?.number;
            // genesis is definitionally synced; it never collects acks
            if !closed.is_genesis() {
                let jet = JetId::from_wire(&msg.jet).ok_or_else(|| CoreError::InvalidState {
                    details: "hot objects name a malformed jet".to_owned(),
                })?;
                self.heavy.confirm_hot(closed, jet)?;
            }
        }
        Ok(())
    }

    async fn submit_reply(
        &self,
        submission: Result<Submission, CoreError>,
    ) -> DispatchOutcome {
        let submission = match submission {
            Ok(submission) => submission,
            Err(err) => return DispatchOutcome::reply(Payload::from_error(&err)),
        };
        match self.engine.submit(submission, &self.shutdown).await {
            Ok(EngineReply::Record { id }) => {
                DispatchOutcome::reply(Payload::Id(Id { id: id.to_vec() }))
            }
            Ok(EngineReply::Pass { target }) => DispatchOutcome::reply(Payload::Pass(
                message::Pass {
                    target: target.to_vec(),
                    origin_kind: 0,
                    origin_payload: Vec::new(),
                },
            )),
            Err(err) => DispatchOutcome::reply(Payload::from_error(&err)),
        }
    }

    fn reply_result(&self, result: Result<Payload, CoreError>) -> DispatchOutcome {
        match result {
            Ok(payload) => DispatchOutcome::reply(payload),
            Err(err) => DispatchOutcome::reply(Payload::from_error(&err)),
        }
    }

    /// `Pass` reply naming the executor for `object` at the latest pulse,
    /// or `None` when the local node is it. Reads answer from local
    /// storage only when this node is authoritative; anyone else gets the
    /// redirect, same as the write path.
    fn read_redirect(
        &self,
        object: &ObjectId,
        origin: &Payload,
    ) -> Result<Option<Payload>, CoreError> {
        let pulse = self.pulses.latest()?;
        let executor = self
            .coordinator
            .executor_for(Role::LightExecutor, object, &pulse)?;
        if executor == self.coordinator.me() {
            return Ok(None);
        }
        debug!(%object, target = %executor, "read for another executor, passing");
        Ok(Some(pass_reply(executor, origin)))
    }

    fn on_get_object(&self, msg: &message::GetObject) -> Result<Payload, CoreError> {
        let object = decode_object_id(&msg.object)?;
        if let Some(pass) = self.read_redirect(&object, &Payload::GetObject(msg.clone()))? {
            return Ok(pass);
        }
        let pulse = self.pulses.latest()?;
        let lifeline = self.indices.for_id(pulse.number, &object)?;
        let state_record = match lifeline.latest_state {
            Some(state_id) => self.records.for_id(&state_id)?.record.marshal(),
            None => Vec::new(),
        };
        let memory = match lifeline.latest_state {
            Some(state_id) => match self.blobs.for_id(&state_id) {
                Ok(memory) => memory,
                Err(CoreError::NotFound { .. }) => Vec::new(),
                Err(err) => return Err(err),
            },
            None => Vec::new(),
        };
        Ok(Payload::State(message::State {
            lifeline: lifeline.encode(),
            state_record,
            memory,
        }))
    }

    fn on_get_code(&self, msg: &message::GetCode) -> Result<Payload, CoreError> {
        let code_id = decode_object_id(&msg.code_id)?;
        match self.records.for_id(&code_id) {
            Ok(material) => {
                if !matches!(material.record, Record::Code(_)) {
                    return Err(CoreError::InvalidState {
                        details: format!("{code_id} is not a code record"),
                    });
                }
                Ok(Payload::Code(message::Code {
                    record: material.record.marshal(),
                }))
            }
            // the code may live with its executor; pass rather than 404
            Err(CoreError::NotFound { .. }) => {
                let pulse = self.pulses.latest()?;
                let executor =
                    self.coordinator
                        .executor_for(Role::LightExecutor, &code_id, &pulse)?;
                if executor == self.coordinator.me() {
                    return Err(CoreError::not_found("code record"));
                }
                Ok(pass_reply(executor, &Payload::GetCode(msg.clone())))
            }
            Err(err) => Err(err),
        }
    }

    fn on_get_request(&self, msg: &message::GetRequest) -> Result<Payload, CoreError> {
        let object = decode_object_id(&msg.object)?;
        if let Some(pass) = self.read_redirect(&object, &Payload::GetRequest(msg.clone()))? {
            return Ok(pass);
        }
        let request_id = decode_object_id(&msg.request_id)?;
        let material = self.records.for_id(&request_id)?;
        if !material.record.is_request() {
            return Err(CoreError::InvalidState {
                details: format!("{request_id} is not a request record"),
            });
        }
        Ok(Payload::Request(message::Request {
            request_id: request_id.to_vec(),
            record: material.record.marshal(),
        }))
    }

    fn on_get_filament(&self, msg: &message::GetFilament) -> Result<Payload, CoreError> {
        let object = decode_object_id(&msg.object)?;
        if let Some(pass) = self.read_redirect(&object, &Payload::GetFilament(msg.clone()))? {
            return Ok(pass);
        }
        let entries = self.indices.records(
            PulseNumber::new(msg.start_from),
            PulseNumber::new(msg.read_until),
            &object,
        )?;
        Ok(Payload::FilamentSegment(message::FilamentSegment {
            object: object.to_vec(),
            records: entries
                .into_iter()
                .map(|entry| entry.record.marshal())
                .collect(),
        }))
    }

    fn on_get_pendings(&self, msg: &message::GetPendings) -> Result<Payload, CoreError> {
        let object = decode_object_id(&msg.object)?;
        if let Some(pass) = self.read_redirect(&object, &Payload::GetPendings(msg.clone()))? {
            return Ok(pass);
        }
        let pulse = self.pulses.latest()?;
        let bucket = self.indices.bucket_or_latest(pulse.number, &object)?;
        let ids = bucket
            .open_requests
            .iter()
            .take(msg.count as usize)
            .map(ObjectId::to_vec)
            .collect();
        Ok(Payload::Ids(message::Ids { ids }))
    }

    fn on_get_jet(&self, msg: &message::GetJet) -> Result<Payload, CoreError> {
        let object = decode_object_id(&msg.object)?;
        let (jet, actual) = self.tree.find(PulseNumber::new(msg.pulse), &object);
        Ok(Payload::Jet(Jet {
            jet: jet.to_wire(),
            actual,
        }))
    }
}

/// Builds the `Pass` redirect carrying the original message so the caller
/// can resend it to `target` verbatim.
fn pass_reply(target: NodeRef, origin: &Payload) -> Payload {
    Payload::Pass(message::Pass {
        target: target.to_vec(),
        origin_kind: origin.kind() as u32,
        origin_payload: origin.marshal(),
    })
}

fn decode_object_id(bytes: &[u8]) -> Result<ObjectId, CoreError> {
    ObjectId::try_from_slice(bytes).map_err(|err| CoreError::InvalidState {
        details: format!("malformed object id: {err}"),
    })
}

fn decode_state_target(bytes: &[u8]) -> Result<ObjectId, CoreError> {
    decode_object_id(bytes)
}

fn decode_incoming_request(bytes: &[u8]) -> Result<IncomingRequest, CoreError> {
    match Record::unmarshal(bytes)? {
        Record::IncomingRequest(request) => Ok(request),
        other => Err(wrong_variant("incoming request", &other)),
    }
}

fn decode_outgoing_request(bytes: &[u8]) -> Result<OutgoingRequest, CoreError> {
    match Record::unmarshal(bytes)? {
        Record::OutgoingRequest(request) => Ok(request),
        other => Err(wrong_variant("outgoing request", &other)),
    }
}

fn decode_result(bytes: &[u8]) -> Result<ResultRecord, CoreError> {
    match Record::unmarshal(bytes)? {
        Record::Result(result) => Ok(result),
        other => Err(wrong_variant("result", &other)),
    }
}

fn decode_activate(bytes: &[u8]) -> Result<ActivateRecord, CoreError> {
    match Record::unmarshal(bytes)? {
        Record::Activate(record) => Ok(record),
        other => Err(wrong_variant("activate", &other)),
    }
}

fn decode_amend(bytes: &[u8]) -> Result<AmendRecord, CoreError> {
    match Record::unmarshal(bytes)? {
        Record::Amend(record) => Ok(record),
        other => Err(wrong_variant("amend", &other)),
    }
}

fn decode_deactivate(bytes: &[u8]) -> Result<DeactivateRecord, CoreError> {
    match Record::unmarshal(bytes)? {
        Record::Deactivate(record) => Ok(record),
        other => Err(wrong_variant("deactivate", &other)),
    }
}

fn wrong_variant(expected: &str, got: &Record) -> CoreError {
    CoreError::InvalidState {
        details: format!("expected an {expected} record, got {:?}", got.kind()),
    }
}

#[cfg(test)]
mod tests;
