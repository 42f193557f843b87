//! The lifeline engine (C7): typed record submissions.
//!
//! Every submission runs the same pipeline: route to a jet (fetching when
//! the local tree is stale), authorize against the coordinator, load the
//! lifeline snapshot, validate the transition, then hash and commit under
//! the object's stripe lock. A pulse that advances mid-operation fails the
//! submission with `FlowCanceled` before anything is applied; the commit is
//! atomic per object.
//!
//! Redirects are not errors here: a submission landing on the wrong node
//! answers `Pass` with the correct target so the caller can resend.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::CoreError;
use crate::id::{NodeRef, ObjectId};
use crate::index::{FilamentBucket, IndexStore, StateKind};
use crate::jet::{Coordinator, JetFetcher, JetId, Role, TreeStore};
use crate::pulse::{Pulse, PulseLog, PulseNumber};
use crate::record::{
    ActivateRecord, AmendRecord, BlobStore, ChildRecord, CodeRecord, DeactivateRecord,
    IncomingRequest, MaterialRecord, OutgoingRequest, PendingFilament, Record, RecordStore,
    ResultRecord,
};

/// Default cap on open requests per object.
pub const DEFAULT_PENDING_LIMIT: usize = 1000;

const LOCK_STRIPES: usize = 128;

/// A typed record submission.
#[derive(Debug, Clone)]
pub enum Submission {
    /// Register an incoming request.
    SetIncomingRequest(IncomingRequest),
    /// Register an outgoing request.
    SetOutgoingRequest(OutgoingRequest),
    /// Close a request with its result.
    SetResult(ResultRecord),
    /// Store contract code.
    SetCode(CodeRecord),
    /// Open a lifeline with its first state.
    Activate {
        /// The object being activated.
        object: ObjectId,
        /// The activation record.
        record: ActivateRecord,
    },
    /// Chain a new state onto the lifeline.
    Amend {
        /// The amended object.
        object: ObjectId,
        /// The amendment record.
        record: AmendRecord,
    },
    /// Close the lifeline.
    Deactivate {
        /// The deactivated object.
        object: ObjectId,
        /// The deactivation record.
        record: DeactivateRecord,
    },
    /// Register a child under the lifeline.
    RegisterChild {
        /// The parent object.
        object: ObjectId,
        /// The child registration record.
        record: ChildRecord,
    },
}

impl Submission {
    /// The record this submission commits.
    #[must_use]
    pub fn to_record(&self) -> Record {
        match self {
            Self::SetIncomingRequest(req) => Record::IncomingRequest(req.clone()),
            Self::SetOutgoingRequest(req) => Record::OutgoingRequest(req.clone()),
            Self::SetResult(res) => Record::Result(res.clone()),
            Self::SetCode(code) => Record::Code(code.clone()),
            Self::Activate { record, .. } => Record::Activate(record.clone()),
            Self::Amend { record, .. } => Record::Amend(record.clone()),
            Self::Deactivate { record, .. } => Record::Deactivate(record.clone()),
            Self::RegisterChild { record, .. } => Record::Child(record.clone()),
        }
    }

    /// The object the submission routes by. Requests without a callee and
    /// code records route by their own record id.
    #[must_use]
    pub fn affinity(&self, record_id: ObjectId) -> ObjectId {
        match self {
            Self::SetIncomingRequest(req) => {
                req.object.map_or(record_id, |reference| reference.object)
            }
            Self::SetOutgoingRequest(req) => {
                req.object.map_or(record_id, |reference| reference.object)
            }
            Self::SetResult(res) => res.object,
            Self::SetCode(_) => record_id,
            Self::Activate { object, .. }
            | Self::Amend { object, .. }
            | Self::Deactivate { object, .. }
            | Self::RegisterChild { object, .. } => *object,
        }
    }
}

/// What the engine answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineReply {
    /// The submission committed (or was an idempotent re-commit); here is
    /// the record id.
    Record {
        /// The committed record's id.
        id: ObjectId,
    },
    /// This node is not the executor; resend to `target`.
    Pass {
        /// The authoritative node.
        target: NodeRef,
    },
}

/// Striped per-object mutexes. One stripe serializes all commits for the
/// objects hashing into it; different stripes proceed in parallel.
struct ObjectLocks {
    stripes: Vec<Mutex<()>>,
}

impl ObjectLocks {
    fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, object: &ObjectId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        object.as_bytes().hash(&mut hasher);
        let index = (hasher.finish() % LOCK_STRIPES as u64) as usize;
        self.stripes[index].lock().await
    }
}

/// The lifeline engine.
pub struct LifelineEngine {
    tree: Arc<TreeStore>,
    fetcher: Arc<JetFetcher>,
    coordinator: Arc<Coordinator>,
    records: Arc<RecordStore>,
    blobs: Arc<BlobStore>,
    indices: Arc<IndexStore>,
    pulses: Arc<PulseLog>,
    locks: ObjectLocks,
    pending_limit: usize,
}

impl LifelineEngine {
    /// Wires the engine to its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tree: Arc<TreeStore>,
        fetcher: Arc<JetFetcher>,
        coordinator: Arc<Coordinator>,
        records: Arc<RecordStore>,
        blobs: Arc<BlobStore>,
        indices: Arc<IndexStore>,
        pulses: Arc<PulseLog>,
        pending_limit: usize,
    ) -> Self {
        Self {
            tree,
            fetcher,
            coordinator,
            records,
            blobs,
            indices,
            pulses,
            locks: ObjectLocks::new(),
            pending_limit,
        }
    }

    /// Processes a submission against the latest pulse.
    pub async fn submit(
        &self,
        submission: Submission,
        ctx: &CancellationToken,
    ) -> Result<EngineReply, CoreError> {
        let pulse = self.pulses.latest()?;
        self.submit_at(pulse, submission, ctx).await
    }

    /// Processes a submission pinned to `pulse`. Fails with `FlowCanceled`
    /// if the log has moved past it by commit time.
    pub async fn submit_at(
        &self,
        pulse: Pulse,
        submission: Submission,
        ctx: &CancellationToken,
    ) -> Result<EngineReply, CoreError> {
        let record = submission.to_record();
        let record_id = record.id_at(pulse.number);
        let object = submission.affinity(record_id);

        // 1. route
        let (jet, actual) = self.tree.find(pulse.number, &object);
        let jet = if actual {
            jet
        } else {
            self.fetcher.fetch(object, pulse.number, ctx).await?
        };
        trace!(%object, %jet, pulse = %pulse.number, "submission routed");

        // 2. authorize
        let executor = self
            .coordinator
            .executor_for(Role::LightExecutor, &object, &pulse)?;
        if executor != self.coordinator.me() {
            debug!(%object, target = %executor, "not the executor, passing");
            return Ok(EngineReply::Pass { target: executor });
        }

        // 3..6 run under the object's stripe; no await happens inside.
        let _guard = self.locks.lock(&object).await;
        let current = self.pulses.latest()?;
        if current.number != pulse.number {
            return Err(CoreError::FlowCanceled {
                current: current.number,
            });
        }
        self.commit(pulse.number, jet, object, &submission, record, record_id)
    }

    fn commit(
        &self,
        pulse: PulseNumber,
        jet: JetId,
        object: ObjectId,
        submission: &Submission,
        record: Record,
        record_id: ObjectId,
    ) -> Result<EngineReply, CoreError> {
        let mut bucket = self.load_bucket(pulse, &object)?;

        // 4. validate
        match submission {
            Submission::SetIncomingRequest(req) => {
                validate_request(&bucket, self.pending_limit, &req.reason, &req.caller)?;
            }
            Submission::SetOutgoingRequest(req) => {
                validate_request(&bucket, self.pending_limit, &req.reason, &req.caller)?;
            }
            Submission::SetResult(res) => {
                if self.indices.last_known_pulse(&object)?.is_none() {
                    return Err(CoreError::not_found("lifeline"));
                }
                if !bucket.open_requests.contains(&res.request) {
                    return Err(CoreError::InvalidState {
                        details: format!("no open request {} on {}", res.request, object),
                    });
                }
            }
            Submission::SetCode(_) => {}
            Submission::Activate { .. } => {
                if bucket.lifeline.is_deactivated() {
                    return Err(CoreError::Deactivated { object });
                }
                if bucket.lifeline.latest_state.is_some() {
                    return Err(CoreError::InvalidState {
                        details: format!("object {object} is already activated"),
                    });
                }
            }
            Submission::Amend { record: amend, .. } => {
                let lifeline = &bucket.lifeline;
                if lifeline.is_deactivated() {
                    return Err(CoreError::Deactivated { object });
                }
                if lifeline.latest_state != Some(amend.prev_state) {
                    return Err(CoreError::InvalidState {
                        details: format!(
                            "amend of {object} names stale state {}",
                            amend.prev_state
                        ),
                    });
                }
            }
            Submission::Deactivate { .. } => {
                if self.indices.last_known_pulse(&object)?.is_none() {
                    return Err(CoreError::not_found("lifeline"));
                }
                if bucket.lifeline.is_deactivated() {
                    return Err(CoreError::Deactivated { object });
                }
            }
            Submission::RegisterChild { record: child, .. } => {
                if bucket.lifeline.is_deactivated() {
                    return Err(CoreError::Deactivated { object });
                }
                if child.prev_child != bucket.lifeline.child_pointer {
                    return Err(CoreError::InvalidState {
                        details: format!("child chain of {object} does not match"),
                    });
                }
            }
        }

        // 5. hash & commit
        let material = MaterialRecord {
            record: record.clone(),
            jet,
        };
        let is_new = self.records.set(&record_id, &material)?;
        if !is_new {
            // idempotent re-commit: the filament and lifeline were already
            // updated when the record first landed
            return Ok(EngineReply::Record { id: record_id });
        }

        match submission {
            Submission::SetIncomingRequest(_) | Submission::SetOutgoingRequest(_) => {
                self.thread_filament(pulse, jet, &mut bucket, record_id)?;
                bucket.open_requests.push(record_id);
                let earliest = bucket
                    .lifeline
                    .earliest_open_request
                    .map_or(pulse, |existing| existing.min(pulse));
                bucket.lifeline.earliest_open_request = Some(earliest);
            }
            Submission::SetResult(res) => {
                self.thread_filament(pulse, jet, &mut bucket, record_id)?;
                bucket.open_requests.retain(|open| *open != res.request);
                if bucket.open_requests.is_empty() {
                    bucket.lifeline.earliest_open_request = None;
                }
            }
            Submission::SetCode(_) => {}
            Submission::Activate { record: rec, .. } => {
                self.blobs.set(&record_id, &rec.memory)?;
                bucket.lifeline.latest_state = Some(record_id);
                bucket.lifeline.latest_state_kind = StateKind::Activate;
                bucket.lifeline.parent = rec.parent;
            }
            Submission::Amend { record: rec, .. } => {
                self.blobs.set(&record_id, &rec.memory)?;
                bucket.lifeline.latest_state = Some(record_id);
                bucket.lifeline.latest_state_kind = StateKind::Amend;
            }
            Submission::Deactivate { .. } => {
                bucket.lifeline.latest_state = Some(record_id);
                bucket.lifeline.latest_state_kind = StateKind::Deactivate;
            }
            Submission::RegisterChild { .. } => {
                bucket.lifeline.child_pointer = Some(record_id);
            }
        }

        if !matches!(submission, Submission::SetCode(_)) {
            self.indices.set_bucket(pulse, &bucket)?;
        }
        debug!(%object, id = %record_id, kind = ?record.kind(), "record committed");

        // 6. reply
        Ok(EngineReply::Record { id: record_id })
    }

    /// Appends one filament link pointing at `record_id` and moves the head.
    fn thread_filament(
        &self,
        pulse: PulseNumber,
        jet: JetId,
        bucket: &mut FilamentBucket,
        record_id: ObjectId,
    ) -> Result<(), CoreError> {
        let meta = Record::PendingFilament(PendingFilament {
            record_id,
            previous: bucket.lifeline.pending_pointer,
        });
        let meta_id = meta.id_at(pulse);
        self.records
            .set(&meta_id, &MaterialRecord { record: meta, jet })?;
        bucket.pending_records.push(meta_id);
        bucket.lifeline.pending_pointer = Some(meta_id);
        Ok(())
    }

    fn load_bucket(
        &self,
        pulse: PulseNumber,
        object: &ObjectId,
    ) -> Result<FilamentBucket, CoreError> {
        match self.indices.bucket(pulse, object) {
            Ok(bucket) => Ok(bucket),
            Err(CoreError::NotFound { .. }) => match self.indices.bucket_or_latest(pulse, object)
            {
                Ok(older) => Ok(older.carried_forward()),
                Err(CoreError::NotFound { .. }) => Ok(FilamentBucket::new(*object)),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        }
    }
}

fn validate_request(
    bucket: &FilamentBucket,
    limit: usize,
    reason: &crate::id::Reference,
    caller: &crate::id::Reference,
) -> Result<(), CoreError> {
    if reason.is_zero() {
        return Err(CoreError::InvalidState {
            details: "request without a reason reference".to_owned(),
        });
    }
    if caller.object.is_zero() {
        return Err(CoreError::InvalidState {
            details: "request without caller affinity".to_owned(),
        });
    }
    if bucket.lifeline.is_deactivated() {
        return Err(CoreError::Deactivated {
            object: bucket.object,
        });
    }
    if bucket.open_requests.len() >= limit {
        return Err(CoreError::TooManyPendings {
            object: bucket.object,
            limit,
        });
    }
    Ok(())
}
