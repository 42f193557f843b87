//! # lumen-core
//!
//! Core of a pulse-driven, jet-sharded ledger: object state is partitioned
//! across a dynamically splittable binary prefix tree, global time advances
//! in discrete pulses, and per-object histories accumulate as append-only
//! lifelines of content-addressed records. Cross-pulse replication drains
//! light (short-term) storage into heavy (long-term) storage behind the
//! TopSyncPulse completeness barrier.
//!
//! ## Subsystems
//!
//! - [`pulse`]: the pulse value and the append-only, gap-checked pulse log
//! - [`jet`]: jet ids, the versioned prefix tree, the rendezvous
//!   coordinator, and the single-flight fetcher
//! - [`record`]: the record union, canonical encoding, content-addressed
//!   record and blob stores
//! - [`index`]: lifeline snapshots and filament buckets
//! - [`lifeline`]: the submission engine (route, authorize, validate,
//!   commit)
//! - [`requester`]: call/result correlation for contract calls
//! - [`keeper`]: per-pulse ack accumulation and the TopSyncPulse cursor
//! - [`replication`]: heavy payload gathering, drops, hot handoff, light
//!   eviction
//! - [`message`]: the wire tagged union and the signed envelope
//! - [`storage`]: the scoped key-value layer under everything
//!
//! Transport, membership, the pulsar clock and contract execution are
//! external collaborators; this crate defines only the seams they plug
//! into ([`jet::JetQuery`], [`jet::RosterProvider`],
//! [`requester::CallSender`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::future::Future;
use std::pin::Pin;

pub mod crypto;
pub mod error;
pub mod id;
pub mod index;
pub mod jet;
pub mod keeper;
pub mod lifeline;
pub mod message;
pub mod pulse;
pub mod record;
pub mod replication;
pub mod requester;
pub mod storage;
pub mod testing;

/// A boxed future for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use error::CoreError;
pub use id::{NodeRef, ObjectId, Reference};
pub use jet::JetId;
pub use pulse::{GENESIS_PULSE, Pulse, PulseNumber};
