//! Deterministic and random value generators for tests.
//!
//! Shared by the core's own tests and by downstream crates exercising the
//! dispatch surface. Not for production use.

use rand::RngCore;

use crate::id::{NodeRef, ObjectId, RECORD_HASH_SIZE, Reference};
use crate::pulse::{ENTROPY_SIZE, Pulse, PulseNumber};

/// An object id with a fixed hash byte, for readable assertions.
#[must_use]
pub fn object_id(pulse: PulseNumber, seed: u8) -> ObjectId {
    ObjectId::new(pulse, [seed; RECORD_HASH_SIZE])
}

/// A random object id created at `pulse`.
#[must_use]
pub fn random_object_id(pulse: PulseNumber) -> ObjectId {
    let mut hash = [0u8; RECORD_HASH_SIZE];
    rand::thread_rng().fill_bytes(&mut hash);
    ObjectId::new(pulse, hash)
}

/// A reference with only the object component set.
#[must_use]
pub fn reference(pulse: PulseNumber, seed: u8) -> Reference {
    Reference::from_object(object_id(pulse, seed))
}

/// A node reference with a fixed byte pattern.
#[must_use]
pub fn node_ref(seed: u8) -> NodeRef {
    NodeRef::from_bytes([seed; 32])
}

/// A pulse with fixed entropy, linked to its neighbors.
#[must_use]
pub fn pulse(number: u32, prev: u32, next: u32) -> Pulse {
    Pulse {
        number: PulseNumber::new(number),
        prev: PulseNumber::new(prev),
        next: PulseNumber::new(next),
        unix_time: 1_700_000_000,
        entropy: [7u8; ENTROPY_SIZE],
    }
}
