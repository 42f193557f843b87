//! Pulses: discrete epochs of global time.
//!
//! A pulse number is a monotonically increasing 32-bit value, never reused.
//! [`GENESIS_PULSE`] is the fixed sentinel lower bound; every real pulse is
//! strictly above it.

mod log;

pub use log::PulseLog;

use std::fmt;

use prost::Message;

/// Size of a big-endian encoded pulse number.
pub const PULSE_NUMBER_SIZE: usize = 4;

/// A 32-bit pulse number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PulseNumber(u32);

/// The sentinel first pulse. Numbers at or below it are reserved.
pub const GENESIS_PULSE: PulseNumber = PulseNumber(65537);

impl PulseNumber {
    /// Wraps a raw number.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// The raw number.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Big-endian bytes, the form used in storage keys.
    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; PULSE_NUMBER_SIZE] {
        self.0.to_be_bytes()
    }

    /// Parses a pulse number from 4 big-endian bytes.
    #[must_use]
    pub fn from_be_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; PULSE_NUMBER_SIZE] = slice.try_into().ok()?;
        Some(Self(u32::from_be_bytes(bytes)))
    }

    /// Whether this is the genesis sentinel.
    #[must_use]
    pub const fn is_genesis(self) -> bool {
        self.0 == GENESIS_PULSE.0
    }
}

impl fmt::Display for PulseNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PulseNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PulseNumber({})", self.0)
    }
}

/// Size of the entropy carried by each pulse.
pub const ENTROPY_SIZE: usize = 32;

/// One epoch of global time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    /// This pulse's number.
    pub number: PulseNumber,
    /// The previous pulse's number.
    pub prev: PulseNumber,
    /// The announced next pulse's number.
    pub next: PulseNumber,
    /// Wall-clock seconds since the unix epoch at pulse issue.
    pub unix_time: u64,
    /// Entropy distributed with the pulse; seeds coordinator scores.
    pub entropy: [u8; ENTROPY_SIZE],
}

impl Pulse {
    /// The genesis pulse: sentinel number, zero entropy, epoch time zero.
    #[must_use]
    pub const fn genesis() -> Self {
        Self {
            number: GENESIS_PULSE,
            prev: GENESIS_PULSE,
            next: GENESIS_PULSE,
            unix_time: 0,
            entropy: [0u8; ENTROPY_SIZE],
        }
    }

    /// Encodes the pulse for persistence.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        PulseProto {
            number: self.number.get(),
            prev: self.prev.get(),
            next: self.next.get(),
            unix_time: self.unix_time,
            entropy: self.entropy.to_vec(),
        }
        .encode_to_vec()
    }

    /// Decodes a persisted pulse.
    pub fn decode(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        let proto = PulseProto::decode(bytes)?;
        let mut entropy = [0u8; ENTROPY_SIZE];
        let len = proto.entropy.len().min(ENTROPY_SIZE);
        entropy[..len].copy_from_slice(&proto.entropy[..len]);
        Ok(Self {
            number: PulseNumber::new(proto.number),
            prev: PulseNumber::new(proto.prev),
            next: PulseNumber::new(proto.next),
            unix_time: proto.unix_time,
            entropy,
        })
    }
}

#[derive(Clone, PartialEq, Message)]
struct PulseProto {
    #[prost(uint32, tag = "1")]
    number: u32,
    #[prost(uint32, tag = "2")]
    prev: u32,
    #[prost(uint32, tag = "3")]
    next: u32,
    #[prost(uint64, tag = "4")]
    unix_time: u64,
    #[prost(bytes = "vec", tag = "5")]
    entropy: Vec<u8>,
}
