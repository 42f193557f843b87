//! Object identifiers and references.
//!
//! An [`ObjectId`] is 32 bytes: the 4-byte big-endian pulse number of the
//! record's creation followed by a 28-byte content hash. Putting the pulse
//! first makes prefix scans over a pulse range cheap in the key-value store.
//!
//! A [`Reference`] pairs an object id with its domain id and identifies a
//! mutable entity; the object component drives sharding and history.
//!
//! A [`NodeRef`] identifies a network node. It is the node's 32-byte ed25519
//! verifying key, so a signed message envelope is verifiable without a side
//! lookup.

use std::fmt;

use crate::pulse::PulseNumber;

/// Size of an object id in bytes.
pub const OBJECT_ID_SIZE: usize = 32;

/// Size of the content-hash section of an object id.
pub const RECORD_HASH_SIZE: usize = 28;

/// Size of the embedded pulse prefix.
pub const PULSE_PREFIX_SIZE: usize = OBJECT_ID_SIZE - RECORD_HASH_SIZE;

/// A 32-byte object identifier with an embedded creation pulse.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId([u8; OBJECT_ID_SIZE]);

impl ObjectId {
    /// The all-zero id, used as an absent-value sentinel on the wire.
    pub const ZERO: Self = Self([0u8; OBJECT_ID_SIZE]);

    /// Builds an id from a pulse number and a 28-byte content hash.
    #[must_use]
    pub fn new(pulse: PulseNumber, hash: [u8; RECORD_HASH_SIZE]) -> Self {
        let mut bytes = [0u8; OBJECT_ID_SIZE];
        bytes[..PULSE_PREFIX_SIZE].copy_from_slice(&pulse.to_be_bytes());
        bytes[PULSE_PREFIX_SIZE..].copy_from_slice(&hash);
        Self(bytes)
    }

    /// Wraps raw bytes as an id.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; OBJECT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parses an id from a slice, rejecting wrong lengths.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, IdError> {
        let bytes: [u8; OBJECT_ID_SIZE] =
            slice.try_into().map_err(|_| IdError::BadLength {
                expected: OBJECT_ID_SIZE,
                actual: slice.len(),
            })?;
        Ok(Self(bytes))
    }

    /// The pulse embedded in the first four bytes.
    #[must_use]
    pub fn pulse(&self) -> PulseNumber {
        let mut be = [0u8; PULSE_PREFIX_SIZE];
        be.copy_from_slice(&self.0[..PULSE_PREFIX_SIZE]);
        PulseNumber::new(u32::from_be_bytes(be))
    }

    /// The 28-byte content-hash section.
    #[must_use]
    pub fn hash(&self) -> &[u8] {
        &self.0[PULSE_PREFIX_SIZE..]
    }

    /// The full 32 bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; OBJECT_ID_SIZE] {
        &self.0
    }

    /// Copies the id into a fresh vector, for wire fields.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Whether this is the zero sentinel.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; OBJECT_ID_SIZE]
    }

    /// Bit `index` of the id, most-significant bit of byte 0 first.
    ///
    /// Jet prefixes descend the id bit string in this order.
    #[must_use]
    pub fn bit(&self, index: u8) -> bool {
        let byte = self.0[usize::from(index / 8)];
        byte & (0x80 >> (index % 8)) != 0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.", self.pulse())?;
        for byte in &self.0[PULSE_PREFIX_SIZE..PULSE_PREFIX_SIZE + 4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…")
    }
}

/// A reference to a mutable entity: object id plus domain id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Reference {
    /// The object whose history the reference points into.
    pub object: ObjectId,
    /// The domain the object belongs to.
    pub domain: ObjectId,
}

impl Reference {
    /// The all-zero reference sentinel.
    pub const ZERO: Self = Self {
        object: ObjectId::ZERO,
        domain: ObjectId::ZERO,
    };

    /// Builds a reference.
    #[must_use]
    pub const fn new(object: ObjectId, domain: ObjectId) -> Self {
        Self { object, domain }
    }

    /// A reference with only the object component set.
    #[must_use]
    pub const fn from_object(object: ObjectId) -> Self {
        Self {
            object,
            domain: ObjectId::ZERO,
        }
    }

    /// Whether both components are the zero sentinel.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.object.is_zero() && self.domain.is_zero()
    }
}

/// A node identifier: the node's ed25519 verifying key bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef([u8; 32]);

impl NodeRef {
    /// The all-zero node reference sentinel.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Wraps raw verifying-key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses a node reference from a slice.
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, IdError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| IdError::BadLength {
            expected: 32,
            actual: slice.len(),
        })?;
        Ok(Self(bytes))
    }

    /// The raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Copies the reference into a fresh vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef({self})")
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…")
    }
}

/// Errors raised when parsing identifier bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input slice had the wrong length.
    #[error("bad identifier length: expected {expected} bytes, got {actual}")]
    BadLength {
        /// Required byte count.
        expected: usize,
        /// Provided byte count.
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_embeds_pulse_big_endian() {
        let id = ObjectId::new(PulseNumber::new(0x0102_0304), [7u8; RECORD_HASH_SIZE]);
        assert_eq!(&id.as_bytes()[..4], &[1, 2, 3, 4]);
        assert_eq!(id.pulse(), PulseNumber::new(0x0102_0304));
        assert_eq!(id.hash(), &[7u8; RECORD_HASH_SIZE]);
    }

    #[test]
    fn slice_parse_rejects_bad_length() {
        assert!(ObjectId::try_from_slice(&[0u8; 31]).is_err());
        assert!(ObjectId::try_from_slice(&[0u8; 32]).is_ok());
        assert!(NodeRef::try_from_slice(&[0u8; 16]).is_err());
    }

    #[test]
    fn bit_order_is_msb_first() {
        let mut bytes = [0u8; OBJECT_ID_SIZE];
        bytes[0] = 0b1100_0000;
        bytes[1] = 0b0000_0001;
        let id = ObjectId::from_bytes(bytes);
        assert!(id.bit(0));
        assert!(id.bit(1));
        assert!(!id.bit(2));
        assert!(id.bit(15));
    }

    #[test]
    fn zero_sentinels() {
        assert!(ObjectId::ZERO.is_zero());
        assert!(Reference::ZERO.is_zero());
        assert!(!Reference::from_object(ObjectId::new(
            PulseNumber::new(1),
            [1u8; RECORD_HASH_SIZE]
        ))
        .is_zero());
    }
}
