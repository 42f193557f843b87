//! Crate-wide error taxonomy.
//!
//! Every cross-component fault in the core maps onto one of the kinds below.
//! Recoverable kinds ([`CoreError::NotExecutor`], [`CoreError::StaleTree`],
//! [`CoreError::FlowCanceled`], [`CoreError::Timeout`]) carry enough metadata
//! for the caller to retry; the rest are terminal for the operation.
//! [`CoreError::Fatal`] signals a storage-layer invariant violation and must
//! abort the node.
//!
//! Errors crossing the wire travel as an `Error` message with a stable
//! numeric code (see [`CoreError::wire_code`]); peers map the code back to a
//! local kind with [`CoreError::from_wire`].

use std::time::Duration;

use thiserror::Error;

use crate::id::{NodeRef, ObjectId};
use crate::jet::JetId;
use crate::pulse::PulseNumber;

/// The core fault taxonomy.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Pulse, record, lifeline or jet unknown.
    #[error("{what} not found")]
    NotFound {
        /// What was looked up.
        what: &'static str,
    },

    /// Pulse append violates the log sequence.
    #[error("pulse {got} out of order (last appended: {last})")]
    OutOfOrder {
        /// The highest pulse already in the log.
        last: PulseNumber,
        /// The pulse that was rejected.
        got: PulseNumber,
    },

    /// The local jet tree has no actual leaf for the object.
    #[error("jet tree for pulse {pulse} is stale at {jet}")]
    StaleTree {
        /// Pulse whose tree was consulted.
        pulse: PulseNumber,
        /// The non-actual leaf that was found.
        jet: JetId,
    },

    /// The local node is not the executor for the target jet at this pulse.
    ///
    /// Surfaced to peers as a `Pass` redirect naming the correct target.
    #[error("not the executor, pass to {target}")]
    NotExecutor {
        /// The node that is authoritative.
        target: NodeRef,
    },

    /// A new pulse arrived while the operation was in flight; nothing was
    /// applied. The caller retries against the new pulse.
    #[error("flow canceled: pulse advanced to {current}")]
    FlowCanceled {
        /// The pulse that superseded the operation.
        current: PulseNumber,
    },

    /// The operation targets a deactivated lifeline.
    #[error("object {object} is deactivated")]
    Deactivated {
        /// The deactivated object.
        object: ObjectId,
    },

    /// Content-hash collision on commit with a differing payload.
    ///
    /// A commit whose payload matches the stored bytes is idempotent and does
    /// not raise this.
    #[error("record {id} already stored with different content")]
    DuplicateRecord {
        /// The colliding record id.
        id: ObjectId,
    },

    /// The object exceeded its pending-request limit.
    #[error("object {object} has too many pending requests (limit {limit})")]
    TooManyPendings {
        /// The overloaded object.
        object: ObjectId,
        /// The configured limit.
        limit: usize,
    },

    /// A lifeline transition that the state chain forbids.
    #[error("invalid state transition: {details}")]
    InvalidState {
        /// Which precondition failed.
        details: String,
    },

    /// Deadline exceeded or the operation was canceled at a suspension
    /// point.
    #[error("timed out after {after:?}: {details}")]
    Timeout {
        /// The deadline that elapsed.
        after: Duration,
        /// Cause marker (reply never arrived, fetch failed, canceled).
        details: String,
    },

    /// Storage-layer invariant violation. The node must shut down.
    #[error("fatal: {details}")]
    Fatal {
        /// Description of the violated invariant.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for [`CoreError::NotFound`].
    #[must_use]
    pub const fn not_found(what: &'static str) -> Self {
        Self::NotFound { what }
    }

    /// Shorthand for [`CoreError::Fatal`].
    #[must_use]
    pub fn fatal(details: impl Into<String>) -> Self {
        Self::Fatal {
            details: details.into(),
        }
    }

    /// True for kinds the caller is expected to retry.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotExecutor { .. }
                | Self::StaleTree { .. }
                | Self::FlowCanceled { .. }
                | Self::Timeout { .. }
        )
    }

    /// Stable numeric code used by the wire `Error` message.
    #[must_use]
    pub const fn wire_code(&self) -> u32 {
        match self {
            Self::NotFound { .. } => 1,
            Self::OutOfOrder { .. } => 2,
            Self::StaleTree { .. } => 3,
            Self::NotExecutor { .. } => 4,
            Self::FlowCanceled { .. } => 5,
            Self::Deactivated { .. } => 6,
            Self::DuplicateRecord { .. } => 7,
            Self::TooManyPendings { .. } => 8,
            Self::InvalidState { .. } => 9,
            Self::Timeout { .. } => 10,
            Self::Fatal { .. } => 11,
        }
    }

    /// Maps a wire code and free-text field back to a local kind.
    ///
    /// Codes outside the table collapse to [`CoreError::Fatal`]; the text is
    /// preserved either way.
    #[must_use]
    pub fn from_wire(code: u32, text: &str) -> Self {
        match code {
            1 => Self::NotFound { what: "remote" },
            2 => Self::OutOfOrder {
                last: PulseNumber::new(0),
                got: PulseNumber::new(0),
            },
            3 => Self::StaleTree {
                pulse: PulseNumber::new(0),
                jet: JetId::ROOT,
            },
            4 => Self::NotExecutor {
                target: NodeRef::ZERO,
            },
            5 => Self::FlowCanceled {
                current: PulseNumber::new(0),
            },
            6 => Self::Deactivated {
                object: ObjectId::ZERO,
            },
            7 => Self::DuplicateRecord {
                id: ObjectId::ZERO,
            },
            8 => Self::TooManyPendings {
                object: ObjectId::ZERO,
                limit: 0,
            },
            9 => Self::InvalidState {
                details: text.to_owned(),
            },
            10 => Self::Timeout {
                after: Duration::ZERO,
                details: text.to_owned(),
            },
            _ => Self::Fatal {
                details: text.to_owned(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert!(CoreError::StaleTree {
            pulse: PulseNumber::new(100),
            jet: JetId::ROOT,
        }
        .is_recoverable());
        assert!(CoreError::FlowCanceled {
            current: PulseNumber::new(100),
        }
        .is_recoverable());
        assert!(!CoreError::fatal("broken").is_recoverable());
        assert!(!CoreError::not_found("pulse").is_recoverable());
    }

    #[test]
    fn wire_codes_round_trip_kind() {
        let errs = [
            CoreError::not_found("record"),
            CoreError::Deactivated {
                object: ObjectId::ZERO,
            },
            CoreError::fatal("storage"),
        ];
        for err in errs {
            let mapped = CoreError::from_wire(err.wire_code(), &err.to_string());
            assert_eq!(mapped.wire_code(), err.wire_code());
        }
    }
}
