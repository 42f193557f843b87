//! Static membership roster.
//!
//! The real system receives per-pulse node lists from an external gossip
//! membership service. This provider serves a fixed roster from the config
//! file through the same seam, which is all a small deployment needs.

use lumen_core::CoreError;
use lumen_core::NodeRef;
use lumen_core::jet::{NodeProfile, Role, RosterProvider};
use lumen_core::pulse::PulseNumber;
use thiserror::Error;

use crate::config::RosterEntry;

/// Errors raised while building the roster from config.
#[derive(Debug, Error)]
pub enum RosterError {
    /// A reference field was not 32 hex-encoded bytes.
    #[error("bad node reference {reference:?}")]
    BadReference {
        /// The offending field value.
        reference: String,
    },

    /// A role name is not in the table.
    #[error("unknown role {role:?}")]
    UnknownRole {
        /// The offending role name.
        role: String,
    },
}

/// Parses a config role name.
pub fn parse_role(name: &str) -> Result<Role, RosterError> {
    match name {
        "virtual_executor" => Ok(Role::VirtualExecutor),
        "virtual_validator" => Ok(Role::VirtualValidator),
        "light_executor" => Ok(Role::LightExecutor),
        "light_validator" => Ok(Role::LightValidator),
        "heavy_executor" => Ok(Role::HeavyExecutor),
        other => Err(RosterError::UnknownRole {
            role: other.to_owned(),
        }),
    }
}

fn parse_reference(hex: &str) -> Result<NodeRef, RosterError> {
    let bad = || RosterError::BadReference {
        reference: hex.to_owned(),
    };
    if hex.len() != 64 {
        return Err(bad());
    }
    let mut bytes = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk).map_err(|_| bad())?;
        bytes[i] = u8::from_str_radix(pair, 16).map_err(|_| bad())?;
    }
    Ok(NodeRef::from_bytes(bytes))
}

/// Renders a node reference as the hex form the config uses.
#[must_use]
pub fn reference_hex(reference: &NodeRef) -> String {
    reference
        .as_bytes()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// A fixed roster served for every pulse.
pub struct StaticRoster {
    profiles: Vec<NodeProfile>,
}

impl StaticRoster {
    /// Builds the roster from config entries, always including the local
    /// node with its configured roles.
    pub fn from_config(
        entries: &[RosterEntry],
        me: NodeRef,
        my_roles: &[Role],
    ) -> Result<Self, RosterError> {
        let mut profiles = Vec::with_capacity(entries.len() + 1);
        for entry in entries {
            let reference = parse_reference(&entry.reference)?;
            let roles = entry
                .roles
                .iter()
                .map(|name| parse_role(name))
                .collect::<Result<Vec<_>, _>>()?;
            profiles.push(NodeProfile {
                reference,
                roles,
                active: entry.active,
            });
        }
        if !profiles.iter().any(|profile| profile.reference == me) {
            profiles.push(NodeProfile {
                reference: me,
                roles: my_roles.to_vec(),
                active: true,
            });
        }
        Ok(Self { profiles })
    }
}

impl RosterProvider for StaticRoster {
    fn nodes_for_pulse(&self, _pulse: PulseNumber) -> Result<Vec<NodeProfile>, CoreError> {
        Ok(self.profiles.clone())
    }
}
