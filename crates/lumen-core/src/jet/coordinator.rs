//! The jet coordinator (C5): who is authoritative for what, when.
//!
//! Role assignment is a deterministic rendezvous: every eligible node gets a
//! 64-bit score derived from the pulse entropy, the jet prefix, the node
//! reference and the role; the executor is the maximum, validators are the
//! next maxima, ties go to the lexicographically smaller reference. Any node
//! with the same roster computes the same assignment without coordination.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::CoreError;
use crate::id::{NodeRef, ObjectId};
use crate::pulse::{Pulse, PulseNumber};

use super::{JetId, TreeStore};

/// Node roles a certificate can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Executes contract calls for virtual objects.
    VirtualExecutor,
    /// Audits virtual execution.
    VirtualValidator,
    /// Accepts record submissions for a jet (the write path).
    LightExecutor,
    /// Audits light material writes.
    LightValidator,
    /// Long-term storage for replicated pulses.
    HeavyExecutor,
}

impl Role {
    /// Stable byte tag mixed into rendezvous scores.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::VirtualExecutor => 1,
            Self::VirtualValidator => 2,
            Self::LightExecutor => 3,
            Self::LightValidator => 4,
            Self::HeavyExecutor => 5,
        }
    }
}

/// One roster entry: a node, what its certificate permits, and whether the
/// membership service saw it active at the pulse.
#[derive(Debug, Clone)]
pub struct NodeProfile {
    /// The node's reference.
    pub reference: NodeRef,
    /// Roles the node's certificate permits.
    pub roles: Vec<Role>,
    /// Whether the node is active in the roster at this pulse.
    pub active: bool,
}

impl NodeProfile {
    /// Whether the node may be assigned `role` at all.
    #[must_use]
    pub fn eligible_for(&self, role: Role) -> bool {
        self.active && self.roles.contains(&role)
    }
}

/// Per-pulse membership input, provided by the external gossip service.
pub trait RosterProvider: Send + Sync {
    /// The node set the membership service certified for `pulse`.
    fn nodes_for_pulse(&self, pulse: PulseNumber) -> Result<Vec<NodeProfile>, CoreError>;
}

/// The coordinator itself. Holds read-only handles; owns nothing mutable.
pub struct Coordinator {
    roster: Arc<dyn RosterProvider>,
    tree: Arc<TreeStore>,
    me: NodeRef,
}

impl Coordinator {
    /// Builds a coordinator for the local node `me`.
    #[must_use]
    pub fn new(roster: Arc<dyn RosterProvider>, tree: Arc<TreeStore>, me: NodeRef) -> Self {
        Self { roster, tree, me }
    }

    /// The local node's reference.
    #[must_use]
    pub const fn me(&self) -> NodeRef {
        self.me
    }

    /// The single authoritative node for (`object`, `pulse`, `role`).
    pub fn executor_for(
        &self,
        role: Role,
        object: &ObjectId,
        pulse: &Pulse,
    ) -> Result<NodeRef, CoreError> {
        let ranked = self.ranked(role, object, pulse)?;
        ranked
            .first()
            .copied()
            .ok_or(CoreError::not_found("eligible node"))
    }

    /// The `count` validators for (`object`, `pulse`, `role`): the nodes
    /// ranked directly below the executor.
    pub fn validators_for(
        &self,
        role: Role,
        object: &ObjectId,
        pulse: &Pulse,
        count: usize,
    ) -> Result<Vec<NodeRef>, CoreError> {
        let ranked = self.ranked(role, object, pulse)?;
        if ranked.is_empty() {
            return Err(CoreError::not_found("eligible node"));
        }
        Ok(ranked.into_iter().skip(1).take(count).collect())
    }

    /// Whether the local node is the executor for (`object`, `pulse`,
    /// `role`).
    pub fn is_me_executor(
        &self,
        role: Role,
        object: &ObjectId,
        pulse: &Pulse,
    ) -> Result<bool, CoreError> {
        Ok(self.executor_for(role, object, pulse)? == self.me)
    }

    /// All nodes eligible for `role` at `pulse`, unranked. The fetcher uses
    /// this to sample query peers.
    pub fn nodes_in_role(
        &self,
        role: Role,
        pulse: PulseNumber,
    ) -> Result<Vec<NodeRef>, CoreError> {
        Ok(self
            .roster
            .nodes_for_pulse(pulse)?
            .into_iter()
            .filter(|profile| profile.eligible_for(role))
            .map(|profile| profile.reference)
            .collect())
    }

    /// The single authoritative node for (`jet`, `pulse`, `role`), for
    /// callers that already hold a jet (replication fan-out).
    pub fn executor_for_jet(
        &self,
        role: Role,
        jet: &JetId,
        pulse: &Pulse,
    ) -> Result<NodeRef, CoreError> {
        self.ranked_for_jet(role, jet, pulse)?
            .first()
            .copied()
            .ok_or(CoreError::not_found("eligible node"))
    }

    fn ranked(
        &self,
        role: Role,
        object: &ObjectId,
        pulse: &Pulse,
    ) -> Result<Vec<NodeRef>, CoreError> {
        let (jet, _) = self.tree.find(pulse.number, object);
        self.ranked_for_jet(role, &jet, pulse)
    }

    fn ranked_for_jet(
        &self,
        role: Role,
        jet: &JetId,
        pulse: &Pulse,
    ) -> Result<Vec<NodeRef>, CoreError> {
        let mut scored: Vec<(u64, NodeRef)> = self
            .roster
            .nodes_for_pulse(pulse.number)?
            .into_iter()
            .filter(|profile| profile.eligible_for(role))
            .map(|profile| {
                (
                    rendezvous_score(pulse, jet, &profile.reference, role),
                    profile.reference,
                )
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(scored.into_iter().map(|(_, reference)| reference).collect())
    }
}

/// The 64-bit rendezvous score for one candidate.
fn rendezvous_score(pulse: &Pulse, jet: &JetId, node: &NodeRef, role: Role) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(pulse.entropy);
    hasher.update([jet.depth()]);
    hasher.update(jet.prefix());
    hasher.update(node.as_bytes());
    hasher.update([role.tag()]);
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use crate::pulse::ENTROPY_SIZE;

    use super::*;

    struct FixedRoster(Vec<NodeProfile>);

    impl RosterProvider for FixedRoster {
        fn nodes_for_pulse(&self, _pulse: PulseNumber) -> Result<Vec<NodeProfile>, CoreError> {
            Ok(self.0.clone())
        }
    }

    fn node(byte: u8) -> NodeRef {
        NodeRef::from_bytes([byte; 32])
    }

    fn profile(byte: u8, roles: &[Role]) -> NodeProfile {
        NodeProfile {
            reference: node(byte),
            roles: roles.to_vec(),
            active: true,
        }
    }

    fn pulse_with_entropy(entropy_byte: u8) -> Pulse {
        Pulse {
            number: PulseNumber::new(65636),
            prev: crate::pulse::GENESIS_PULSE,
            next: PulseNumber::new(65646),
            unix_time: 0,
            entropy: [entropy_byte; ENTROPY_SIZE],
        }
    }

    fn coordinator(profiles: Vec<NodeProfile>, me: NodeRef) -> Coordinator {
        Coordinator::new(
            Arc::new(FixedRoster(profiles)),
            Arc::new(TreeStore::new()),
            me,
        )
    }

    #[test]
    fn assignment_is_deterministic() {
        let profiles: Vec<_> = (1..=5)
            .map(|b| profile(b, &[Role::LightExecutor]))
            .collect();
        let coord = coordinator(profiles, node(1));
        let pulse = pulse_with_entropy(7);
        let obj = ObjectId::ZERO;

        let first = coord
            .executor_for(Role::LightExecutor, &obj, &pulse)
            .expect("executor");
        for _ in 0..10 {
            assert_eq!(
                coord
                    .executor_for(Role::LightExecutor, &obj, &pulse)
                    .expect("executor"),
                first
            );
        }
    }

    #[test]
    fn entropy_reshuffles_assignment() {
        let profiles: Vec<_> = (1..=16)
            .map(|b| profile(b, &[Role::LightExecutor]))
            .collect();
        let coord = coordinator(profiles, node(1));
        let obj = ObjectId::ZERO;

        let picks: Vec<_> = (0..16)
            .map(|e| {
                coord
                    .executor_for(Role::LightExecutor, &obj, &pulse_with_entropy(e))
                    .expect("executor")
            })
            .collect();
        // with 16 nodes and 16 entropies at least two picks must differ
        assert!(picks.iter().any(|pick| *pick != picks[0]));
    }

    #[test]
    fn ineligible_nodes_are_skipped() {
        let mut inactive = profile(1, &[Role::LightExecutor]);
        inactive.active = false;
        let heavy_only = profile(2, &[Role::HeavyExecutor]);
        let light = profile(3, &[Role::LightExecutor]);
        let coord = coordinator(vec![inactive, heavy_only, light], node(3));
        let pulse = pulse_with_entropy(0);

        assert_eq!(
            coord
                .executor_for(Role::LightExecutor, &ObjectId::ZERO, &pulse)
                .expect("executor"),
            node(3)
        );
        assert!(coord
            .executor_for(Role::VirtualExecutor, &ObjectId::ZERO, &pulse)
            .is_err());
    }

    #[test]
    fn validators_are_the_next_maxima() {
        let profiles: Vec<_> = (1..=6)
            .map(|b| profile(b, &[Role::LightValidator]))
            .collect();
        let coord = coordinator(profiles, node(1));
        let pulse = pulse_with_entropy(3);
        let obj = ObjectId::ZERO;

        let executor = coord
            .executor_for(Role::LightValidator, &obj, &pulse)
            .expect("executor");
        let validators = coord
            .validators_for(Role::LightValidator, &obj, &pulse, 3)
            .expect("validators");
        assert_eq!(validators.len(), 3);
        assert!(!validators.contains(&executor));
    }

    #[test]
    fn roles_get_independent_assignments() {
        let profiles: Vec<_> = (1..=16)
            .map(|b| profile(b, &[Role::LightExecutor, Role::VirtualExecutor]))
            .collect();
        let coord = coordinator(profiles, node(1));
        let obj = ObjectId::ZERO;

        // scores mix in the role tag, so across entropies the two roles
        // cannot always agree
        let disagree = (0..16).any(|e| {
            let pulse = pulse_with_entropy(e);
            coord
                .executor_for(Role::LightExecutor, &obj, &pulse)
                .expect("light")
                != coord
                    .executor_for(Role::VirtualExecutor, &obj, &pulse)
                    .expect("virtual")
        });
        assert!(disagree);
    }
}
