//! The jet fetcher (C6): discovering actual jets from peers.
//!
//! When the local tree answers `actual = false`, the fetcher asks other
//! light nodes which jet really covers the object at that pulse. Concurrent
//! callers for the same (pulse, prefix) collapse into a single network
//! round; every waiter receives the same result, and the underlying round
//! is canceled only when the last waiter departs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::BoxFuture;
use crate::error::CoreError;
use crate::id::{NodeRef, ObjectId};
use crate::pulse::PulseNumber;

use super::{Coordinator, JetId, Role, TreeStore};

/// How many peers one fetch round samples.
const FETCH_PEER_SAMPLE: usize = 8;

/// A peer's answer to a `GetJet` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchedJet {
    /// The leaf the peer resolved.
    pub jet: JetId,
    /// Whether the peer considers its leaf actual.
    pub actual: bool,
}

/// Transport seam for `GetJet` queries.
pub trait JetQuery: Send + Sync {
    /// Asks `node` which jet covers `object` at `pulse`.
    fn get_jet<'a>(
        &'a self,
        node: NodeRef,
        object: ObjectId,
        pulse: PulseNumber,
    ) -> BoxFuture<'a, Result<FetchedJet, CoreError>>;
}

type FlightKey = (u32, JetId);
type FlightResult = Result<JetId, CoreError>;

struct Flight {
    rx: watch::Receiver<Option<FlightResult>>,
    waiters: Arc<AtomicUsize>,
    token: CancellationToken,
}

/// Decrements the waiter count on drop; the last one out cancels the round.
struct WaiterGuard {
    waiters: Arc<AtomicUsize>,
    token: CancellationToken,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.waiters.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.token.cancel();
        }
    }
}

/// The jet fetcher (C6).
pub struct JetFetcher {
    tree: Arc<TreeStore>,
    coordinator: Arc<Coordinator>,
    query: Arc<dyn JetQuery>,
    peer_timeout: Duration,
    flights: Arc<Mutex<HashMap<FlightKey, Flight>>>,
}

impl JetFetcher {
    /// Builds a fetcher over the given tree, coordinator and transport.
    #[must_use]
    pub fn new(
        tree: Arc<TreeStore>,
        coordinator: Arc<Coordinator>,
        query: Arc<dyn JetQuery>,
        peer_timeout: Duration,
    ) -> Self {
        Self {
            tree,
            coordinator,
            query,
            peer_timeout,
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolves the actual jet for `object` at `pulse`.
    ///
    /// Returns immediately when the local tree already has an actual leaf.
    /// Otherwise joins (or starts) the single flight for the stale prefix.
    /// A successful fetch marks the leaf actual in the tree before waiters
    /// are woken.
    ///
    /// # Errors
    ///
    /// [`CoreError::StaleTree`] when no peer confirms an actual leaf within
    /// the peer timeout; [`CoreError::Timeout`] when `ctx` is canceled
    /// while waiting.
    pub async fn fetch(
        &self,
        object: ObjectId,
        pulse: PulseNumber,
        ctx: &CancellationToken,
    ) -> Result<JetId, CoreError> {
        let (stale_jet, actual) = self.tree.find(pulse, &object);
        if actual {
            return Ok(stale_jet);
        }

        let key = (pulse.get(), stale_jet);
        let (mut rx, _guard) = self.join_flight(key, object, pulse, stale_jet);

        loop {
            let settled = rx.borrow().clone();
            if let Some(result) = settled {
                return result;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(CoreError::Timeout {
                            after: self.peer_timeout,
                            details: "jet fetch driver went away".to_owned(),
                        });
                    }
                }
                () = ctx.cancelled() => {
                    return Err(CoreError::Timeout {
                        after: Duration::ZERO,
                        details: "jet fetch canceled by caller".to_owned(),
                    });
                }
            }
        }
    }

    fn join_flight(
        &self,
        key: FlightKey,
        object: ObjectId,
        pulse: PulseNumber,
        stale_jet: JetId,
    ) -> (watch::Receiver<Option<FlightResult>>, WaiterGuard) {
        let mut flights = self.flights.lock().expect("fetcher lock poisoned");
        if let Some(flight) = flights.get(&key) {
            flight.waiters.fetch_add(1, Ordering::AcqRel);
            let guard = WaiterGuard {
                waiters: flight.waiters.clone(),
                token: flight.token.clone(),
            };
            return (flight.rx.clone(), guard);
        }

        let (tx, rx) = watch::channel(None);
        let waiters = Arc::new(AtomicUsize::new(1));
        let token = CancellationToken::new();
        flights.insert(
            key,
            Flight {
                rx: rx.clone(),
                waiters: waiters.clone(),
                token: token.clone(),
            },
        );
        let guard = WaiterGuard {
            waiters,
            token: token.clone(),
        };

        let tree = self.tree.clone();
        let coordinator = self.coordinator.clone();
        let query = self.query.clone();
        let flights_map = self.flights.clone();
        let peer_timeout = self.peer_timeout;
        tokio::spawn(async move {
            let round = query_peers(
                coordinator,
                query,
                object,
                pulse,
                stale_jet,
                peer_timeout,
            );
            let result = tokio::select! {
                result = round => result,
                () = token.cancelled() => Err(CoreError::Timeout {
                    after: Duration::ZERO,
                    details: "jet fetch canceled by last waiter".to_owned(),
                }),
            };
            if let Ok(jet) = &result {
                if let Err(err) = tree.update(pulse, *jet, true) {
                    warn!(%jet, %pulse, %err, "could not apply fetched jet");
                }
            }
            let _ = tx.send(Some(result));
            flights_map
                .lock()
                .expect("fetcher lock poisoned")
                .remove(&key);
        });

        (rx, guard)
    }
}

/// One network round: query a random sample of other light nodes and take
/// the first `actual = true` answer.
async fn query_peers(
    coordinator: Arc<Coordinator>,
    query: Arc<dyn JetQuery>,
    object: ObjectId,
    pulse: PulseNumber,
    stale_jet: JetId,
    peer_timeout: Duration,
) -> FlightResult {
    let me = coordinator.me();
    let mut peers: Vec<NodeRef> = coordinator
        .nodes_in_role(Role::LightExecutor, pulse)?
        .into_iter()
        .filter(|node| *node != me)
        .collect();
    if peers.is_empty() {
        return Err(CoreError::StaleTree {
            pulse,
            jet: stale_jet,
        });
    }
    peers.shuffle(&mut rand::thread_rng());
    peers.truncate(FETCH_PEER_SAMPLE);

    let (tx, mut rx) = mpsc::channel(peers.len());
    for peer in &peers {
        let query = query.clone();
        let tx = tx.clone();
        let peer = *peer;
        tokio::spawn(async move {
            let answer = query.get_jet(peer, object, pulse).await;
            let _ = tx.send(answer).await;
        });
    }
    drop(tx);

    let wait_first_actual = async {
        while let Some(answer) = rx.recv().await {
            match answer {
                Ok(FetchedJet { jet, actual: true }) => return Some(jet),
                Ok(FetchedJet { jet, actual: false }) => {
                    debug!(%jet, %pulse, "peer tree is stale too");
                }
                Err(err) => {
                    debug!(%pulse, %err, "jet query failed");
                }
            }
        }
        None
    };

    match tokio::time::timeout(peer_timeout, wait_first_actual).await {
        Ok(Some(jet)) => Ok(jet),
        Ok(None) | Err(_) => Err(CoreError::StaleTree {
            pulse,
            jet: stale_jet,
        }),
    }
}

#[cfg(test)]
mod tests {
    use crate::jet::coordinator::{NodeProfile, RosterProvider};
    use crate::pulse::GENESIS_PULSE;

    use super::*;

    const PULSE: PulseNumber = PulseNumber::new(65636);

    struct FixedRoster(Vec<NodeProfile>);

    impl RosterProvider for FixedRoster {
        fn nodes_for_pulse(&self, _pulse: PulseNumber) -> Result<Vec<NodeProfile>, CoreError> {
            Ok(self.0.clone())
        }
    }

    fn light_profile(byte: u8) -> NodeProfile {
        NodeProfile {
            reference: NodeRef::from_bytes([byte; 32]),
            roles: vec![Role::LightExecutor],
            active: true,
        }
    }

    struct CountingQuery {
        calls: AtomicUsize,
        answer: FetchedJet,
        delay: Duration,
    }

    impl JetQuery for CountingQuery {
        fn get_jet<'a>(
            &'a self,
            _node: NodeRef,
            _object: ObjectId,
            _pulse: PulseNumber,
        ) -> BoxFuture<'a, Result<FetchedJet, CoreError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                Ok(self.answer)
            })
        }
    }

    fn fetcher_with(
        query: Arc<dyn JetQuery>,
        peers: usize,
        timeout: Duration,
    ) -> (Arc<JetFetcher>, Arc<TreeStore>) {
        let tree = Arc::new(TreeStore::new());
        let me = NodeRef::from_bytes([0xee; 32]);
        let mut profiles: Vec<_> = (1..=peers as u8).map(light_profile).collect();
        profiles.push(NodeProfile {
            reference: me,
            roles: vec![Role::LightExecutor],
            active: true,
        });
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(FixedRoster(profiles)),
            tree.clone(),
            me,
        ));
        let fetcher = Arc::new(JetFetcher::new(
            tree.clone(),
            coordinator,
            query,
            timeout,
        ));
        (fetcher, tree)
    }

    fn some_object() -> ObjectId {
        ObjectId::new(GENESIS_PULSE, [0x42; 28])
    }

    #[tokio::test]
    async fn actual_local_leaf_short_circuits() {
        let query = Arc::new(CountingQuery {
            calls: AtomicUsize::new(0),
            answer: FetchedJet {
                jet: JetId::ROOT,
                actual: true,
            },
            delay: Duration::ZERO,
        });
        let (fetcher, tree) = fetcher_with(query.clone(), 3, Duration::from_secs(1));
        tree.update(PULSE, JetId::ROOT, true).expect("update");

        let jet = fetcher
            .fetch(some_object(), PULSE, &CancellationToken::new())
            .await
            .expect("fetch");
        assert_eq!(jet, JetId::ROOT);
        assert_eq!(query.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fetch_updates_tree_and_returns_actual_jet() {
        let (_, right) = JetId::ROOT.children().expect("children");
        let query = Arc::new(CountingQuery {
            calls: AtomicUsize::new(0),
            answer: FetchedJet {
                jet: right,
                actual: true,
            },
            delay: Duration::ZERO,
        });
        let (fetcher, tree) = fetcher_with(query, 3, Duration::from_secs(1));

        let mut object_bytes = [0u8; 32];
        object_bytes[0] = 0b1100_0000;
        let object = ObjectId::from_bytes(object_bytes);

        let jet = fetcher
            .fetch(object, PULSE, &CancellationToken::new())
            .await
            .expect("fetch");
        assert_eq!(jet, right);

        let (found, actual) = tree.find(PULSE, &object);
        assert_eq!(found, right);
        assert!(actual);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_fetches_share_one_round() {
        let query = Arc::new(CountingQuery {
            calls: AtomicUsize::new(0),
            answer: FetchedJet {
                jet: JetId::ROOT,
                actual: true,
            },
            delay: Duration::from_millis(200),
        });
        let (fetcher, _) = fetcher_with(query.clone(), 2, Duration::from_secs(5));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let fetcher = fetcher.clone();
            handles.push(tokio::spawn(async move {
                fetcher
                    .fetch(some_object(), PULSE, &CancellationToken::new())
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.expect("join").expect("fetch"), JetId::ROOT);
        }
        // one round, two sampled peers: exactly two queries despite 16 callers
        assert_eq!(query.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_actual_answer_is_stale_tree() {
        let query = Arc::new(CountingQuery {
            calls: AtomicUsize::new(0),
            answer: FetchedJet {
                jet: JetId::ROOT,
                actual: false,
            },
            delay: Duration::ZERO,
        });
        let (fetcher, _) = fetcher_with(query, 3, Duration::from_millis(100));

        let err = fetcher
            .fetch(some_object(), PULSE, &CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(matches!(err, CoreError::StaleTree { .. }));
    }

    #[tokio::test]
    async fn caller_cancellation_surfaces_as_timeout_kind() {
        let query = Arc::new(CountingQuery {
            calls: AtomicUsize::new(0),
            answer: FetchedJet {
                jet: JetId::ROOT,
                actual: true,
            },
            delay: Duration::from_secs(30),
        });
        let (fetcher, _) = fetcher_with(query, 2, Duration::from_secs(60));

        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = fetcher
            .fetch(some_object(), PULSE, &ctx)
            .await
            .expect_err("must cancel");
        assert!(matches!(err, CoreError::Timeout { .. }));
    }
}
