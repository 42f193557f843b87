//! The contract requester (C8): correlating calls with their results.
//!
//! A call registers a one-shot channel under the stable hash of its request
//! record, transmits the `CallMethod` message, and waits for the matching
//! `ReturnResults` to come home. At most one entry exists per request hash;
//! a reply with no pending entry is logged and dropped.
//!
//! Transient send faults are retried with exponential backoff aligned to
//! pulse boundaries: a retry never reuses the pulse of the failed attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::BoxFuture;
use crate::error::CoreError;
use crate::id::{ObjectId, RECORD_HASH_SIZE};
use crate::message::{CallMethod, ReturnResults};
use crate::pulse::{PulseLog, PulseNumber};
use crate::record::{IncomingRequest, Record, ReturnMode};

/// Default deadline for a waiting call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

/// Default retry count for transient send faults.
pub const DEFAULT_CALL_RETRIES: u32 = 3;

const BACKOFF_START: Duration = Duration::from_millis(50);
const BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Per-call knobs.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    /// How many times a transiently failing send is retried.
    pub retries: u32,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_CALL_RETRIES,
        }
    }
}

/// The registration ack for a transmitted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterAck {
    /// Id the executor registered the request under.
    pub request_id: ObjectId,
}

/// Transport seam: delivers a `CallMethod` to the responsible executor and
/// returns its registration ack.
pub trait CallSender: Send + Sync {
    /// Sends `msg` under `pulse` and awaits the ack.
    fn send_call<'a>(
        &'a self,
        msg: &'a CallMethod,
        pulse: PulseNumber,
    ) -> BoxFuture<'a, Result<RegisterAck, CoreError>>;
}

/// What a call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// `NoWait` call: the request registered, nothing was awaited.
    Registered(RegisterAck),
    /// `Wait` call: the results arrived. `error` may still name a contract
    /// fault; that is the caller's to interpret.
    Returned(ReturnResults),
}

type PendingMap = HashMap<[u8; RECORD_HASH_SIZE], oneshot::Sender<ReturnResults>>;

/// The contract requester.
pub struct ContractRequester {
    sender: Arc<dyn CallSender>,
    pulses: Arc<PulseLog>,
    pending: Mutex<PendingMap>,
    call_timeout: Duration,
}

impl ContractRequester {
    /// Builds a requester with the default call timeout.
    #[must_use]
    pub fn new(sender: Arc<dyn CallSender>, pulses: Arc<PulseLog>) -> Self {
        Self::with_timeout(sender, pulses, DEFAULT_CALL_TIMEOUT)
    }

    /// Builds a requester with an explicit call timeout.
    #[must_use]
    pub fn with_timeout(
        sender: Arc<dyn CallSender>,
        pulses: Arc<PulseLog>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            sender,
            pulses,
            pending: Mutex::new(HashMap::new()),
            call_timeout,
        }
    }

    /// How many calls are currently awaiting results.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("requester lock poisoned").len()
    }

    /// Issues a contract call.
    ///
    /// A zero nonce is replaced with a random one so identical payloads from
    /// different callers do not collide on the request hash.
    pub async fn call(
        &self,
        mut request: IncomingRequest,
        opts: CallOptions,
        ctx: &CancellationToken,
    ) -> Result<CallOutcome, CoreError> {
        if request.nonce == 0 {
            request.nonce = rand::random();
        }
        let wait = request.return_mode == ReturnMode::Wait;
        let record = Record::IncomingRequest(request);
        let hash = record.content_hash();
        let msg = CallMethod {
            record: record.marshal(),
        };

        let receiver = if wait {
            Some(self.register(hash)?)
        } else {
            None
        };

        let ack = match self.send_with_retries(&msg, opts.retries).await {
            Ok(ack) => ack,
            Err(err) => {
                self.unregister(&hash);
                return Err(err);
            }
        };
        if ack.request_id.hash() != hash {
            self.unregister(&hash);
            return Err(CoreError::InvalidState {
                details: "registered request has a different hash".to_owned(),
            });
        }

        let Some(receiver) = receiver else {
            return Ok(CallOutcome::Registered(ack));
        };

        debug!(request = %ack.request_id, "waiting for call results");
        tokio::select! {
            received = receiver => {
                received.map(CallOutcome::Returned).map_err(|_| {
                    CoreError::fatal("requester dropped a pending entry while in use")
                })
            }
            () = tokio::time::sleep(self.call_timeout) => {
                self.unregister(&hash);
                Err(CoreError::Timeout {
                    after: self.call_timeout,
                    details: "call results never arrived".to_owned(),
                })
            }
            () = ctx.cancelled() => {
                self.unregister(&hash);
                Err(CoreError::Timeout {
                    after: Duration::ZERO,
                    details: "call canceled".to_owned(),
                })
            }
        }
    }

    /// Delivers results to the waiting call, if any. Late or unknown
    /// replies are dropped.
    pub fn receive_result(&self, msg: ReturnResults) {
        let Ok(request_id) = ObjectId::try_from_slice(&msg.request_id) else {
            warn!("return results with a malformed request id, dropping");
            return;
        };
        let mut key = [0u8; RECORD_HASH_SIZE];
        key.copy_from_slice(request_id.hash());

        let entry = {
            let mut pending = self.pending.lock().expect("requester lock poisoned");
            pending.remove(&key)
        };
        match entry {
            Some(tx) => {
                // the receiver may have timed out in between; that is fine
                let _ = tx.send(msg);
            }
            None => {
                warn!(request = %request_id, "results for no pending call, dropping");
            }
        }
    }

    fn register(
        &self,
        hash: [u8; RECORD_HASH_SIZE],
    ) -> Result<oneshot::Receiver<ReturnResults>, CoreError> {
        let mut pending = self.pending.lock().expect("requester lock poisoned");
        if pending.contains_key(&hash) {
            return Err(CoreError::DuplicateRecord {
                id: ObjectId::new(PulseNumber::new(0), hash),
            });
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(hash, tx);
        Ok(rx)
    }

    fn unregister(&self, hash: &[u8; RECORD_HASH_SIZE]) {
        let mut pending = self.pending.lock().expect("requester lock poisoned");
        pending.remove(hash);
    }

    async fn send_with_retries(
        &self,
        msg: &CallMethod,
        retries: u32,
    ) -> Result<RegisterAck, CoreError> {
        let mut backoff = BACKOFF_START;
        let mut attempt = 0u32;
        loop {
            let pulse = self.pulses.latest()?.number;
            match self.sender.send_call(msg, pulse).await {
                Ok(ack) => return Ok(ack),
                Err(err) if err.is_recoverable() && attempt < retries => {
                    attempt += 1;
                    debug!(%err, attempt, "transient call fault, retrying next pulse");
                    self.wait_for_pulse_after(pulse, &mut backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Sleeps with exponential backoff until the log moves past `last`, so
    /// the retry lands on a different pulse than the failed attempt.
    async fn wait_for_pulse_after(&self, last: PulseNumber, backoff: &mut Duration) {
        loop {
            tokio::time::sleep(*backoff).await;
            *backoff = (*backoff * 2).min(BACKOFF_CAP);
            match self.pulses.latest() {
                Ok(pulse) if pulse.number != last => return,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rand::Rng;
    use tokio::sync::mpsc;

    use crate::id::Reference;
    use crate::pulse::{ENTROPY_SIZE, GENESIS_PULSE, Pulse};
    use crate::storage::MemoryStore;

    use super::*;

    const P1: PulseNumber = PulseNumber::new(65636);

    fn pulse_log() -> Arc<PulseLog> {
        let log = Arc::new(PulseLog::open(Arc::new(MemoryStore::new())).expect("open"));
        log.append(Pulse::genesis()).expect("genesis");
        log.append(Pulse {
            number: P1,
            prev: GENESIS_PULSE,
            next: PulseNumber::new(65646),
            unix_time: 0,
            entropy: [1u8; ENTROPY_SIZE],
        })
        .expect("p1");
        log
    }

    fn request(nonce: u64, mode: ReturnMode) -> IncomingRequest {
        let seed = ObjectId::new(P1, [9u8; RECORD_HASH_SIZE]);
        IncomingRequest {
            caller: Reference::from_object(seed),
            object: None,
            method: "createMember".to_owned(),
            arguments: nonce.to_be_bytes().to_vec(),
            reason: Reference::from_object(seed),
            api_request_id: String::new(),
            return_mode: mode,
            nonce,
        }
    }

    /// Acks every call with the correct hash and reports the registered id.
    struct AckSender {
        calls: AtomicUsize,
        registered: mpsc::UnboundedSender<ObjectId>,
    }

    impl CallSender for AckSender {
        fn send_call<'a>(
            &'a self,
            msg: &'a CallMethod,
            pulse: PulseNumber,
        ) -> BoxFuture<'a, Result<RegisterAck, CoreError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let record = Record::unmarshal(&msg.record).expect("valid record");
            let request_id = record.id_at(pulse);
            let _ = self.registered.send(request_id);
            Box::pin(async move { Ok(RegisterAck { request_id }) })
        }
    }

    fn ack_requester(
        timeout: Duration,
    ) -> (
        Arc<ContractRequester>,
        mpsc::UnboundedReceiver<ObjectId>,
        Arc<AckSender>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = Arc::new(AckSender {
            calls: AtomicUsize::new(0),
            registered: tx,
        });
        let requester = Arc::new(ContractRequester::with_timeout(
            sender.clone(),
            pulse_log(),
            timeout,
        ));
        (requester, rx, sender)
    }

    // Scenario: many concurrent calls, each answered after a random delay;
    // every call sees exactly its own results and the map drains.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_correlate_exactly() {
        let (requester, mut registered, _) = ack_requester(Duration::from_secs(10));

        // responder: answers each registered request after 10..100 ms
        let responder = requester.clone();
        tokio::spawn(async move {
            while let Some(request_id) = registered.recv().await {
                let responder = responder.clone();
                tokio::spawn(async move {
                    let delay = rand::thread_rng().gen_range(10..=100);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    responder.receive_result(ReturnResults {
                        request_id: request_id.to_vec(),
                        error: String::new(),
                        payload: request_id.hash().to_vec(),
                    });
                });
            }
        });

        let mut handles = Vec::new();
        for nonce in 1..=1000u64 {
            let requester = requester.clone();
            handles.push(tokio::spawn(async move {
                requester
                    .call(
                        request(nonce, ReturnMode::Wait),
                        CallOptions::default(),
                        &CancellationToken::new(),
                    )
                    .await
            }));
        }
        for handle in handles {
            let outcome = handle.await.expect("join").expect("call");
            let CallOutcome::Returned(results) = outcome else {
                panic!("wait call must return results");
            };
            // the payload we generated is the request's own hash
            let id = ObjectId::try_from_slice(&results.request_id).expect("id");
            assert_eq!(results.payload, id.hash().to_vec());
        }
        assert_eq!(requester.pending_count(), 0);
    }

    #[tokio::test]
    async fn no_wait_returns_the_ack_synchronously() {
        let (requester, _registered, sender) = ack_requester(Duration::from_secs(1));
        let outcome = requester
            .call(
                request(7, ReturnMode::NoWait),
                CallOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .expect("call");
        assert!(matches!(outcome, CallOutcome::Registered(_)));
        assert_eq!(requester.pending_count(), 0);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_cleans_the_pending_entry() {
        let (requester, _registered, _) = ack_requester(Duration::from_millis(50));
        let err = requester
            .call(
                request(8, ReturnMode::Wait),
                CallOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("no responder, must time out");
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert_eq!(requester.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_reply_is_dropped() {
        let (requester, _registered, _) = ack_requester(Duration::from_secs(1));
        requester.receive_result(ReturnResults {
            request_id: ObjectId::new(P1, [3u8; RECORD_HASH_SIZE]).to_vec(),
            error: String::new(),
            payload: Vec::new(),
        });
        assert_eq!(requester.pending_count(), 0);
    }

    /// Fails the first attempt with a recoverable fault, then acks.
    struct FlakySender {
        calls: AtomicUsize,
        pulses_seen: Mutex<Vec<PulseNumber>>,
    }

    impl CallSender for FlakySender {
        fn send_call<'a>(
            &'a self,
            msg: &'a CallMethod,
            pulse: PulseNumber,
        ) -> BoxFuture<'a, Result<RegisterAck, CoreError>> {
            let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
            self.pulses_seen
                .lock()
                .expect("test lock")
                .push(pulse);
            let record = Record::unmarshal(&msg.record).expect("valid record");
            let request_id = record.id_at(pulse);
            Box::pin(async move {
                if attempt == 0 {
                    Err(CoreError::FlowCanceled { current: pulse })
                } else {
                    Ok(RegisterAck { request_id })
                }
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transient_fault_retries_on_a_later_pulse() {
        let pulses = pulse_log();
        let sender = Arc::new(FlakySender {
            calls: AtomicUsize::new(0),
            pulses_seen: Mutex::new(Vec::new()),
        });
        let requester = Arc::new(ContractRequester::with_timeout(
            sender.clone(),
            pulses.clone(),
            Duration::from_secs(1),
        ));

        // advance the pulse shortly after the first failure
        let log = pulses.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            log.append(Pulse {
                number: PulseNumber::new(65646),
                prev: P1,
                next: PulseNumber::new(65656),
                unix_time: 0,
                entropy: [2u8; ENTROPY_SIZE],
            })
            .expect("advance");
        });

        let outcome = requester
            .call(
                request(9, ReturnMode::NoWait),
                CallOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .expect("retried call");
        assert!(matches!(outcome, CallOutcome::Registered(_)));
        assert_eq!(sender.calls.load(Ordering::SeqCst), 2);

        let seen = sender.pulses_seen.lock().expect("test lock").clone();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0], seen[1], "retry must land on a different pulse");
    }

    #[tokio::test]
    async fn mismatched_ack_hash_is_rejected() {
        struct WrongAck;
        impl CallSender for WrongAck {
            fn send_call<'a>(
                &'a self,
                _msg: &'a CallMethod,
                pulse: PulseNumber,
            ) -> BoxFuture<'a, Result<RegisterAck, CoreError>> {
                Box::pin(async move {
                    Ok(RegisterAck {
                        request_id: ObjectId::new(pulse, [0xbb; RECORD_HASH_SIZE]),
                    })
                })
            }
        }

        let requester = ContractRequester::with_timeout(
            Arc::new(WrongAck),
            pulse_log(),
            Duration::from_secs(1),
        );
        let err = requester
            .call(
                request(4, ReturnMode::Wait),
                CallOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("hash mismatch");
        assert!(matches!(err, CoreError::InvalidState { .. }));
        assert_eq!(requester.pending_count(), 0);
    }
}
