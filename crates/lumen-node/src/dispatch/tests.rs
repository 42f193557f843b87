//! Dispatcher tests, including the single-node pulse cycle end to end.

use std::sync::Arc;
use std::time::Duration;

use lumen_core::jet::{NodeProfile, RosterProvider};
use lumen_core::message::MessageKind;
use lumen_core::pulse::GENESIS_PULSE;
use lumen_core::record::ReturnMode;
use lumen_core::storage::MemoryStore;
use lumen_core::testing;

use super::*;

struct SoloRoster {
    me: NodeRef,
    roles: Vec<Role>,
}

impl RosterProvider for SoloRoster {
    fn nodes_for_pulse(&self, _pulse: PulseNumber) -> Result<Vec<NodeProfile>, CoreError> {
        Ok(vec![NodeProfile {
            reference: self.me,
            roles: self.roles.clone(),
            active: true,
        }])
    }
}

fn solo_node() -> Node {
    let keys = Arc::new(NodeKeypair::generate());
    let roles = vec![Role::LightExecutor, Role::HeavyExecutor];
    let roster = Arc::new(SoloRoster {
        me: keys.reference(),
        roles: roles.clone(),
    });
    Node::build(
        Arc::new(MemoryStore::new()),
        NodeDeps {
            keys,
            roster,
            roles,
            jet_query: Arc::new(LocalOnlyJetQuery),
            call_sender: None,
            jet_fetch_timeout: Duration::from_millis(200),
            call_timeout: Duration::from_secs(2),
            pending_limit: 100,
            shutdown: CancellationToken::new(),
        },
    )
    .expect("build node")
}

/// Boots the ledger: genesis pulse in the log, actual root jet, and the
/// first working pulse handed over.
fn boot(node: &Node, first: u32) {
    node.on_pulse(Pulse::genesis()).expect("genesis pulse");
    node.tree
        .update(GENESIS_PULSE, JetId::ROOT, true)
        .expect("seed tree");
    let outbound = node
        .on_pulse(testing::pulse(first, GENESIS_PULSE.get(), first + 10))
        .expect("first pulse");
    assert!(outbound.is_empty(), "solo node applies handoffs locally");
}

fn activate_submission(object: ObjectId) -> Submission {
    Submission::Activate {
        object,
        record: ActivateRecord {
            request: lumen_core::Reference::from_object(object),
            memory: vec![1, 2, 3],
            parent: lumen_core::Reference::from_object(object),
        },
    }
}

#[tokio::test]
async fn solo_pulse_cycle_replicates_and_advances_top_sync() {
    let node = solo_node();
    boot(&node, 65646);
    let p1 = PulseNumber::new(65646);

    // the handoff from genesis made the first pulse's tree actual
    let object = testing::object_id(p1, 9);
    let (_, actual) = node.tree.find(p1, &object);
    assert!(actual);

    // commit a lifeline during the pulse
    let reply = node
        .engine
        .submit(activate_submission(object), &CancellationToken::new())
        .await
        .expect("activate");
    assert!(matches!(reply, EngineReply::Record { .. }));

    // nothing synced yet
    assert_eq!(node.keeper.top_sync_pulse(), GENESIS_PULSE);

    // turning the pulse replicates the closed one into the (local) heavy
    // store and confirms hot objects, completing it
    let outbound = node
        .on_pulse(testing::pulse(65656, 65646, 65666))
        .expect("second pulse");
    assert!(outbound.is_empty());
    assert_eq!(node.keeper.top_sync_pulse(), p1);

    // the new pulse carried the lifeline forward and is writable
    let p2 = PulseNumber::new(65656);
    let bucket = node.indices.bucket(p2, &object).expect("carried bucket");
    assert!(bucket.lifeline.latest_state.is_some());
    let (_, actual) = node.tree.find(p2, &object);
    assert!(actual);
}

#[tokio::test]
async fn pulse_message_is_dispatched_like_a_pulse() {
    let node = solo_node();
    node.on_pulse(Pulse::genesis()).expect("genesis");
    node.tree
        .update(GENESIS_PULSE, JetId::ROOT, true)
        .expect("seed tree");

    let pulse = testing::pulse(65646, GENESIS_PULSE.get(), 65656);
    let meta = Meta::seal(
        &Payload::Pulse(PulseMessage {
            pulse: pulse.encode(),
        }),
        GENESIS_PULSE,
        &node.keys,
    );
    let outcome = node.handle(&meta).await;
    assert!(outcome.reply.is_none());
    assert_eq!(node.pulses.latest().expect("latest").number, pulse.number);
}

#[tokio::test]
async fn out_of_order_pulse_message_answers_an_error() {
    let node = solo_node();
    boot(&node, 65646);

    let stale = testing::pulse(65600, GENESIS_PULSE.get(), 65700);
    let outcome = node
        .handle_payload(Payload::Pulse(PulseMessage {
            pulse: stale.encode(),
        }))
        .await;
    let Some(Payload::Error(err)) = outcome.reply else {
        panic!("expected an error reply");
    };
    assert_eq!(
        err.code,
        CoreError::OutOfOrder {
            last: PulseNumber::new(0),
            got: PulseNumber::new(0)
        }
        .wire_code()
    );
}

#[tokio::test]
async fn tampered_envelope_is_rejected_at_the_door() {
    let node = solo_node();
    boot(&node, 65646);

    let mut meta = Meta::seal(
        &Payload::GetJet(message::GetJet {
            object: testing::object_id(PulseNumber::new(65646), 1).to_vec(),
            pulse: 65646,
        }),
        PulseNumber::new(65646),
        &node.keys,
    );
    meta.payload.push(0xff);

    let outcome = node.handle(&meta).await;
    let Some(Payload::Error(_)) = outcome.reply else {
        panic!("expected an error reply");
    };
}

#[tokio::test]
async fn get_jet_answers_the_local_leaf() {
    let node = solo_node();
    boot(&node, 65646);
    let p1 = PulseNumber::new(65646);

    let outcome = node
        .handle_payload(Payload::GetJet(message::GetJet {
            object: testing::object_id(p1, 3).to_vec(),
            pulse: p1.get(),
        }))
        .await;
    let Some(Payload::Jet(jet)) = outcome.reply else {
        panic!("expected a jet reply");
    };
    assert!(jet.actual);
    assert_eq!(JetId::from_wire(&jet.jet), Some(JetId::ROOT));
}

#[tokio::test]
async fn write_then_read_through_the_wire_surface() {
    let node = solo_node();
    boot(&node, 65646);
    let p1 = PulseNumber::new(65646);
    let object = testing::object_id(p1, 7);

    // activate through the wire
    let record = Record::Activate(ActivateRecord {
        request: lumen_core::Reference::from_object(object),
        memory: vec![9, 9],
        parent: lumen_core::Reference::from_object(object),
    });
    let outcome = node
        .handle_payload(Payload::Activate(message::Activate {
            record: record.marshal(),
            object: object.to_vec(),
        }))
        .await;
    let Some(Payload::Id(ack)) = outcome.reply else {
        panic!("expected an id reply, got {:?}", outcome.reply);
    };
    let state_id = ObjectId::try_from_slice(&ack.id).expect("id");

    // read it back
    let outcome = node
        .handle_payload(Payload::GetObject(message::GetObject {
            object: object.to_vec(),
        }))
        .await;
    let Some(Payload::State(state)) = outcome.reply else {
        panic!("expected a state reply, got {:?}", outcome.reply);
    };
    let lifeline = lumen_core::index::Lifeline::decode(&state.lifeline).expect("lifeline");
    assert_eq!(lifeline.latest_state, Some(state_id));
    assert_eq!(state.memory, vec![9, 9]);
    assert_eq!(Record::unmarshal(&state.state_record).expect("record"), record);
}

#[tokio::test]
async fn call_method_acks_with_the_request_id() {
    let node = solo_node();
    boot(&node, 65646);
    let p1 = PulseNumber::new(65646);

    let request = IncomingRequest {
        caller: lumen_core::Reference::from_object(testing::object_id(p1, 2)),
        object: None,
        method: "contract.createMember".to_owned(),
        arguments: vec![1],
        reason: lumen_core::Reference::from_object(testing::object_id(p1, 3)),
        api_request_id: "rpc-1".to_owned(),
        return_mode: ReturnMode::NoWait,
        nonce: 77,
    };
    let record = Record::IncomingRequest(request);
    let expected_id = record.id_at(p1);

    let outcome = node
        .handle_payload(Payload::CallMethod(CallMethod {
            record: record.marshal(),
        }))
        .await;
    let Some(Payload::Id(ack)) = outcome.reply else {
        panic!("expected an id reply, got {:?}", outcome.reply);
    };
    assert_eq!(ObjectId::try_from_slice(&ack.id).expect("id"), expected_id);
}

// Scenario: reads landing on a node that is not the executor answer a
// Pass naming the authoritative one, never the local (possibly stale)
// storage.
#[tokio::test]
async fn reads_redirect_when_another_node_is_executor() {
    let keys = Arc::new(NodeKeypair::generate());
    let other = NodeRef::from_bytes([0x44; 32]);
    let node = Node::build(
        Arc::new(MemoryStore::new()),
        NodeDeps {
            keys,
            roster: Arc::new(SoloRoster {
                me: other,
                roles: vec![Role::LightExecutor],
            }),
            roles: vec![Role::LightExecutor],
            jet_query: Arc::new(LocalOnlyJetQuery),
            call_sender: None,
            jet_fetch_timeout: Duration::from_millis(100),
            call_timeout: Duration::from_secs(1),
            pending_limit: 100,
            shutdown: CancellationToken::new(),
        },
    )
    .expect("build node");
    node.on_pulse(Pulse::genesis()).expect("genesis");
    node.on_pulse(testing::pulse(65646, GENESIS_PULSE.get(), 65656))
        .expect("first pulse");
    let object = testing::object_id(PulseNumber::new(65646), 7);

    let expect_pass = |outcome: DispatchOutcome, kind: MessageKind| {
        let Some(Payload::Pass(pass)) = outcome.reply else {
            panic!("expected a pass for {}, got {:?}", kind.name(), outcome.reply);
        };
        assert_eq!(pass.target, other.to_vec());
        assert_eq!(pass.origin_kind, kind as u32);
        // the origin rides along so the caller can resend it verbatim
        Payload::unmarshal(kind, &pass.origin_payload).expect("origin payload");
    };

    expect_pass(
        node.handle_payload(Payload::GetObject(message::GetObject {
            object: object.to_vec(),
        }))
        .await,
        MessageKind::GetObject,
    );
    expect_pass(
        node.handle_payload(Payload::GetRequest(message::GetRequest {
            object: object.to_vec(),
            request_id: object.to_vec(),
        }))
        .await,
        MessageKind::GetRequest,
    );
    expect_pass(
        node.handle_payload(Payload::GetFilament(message::GetFilament {
            object: object.to_vec(),
            start_from: 65646,
            read_until: 65646,
        }))
        .await,
        MessageKind::GetFilament,
    );
    expect_pass(
        node.handle_payload(Payload::GetPendings(message::GetPendings {
            object: object.to_vec(),
            count: 10,
        }))
        .await,
        MessageKind::GetPendings,
    );
    // code that is not stored here passes to the executor instead of 404
    expect_pass(
        node.handle_payload(Payload::GetCode(message::GetCode {
            code_id: object.to_vec(),
        }))
        .await,
        MessageKind::GetCode,
    );
}

#[tokio::test]
async fn unsolicited_reply_kinds_are_dropped() {
    let node = solo_node();
    boot(&node, 65646);

    let outcome = node
        .handle_payload(Payload::Ids(message::Ids { ids: Vec::new() }))
        .await;
    assert!(outcome.reply.is_none());
    assert!(outcome.outbound.is_empty());

    let outcome = node
        .handle_payload(Payload::Error(message::ErrorPayload {
            code: 1,
            text: "late".to_owned(),
        }))
        .await;
    assert!(outcome.reply.is_none());
}

#[tokio::test]
async fn get_pendings_lists_open_requests() {
    let node = solo_node();
    boot(&node, 65646);
    let p1 = PulseNumber::new(65646);
    let object = testing::object_id(p1, 5);

    node.engine
        .submit(activate_submission(object), &CancellationToken::new())
        .await
        .expect("activate");
    let request = IncomingRequest {
        caller: lumen_core::Reference::from_object(testing::object_id(p1, 2)),
        object: Some(lumen_core::Reference::from_object(object)),
        method: "transfer".to_owned(),
        arguments: Vec::new(),
        reason: lumen_core::Reference::from_object(testing::object_id(p1, 3)),
        api_request_id: String::new(),
        return_mode: ReturnMode::Wait,
        nonce: 1,
    };
    let EngineReply::Record { id: request_id } = node
        .engine
        .submit(
            Submission::SetIncomingRequest(request),
            &CancellationToken::new(),
        )
        .await
        .expect("request")
    else {
        panic!("expected a commit");
    };

    let outcome = node
        .handle_payload(Payload::GetPendings(message::GetPendings {
            object: object.to_vec(),
            count: 10,
        }))
        .await;
    let Some(Payload::Ids(ids)) = outcome.reply else {
        panic!("expected ids, got {:?}", outcome.reply);
    };
    assert_eq!(ids.ids, vec![request_id.to_vec()]);
}
