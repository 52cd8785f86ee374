mod common;

use bytes::Bytes;
use common::{config, connect, eventually, payload_of, reach, setup, signaler_with};
use parking_lot::Mutex;
use serde_json::json;
use ssc_mesh::logger::MemoryWriter;
use ssc_mesh::peer::codec;
use ssc_mesh::peer::data_channel::Inbound;
use ssc_mesh::{
    Callbacks, DescriptorKind, IceCandidate, LogSink, LoopbackNetwork, MessageChannel, Role,
    Session, SessionState, SignalConfig, SignalError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test]
async fn offer_answer_and_one_message() {
    let (net, signaler) = setup();
    net.set_candidates(
        Role::Peer,
        vec![IceCandidate::new("candidate:abc 1 udp 2130706431 127.0.0.1 50001 typ host")],
    );
    let registry = signaler.host_registry();

    let peer = signaler.create_session(Role::Peer).await.unwrap();
    let offer = payload_of(&peer).await;
    assert!(offer.starts_with(codec::PAYLOAD_VERSION));
    assert_eq!(peer.state(), SessionState::AwaitingRemote);

    let decoded = codec::decode(&offer).unwrap();
    assert_eq!(decoded.descriptor.kind, DescriptorKind::Offer);
    assert!(decoded.descriptor.body.starts_with("v=0"));
    assert_eq!(decoded.candidates.len(), 1);
    assert_eq!(decoded.candidates[0].foundation(), Some("abc"));
    assert_eq!(decoded.id, peer.id());

    let host = registry.create_peer("p1").await.unwrap();
    assert_eq!(host.state(), SessionState::AwaitingRemote);
    let host_trail = trail_of(&host);
    let peer_trail = trail_of(&peer);

    registry.accept_for_peer("p1", &offer).await.unwrap();
    let answer = registry.answer_for_peer("p1").await.unwrap();
    assert_eq!(host.state(), SessionState::Connecting);
    assert_eq!(
        *host_trail.lock(),
        vec![
            SessionState::GeneratingAnswer,
            SessionState::GatheringLocalAnswer,
            SessionState::Connecting,
        ]
    );
    assert!(!answer.is_empty());
    let decoded = codec::decode(&answer).unwrap();
    assert_eq!(decoded.descriptor.kind, DescriptorKind::Answer);
    assert_eq!(decoded.id, peer.id());

    // the offer's candidates landed on the host's transport
    assert!(net
        .applied_candidates()
        .iter()
        .any(|c| c.foundation() == Some("abc")));

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    host.on_message(move |_, data| sink.lock().push(data.clone()));

    peer.accept_remote(&answer).await.unwrap();
    reach(&peer, SessionState::Open).await;
    reach(&host, SessionState::Open).await;

    peer.send("hello").await.unwrap();
    eventually(|| received.lock().len() == 1).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(*received.lock(), vec![Bytes::from_static(b"hello")]);

    assert_eq!(host_trail.lock().last(), Some(&SessionState::Open));
    assert_eq!(
        *peer_trail.lock(),
        vec![SessionState::Connecting, SessionState::Open]
    );
}

/// Every state a session announces from now on
fn trail_of(session: &Session) -> Arc<Mutex<Vec<SessionState>>> {
    let trail = Arc::new(Mutex::new(Vec::new()));
    let sink = trail.clone();
    session.on_state_change(move |_, state| sink.lock().push(state));
    trail
}

fn assert_forward_only(role: Role, start: SessionState, trail: &[SessionState]) {
    let mut from = start;
    for &to in trail {
        assert!(
            from.can_transition(to, role),
            "{role} went {from} -> {to} in {trail:?}"
        );
        assert!(to.rank() > from.rank(), "{from} -> {to} moved backwards");
        from = to;
    }
}

#[tokio::test]
async fn observed_states_only_move_forward() {
    let (_net, signaler) = setup();
    let registry = signaler.host_registry();

    let peer = signaler.create_session(Role::Peer).await.unwrap();
    let offer = payload_of(&peer).await;
    let host = registry.create_peer("p1").await.unwrap();
    let peer_start = peer.state();
    let host_start = host.state();
    let peer_trail = trail_of(&peer);
    let host_trail = trail_of(&host);

    registry.accept_for_peer("p1", &offer).await.unwrap();
    let answer = payload_of(&host).await;
    // a stale paste on an answered session is refused and changes nothing
    assert!(host.accept_remote(&offer).await.is_err());
    peer.accept_remote(&answer).await.unwrap();
    reach(&peer, SessionState::Open).await;
    reach(&host, SessionState::Open).await;
    peer.close().await;
    reach(&host, SessionState::Closed).await;
    // nothing moves a terminal session
    host.close().await;
    sleep(Duration::from_millis(50)).await;

    assert_forward_only(Role::Peer, peer_start, &peer_trail.lock());
    assert_forward_only(Role::Host, host_start, &host_trail.lock());
    assert_eq!(peer_trail.lock().last(), Some(&SessionState::Closed));
    assert_eq!(host_trail.lock().last(), Some(&SessionState::Closed));
}

#[tokio::test]
async fn empty_candidate_list_still_connects() {
    let (net, signaler) = setup();
    net.set_candidates(Role::Peer, vec![]);
    let registry = signaler.host_registry();

    let peer = signaler.create_session(Role::Peer).await.unwrap();
    let offer = payload_of(&peer).await;
    let decoded = codec::decode(&offer).unwrap();
    assert!(decoded.candidates.is_empty());
    assert_eq!(decoded.descriptor.kind, DescriptorKind::Offer);

    registry.create_peer("p1").await.unwrap();
    registry.accept_for_peer("p1", &offer).await.unwrap();
    let answer = payload_of(&registry.get("p1").unwrap()).await;
    peer.accept_remote(&answer).await.unwrap();
    reach(&peer, SessionState::Open).await;
    assert!(net.applied_candidates().iter().all(|c| c.foundation() != Some("lo1")));
}

#[tokio::test]
async fn closing_while_gathering_silences_the_session() {
    let net = LoopbackNetwork::new();
    net.stall_gathering(true);
    let connects = Arc::new(AtomicUsize::new(0));
    let c = connects.clone();
    let signaler = signaler_with(
        &net,
        SignalConfig {
            gather_timeout_secs: Some(1),
            ..config()
        },
    )
    .with_callbacks(Callbacks::new().on_connect(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    }));

    let peer = signaler.create_session(Role::Peer).await.unwrap();
    assert_eq!(peer.state(), SessionState::GatheringLocal);
    let trail = trail_of(&peer);
    let messages = Arc::new(AtomicUsize::new(0));
    let m = messages.clone();
    peer.on_message(move |_, _| {
        m.fetch_add(1, Ordering::SeqCst);
    });
    let mut states = peer.subscribe_state();

    peer.close().await;
    assert_eq!(*states.borrow_and_update(), SessionState::Closed);
    assert_eq!(*trail.lock(), vec![SessionState::Closed]);

    // outlive the gather deadline; nothing may fire for the dead session
    sleep(Duration::from_millis(1300)).await;
    assert!(peer.accept_remote("ssc1:").await.is_err());
    net.fail_all("late fault");
    sleep(Duration::from_millis(50)).await;

    assert!(!states.has_changed().unwrap());
    assert_eq!(*trail.lock(), vec![SessionState::Closed]);
    assert_eq!(messages.load(Ordering::SeqCst), 0);
    assert_eq!(connects.load(Ordering::SeqCst), 0);
    assert!(peer.try_local_payload().is_none());
    assert_eq!(net.live_endpoints(), 0);
}

#[tokio::test]
async fn send_before_open_changes_nothing() {
    let (_net, signaler) = setup();
    let peer = signaler.create_session(Role::Peer).await.unwrap();
    payload_of(&peer).await;

    assert_eq!(peer.send("too early").await, Err(SignalError::ChannelNotOpen));
    assert_eq!(peer.state(), SessionState::AwaitingRemote);
}

#[tokio::test]
async fn malformed_payload_keeps_waiting() {
    let (_net, signaler) = setup();
    let registry = signaler.host_registry();
    let peer = signaler.create_session(Role::Peer).await.unwrap();
    let offer = payload_of(&peer).await;
    let host = registry.create_peer("p1").await.unwrap();

    for garbage in ["", "hello", "ssc1:!!!", "ssc1:aGVsbG8="] {
        let err = host.accept_remote(garbage).await.unwrap_err();
        assert!(matches!(err, SignalError::MalformedPayload(_)), "{garbage}: {err}");
        assert_eq!(host.state(), SessionState::AwaitingRemote);
    }

    // a wrapped paste still goes through afterwards
    let wrapped: String = offer
        .as_bytes()
        .chunks(40)
        .map(|c| format!("{}\n", String::from_utf8_lossy(c)))
        .collect();
    host.accept_remote(&wrapped).await.unwrap();
    payload_of(&host).await;
}

#[tokio::test]
async fn wrong_descriptor_kind_is_refused() {
    let (_net, signaler) = setup();
    let first = signaler.create_session(Role::Peer).await.unwrap();
    let second = signaler.create_session(Role::Peer).await.unwrap();
    let offer = payload_of(&first).await;
    payload_of(&second).await;

    assert_eq!(
        second.accept_remote(&offer).await,
        Err(SignalError::UnexpectedDescriptor {
            expected: DescriptorKind::Answer,
            got: DescriptorKind::Offer,
        })
    );
    assert_eq!(second.state(), SessionState::AwaitingRemote);
}

#[tokio::test]
async fn answer_for_another_peer_is_refused() {
    let (_net, signaler) = setup();
    let registry = signaler.host_registry();
    let alice = signaler.create_session(Role::Peer).await.unwrap();
    let bob = signaler.create_session(Role::Peer).await.unwrap();
    let offer = payload_of(&alice).await;
    payload_of(&bob).await;

    registry.create_peer("alice").await.unwrap();
    registry.accept_for_peer("alice", &offer).await.unwrap();
    let answer = registry.answer_for_peer("alice").await.unwrap();

    assert_eq!(
        bob.accept_remote(&answer).await,
        Err(SignalError::SessionMismatch {
            expected: bob.id().to_string(),
            got: alice.id().to_string(),
        })
    );
    assert_eq!(bob.state(), SessionState::AwaitingRemote);

    alice.accept_remote(&answer).await.unwrap();
    reach(&alice, SessionState::Open).await;
}

#[tokio::test]
async fn concurrent_accept_reports_busy() {
    let (net, signaler) = setup();
    let registry = signaler.host_registry();
    let peer = signaler.create_session(Role::Peer).await.unwrap();
    let offer = payload_of(&peer).await;
    let host = registry.create_peer("p1").await.unwrap();

    net.delay_remote_descriptions(Duration::from_millis(300));
    let first = {
        let host = host.clone();
        let offer = offer.clone();
        tokio::spawn(async move { host.accept_remote(&offer).await })
    };
    sleep(Duration::from_millis(50)).await;

    assert_eq!(host.accept_remote(&offer).await, Err(SignalError::SessionBusy));
    first.await.unwrap().unwrap();
    payload_of(&host).await;
}

#[tokio::test]
async fn rejected_descriptor_fails_the_session() {
    let (net, signaler) = setup();
    let registry = signaler.host_registry();
    let peer = signaler.create_session(Role::Peer).await.unwrap();
    let offer = payload_of(&peer).await;
    let host = registry.create_peer("p1").await.unwrap();

    net.reject_remote_descriptions(true);
    let err = registry.accept_for_peer("p1", &offer).await.unwrap_err();
    assert!(matches!(err, SignalError::DescriptorRejected(_)), "{err}");
    assert_eq!(host.state(), SessionState::Failed);
    assert!(registry.answer_for_peer("p1").await.is_err());
    eventually(|| !registry.contains("p1")).await;
}

#[tokio::test]
async fn rejected_candidates_are_skipped() {
    let (net, signaler) = setup();
    let registry = signaler.host_registry();
    let peer = signaler.create_session(Role::Peer).await.unwrap();
    let offer = payload_of(&peer).await;

    net.reject_candidates(true);
    let host = registry.create_peer("p1").await.unwrap();
    registry.accept_for_peer("p1", &offer).await.unwrap();
    let answer = registry.answer_for_peer("p1").await.unwrap();
    assert!(net.applied_candidates().is_empty());

    peer.accept_remote(&answer).await.unwrap();
    reach(&peer, SessionState::Open).await;
    reach(&host, SessionState::Open).await;
}

#[tokio::test]
async fn stalled_gathering_finishes_at_the_deadline() {
    let net = LoopbackNetwork::new();
    net.stall_gathering(true);
    let signaler = signaler_with(
        &net,
        SignalConfig {
            gather_timeout_secs: Some(1),
            ..config()
        },
    );

    let peer = signaler.create_session(Role::Peer).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(peer.state(), SessionState::GatheringLocal);
    assert!(peer.try_local_payload().is_none());

    let offer = payload_of(&peer).await;
    assert_eq!(peer.state(), SessionState::AwaitingRemote);
    // what was found before the deadline is kept
    assert_eq!(codec::decode(&offer).unwrap().candidates.len(), 1);
}

#[tokio::test]
async fn unopened_session_expires() {
    let net = LoopbackNetwork::new();
    let signaler = signaler_with(
        &net,
        SignalConfig {
            session_expiry_secs: Some(1),
            ..config()
        },
    );
    let host = signaler.create_session(Role::Host).await.unwrap();
    assert_eq!(host.state(), SessionState::AwaitingRemote);
    reach(&host, SessionState::Failed).await;
    eventually(|| net.live_endpoints() == 0).await;
}

#[tokio::test]
async fn close_tears_down_both_sides() {
    let net = LoopbackNetwork::new();
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let (c, d) = (connects.clone(), disconnects.clone());
    let signaler = signaler_with(&net, config()).with_callbacks(
        Callbacks::new()
            .on_connect(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .on_disconnect(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            }),
    );
    let registry = signaler.host_registry();
    let (peer, host) = connect(&signaler, &registry, "p1").await;
    eventually(|| connects.load(Ordering::SeqCst) == 2).await;
    assert_eq!(net.live_endpoints(), 2);

    peer.close().await;
    assert_eq!(peer.state(), SessionState::Closed);
    reach(&host, SessionState::Closed).await;
    eventually(|| disconnects.load(Ordering::SeqCst) == 2).await;
    eventually(|| net.live_endpoints() == 0).await;

    // closing twice is a no-op
    peer.close().await;
    assert_eq!(peer.send("late").await, Err(SignalError::ChannelNotOpen));
    assert_eq!(disconnects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn transport_fault_fails_open_sessions() {
    let (net, signaler) = setup();
    let registry = signaler.host_registry();
    let (peer, host) = connect(&signaler, &registry, "p1").await;

    net.fail_all("link lost");
    reach(&peer, SessionState::Failed).await;
    reach(&host, SessionState::Failed).await;
    eventually(|| registry.is_empty()).await;
}

#[tokio::test]
async fn message_channel_names_the_sender() {
    let (_net, signaler) = setup();
    let registry = signaler.host_registry();
    let (peer, host) = connect(&signaler, &registry, "p1").await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let host_side = MessageChannel::attach(&host, move |_, inbound| sink.lock().push(inbound));
    let peer_side = MessageChannel::attach(&peer, |_, _| {});

    peer_side.introduce("ann").await.unwrap();
    peer_side.send_msg(json!({"move": "e4"})).await.unwrap();
    peer.send("plain").await.unwrap();

    eventually(|| seen.lock().len() == 3).await;
    assert_eq!(
        *seen.lock(),
        vec![
            Inbound::Introduced { name: "ann".into() },
            Inbound::Message {
                from: Some("ann".into()),
                payload: json!({"move": "e4"}),
            },
            Inbound::Raw(Bytes::from_static(b"plain")),
        ]
    );
    assert_eq!(host_side.remote_name().as_deref(), Some("ann"));
}

#[tokio::test]
async fn log_sink_records_the_lifecycle() {
    let net = LoopbackNetwork::new();
    let writer = Arc::new(MemoryWriter::new());
    let signaler = signaler_with(&net, config()).with_log(LogSink::new(writer.clone()));
    let registry = signaler.host_registry();
    connect(&signaler, &registry, "p1").await;

    eventually(|| signaler.log().pending() == 0 && !writer.entries().is_empty()).await;
    let entries = writer.entries();
    assert!(entries.iter().any(|e| e.contains("session created")));
    assert!(entries.iter().any(|e| e.contains("payload ready")));
    assert!(entries.iter().any(|e| e.starts_with("[p1/")));
}
