mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{WAIT, next_event, peer, spawn, wait_for_snapshot};
use mesh_test_macros::timeout_test;
use peer_mesh::testing::{FakeCall, FakeTransportFactory, eventually};
use peer_mesh::{
    IceCandidate, MeshError, MeshEvent, MeshEvents, NegotiationState, SignalingSession,
    document_key,
};
use signaling_bus::{CandidateRecord, LocalSignalingStore, SignalingChannel};

struct Seat {
    fake: FakeTransportFactory,
    session: SignalingSession,
    events: MeshEvents,
}

async fn seat(local: &str, store: &Arc<LocalSignalingStore>) -> Seat {
    let fake = FakeTransportFactory::new();
    let (handle, events) = spawn(local, &fake);
    let channel: Arc<dyn SignalingChannel> = store.clone();
    let (session, events) = SignalingSession::start(handle, events, channel)
        .await
        .expect("session starts");
    Seat {
        fake,
        session,
        events,
    }
}

#[timeout_test(10)]
async fn offer_published_before_subscribe_is_answered() {
    let store = Arc::new(LocalSignalingStore::new());
    let (east, north) = (peer("east"), peer("north"));

    let a = seat("east", &store).await;
    assert!(a.session.connect(&north).await.expect("offer sent"));
    let offer_key = document_key(&east, &north).expect("key");
    let offer_doc = store.document(&offer_key).expect("offer document");
    assert!(offer_doc.offer.is_some());

    // North only shows up after the offer is already stored.
    let b = seat("north", &store).await;
    let answer_key = document_key(&north, &east).expect("key");
    assert!(
        eventually(WAIT, || store
            .document(&answer_key)
            .is_some_and(|doc| doc.answer.is_some()))
        .await,
        "north never answered"
    );

    wait_for_snapshot(a.session.handle(), &north, |s| {
        s.state == NegotiationState::Negotiated
    })
    .await;
    wait_for_snapshot(b.session.handle(), &east, |s| {
        s.state == NegotiationState::Negotiated
    })
    .await;
    assert!(
        b.fake
            .calls()
            .contains(&FakeCall::CreateAnswer(east.clone()))
    );
}

#[timeout_test(10)]
async fn candidates_travel_through_documents() {
    let store = Arc::new(LocalSignalingStore::new());
    let (east, north) = (peer("east"), peer("north"));
    let a = seat("east", &store).await;
    let b = seat("north", &store).await;

    a.session.connect(&north).await.expect("offer");
    wait_for_snapshot(a.session.handle(), &north, |s| {
        s.state == NegotiationState::Negotiated
    })
    .await;

    let candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.5 50000 typ host")
        .with_mid("0", 0);
    assert!(a.fake.emit_local_candidate(&north, candidate.clone()));
    let key = document_key(&east, &north).expect("key");
    assert!(
        eventually(WAIT, || store
            .document(&key)
            .is_some_and(|doc| doc.ice_candidates.len() == 1))
        .await
    );
    assert!(
        eventually(WAIT, || b.fake.applied_candidates(&east) == vec![candidate.candidate.clone()])
            .await
    );

    // A malformed entry is dropped; the next good one still lands.
    store
        .append_candidate(
            &document_key(&north, &east).expect("key"),
            serde_json::json!({ "bogus": true }),
        )
        .await
        .expect("append");
    let good = CandidateRecord {
        sdp: "candidate:2 1 udp 1 10.0.0.6 50001 typ host".into(),
        sdp_mid: "0".into(),
        sdp_mline_index: "0".into(),
    };
    store
        .append_candidate(
            &document_key(&north, &east).expect("key"),
            good.to_value().expect("json"),
        )
        .await
        .expect("append");
    assert!(
        eventually(WAIT, || a.fake.applied_candidates(&north) == vec![good.sdp.clone()]).await
    );
}

#[timeout_test(10)]
async fn only_the_lower_id_offers() {
    let store = Arc::new(LocalSignalingStore::new());
    let b = seat("north", &store).await;
    let east = peer("east");

    let offered = b.session.connect(&east).await.expect("connect");
    assert!(!offered);
    assert!(store.keys().is_empty());
    let snapshot = b
        .session
        .handle()
        .snapshot(&east)
        .await
        .expect("alive")
        .expect("connection prepared");
    assert_eq!(snapshot.state, NegotiationState::New);
}

#[timeout_test(10)]
async fn colliding_offer_from_higher_id_is_ignored() {
    let store = Arc::new(LocalSignalingStore::new());
    let (east, north) = (peer("east"), peer("north"));
    let a = seat("east", &store).await;
    a.session.connect(&north).await.expect("offer");

    store
        .publish_offer(&document_key(&north, &east).expect("key"), "rogue offer")
        .await
        .expect("publish");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = a
        .session
        .handle()
        .snapshot(&north)
        .await
        .expect("alive")
        .expect("connection");
    assert_eq!(snapshot.state, NegotiationState::Offering);
    assert!(
        !a.fake
            .calls()
            .iter()
            .any(|call| matches!(call, FakeCall::CreateAnswer(_)))
    );
}

#[timeout_test(10)]
async fn failed_publish_is_reported_and_retried() {
    let store = Arc::new(LocalSignalingStore::new());
    let north = peer("north");
    let mut a = seat("east", &store).await;

    store.set_reject_writes(true);
    let err = a.session.connect(&north).await.expect_err("publish rejected");
    assert!(matches!(err, MeshError::Signaling(_)));
    next_event(&mut a.events, |e| matches!(e, MeshEvent::SignalingFailed { .. })).await;
    assert_eq!(a.session.unpublished(&north), 1);

    store.set_reject_writes(false);
    assert_eq!(a.session.retry_publish(&north).await.expect("retry"), 1);
    assert_eq!(a.session.unpublished(&north), 0);
    let key = document_key(&peer("east"), &north).expect("key");
    assert!(store.document(&key).is_some_and(|doc| doc.offer.is_some()));
}

#[timeout_test(10)]
async fn dial_all_offers_upward_and_shutdown_removes_documents() {
    let store = Arc::new(LocalSignalingStore::new());
    let a = seat("east", &store).await;

    a.session.dial_all().await.expect("dial");
    let east = peer("east");
    for remote in ["north", "west"] {
        let key = document_key(&east, &peer(remote)).expect("key");
        assert!(store.document(&key).is_some_and(|doc| doc.offer.is_some()));
    }

    a.session.shutdown().await.expect("shutdown");
    assert!(store.keys().is_empty());
}

#[timeout_test(10)]
async fn session_forwards_orchestrator_events() {
    let store = Arc::new(LocalSignalingStore::new());
    let mut a = seat("east", &store).await;
    let north = peer("north");

    a.session
        .handle()
        .close_connection(&north)
        .await
        .expect("close");
    a.session
        .handle()
        .get_or_create_connection(&north)
        .await
        .expect("create");
    a.session
        .handle()
        .close_connection(&north)
        .await
        .expect("close");
    next_event(&mut a.events, |e| *e == MeshEvent::ConnectionClosed(north.clone())).await;
}

fn record(sdp: &str) -> serde_json::Value {
    CandidateRecord {
        sdp: sdp.into(),
        sdp_mid: "0".into(),
        sdp_mline_index: "0".into(),
    }
    .to_value()
    .expect("json")
}

#[timeout_test(10)]
async fn recreated_document_is_read_from_its_first_candidate() {
    let store = Arc::new(LocalSignalingStore::new());
    let east = peer("east");
    let b = seat("north", &store).await;
    let key = document_key(&east, &peer("north")).expect("key");

    store.publish_offer(&key, "offer-1").await.expect("publish");
    for sdp in ["c1", "c2"] {
        store.append_candidate(&key, record(sdp)).await.expect("append");
    }
    assert!(eventually(WAIT, || b.fake.applied_candidates(&east) == vec!["c1", "c2"]).await);

    // East's session went away and a fresh one writes the same key again.
    store.remove(&key).await.expect("remove");
    b.session
        .handle()
        .close_connection(&east)
        .await
        .expect("close");
    store.publish_offer(&key, "offer-2").await.expect("publish");
    store.append_candidate(&key, record("c3")).await.expect("append");

    assert!(
        eventually(WAIT, || b.fake.applied_candidates(&east) == vec!["c1", "c2", "c3"]).await,
        "applied: {:?}",
        b.fake.applied_candidates(&east)
    );
    wait_for_snapshot(b.session.handle(), &east, |s| {
        s.state == NegotiationState::Negotiated
    })
    .await;
}

#[timeout_test(10)]
async fn unanswerable_offer_is_answered_once_the_stale_connection_closes() {
    let store = Arc::new(LocalSignalingStore::new());
    let (east, north) = (peer("east"), peer("north"));
    let a = seat("east", &store).await;
    let b = seat("north", &store).await;

    a.session.connect(&north).await.expect("offer");
    wait_for_snapshot(b.session.handle(), &east, |s| {
        s.state == NegotiationState::Negotiated
    })
    .await;
    wait_for_snapshot(a.session.handle(), &north, |s| {
        s.state == NegotiationState::Negotiated
    })
    .await;

    // East renegotiates while north still holds the old connection.
    a.session
        .handle()
        .close_connection(&north)
        .await
        .expect("close");
    assert!(a.session.connect(&north).await.expect("re-offer"));
    let candidate = IceCandidate::new("candidate:7 1 udp 1 10.0.0.7 50007 typ host").with_mid("0", 0);
    assert!(a.fake.emit_local_candidate(&north, candidate.clone()));
    let key = document_key(&east, &north).expect("key");
    assert!(
        eventually(WAIT, || store
            .document(&key)
            .is_some_and(|doc| doc.ice_candidates.len() == 1))
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stale = b
        .session
        .handle()
        .snapshot(&east)
        .await
        .expect("alive")
        .expect("old connection");
    assert_eq!(stale.state, NegotiationState::Negotiated);
    assert!(b.fake.applied_candidates(&east).is_empty());
    let waiting = a
        .session
        .handle()
        .snapshot(&north)
        .await
        .expect("alive")
        .expect("connection");
    assert_eq!(waiting.state, NegotiationState::Offering);

    b.session
        .handle()
        .close_connection(&east)
        .await
        .expect("close");

    wait_for_snapshot(b.session.handle(), &east, |s| {
        s.state == NegotiationState::Negotiated
    })
    .await;
    wait_for_snapshot(a.session.handle(), &north, |s| {
        s.state == NegotiationState::Negotiated
    })
    .await;
    assert!(
        eventually(WAIT, || b.fake.applied_candidates(&east) == vec![candidate.candidate.clone()])
            .await
    );
}
