#![allow(dead_code)]

use std::time::Duration;

use peer_mesh::testing::{FakeTransportFactory, eventually};
use peer_mesh::{
    MeshConfig, MeshEvent, MeshEvents, Orchestrator, OrchestratorHandle, PeerId, PeerSet,
    PeerSnapshot,
};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn peer(raw: &str) -> PeerId {
    PeerId::parse(raw).expect("valid peer id")
}

pub fn table_config(local: &str) -> MeshConfig {
    let seats = PeerSet::parse_list("east,north,west").expect("three seats");
    MeshConfig::new(peer(local), seats)
}

pub fn spawn(local: &str, fake: &FakeTransportFactory) -> (OrchestratorHandle, MeshEvents) {
    Orchestrator::spawn(&table_config(local), fake.shared()).expect("orchestrator starts")
}

/// Next event satisfying `matches`, skipping everything else.
pub async fn next_event<F>(events: &mut MeshEvents, matches: F) -> MeshEvent
where
    F: Fn(&MeshEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("event before timeout")
            .expect("event stream open");
        if matches(&event) {
            return event;
        }
    }
}

/// Drains whatever is already queued without waiting.
pub fn drain(events: &mut MeshEvents) -> Vec<MeshEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub async fn wait_for_snapshot<F>(handle: &OrchestratorHandle, peer: &PeerId, check: F) -> PeerSnapshot
where
    F: Fn(&PeerSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(snapshot) = handle.snapshot(peer).await.expect("orchestrator alive") {
            if check(&snapshot) {
                return snapshot;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "snapshot for {peer} never matched, last: {snapshot:?}"
            );
        } else {
            assert!(tokio::time::Instant::now() < deadline, "no connection for {peer}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Creates the connection to `remote` and opens its outgoing channel.
pub async fn connect_open(handle: &OrchestratorHandle, fake: &FakeTransportFactory, remote: &PeerId) {
    handle
        .get_or_create_connection(remote)
        .await
        .expect("connection created");
    assert!(
        eventually(WAIT, || fake.channels_opened(remote) >= 1).await,
        "outgoing channel for {remote} never requested"
    );
    assert!(fake.open_channel(remote), "channel open delivered");
    wait_for_snapshot(handle, remote, |snapshot| snapshot.channel_open).await;
}
