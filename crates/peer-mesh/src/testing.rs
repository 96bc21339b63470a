//! Deterministic in-memory transport for exercising the orchestrator.
//!
//! Every capability call is recorded, individual operations can be made to
//! fail, and tests push transport events (channel open, ICE state, local
//! candidates, inbound messages) by hand.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::peer::PeerId;
use crate::transport::{
    ChannelId, ChannelState, IceCandidate, IceConnectivity, PeerTransport, SdpKind,
    SessionDescription, TransportEvent, TransportEvents, TransportFactory,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Connect(PeerId),
    CreateOffer(PeerId),
    CreateAnswer(PeerId),
    SetLocal(PeerId, SdpKind),
    SetRemote(PeerId, SdpKind),
    AddCandidate(PeerId, String),
    OpenChannel(PeerId, String),
    Send(PeerId, String),
    Close(PeerId),
}

#[derive(Debug, Default)]
struct FakePeer {
    events: Option<TransportEvents>,
    connects: usize,
    descriptions: usize,
    remote_set: bool,
    outgoing: Vec<ChannelId>,
    applied: Vec<String>,
    sent: Vec<String>,
    fail_sends: usize,
    fail_create_offer: bool,
    fail_set_remote: bool,
    fail_open_channel: bool,
}

#[derive(Debug, Default)]
struct FakeInner {
    peers: HashMap<PeerId, FakePeer>,
    fail_connect: HashSet<PeerId>,
    calls: Vec<FakeCall>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeTransportFactory {
    inner: Arc<Mutex<FakeInner>>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Arc<dyn TransportFactory> {
        Arc::new(self.clone())
    }

    pub fn fail_connect(&self, peer: &PeerId) {
        self.inner.lock().fail_connect.insert(peer.clone());
    }

    /// The next `count` sends to `peer` fail.
    pub fn fail_next_sends(&self, peer: &PeerId, count: usize) {
        self.with_peer(peer, |state| state.fail_sends = count);
    }

    pub fn fail_create_offer(&self, peer: &PeerId) {
        self.with_peer(peer, |state| state.fail_create_offer = true);
    }

    pub fn fail_set_remote(&self, peer: &PeerId) {
        self.with_peer(peer, |state| state.fail_set_remote = true);
    }

    pub fn fail_open_channel(&self, peer: &PeerId, fail: bool) {
        self.with_peer(peer, |state| state.fail_open_channel = fail);
    }

    fn with_peer<R>(&self, peer: &PeerId, apply: impl FnOnce(&mut FakePeer) -> R) -> R {
        apply(self.inner.lock().peers.entry(peer.clone()).or_default())
    }

    fn events(&self, peer: &PeerId) -> Option<TransportEvents> {
        self.inner
            .lock()
            .peers
            .get(peer)
            .and_then(|state| state.events.clone())
    }

    /// Pushes a raw transport event for `peer`. False if nothing is listening.
    pub fn emit(&self, peer: &PeerId, event: TransportEvent) -> bool {
        self.events(peer).is_some_and(|events| events.emit(event))
    }

    /// Most recent outgoing channel created for `peer`.
    pub fn outgoing_channel(&self, peer: &PeerId) -> Option<ChannelId> {
        self.with_peer(peer, |state| state.outgoing.last().copied())
    }

    pub fn open_channel(&self, peer: &PeerId) -> bool {
        self.set_channel_state(peer, ChannelState::Open)
    }

    pub fn close_channel(&self, peer: &PeerId) -> bool {
        self.set_channel_state(peer, ChannelState::Closed)
    }

    fn set_channel_state(&self, peer: &PeerId, state: ChannelState) -> bool {
        match self.outgoing_channel(peer) {
            Some(channel) => self.emit(peer, TransportEvent::ChannelState { channel, state }),
            None => false,
        }
    }

    /// Announces a remote-opened channel and opens it.
    pub fn incoming_channel(&self, peer: &PeerId, label: &str) -> Option<ChannelId> {
        let channel = ChannelId::next();
        let announced = self.emit(
            peer,
            TransportEvent::IncomingChannel {
                channel,
                label: label.to_string(),
            },
        ) && self.emit(
            peer,
            TransportEvent::ChannelState {
                channel,
                state: ChannelState::Open,
            },
        );
        announced.then_some(channel)
    }

    pub fn set_ice_state(&self, peer: &PeerId, state: IceConnectivity) -> bool {
        self.emit(peer, TransportEvent::IceState(state))
    }

    pub fn emit_local_candidate(&self, peer: &PeerId, candidate: IceCandidate) -> bool {
        self.emit(peer, TransportEvent::LocalCandidate(candidate))
    }

    /// Delivers an inbound message on `channel`, or on the outgoing channel.
    pub fn deliver(&self, peer: &PeerId, channel: Option<ChannelId>, text: &str) -> bool {
        let Some(channel) = channel.or_else(|| self.outgoing_channel(peer)) else {
            return false;
        };
        self.emit(
            peer,
            TransportEvent::Message {
                channel,
                text: text.to_string(),
            },
        )
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.inner.lock().calls.clone()
    }

    pub fn applied_candidates(&self, peer: &PeerId) -> Vec<String> {
        self.with_peer(peer, |state| state.applied.clone())
    }

    pub fn sent(&self, peer: &PeerId) -> Vec<String> {
        self.with_peer(peer, |state| state.sent.clone())
    }

    pub fn channels_opened(&self, peer: &PeerId) -> usize {
        self.with_peer(peer, |state| state.outgoing.len())
    }

    pub fn connects(&self, peer: &PeerId) -> usize {
        self.with_peer(peer, |state| state.connects)
    }

    pub fn is_closed(&self, peer: &PeerId) -> bool {
        self.calls()
            .iter()
            .any(|call| *call == FakeCall::Close(peer.clone()))
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn connect(
        &self,
        peer: &PeerId,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let mut inner = self.inner.lock();
        inner.calls.push(FakeCall::Connect(peer.clone()));
        if inner.fail_connect.contains(peer) {
            return Err(TransportError::Setup(format!("refusing to connect {peer}")));
        }
        let state = inner.peers.entry(peer.clone()).or_default();
        state.connects += 1;
        state.events = Some(events);
        state.remote_set = false;
        state.outgoing.clear();
        Ok(Box::new(FakeTransport {
            peer: peer.clone(),
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct FakeTransport {
    peer: PeerId,
    inner: Arc<Mutex<FakeInner>>,
}

impl FakeTransport {
    fn record<R>(&self, call: FakeCall, apply: impl FnOnce(&mut FakePeer) -> R) -> R {
        let mut inner = self.inner.lock();
        inner.calls.push(call);
        apply(inner.peers.entry(self.peer.clone()).or_default())
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let peer = self.peer.clone();
        self.record(FakeCall::CreateOffer(peer.clone()), |state| {
            if state.fail_create_offer {
                return Err(TransportError::Negotiation("offer refused".into()));
            }
            state.descriptions += 1;
            Ok(SessionDescription::offer(format!(
                "fake-offer:{peer}:{}",
                state.descriptions
            )))
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let peer = self.peer.clone();
        self.record(FakeCall::CreateAnswer(peer.clone()), |state| {
            if !state.remote_set {
                return Err(TransportError::Negotiation(
                    "answer requested without remote offer".into(),
                ));
            }
            state.descriptions += 1;
            Ok(SessionDescription::answer(format!(
                "fake-answer:{peer}:{}",
                state.descriptions
            )))
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(FakeCall::SetLocal(self.peer.clone(), description.kind), |_| Ok(()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(FakeCall::SetRemote(self.peer.clone(), description.kind), |state| {
            if state.fail_set_remote {
                return Err(TransportError::Negotiation("remote description rejected".into()));
            }
            state.remote_set = true;
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let call = FakeCall::AddCandidate(self.peer.clone(), candidate.candidate.clone());
        self.record(call, |state| {
            if !state.remote_set {
                return Err(TransportError::Negotiation(
                    "candidate added before remote description".into(),
                ));
            }
            state.applied.push(candidate.candidate);
            Ok(())
        })
    }

    async fn open_channel(&self, label: &str) -> Result<ChannelId, TransportError> {
        self.record(FakeCall::OpenChannel(self.peer.clone(), label.to_string()), |state| {
            if state.fail_open_channel {
                return Err(TransportError::Setup("data channel refused".into()));
            }
            let channel = ChannelId::next();
            state.outgoing.push(channel);
            Ok(channel)
        })
    }

    async fn send_on_channel(&self, _channel: ChannelId, text: &str) -> Result<(), TransportError> {
        self.record(FakeCall::Send(self.peer.clone(), text.to_string()), |state| {
            if state.fail_sends > 0 {
                state.fail_sends -= 1;
                return Err(TransportError::Send("injected send failure".into()));
            }
            state.sent.push(text.to_string());
            Ok(())
        })
    }

    async fn close(&self) {
        self.record(FakeCall::Close(self.peer.clone()), |state| {
            state.events = None;
            state.remote_set = false;
        });
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
