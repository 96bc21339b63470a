//! Single-owner actor driving every peer connection of one local seat.
//!
//! All per-peer tables live inside the actor task and are only touched from
//! its loop. Transport work runs on a per-connection lane task which owns the
//! transport object and reports back through the same inbox, tagged with the
//! connection generation so late results for a closed connection are dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::candidates::IceCandidateBuffer;
use crate::channels::{ChannelDirection, ChannelOpened, DataChannelRegistry};
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult, TransportError};
use crate::events::{MeshEvent, MeshEvents};
use crate::peer::{PeerId, PeerSet};
use crate::queue::{Destination, OutboundMessage, OutboundMessageQueue};
use crate::state::{NegotiationRole, NegotiationState, PeerConnection, PeerSnapshot, Transition};
use crate::transport::{
    ChannelId, ChannelState, IceCandidate, PeerTransport, SdpKind, SessionDescription,
    TransportEvent, TransportEvents, TransportFactory,
};

const LOG_TARGET: &str = "peer_mesh::orchestrator";

type Reply<T> = oneshot::Sender<MeshResult<T>>;

enum Command {
    GetOrCreate {
        peer: PeerId,
        reply: Reply<PeerSnapshot>,
    },
    CreateOffer {
        peer: PeerId,
        reply: Reply<String>,
    },
    CreateAnswer {
        peer: PeerId,
        offer: String,
        reply: Reply<String>,
    },
    SetRemoteDescription {
        peer: PeerId,
        answer: String,
        reply: Reply<()>,
    },
    AddIceCandidate {
        peer: PeerId,
        candidate: IceCandidate,
        reply: Reply<()>,
    },
    Send {
        destination: Destination,
        text: String,
        reply: Reply<Vec<oneshot::Receiver<bool>>>,
    },
    Close {
        peer: PeerId,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        peer: PeerId,
        reply: oneshot::Sender<Option<PeerSnapshot>>,
    },
    Snapshots {
        reply: oneshot::Sender<Vec<PeerSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Inbox {
    Command(Command),
    Transport {
        peer: PeerId,
        generation: u64,
        event: TransportEvent,
    },
    Completed {
        peer: PeerId,
        generation: u64,
        completion: Completion,
    },
}

/// What to do once a remote description has been applied.
enum PendingRemote {
    Answer(Reply<String>),
    Applied(Reply<()>),
}

impl PendingRemote {
    fn reject(self, err: MeshError) {
        match self {
            PendingRemote::Answer(reply) => {
                let _ = reply.send(Err(err));
            }
            PendingRemote::Applied(reply) => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Work executed in order on a connection's lane.
enum PeerOp {
    OpenOutgoing {
        label: String,
    },
    CreateOffer {
        reply: Reply<String>,
    },
    SetRemote {
        description: SessionDescription,
        pending: PendingRemote,
    },
    CreateAnswer {
        reply: Reply<String>,
    },
    AddCandidate(IceCandidate),
    Send {
        channel: ChannelId,
        message: OutboundMessage,
    },
    Close,
}

enum Completion {
    TransportReady(Result<(), TransportError>),
    OutgoingChannel(Result<ChannelId, TransportError>),
    OfferCreated {
        result: Result<SessionDescription, TransportError>,
        reply: Reply<String>,
    },
    RemoteApplied {
        result: Result<(), TransportError>,
        pending: PendingRemote,
    },
    AnswerCreated {
        result: Result<SessionDescription, TransportError>,
        reply: Reply<String>,
    },
    CandidateApplied(Result<(), TransportError>),
    SendFinished {
        result: Result<(), TransportError>,
        message: OutboundMessage,
    },
}

impl Completion {
    /// Resolves whoever is waiting on a completion whose connection is gone.
    fn abandon(self, peer: &PeerId) {
        let closed = || MeshError::Closed(peer.clone());
        match self {
            Completion::OfferCreated { reply, .. } | Completion::AnswerCreated { reply, .. } => {
                let _ = reply.send(Err(closed()));
            }
            Completion::RemoteApplied { pending, .. } => pending.reject(closed()),
            Completion::SendFinished { mut message, .. } => message.acknowledge(false),
            Completion::TransportReady(_)
            | Completion::OutgoingChannel(_)
            | Completion::CandidateApplied(_) => {}
        }
    }
}

pub struct Orchestrator {
    local: PeerId,
    participants: PeerSet,
    factory: Arc<dyn TransportFactory>,
    inbox: mpsc::WeakUnboundedSender<Inbox>,
    events: mpsc::UnboundedSender<MeshEvent>,
    connections: HashMap<PeerId, PeerConnection<PeerOp>>,
    channels: DataChannelRegistry,
    candidates: IceCandidateBuffer,
    queue: OutboundMessageQueue,
    next_generation: u64,
}

impl Orchestrator {
    /// Starts the actor on the current tokio runtime.
    ///
    /// The actor stops once every [`OrchestratorHandle`] is dropped or
    /// [`OrchestratorHandle::shutdown`] is called.
    pub fn spawn(
        config: &MeshConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> MeshResult<(OrchestratorHandle, MeshEvents)> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let actor = Orchestrator {
            local: config.local.clone(),
            participants: config.participants.clone(),
            factory,
            inbox: tx.downgrade(),
            events: events_tx,
            connections: HashMap::new(),
            channels: DataChannelRegistry::new(),
            candidates: IceCandidateBuffer::new(),
            queue: OutboundMessageQueue::new(),
            next_generation: 0,
        };
        info!(
            target = LOG_TARGET,
            local = %config.local,
            participants = config.participants.len(),
            "starting orchestrator"
        );
        tokio::spawn(actor.run(rx));
        let handle = OrchestratorHandle {
            local: config.local.clone(),
            participants: config.participants.clone(),
            tx,
        };
        Ok((handle, events_rx))
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Inbox>) {
        while let Some(message) = inbox.recv().await {
            match message {
                Inbox::Command(Command::Shutdown { reply }) => {
                    self.close_all();
                    let _ = reply.send(());
                    break;
                }
                Inbox::Command(command) => self.handle_command(command),
                Inbox::Transport {
                    peer,
                    generation,
                    event,
                } => self.handle_transport(peer, generation, event),
                Inbox::Completed {
                    peer,
                    generation,
                    completion,
                } => self.handle_completion(peer, generation, completion),
            }
        }
        self.close_all();
        debug!(target = LOG_TARGET, local = %self.local, "orchestrator stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::GetOrCreate { peer, reply } => {
                let _ = reply.send(self.get_or_create(&peer));
            }
            Command::CreateOffer { peer, reply } => self.create_offer(peer, reply),
            Command::CreateAnswer { peer, offer, reply } => self.accept_offer(peer, offer, reply),
            Command::SetRemoteDescription {
                peer,
                answer,
                reply,
            } => self.apply_remote_answer(peer, answer, reply),
            Command::AddIceCandidate {
                peer,
                candidate,
                reply,
            } => {
                let _ = reply.send(self.add_remote_candidate(&peer, candidate));
            }
            Command::Send {
                destination,
                text,
                reply,
            } => {
                let _ = reply.send(self.send(destination, &text));
            }
            Command::Close { peer, reply } => {
                self.close_connection(&peer);
                let _ = reply.send(());
            }
            Command::Snapshot { peer, reply } => {
                let _ = reply.send(self.snapshot(&peer));
            }
            Command::Snapshots { reply } => {
                let mut peers: Vec<&PeerId> = self.connections.keys().collect();
                peers.sort();
                let snapshots = peers
                    .into_iter()
                    .filter_map(|peer| self.snapshot(peer))
                    .collect();
                let _ = reply.send(snapshots);
            }
            Command::Shutdown { reply } => {
                self.close_all();
                let _ = reply.send(());
            }
        }
    }

    fn check_peer(&self, peer: &PeerId) -> MeshResult<()> {
        if *peer == self.local || !self.participants.contains(peer) {
            return Err(MeshError::UnknownPeer(peer.clone()));
        }
        Ok(())
    }

    fn is_live(&self, peer: &PeerId, generation: u64) -> bool {
        self.connections
            .get(peer)
            .is_some_and(|conn| conn.generation == generation)
    }

    fn emit(&self, event: MeshEvent) {
        if self.events.send(event).is_err() {
            trace!(target = LOG_TARGET, "event receiver dropped");
        }
    }

    fn get_or_create(&mut self, peer: &PeerId) -> MeshResult<PeerSnapshot> {
        self.check_peer(peer)?;
        self.ensure_connection(peer);
        self.snapshot(peer)
            .ok_or_else(|| MeshError::Closed(peer.clone()))
    }

    /// Creates the connection on first use; afterwards makes sure the
    /// outgoing channel exists, reopening it when it was lost.
    fn ensure_connection(&mut self, peer: &PeerId) {
        if let Some(conn) = self.connections.get_mut(peer) {
            if !conn.outgoing_requested
                && !conn.state.is_terminal()
                && !self.channels.has_outgoing(peer)
            {
                debug!(target = LOG_TARGET, peer = %peer, "reopening outgoing channel");
                conn.outgoing_requested = true;
                let _ = conn.lane.send(PeerOp::OpenOutgoing {
                    label: peer.to_string(),
                });
            }
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let (lane_tx, lane_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_lane(
            peer.clone(),
            generation,
            Arc::clone(&self.factory),
            self.transport_events(peer, generation),
            lane_rx,
            self.inbox.clone(),
        ));

        let mut conn = PeerConnection::new(generation, lane_tx);
        conn.outgoing_requested = true;
        let _ = conn.lane.send(PeerOp::OpenOutgoing {
            label: peer.to_string(),
        });
        self.connections.insert(peer.clone(), conn);
        info!(target = LOG_TARGET, peer = %peer, generation, "peer connection created");
    }

    fn transport_events(&self, peer: &PeerId, generation: u64) -> TransportEvents {
        let inbox = self.inbox.clone();
        let owner = peer.clone();
        TransportEvents::new(peer.clone(), move |event| {
            let Some(inbox) = inbox.upgrade() else {
                return false;
            };
            inbox
                .send(Inbox::Transport {
                    peer: owner.clone(),
                    generation,
                    event,
                })
                .is_ok()
        })
    }

    fn create_offer(&mut self, peer: PeerId, reply: Reply<String>) {
        if let Err(err) = self.check_peer(&peer) {
            let _ = reply.send(Err(err));
            return;
        }
        self.ensure_connection(&peer);
        let Some(conn) = self.connections.get_mut(&peer) else {
            let _ = reply.send(Err(MeshError::Closed(peer)));
            return;
        };
        if !matches!(
            conn.state,
            NegotiationState::New | NegotiationState::Offering
        ) {
            let state = conn.state;
            let _ = reply.send(Err(MeshError::InvalidState { peer, state }));
            return;
        }
        conn.role = NegotiationRole::Offerer;
        conn.state = NegotiationState::Offering;
        debug!(target = LOG_TARGET, peer = %peer, state = %conn.state, "creating offer");
        let _ = conn.lane.send(PeerOp::CreateOffer { reply });
    }

    fn accept_offer(&mut self, peer: PeerId, offer: String, reply: Reply<String>) {
        if let Err(err) = self.check_peer(&peer) {
            let _ = reply.send(Err(err));
            return;
        }
        self.ensure_connection(&peer);
        let Some(conn) = self.connections.get_mut(&peer) else {
            let _ = reply.send(Err(MeshError::Closed(peer)));
            return;
        };
        if conn.state != NegotiationState::New {
            let state = conn.state;
            let _ = reply.send(Err(MeshError::InvalidState { peer, state }));
            return;
        }
        conn.role = NegotiationRole::Answerer;
        conn.state = NegotiationState::Answering;
        debug!(target = LOG_TARGET, peer = %peer, state = %conn.state, "accepting offer");
        let _ = conn.lane.send(PeerOp::SetRemote {
            description: SessionDescription::offer(offer),
            pending: PendingRemote::Answer(reply),
        });
    }

    fn apply_remote_answer(&mut self, peer: PeerId, answer: String, reply: Reply<()>) {
        if let Err(err) = self.check_peer(&peer) {
            let _ = reply.send(Err(err));
            return;
        }
        let Some(conn) = self.connections.get_mut(&peer) else {
            let _ = reply.send(Err(MeshError::InvalidState {
                peer,
                state: NegotiationState::New,
            }));
            return;
        };
        if conn.state != NegotiationState::Offering {
            let state = conn.state;
            let _ = reply.send(Err(MeshError::InvalidState { peer, state }));
            return;
        }
        debug!(target = LOG_TARGET, peer = %peer, "applying remote answer");
        let _ = conn.lane.send(PeerOp::SetRemote {
            description: SessionDescription::answer(answer),
            pending: PendingRemote::Applied(reply),
        });
    }

    fn add_remote_candidate(&mut self, peer: &PeerId, candidate: IceCandidate) -> MeshResult<()> {
        self.check_peer(peer)?;
        self.ensure_connection(peer);
        let Some(conn) = self.connections.get(peer) else {
            return Err(MeshError::Closed(peer.clone()));
        };
        if conn.remote_description_set {
            trace!(target = LOG_TARGET, peer = %peer, candidate = %candidate.candidate, "applying remote candidate");
            let _ = conn.lane.send(PeerOp::AddCandidate(candidate));
        } else {
            trace!(target = LOG_TARGET, peer = %peer, candidate = %candidate.candidate, "buffering remote candidate");
            self.candidates.buffer_remote(peer, candidate);
        }
        Ok(())
    }

    fn send(
        &mut self,
        destination: Destination,
        text: &str,
    ) -> MeshResult<Vec<oneshot::Receiver<bool>>> {
        let targets: Vec<PeerId> = match destination {
            Destination::Peer(peer) => {
                self.check_peer(&peer)?;
                self.ensure_connection(&peer);
                vec![peer]
            }
            Destination::All => {
                let mut peers: Vec<PeerId> = self.connections.keys().cloned().collect();
                peers.sort();
                peers
            }
        };
        Ok(targets
            .iter()
            .map(|peer| self.send_or_queue(peer, text))
            .collect())
    }

    fn send_or_queue(&mut self, peer: &PeerId, text: &str) -> oneshot::Receiver<bool> {
        let (ack, delivered) = oneshot::channel();
        if self.channels.is_open(peer) {
            self.queue.enqueue(peer, OutboundMessage::with_ack(text, ack));
            self.flush(peer);
        } else {
            trace!(target = LOG_TARGET, peer = %peer, "channel not open, queueing message");
            self.queue.enqueue(peer, OutboundMessage::new(text));
            let _ = ack.send(false);
        }
        delivered
    }

    /// Hands the front message to the lane. The next one follows when the
    /// send completes, so a failure can never be overtaken.
    fn flush(&mut self, peer: &PeerId) {
        let Some(channel) = self.channels.send_target(peer) else {
            return;
        };
        let Some(conn) = self.connections.get(peer) else {
            return;
        };
        let Some(message) = self.queue.begin_send(peer) else {
            return;
        };
        trace!(target = LOG_TARGET, peer = %peer, channel = %channel, "sending queued message");
        if let Err(mpsc::error::SendError(op)) = conn.lane.send(PeerOp::Send { channel, message }) {
            if let PeerOp::Send { message, .. } = op {
                self.queue.finish_send(peer, Some(message));
            }
        }
    }

    fn close_connection(&mut self, peer: &PeerId) {
        let Some(conn) = self.connections.remove(peer) else {
            return;
        };
        let _ = conn.lane.send(PeerOp::Close);
        let channels = self.channels.remove_peer(peer);
        self.candidates.purge(peer);
        self.queue.purge(peer);
        info!(
            target = LOG_TARGET,
            peer = %peer,
            generation = conn.generation,
            channels = channels.len(),
            "peer connection closed"
        );
        self.emit(MeshEvent::ConnectionClosed(peer.clone()));
    }

    fn close_all(&mut self) {
        let mut peers: Vec<PeerId> = self.connections.keys().cloned().collect();
        peers.sort();
        for peer in peers {
            self.close_connection(&peer);
        }
    }

    fn snapshot(&self, peer: &PeerId) -> Option<PeerSnapshot> {
        let conn = self.connections.get(peer)?;
        Some(PeerSnapshot {
            peer: peer.clone(),
            generation: conn.generation,
            role: conn.role,
            state: conn.state,
            ice_state: conn.ice_state,
            signaling_state: conn.signaling_state,
            created_at: conn.created_at,
            channel_open: self.channels.is_open(peer),
            queued: self.queue.len(peer),
            pending_remote_candidates: self.candidates.pending_remote(peer),
            pending_local_candidates: self.candidates.pending_local(peer),
        })
    }

    fn report(&mut self, peer: &PeerId, transition: Transition) {
        match transition {
            Transition::Established => {
                info!(target = LOG_TARGET, peer = %peer, "connection established");
                self.emit(MeshEvent::ConnectionEstablished(peer.clone()));
            }
            Transition::Lost => {
                warn!(target = LOG_TARGET, peer = %peer, "connection lost");
                self.emit(MeshEvent::ConnectionLost(peer.clone()));
            }
            Transition::Failed(reason) => {
                warn!(target = LOG_TARGET, peer = %peer, reason = %reason, "connection failed");
                self.queue.release_acks(peer);
                self.emit(MeshEvent::ConnectionFailed {
                    peer: peer.clone(),
                    reason,
                });
            }
        }
    }

    fn fail_peer(&mut self, peer: &PeerId, err: &MeshError) {
        let Some(conn) = self.connections.get_mut(peer) else {
            return;
        };
        if conn.fail() {
            self.report(peer, Transition::Failed(err.to_string()));
        }
    }

    fn release_local_candidates(&mut self, peer: &PeerId) {
        for candidate in self.candidates.drain_local(peer) {
            self.emit(MeshEvent::LocalIceCandidateReady {
                peer: peer.clone(),
                candidate,
            });
        }
    }

    fn handle_transport(&mut self, peer: PeerId, generation: u64, event: TransportEvent) {
        if !self.is_live(&peer, generation) {
            debug!(target = LOG_TARGET, peer = %peer, generation, "dropping event from closed connection");
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let ready = self
                    .connections
                    .get(&peer)
                    .is_some_and(|conn| conn.local_description_set);
                if ready {
                    self.emit(MeshEvent::LocalIceCandidateReady { peer, candidate });
                } else {
                    trace!(target = LOG_TARGET, peer = %peer, "holding local candidate until local description is set");
                    self.candidates.buffer_local(&peer, candidate);
                }
            }
            TransportEvent::IceState(ice) => {
                let Some(conn) = self.connections.get_mut(&peer) else {
                    return;
                };
                let transition = conn.on_ice_state(ice);
                debug!(target = LOG_TARGET, peer = %peer, ice = %ice, state = %conn.state, "ice state changed");
                if let Some(transition) = transition {
                    self.report(&peer, transition);
                }
            }
            TransportEvent::SignalingState(state) => {
                if let Some(conn) = self.connections.get_mut(&peer) {
                    trace!(target = LOG_TARGET, peer = %peer, state = ?state, "signaling state changed");
                    conn.signaling_state = state;
                }
            }
            TransportEvent::IncomingChannel { channel, label } => {
                debug!(target = LOG_TARGET, peer = %peer, channel = %channel, label = %label, "incoming data channel");
                self.channels.register_incoming(channel, &peer);
            }
            TransportEvent::ChannelState { channel, state } => {
                self.on_channel_state(&peer, channel, state);
            }
            TransportEvent::Message { channel, text } => {
                let owner = self
                    .channels
                    .peer_for(channel)
                    .cloned()
                    .unwrap_or_else(|| peer.clone());
                trace!(target = LOG_TARGET, peer = %owner, channel = %channel, bytes = text.len(), "message received");
                self.emit(MeshEvent::MessageReceived { peer: owner, text });
            }
        }
    }

    fn on_channel_state(&mut self, peer: &PeerId, channel: ChannelId, state: ChannelState) {
        if self.channels.get(channel).is_none() {
            // Only channels we opened can be reported before registration.
            self.channels.register_outgoing(peer, channel);
        }
        let outgoing = self
            .channels
            .get(channel)
            .is_some_and(|handle| handle.direction == ChannelDirection::Outgoing);
        let opened = self.channels.set_state(channel, state);
        debug!(target = LOG_TARGET, peer = %peer, channel = %channel, state = ?state, "data channel state");
        match state {
            ChannelState::Open => {
                if let Some(ChannelOpened(owner)) = opened {
                    self.emit(MeshEvent::ChannelOpened(owner.clone()));
                    self.flush(&owner);
                }
            }
            ChannelState::Closing | ChannelState::Closed => {
                if state == ChannelState::Closed && outgoing && !self.channels.has_outgoing(peer) {
                    if let Some(conn) = self.connections.get_mut(peer) {
                        conn.outgoing_requested = false;
                    }
                }
                if !self.channels.is_open(peer) {
                    self.queue.release_acks(peer);
                }
            }
            ChannelState::Connecting => {}
        }
    }

    fn handle_completion(&mut self, peer: PeerId, generation: u64, completion: Completion) {
        if !self.is_live(&peer, generation) {
            debug!(target = LOG_TARGET, peer = %peer, generation, "discarding late completion");
            completion.abandon(&peer);
            return;
        }
        match completion {
            Completion::TransportReady(Ok(())) => {
                debug!(target = LOG_TARGET, peer = %peer, "transport ready");
            }
            Completion::TransportReady(Err(err)) => {
                let err = MeshError::negotiation(&peer, &err);
                self.fail_peer(&peer, &err);
            }
            Completion::OutgoingChannel(Ok(channel)) => {
                debug!(target = LOG_TARGET, peer = %peer, channel = %channel, "outgoing channel created");
                self.channels.register_outgoing(&peer, channel);
            }
            Completion::OutgoingChannel(Err(err)) => {
                warn!(target = LOG_TARGET, peer = %peer, error = %err, "could not open outgoing channel");
                if let Some(conn) = self.connections.get_mut(&peer) {
                    conn.outgoing_requested = false;
                }
            }
            Completion::OfferCreated { result, reply } => match result {
                Ok(description) => {
                    if let Some(conn) = self.connections.get_mut(&peer) {
                        conn.local_description_set = true;
                    }
                    self.release_local_candidates(&peer);
                    let _ = reply.send(Ok(description.sdp));
                }
                Err(err) => {
                    let err = MeshError::negotiation(&peer, &err);
                    let _ = reply.send(Err(err.clone()));
                    self.fail_peer(&peer, &err);
                }
            },
            Completion::RemoteApplied { result, pending } => match result {
                Ok(()) => self.remote_description_applied(&peer, pending),
                Err(err) => {
                    let err = MeshError::negotiation(&peer, &err);
                    pending.reject(err.clone());
                    self.fail_peer(&peer, &err);
                }
            },
            Completion::AnswerCreated { result, reply } => match result {
                Ok(description) => {
                    let transition = self.connections.get_mut(&peer).and_then(|conn| {
                        conn.local_description_set = true;
                        conn.negotiation_complete()
                    });
                    self.release_local_candidates(&peer);
                    let _ = reply.send(Ok(description.sdp));
                    if let Some(transition) = transition {
                        self.report(&peer, transition);
                    }
                }
                Err(err) => {
                    let err = MeshError::negotiation(&peer, &err);
                    let _ = reply.send(Err(err.clone()));
                    self.fail_peer(&peer, &err);
                }
            },
            Completion::CandidateApplied(Ok(())) => {
                trace!(target = LOG_TARGET, peer = %peer, "remote candidate applied");
            }
            Completion::CandidateApplied(Err(err)) => {
                warn!(target = LOG_TARGET, peer = %peer, error = %err, "remote candidate rejected");
            }
            Completion::SendFinished {
                result: Ok(()),
                mut message,
            } => {
                message.acknowledge(true);
                self.queue.finish_send(&peer, None);
                self.flush(&peer);
            }
            Completion::SendFinished {
                result: Err(err),
                mut message,
            } => {
                let err = MeshError::ChannelSend {
                    peer: peer.clone(),
                    reason: err.to_string(),
                };
                warn!(
                    target = LOG_TARGET,
                    peer = %peer,
                    error = %err,
                    queued = self.queue.len(&peer) + 1,
                    "send failed, message kept at the front of the queue"
                );
                message.acknowledge(false);
                self.queue.finish_send(&peer, Some(message));
                self.queue.release_acks(&peer);
            }
        }
    }

    /// Buffered remote candidates go to the lane ahead of anything queued
    /// after this point, so they land right after the description.
    fn remote_description_applied(&mut self, peer: &PeerId, pending: PendingRemote) {
        let buffered = self.candidates.drain_remote(peer);
        let Some(conn) = self.connections.get_mut(peer) else {
            pending.reject(MeshError::Closed(peer.clone()));
            return;
        };
        conn.remote_description_set = true;
        if !buffered.is_empty() {
            debug!(target = LOG_TARGET, peer = %peer, count = buffered.len(), "applying buffered remote candidates");
        }
        for candidate in buffered {
            let _ = conn.lane.send(PeerOp::AddCandidate(candidate));
        }
        match pending {
            PendingRemote::Answer(reply) => {
                let _ = conn.lane.send(PeerOp::CreateAnswer { reply });
            }
            PendingRemote::Applied(reply) => {
                let transition = conn.negotiation_complete();
                debug!(target = LOG_TARGET, peer = %peer, state = %conn.state, "remote answer applied");
                let _ = reply.send(Ok(()));
                if let Some(transition) = transition {
                    self.report(peer, transition);
                }
            }
        }
    }
}

async fn run_lane(
    peer: PeerId,
    generation: u64,
    factory: Arc<dyn TransportFactory>,
    events: TransportEvents,
    mut ops: mpsc::UnboundedReceiver<PeerOp>,
    inbox: mpsc::WeakUnboundedSender<Inbox>,
) {
    let post = |completion: Completion| -> bool {
        let Some(inbox) = inbox.upgrade() else {
            return false;
        };
        inbox
            .send(Inbox::Completed {
                peer: peer.clone(),
                generation,
                completion,
            })
            .is_ok()
    };

    let transport = match factory.connect(&peer, events).await {
        Ok(transport) => {
            post(Completion::TransportReady(Ok(())));
            transport
        }
        Err(err) => {
            warn!(target = LOG_TARGET, peer = %peer, error = %err, "transport setup failed");
            post(Completion::TransportReady(Err(err)));
            return;
        }
    };

    while let Some(op) = ops.recv().await {
        let completion = match op {
            PeerOp::OpenOutgoing { label } => {
                Completion::OutgoingChannel(transport.open_channel(&label).await)
            }
            PeerOp::CreateOffer { reply } => Completion::OfferCreated {
                result: local_description(transport.as_ref(), SdpKind::Offer).await,
                reply,
            },
            PeerOp::SetRemote {
                description,
                pending,
            } => Completion::RemoteApplied {
                result: transport.set_remote_description(description).await,
                pending,
            },
            PeerOp::CreateAnswer { reply } => Completion::AnswerCreated {
                result: local_description(transport.as_ref(), SdpKind::Answer).await,
                reply,
            },
            PeerOp::AddCandidate(candidate) => {
                Completion::CandidateApplied(transport.add_ice_candidate(candidate).await)
            }
            PeerOp::Send { channel, message } => Completion::SendFinished {
                result: transport.send_on_channel(channel, &message.text).await,
                message,
            },
            PeerOp::Close => break,
        };
        if !post(completion) {
            break;
        }
    }
    transport.close().await;
    trace!(target = LOG_TARGET, peer = %peer, generation, "lane finished");
}

async fn local_description(
    transport: &dyn PeerTransport,
    kind: SdpKind,
) -> Result<SessionDescription, TransportError> {
    let description = match kind {
        SdpKind::Offer => transport.create_offer().await?,
        SdpKind::Answer => transport.create_answer().await?,
    };
    transport.set_local_description(description.clone()).await?;
    Ok(description)
}

/// Cloneable front door to an orchestrator actor.
#[derive(Clone)]
pub struct OrchestratorHandle {
    local: PeerId,
    participants: PeerSet,
    tx: mpsc::UnboundedSender<Inbox>,
}

impl fmt::Debug for OrchestratorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorHandle")
            .field("local", &self.local)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl OrchestratorHandle {
    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn participants(&self) -> &PeerSet {
        &self.participants
    }

    async fn request<T>(
        &self,
        peer: Option<&PeerId>,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> MeshResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Inbox::Command(build(reply)))
            .map_err(|_| MeshError::Shutdown)?;
        rx.await.map_err(|_| match peer {
            Some(peer) if !self.tx.is_closed() => MeshError::Closed(peer.clone()),
            _ => MeshError::Shutdown,
        })
    }

    /// Idempotent: the transport and its outgoing channel are created once.
    pub async fn get_or_create_connection(&self, peer: &PeerId) -> MeshResult<PeerSnapshot> {
        self.request(Some(peer), |reply| Command::GetOrCreate {
            peer: peer.clone(),
            reply,
        })
        .await?
    }

    /// Creates and applies a local offer, returning its SDP for signaling.
    pub async fn create_offer(&self, peer: &PeerId) -> MeshResult<String> {
        self.request(Some(peer), |reply| Command::CreateOffer {
            peer: peer.clone(),
            reply,
        })
        .await?
    }

    /// Applies a remote offer and returns the local answer SDP.
    pub async fn create_answer(&self, peer: &PeerId, offer: &str) -> MeshResult<String> {
        self.request(Some(peer), |reply| Command::CreateAnswer {
            peer: peer.clone(),
            offer: offer.to_string(),
            reply,
        })
        .await?
    }

    /// Applies the remote answer to an offer this side sent.
    pub async fn set_remote_description(&self, peer: &PeerId, answer: &str) -> MeshResult<()> {
        self.request(Some(peer), |reply| Command::SetRemoteDescription {
            peer: peer.clone(),
            answer: answer.to_string(),
            reply,
        })
        .await?
    }

    pub async fn add_ice_candidate(&self, peer: &PeerId, candidate: IceCandidate) -> MeshResult<()> {
        self.request(Some(peer), |reply| Command::AddIceCandidate {
            peer: peer.clone(),
            candidate,
            reply,
        })
        .await?
    }

    /// Broadcast to every known peer. `true` only if every channel was open
    /// and every send went out; other copies stay queued.
    pub async fn send_message(&self, text: &str) -> MeshResult<bool> {
        self.deliver(Destination::All, text).await
    }

    pub async fn send_message_to(&self, peer: &PeerId, text: &str) -> MeshResult<bool> {
        self.deliver(Destination::Peer(peer.clone()), text).await
    }

    async fn deliver(&self, destination: Destination, text: &str) -> MeshResult<bool> {
        let acks = self
            .request(None, |reply| Command::Send {
                destination,
                text: text.to_string(),
                reply,
            })
            .await??;
        if acks.is_empty() {
            return Ok(false);
        }
        let delivered = join_all(acks).await;
        Ok(delivered.into_iter().all(|ack| ack.unwrap_or(false)))
    }

    /// Tears the connection down and forgets everything about the peer.
    pub async fn close_connection(&self, peer: &PeerId) -> MeshResult<()> {
        self.request(None, |reply| Command::Close {
            peer: peer.clone(),
            reply,
        })
        .await
    }

    pub async fn snapshot(&self, peer: &PeerId) -> MeshResult<Option<PeerSnapshot>> {
        self.request(None, |reply| Command::Snapshot {
            peer: peer.clone(),
            reply,
        })
        .await
    }

    pub async fn snapshots(&self) -> MeshResult<Vec<PeerSnapshot>> {
        self.request(None, |reply| Command::Snapshots { reply }).await
    }

    pub async fn shutdown(&self) -> MeshResult<()> {
        self.request(None, |reply| Command::Shutdown { reply }).await
    }
}
