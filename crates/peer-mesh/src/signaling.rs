//! Glue between an orchestrator and a [`SignalingChannel`].
//!
//! Inbound: documents addressed to the local seat are turned into answers,
//! applied answers and remote candidates. Outbound: offers and answers are
//! published by the session, and `LocalIceCandidateReady` events are appended
//! to the local seat's document for that peer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use signaling_bus::{
    CandidateRecord, ChangeKind, DocumentChange, DocumentKey, SignalingChannel, SignalingDocument,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{MeshError, MeshResult};
use crate::events::{MeshEvent, MeshEvents};
use crate::orchestrator::OrchestratorHandle;
use crate::peer::{PeerId, PeerSet, document_key};
use crate::state::NegotiationState;
use crate::transport::IceCandidate;

const LOG_TARGET: &str = "peer_mesh::signaling";

/// Writes that failed and are waiting for [`SignalingSession::retry_publish`].
#[derive(Debug, Default)]
struct Unpublished {
    offer: Option<String>,
    answer: Option<String>,
    candidates: Vec<IceCandidate>,
}

impl Unpublished {
    fn is_empty(&self) -> bool {
        self.offer.is_none() && self.answer.is_none() && self.candidates.is_empty()
    }
}

type Backlog = Arc<Mutex<HashMap<PeerId, Unpublished>>>;

/// How much of a remote document has already been consumed.
#[derive(Debug, Default)]
struct DocumentProgress {
    offer: Option<String>,
    answer: Option<String>,
    candidates_seen: usize,
}

#[derive(Clone)]
struct Publisher {
    local: PeerId,
    channel: Arc<dyn SignalingChannel>,
    backlog: Backlog,
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl Publisher {
    fn key_for(&self, peer: &PeerId) -> MeshResult<DocumentKey> {
        document_key(&self.local, peer)
    }

    fn report_failure(&self, peer: &PeerId, err: &MeshError) {
        warn!(target = LOG_TARGET, peer = %peer, error = %err, "signaling publish failed");
        let _ = self.events.send(MeshEvent::SignalingFailed {
            peer: peer.clone(),
            reason: err.to_string(),
        });
    }

    async fn publish_offer(&self, peer: &PeerId, sdp: &str) -> MeshResult<()> {
        let key = self.key_for(peer)?;
        let result = self
            .channel
            .publish_offer(&key, sdp)
            .await
            .map_err(MeshError::from);
        if let Err(err) = &result {
            self.backlog.lock().entry(peer.clone()).or_default().offer = Some(sdp.to_string());
            self.report_failure(peer, err);
        } else {
            debug!(target = LOG_TARGET, key = %key, "offer published");
        }
        result
    }

    async fn publish_answer(&self, peer: &PeerId, sdp: &str) -> MeshResult<()> {
        let key = self.key_for(peer)?;
        let result = self
            .channel
            .publish_answer(&key, sdp)
            .await
            .map_err(MeshError::from);
        if let Err(err) = &result {
            self.backlog.lock().entry(peer.clone()).or_default().answer = Some(sdp.to_string());
            self.report_failure(peer, err);
        } else {
            debug!(target = LOG_TARGET, key = %key, "answer published");
        }
        result
    }

    async fn append_candidate(&self, peer: &PeerId, candidate: &IceCandidate) -> MeshResult<()> {
        let key = self.key_for(peer)?;
        let value = candidate.to_record().to_value()?;
        let result = self
            .channel
            .append_candidate(&key, value)
            .await
            .map_err(MeshError::from);
        if let Err(err) = &result {
            self.backlog
                .lock()
                .entry(peer.clone())
                .or_default()
                .candidates
                .push(candidate.clone());
            self.report_failure(peer, err);
        } else {
            trace!(target = LOG_TARGET, key = %key, "candidate appended");
        }
        result
    }
}

/// Signaling pump for one local seat. Dropping it stops both tasks.
pub struct SignalingSession {
    handle: OrchestratorHandle,
    publisher: Publisher,
    inbound: JoinHandle<()>,
    outbound: JoinHandle<()>,
}

impl SignalingSession {
    /// Subscribes to `channel` and takes over the orchestrator's event stream.
    /// The returned stream carries every orchestrator event plus
    /// [`MeshEvent::SignalingFailed`].
    pub async fn start(
        handle: OrchestratorHandle,
        events: MeshEvents,
        channel: Arc<dyn SignalingChannel>,
    ) -> MeshResult<(Self, MeshEvents)> {
        let subscription = channel.subscribe().await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let publisher = Publisher {
            local: handle.local().clone(),
            channel,
            backlog: Backlog::default(),
            events: events_tx,
        };

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let inbound = tokio::spawn(run_inbound(
            handle.clone(),
            publisher.clone(),
            subscription,
            closed_rx,
        ));
        let outbound = tokio::spawn(run_outbound(publisher.clone(), events, closed_tx));
        info!(target = LOG_TARGET, local = %handle.local(), "signaling session started");

        Ok((
            Self {
                handle,
                publisher,
                inbound,
                outbound,
            },
            events_rx,
        ))
    }

    pub fn handle(&self) -> &OrchestratorHandle {
        &self.handle
    }

    /// Starts negotiation with `peer`. Only the lower id of a pair offers;
    /// the other side just prepares its connection and waits. Returns whether
    /// an offer was sent.
    pub async fn connect(&self, peer: &PeerId) -> MeshResult<bool> {
        let local = self.handle.local();
        if !PeerSet::offers_to(local, peer) {
            self.handle.get_or_create_connection(peer).await?;
            debug!(target = LOG_TARGET, peer = %peer, "waiting for remote offer");
            return Ok(false);
        }
        let offer = self.handle.create_offer(peer).await?;
        self.publisher.publish_offer(peer, &offer).await?;
        Ok(true)
    }

    /// [`connect`](Self::connect) to every other participant.
    pub async fn dial_all(&self) -> MeshResult<()> {
        let peers: Vec<PeerId> = self
            .handle
            .participants()
            .others(self.handle.local())
            .cloned()
            .collect();
        for peer in peers {
            self.connect(&peer).await?;
        }
        Ok(())
    }

    /// Republishes everything that failed to reach the signaling channel for
    /// `peer`. Whatever fails again stays queued for the next retry.
    pub async fn retry_publish(&self, peer: &PeerId) -> MeshResult<usize> {
        let pending = self.publisher.backlog.lock().remove(peer).unwrap_or_default();
        if pending.is_empty() {
            return Ok(0);
        }
        let mut published = 0;
        let mut first_error = None;
        if let Some(offer) = &pending.offer {
            match self.publisher.publish_offer(peer, offer).await {
                Ok(()) => published += 1,
                Err(err) => first_error = first_error.or(Some(err)),
            }
        }
        if let Some(answer) = &pending.answer {
            match self.publisher.publish_answer(peer, answer).await {
                Ok(()) => published += 1,
                Err(err) => first_error = first_error.or(Some(err)),
            }
        }
        for candidate in &pending.candidates {
            match self.publisher.append_candidate(peer, candidate).await {
                Ok(()) => published += 1,
                Err(err) => first_error = first_error.or(Some(err)),
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(published),
        }
    }

    /// Number of failed writes waiting for a retry.
    pub fn unpublished(&self, peer: &PeerId) -> usize {
        self.publisher.backlog.lock().get(peer).map_or(0, |pending| {
            usize::from(pending.offer.is_some())
                + usize::from(pending.answer.is_some())
                + pending.candidates.len()
        })
    }

    /// Removes the documents this seat wrote and stops the pump.
    pub async fn shutdown(self) -> MeshResult<()> {
        let peers: Vec<PeerId> = self
            .handle
            .participants()
            .others(self.handle.local())
            .cloned()
            .collect();
        for peer in peers {
            let key = self.publisher.key_for(&peer)?;
            if let Err(err) = self.publisher.channel.remove(&key).await {
                warn!(target = LOG_TARGET, key = %key, error = %err, "could not remove signaling document");
            }
        }
        info!(target = LOG_TARGET, local = %self.handle.local(), "signaling session stopped");
        Ok(())
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.inbound.abort();
        self.outbound.abort();
    }
}

async fn run_outbound(
    publisher: Publisher,
    mut events: MeshEvents,
    closed: mpsc::UnboundedSender<PeerId>,
) {
    while let Some(event) = events.recv().await {
        match &event {
            MeshEvent::LocalIceCandidateReady { peer, candidate } => {
                // Failures are kept in the backlog and reported by the publisher.
                let _ = publisher.append_candidate(peer, candidate).await;
            }
            MeshEvent::ConnectionClosed(peer) => {
                let _ = closed.send(peer.clone());
            }
            _ => {}
        }
        if publisher.events.send(event).is_err() {
            trace!(target = LOG_TARGET, "session event receiver dropped");
        }
    }
}

async fn run_inbound(
    handle: OrchestratorHandle,
    publisher: Publisher,
    mut subscription: signaling_bus::Subscription,
    mut closed: mpsc::UnboundedReceiver<PeerId>,
) {
    let mut inbound = Inbound {
        handle,
        publisher,
        progress: HashMap::new(),
        stalled: HashMap::new(),
    };
    loop {
        tokio::select! {
            change = subscription.next() => match change {
                Some(change) => inbound.on_change(change).await,
                None => break,
            },
            Some(peer) = closed.recv() => inbound.retry_stalled(&peer).await,
        }
    }
    debug!(target = LOG_TARGET, local = %inbound.handle.local(), "signaling subscription ended");
}

enum OfferOutcome {
    Answered,
    /// Lost the glare tie-break; our own offer stands.
    Ignored,
    Failed,
}

struct Inbound {
    handle: OrchestratorHandle,
    publisher: Publisher,
    progress: HashMap<DocumentKey, DocumentProgress>,
    /// Latest document per sender whose offer could not be answered yet.
    /// Retried once our connection to that sender is closed.
    stalled: HashMap<PeerId, SignalingDocument>,
}

impl Inbound {
    async fn on_change(&mut self, change: DocumentChange) {
        let Some(from) = sender_for_us(&self.handle, &change.key) else {
            return;
        };
        if change.kind == ChangeKind::Removed {
            debug!(target = LOG_TARGET, key = %change.key, "remote document removed");
            self.progress.remove(&change.key);
            self.stalled.remove(&from);
            return;
        }
        self.apply(&from, change.key, change.document).await;
    }

    async fn retry_stalled(&mut self, peer: &PeerId) {
        let Some(document) = self.stalled.remove(peer) else {
            return;
        };
        let Ok(key) = document_key(peer, self.handle.local()) else {
            return;
        };
        debug!(target = LOG_TARGET, peer = %peer, "retrying unanswered offer");
        self.apply(peer, key, document).await;
    }

    async fn apply(&mut self, from: &PeerId, key: DocumentKey, document: SignalingDocument) {
        let seen = self.progress.entry(key).or_default();
        if document.ice_candidates.len() < seen.candidates_seen {
            // Rewritten from scratch; the array only ever grows otherwise.
            seen.candidates_seen = 0;
        }

        let mut stalled = false;
        if let Some(offer) = document
            .offer
            .as_ref()
            .filter(|offer| seen.offer.as_ref() != Some(*offer))
        {
            match answer_offer(&self.handle, &self.publisher, from, offer).await {
                OfferOutcome::Answered | OfferOutcome::Ignored => {
                    seen.offer = Some(offer.clone());
                    self.stalled.remove(from);
                }
                OfferOutcome::Failed => stalled = true,
            }
        }

        if let Some(answer) = document
            .answer
            .as_ref()
            .filter(|answer| seen.answer.as_ref() != Some(*answer))
        {
            seen.answer = Some(answer.clone());
            if let Err(err) = self.handle.set_remote_description(from, answer).await {
                warn!(target = LOG_TARGET, peer = %from, error = %err, "could not apply remote answer");
            }
        }

        if stalled {
            // Candidates here belong to the unanswered offer; hold them with it.
            self.stalled.insert(from.clone(), document);
            return;
        }

        for value in document.ice_candidates.iter().skip(seen.candidates_seen) {
            let candidate = CandidateRecord::from_value(value)
                .map_err(|err| MeshError::Decode(err.to_string()))
                .and_then(|record| IceCandidate::from_record(&record));
            match candidate {
                Ok(candidate) => {
                    if let Err(err) = self.handle.add_ice_candidate(from, candidate).await {
                        warn!(target = LOG_TARGET, peer = %from, error = %err, "could not add remote candidate");
                    }
                }
                Err(err) => {
                    warn!(target = LOG_TARGET, peer = %from, error = %err, "dropping undecodable candidate");
                }
            }
        }
        seen.candidates_seen = document.ice_candidates.len();
    }
}

/// The sender of a document meant for the local seat, if it is one.
fn sender_for_us(handle: &OrchestratorHandle, key: &DocumentKey) -> Option<PeerId> {
    if key.to_peer() != handle.local().as_str() {
        return None;
    }
    let from = PeerId::parse(key.from_peer()).ok()?;
    if !handle.participants().contains(&from) {
        debug!(target = LOG_TARGET, key = %key, "ignoring document from non-participant");
        return None;
    }
    Some(from)
}

async fn answer_offer(
    handle: &OrchestratorHandle,
    publisher: &Publisher,
    from: &PeerId,
    offer: &str,
) -> OfferOutcome {
    if PeerSet::offers_to(handle.local(), from) {
        let offering = matches!(
            handle.snapshot(from).await,
            Ok(Some(snapshot)) if snapshot.state == NegotiationState::Offering
        );
        if offering {
            debug!(target = LOG_TARGET, peer = %from, "ignoring colliding offer, ours takes precedence");
            return OfferOutcome::Ignored;
        }
    }
    match handle.create_answer(from, offer).await {
        Ok(answer) => {
            // Failures are kept in the backlog and reported by the publisher.
            let _ = publisher.publish_answer(from, &answer).await;
            OfferOutcome::Answered
        }
        Err(err) => {
            warn!(target = LOG_TARGET, peer = %from, error = %err, "could not answer offer");
            OfferOutcome::Failed
        }
    }
}
