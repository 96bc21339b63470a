use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;

use crate::peer::PeerId;

/// Where an application message is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Peer(PeerId),
    All,
}

/// Opaque text payload waiting for an open channel.
///
/// `ack` is resolved once: `true` when this message went out on the wire,
/// `false` when a send failed or the connection went away first.
#[derive(Debug)]
pub struct OutboundMessage {
    pub text: String,
    ack: Option<oneshot::Sender<bool>>,
}

impl OutboundMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ack: None,
        }
    }

    pub fn with_ack(text: impl Into<String>, ack: oneshot::Sender<bool>) -> Self {
        Self {
            text: text.into(),
            ack: Some(ack),
        }
    }

    pub fn acknowledge(&mut self, delivered: bool) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(delivered);
        }
    }
}

#[derive(Debug, Default)]
struct PeerQueue {
    pending: VecDeque<OutboundMessage>,
    in_flight: bool,
}

/// Per-destination FIFO of outbound application messages.
///
/// At most one message per peer is in flight. A failed send goes back to the
/// front, so nothing enqueued later can overtake it.
#[derive(Debug, Default)]
pub struct OutboundMessageQueue {
    peers: HashMap<PeerId, PeerQueue>,
}

impl OutboundMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, peer: &PeerId, message: OutboundMessage) {
        self.peers
            .entry(peer.clone())
            .or_default()
            .pending
            .push_back(message);
    }

    /// Takes the front message for sending, unless one is already out.
    pub fn begin_send(&mut self, peer: &PeerId) -> Option<OutboundMessage> {
        let queue = self.peers.get_mut(peer)?;
        if queue.in_flight {
            return None;
        }
        let message = queue.pending.pop_front()?;
        queue.in_flight = true;
        Some(message)
    }

    /// Ends the in-flight send. A message handed back failed and is requeued
    /// at the front.
    pub fn finish_send(&mut self, peer: &PeerId, failed: Option<OutboundMessage>) {
        let Some(queue) = self.peers.get_mut(peer) else {
            return;
        };
        queue.in_flight = false;
        if let Some(message) = failed {
            queue.pending.push_front(message);
        }
    }

    pub fn is_in_flight(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|queue| queue.in_flight)
    }

    /// Resolves every waiting caller for `peer` with `false`. The messages
    /// themselves stay queued.
    pub fn release_acks(&mut self, peer: &PeerId) {
        if let Some(queue) = self.peers.get_mut(peer) {
            for message in queue.pending.iter_mut() {
                message.acknowledge(false);
            }
        }
    }

    pub fn len(&self, peer: &PeerId) -> usize {
        self.peers.get(peer).map_or(0, |queue| queue.pending.len())
    }

    pub fn is_empty(&self, peer: &PeerId) -> bool {
        self.len(peer) == 0
    }

    pub fn purge(&mut self, peer: &PeerId) {
        if let Some(mut queue) = self.peers.remove(peer) {
            for message in queue.pending.iter_mut() {
                message.acknowledge(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(raw: &str) -> PeerId {
        PeerId::parse(raw).expect("peer id")
    }

    #[test]
    fn drains_insertion_order() {
        let mut queue = OutboundMessageQueue::new();
        let east = peer("east");
        for text in ["m1", "m2", "m3"] {
            queue.enqueue(&east, OutboundMessage::new(text));
        }
        let mut sent = Vec::new();
        while let Some(message) = queue.begin_send(&east) {
            sent.push(message.text.clone());
            queue.finish_send(&east, None);
        }
        assert_eq!(sent, vec!["m1", "m2", "m3"]);
        assert!(queue.is_empty(&east));
    }

    #[test]
    fn one_message_in_flight_at_a_time() {
        let mut queue = OutboundMessageQueue::new();
        let east = peer("east");
        queue.enqueue(&east, OutboundMessage::new("m1"));
        queue.enqueue(&east, OutboundMessage::new("m2"));
        let first = queue.begin_send(&east).expect("m1 out");
        assert_eq!(first.text, "m1");
        assert!(queue.begin_send(&east).is_none());
        assert!(queue.is_in_flight(&east));
    }

    #[test]
    fn failed_send_returns_to_the_front() {
        let mut queue = OutboundMessageQueue::new();
        let east = peer("east");
        queue.enqueue(&east, OutboundMessage::new("m1"));
        queue.enqueue(&east, OutboundMessage::new("m2"));
        let failed = queue.begin_send(&east).expect("m1 out");
        queue.finish_send(&east, Some(failed));
        assert_eq!(queue.len(&east), 2);
        let retry = queue.begin_send(&east).expect("retry");
        assert_eq!(retry.text, "m1");
    }

    #[test]
    fn purge_resolves_waiting_callers() {
        let mut queue = OutboundMessageQueue::new();
        let east = peer("east");
        let (tx, mut rx) = oneshot::channel();
        queue.enqueue(&east, OutboundMessage::with_ack("m1", tx));
        queue.purge(&east);
        assert_eq!(rx.try_recv(), Ok(false));
        assert_eq!(queue.len(&east), 0);
    }

    #[test]
    fn release_acks_keeps_messages() {
        let mut queue = OutboundMessageQueue::new();
        let east = peer("east");
        let (tx, mut rx) = oneshot::channel();
        queue.enqueue(&east, OutboundMessage::with_ack("m1", tx));
        queue.release_acks(&east);
        assert_eq!(rx.try_recv(), Ok(false));
        assert_eq!(queue.len(&east), 1);
    }
}
