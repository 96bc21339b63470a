use std::collections::HashMap;

use crate::peer::PeerId;
use crate::transport::IceCandidate;

/// Per-peer holding area for ICE candidates that cannot be used yet.
///
/// Remote candidates wait here until a remote description is applied;
/// local candidates wait until the local description exists. Both lists are
/// append-only and are handed out whole, in arrival order, when drained.
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    remote: HashMap<PeerId, Vec<IceCandidate>>,
    local: HashMap<PeerId, Vec<IceCandidate>>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_remote(&mut self, peer: &PeerId, candidate: IceCandidate) {
        self.remote.entry(peer.clone()).or_default().push(candidate);
    }

    pub fn drain_remote(&mut self, peer: &PeerId) -> Vec<IceCandidate> {
        self.remote.remove(peer).unwrap_or_default()
    }

    pub fn buffer_local(&mut self, peer: &PeerId, candidate: IceCandidate) {
        self.local.entry(peer.clone()).or_default().push(candidate);
    }

    pub fn drain_local(&mut self, peer: &PeerId) -> Vec<IceCandidate> {
        self.local.remove(peer).unwrap_or_default()
    }

    pub fn pending_remote(&self, peer: &PeerId) -> usize {
        self.remote.get(peer).map_or(0, Vec::len)
    }

    pub fn pending_local(&self, peer: &PeerId) -> usize {
        self.local.get(peer).map_or(0, Vec::len)
    }

    pub fn purge(&mut self, peer: &PeerId) {
        self.remote.remove(peer);
        self.local.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(raw: &str) -> PeerId {
        PeerId::parse(raw).expect("peer id")
    }

    #[test]
    fn drains_in_arrival_order_exactly_once() {
        let mut buffer = IceCandidateBuffer::new();
        let east = peer("east");
        for n in 1..=3 {
            buffer.buffer_remote(&east, IceCandidate::new(format!("c{n}")));
        }
        assert_eq!(buffer.pending_remote(&east), 3);

        let drained: Vec<String> = buffer
            .drain_remote(&east)
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(drained, vec!["c1", "c2", "c3"]);
        assert!(buffer.drain_remote(&east).is_empty());
    }

    #[test]
    fn peers_and_directions_are_independent() {
        let mut buffer = IceCandidateBuffer::new();
        let (east, west) = (peer("east"), peer("west"));
        buffer.buffer_remote(&east, IceCandidate::new("r1"));
        buffer.buffer_local(&east, IceCandidate::new("l1"));
        buffer.buffer_remote(&west, IceCandidate::new("r2"));

        buffer.purge(&east);
        assert_eq!(buffer.pending_remote(&east), 0);
        assert_eq!(buffer.pending_local(&east), 0);
        assert_eq!(buffer.pending_remote(&west), 1);
    }
}
