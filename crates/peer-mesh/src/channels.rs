use std::collections::HashMap;

use crate::peer::PeerId;
use crate::transport::{ChannelId, ChannelState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDirection {
    /// Created locally, labelled with the destination peer.
    Outgoing,
    /// Announced by the remote side on a connection we own.
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannelHandle {
    pub id: ChannelId,
    pub peer: PeerId,
    pub direction: ChannelDirection,
    pub state: ChannelState,
}

/// Raised when a channel first reaches the open state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpened(pub PeerId);

/// Channel handle to peer mapping, in both directions.
///
/// The peer for a channel is always the peer whose connection produced it;
/// labels are never consulted.
///
/// Each peer has at most one send channel: the first channel that opened. It
/// stays selected until it leaves the open state, so consecutive messages for
/// a peer never hop between SCTP streams.
#[derive(Debug, Default)]
pub struct DataChannelRegistry {
    channels: HashMap<ChannelId, DataChannelHandle>,
    by_peer: HashMap<PeerId, Vec<ChannelId>>,
    send_channel: HashMap<PeerId, ChannelId>,
}

impl DataChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering the same channel twice keeps the first record.
    pub fn register_outgoing(&mut self, peer: &PeerId, channel: ChannelId) {
        self.insert(peer, channel, ChannelDirection::Outgoing);
    }

    pub fn register_incoming(&mut self, channel: ChannelId, peer: &PeerId) {
        self.insert(peer, channel, ChannelDirection::Incoming);
    }

    fn insert(&mut self, peer: &PeerId, channel: ChannelId, direction: ChannelDirection) {
        if self.channels.contains_key(&channel) {
            return;
        }
        self.channels.insert(
            channel,
            DataChannelHandle {
                id: channel,
                peer: peer.clone(),
                direction,
                state: ChannelState::Connecting,
            },
        );
        self.by_peer.entry(peer.clone()).or_default().push(channel);
    }

    pub fn peer_for(&self, channel: ChannelId) -> Option<&PeerId> {
        self.channels.get(&channel).map(|handle| &handle.peer)
    }

    pub fn get(&self, channel: ChannelId) -> Option<&DataChannelHandle> {
        self.channels.get(&channel)
    }

    pub fn channels_for(&self, peer: &PeerId) -> impl Iterator<Item = &DataChannelHandle> {
        self.by_peer
            .get(peer)
            .into_iter()
            .flatten()
            .filter_map(|id| self.channels.get(id))
    }

    /// True while an outgoing channel for `peer` exists and is not closed.
    pub fn has_outgoing(&self, peer: &PeerId) -> bool {
        self.channels_for(peer).any(|handle| {
            handle.direction == ChannelDirection::Outgoing && handle.state != ChannelState::Closed
        })
    }

    /// Records a ready-state change. Returns the open notification only on the
    /// transition into [`ChannelState::Open`].
    pub fn set_state(&mut self, channel: ChannelId, state: ChannelState) -> Option<ChannelOpened> {
        let handle = self.channels.get_mut(&channel)?;
        let previous = handle.state;
        handle.state = state;
        let peer = handle.peer.clone();

        if state == ChannelState::Open {
            self.send_channel.entry(peer.clone()).or_insert(channel);
        } else if self.send_channel.get(&peer) == Some(&channel) {
            self.send_channel.remove(&peer);
            if let Some(next) = self.next_open(&peer) {
                self.send_channel.insert(peer.clone(), next);
            }
        }

        (state == ChannelState::Open && previous != ChannelState::Open)
            .then_some(ChannelOpened(peer))
    }

    /// Replacement send channel: an open outgoing one, else an open incoming one.
    fn next_open(&self, peer: &PeerId) -> Option<ChannelId> {
        let open = |direction| {
            self.channels_for(peer)
                .find(|handle| handle.direction == direction && handle.state == ChannelState::Open)
                .map(|handle| handle.id)
        };
        open(ChannelDirection::Outgoing).or_else(|| open(ChannelDirection::Incoming))
    }

    /// The channel all sends to `peer` go through while it stays open.
    pub fn send_target(&self, peer: &PeerId) -> Option<ChannelId> {
        self.send_channel.get(peer).copied()
    }

    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.send_target(peer).is_some()
    }

    pub fn remove_peer(&mut self, peer: &PeerId) -> Vec<ChannelId> {
        self.send_channel.remove(peer);
        let ids = self.by_peer.remove(peer).unwrap_or_default();
        for id in &ids {
            self.channels.remove(id);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(raw: &str) -> PeerId {
        PeerId::parse(raw).expect("peer id")
    }

    #[test]
    fn resolves_channels_in_both_directions() {
        let mut registry = DataChannelRegistry::new();
        let (east, west) = (peer("east"), peer("west"));
        let out = ChannelId::next();
        let inc = ChannelId::next();
        registry.register_outgoing(&east, out);
        registry.register_incoming(inc, &west);

        assert_eq!(registry.peer_for(out), Some(&east));
        assert_eq!(registry.peer_for(inc), Some(&west));
        assert_eq!(registry.channels_for(&east).count(), 1);
        assert!(registry.has_outgoing(&east));
        assert!(!registry.has_outgoing(&west));
        assert_eq!(registry.peer_for(ChannelId::next()), None);
    }

    #[test]
    fn open_is_reported_once_per_transition() {
        let mut registry = DataChannelRegistry::new();
        let east = peer("east");
        let out = ChannelId::next();
        registry.register_outgoing(&east, out);

        assert_eq!(registry.set_state(out, ChannelState::Open), Some(ChannelOpened(east.clone())));
        assert_eq!(registry.set_state(out, ChannelState::Open), None);
        assert_eq!(registry.set_state(out, ChannelState::Closed), None);
        assert!(!registry.has_outgoing(&east));
        assert_eq!(registry.set_state(out, ChannelState::Open), Some(ChannelOpened(east)));
    }

    #[test]
    fn sends_stay_on_first_open_channel_until_it_closes() {
        let mut registry = DataChannelRegistry::new();
        let east = peer("east");
        let out = ChannelId::next();
        let inc = ChannelId::next();
        registry.register_outgoing(&east, out);
        registry.register_incoming(inc, &east);

        assert_eq!(registry.send_target(&east), None);
        registry.set_state(inc, ChannelState::Open);
        assert_eq!(registry.send_target(&east), Some(inc));
        // A second channel opening does not move traffic to another stream.
        registry.set_state(out, ChannelState::Open);
        assert_eq!(registry.send_target(&east), Some(inc));

        registry.set_state(inc, ChannelState::Closing);
        assert_eq!(registry.send_target(&east), Some(out));
        registry.set_state(inc, ChannelState::Open);
        assert_eq!(registry.send_target(&east), Some(out));
        registry.set_state(out, ChannelState::Closed);
        assert_eq!(registry.send_target(&east), Some(inc));
        registry.set_state(inc, ChannelState::Closed);
        assert_eq!(registry.send_target(&east), None);
        assert!(!registry.is_open(&east));
    }

    #[test]
    fn removing_a_peer_clears_its_send_channel() {
        let mut registry = DataChannelRegistry::new();
        let east = peer("east");
        let out = ChannelId::next();
        registry.register_outgoing(&east, out);
        registry.set_state(out, ChannelState::Open);
        registry.remove_peer(&east);
        assert_eq!(registry.send_target(&east), None);
    }

    #[test]
    fn duplicate_registration_keeps_existing_state() {
        let mut registry = DataChannelRegistry::new();
        let east = peer("east");
        let out = ChannelId::next();
        registry.register_outgoing(&east, out);
        registry.set_state(out, ChannelState::Open);
        registry.register_outgoing(&east, out);
        assert!(registry.is_open(&east));
        assert_eq!(registry.remove_peer(&east), vec![out]);
        assert!(registry.get(out).is_none());
    }
}
