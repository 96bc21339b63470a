use tokio::sync::mpsc;

use crate::peer::PeerId;
use crate::transport::IceCandidate;

/// Everything the orchestrator reports to the game layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    MessageReceived { peer: PeerId, text: String },
    ConnectionEstablished(PeerId),
    /// Recoverable; no automatic action is taken.
    ConnectionLost(PeerId),
    /// Terminal for this connection. Close it before negotiating again.
    ConnectionFailed { peer: PeerId, reason: String },
    /// A local candidate that may now be published for `peer`.
    LocalIceCandidateReady { peer: PeerId, candidate: IceCandidate },
    ChannelOpened(PeerId),
    ConnectionClosed(PeerId),
    SignalingFailed { peer: PeerId, reason: String },
}

impl MeshEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            MeshEvent::MessageReceived { peer, .. }
            | MeshEvent::ConnectionFailed { peer, .. }
            | MeshEvent::LocalIceCandidateReady { peer, .. }
            | MeshEvent::SignalingFailed { peer, .. } => peer,
            MeshEvent::ConnectionEstablished(peer)
            | MeshEvent::ConnectionLost(peer)
            | MeshEvent::ChannelOpened(peer)
            | MeshEvent::ConnectionClosed(peer) => peer,
        }
    }
}

pub type MeshEvents = mpsc::UnboundedReceiver<MeshEvent>;
