use signaling_bus::SignalingError;
use thiserror::Error;

use crate::peer::PeerId;
use crate::state::NegotiationState;

/// Failures reported by a transport capability implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("channel send failed: {0}")]
    Send(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, Error)]
pub enum MeshError {
    #[error("negotiation with {peer} failed: {reason}")]
    Negotiation { peer: PeerId, reason: String },
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("send to {peer} failed: {reason}")]
    ChannelSend { peer: PeerId, reason: String },
    #[error("could not decode payload: {0}")]
    Decode(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{0} is not a participant in this session")]
    UnknownPeer(PeerId),
    #[error("connection to {peer} is {state}")]
    InvalidState {
        peer: PeerId,
        state: NegotiationState,
    },
    #[error("connection to {0} was closed")]
    Closed(PeerId),
    #[error("orchestrator has shut down")]
    Shutdown,
}

pub type MeshResult<T> = Result<T, MeshError>;

impl MeshError {
    pub(crate) fn negotiation(peer: &PeerId, err: &TransportError) -> Self {
        MeshError::Negotiation {
            peer: peer.clone(),
            reason: err.to_string(),
        }
    }
}
