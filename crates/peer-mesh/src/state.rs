use std::fmt;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::peer::PeerId;
use crate::transport::{IceConnectivity, SignalingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationRole {
    None,
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationState {
    New,
    Offering,
    Answering,
    Negotiated,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::New => "NEW",
            NegotiationState::Offering => "OFFERING",
            NegotiationState::Answering => "ANSWERING",
            NegotiationState::Negotiated => "NEGOTIATED",
            NegotiationState::Connected => "CONNECTED",
            NegotiationState::Disconnected => "DISCONNECTED",
            NegotiationState::Failed => "FAILED",
            NegotiationState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// What a connectivity change means for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Transition {
    Established,
    Lost,
    Failed(String),
}

/// Orchestrator-private record for one remote seat.
pub(crate) struct PeerConnection<Op> {
    pub generation: u64,
    pub role: NegotiationRole,
    pub state: NegotiationState,
    pub ice_state: IceConnectivity,
    pub signaling_state: SignalingState,
    pub created_at: SystemTime,
    pub remote_description_set: bool,
    pub local_description_set: bool,
    pub outgoing_requested: bool,
    pub lane: mpsc::UnboundedSender<Op>,
}

impl<Op> PeerConnection<Op> {
    pub fn new(generation: u64, lane: mpsc::UnboundedSender<Op>) -> Self {
        Self {
            generation,
            role: NegotiationRole::None,
            state: NegotiationState::New,
            ice_state: IceConnectivity::New,
            signaling_state: SignalingState::Stable,
            created_at: SystemTime::now(),
            remote_description_set: false,
            local_description_set: false,
            outgoing_requested: false,
            lane,
        }
    }

    fn ice_up(&self) -> bool {
        matches!(
            self.ice_state,
            IceConnectivity::Connected | IceConnectivity::Completed
        )
    }

    /// Applies a connectivity report. CONNECTED needs finished SDP
    /// negotiation as well as a live ICE path.
    pub fn on_ice_state(&mut self, ice: IceConnectivity) -> Option<Transition> {
        self.ice_state = ice;
        match ice {
            IceConnectivity::New | IceConnectivity::Checking => None,
            IceConnectivity::Connected | IceConnectivity::Completed => match self.state {
                NegotiationState::Negotiated | NegotiationState::Disconnected => {
                    self.state = NegotiationState::Connected;
                    Some(Transition::Established)
                }
                _ => None,
            },
            IceConnectivity::Disconnected => {
                if self.state != NegotiationState::Connected {
                    return None;
                }
                self.state = NegotiationState::Disconnected;
                Some(Transition::Lost)
            }
            IceConnectivity::Failed | IceConnectivity::Closed => {
                if self.state.is_terminal() {
                    return None;
                }
                self.state = NegotiationState::Failed;
                Some(Transition::Failed(format!("ice connectivity {ice}")))
            }
        }
    }

    /// Offer and answer are both applied.
    pub fn negotiation_complete(&mut self) -> Option<Transition> {
        if self.state.is_terminal() {
            return None;
        }
        if self.ice_up() {
            self.state = NegotiationState::Connected;
            Some(Transition::Established)
        } else {
            self.state = NegotiationState::Negotiated;
            None
        }
    }

    pub fn fail(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = NegotiationState::Failed;
        true
    }
}

/// Point-in-time view of one connection, for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub peer: PeerId,
    pub generation: u64,
    pub role: NegotiationRole,
    pub state: NegotiationState,
    pub ice_state: IceConnectivity,
    pub signaling_state: SignalingState,
    pub created_at: SystemTime,
    pub channel_open: bool,
    pub queued: usize,
    pub pending_remote_candidates: usize,
    pub pending_local_candidates: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> PeerConnection<()> {
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerConnection::new(1, tx)
    }

    #[test]
    fn ice_alone_does_not_connect() {
        let mut conn = connection();
        assert_eq!(conn.on_ice_state(IceConnectivity::Connected), None);
        assert_eq!(conn.state, NegotiationState::New);
        assert_eq!(conn.negotiation_complete(), Some(Transition::Established));
        assert_eq!(conn.state, NegotiationState::Connected);
    }

    #[test]
    fn disconnect_is_recoverable() {
        let mut conn = connection();
        conn.negotiation_complete();
        assert_eq!(conn.on_ice_state(IceConnectivity::Checking), None);
        assert_eq!(conn.on_ice_state(IceConnectivity::Completed), Some(Transition::Established));
        assert_eq!(conn.on_ice_state(IceConnectivity::Disconnected), Some(Transition::Lost));
        assert_eq!(conn.state, NegotiationState::Disconnected);
        assert_eq!(conn.on_ice_state(IceConnectivity::Connected), Some(Transition::Established));
    }

    #[test]
    fn failure_is_terminal() {
        let mut conn = connection();
        conn.negotiation_complete();
        assert!(matches!(
            conn.on_ice_state(IceConnectivity::Failed),
            Some(Transition::Failed(_))
        ));
        assert_eq!(conn.on_ice_state(IceConnectivity::Closed), None);
        assert_eq!(conn.on_ice_state(IceConnectivity::Connected), None);
        assert_eq!(conn.negotiation_complete(), None);
        assert!(!conn.fail());
        assert_eq!(conn.state, NegotiationState::Failed);
    }
}
