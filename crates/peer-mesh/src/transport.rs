//! Capability interface over a host real-time transport stack.
//!
//! The orchestrator owns one [`PeerTransport`] per remote seat and never looks
//! behind this trait; the WebRTC binding lives in its own crate and tests use
//! [`crate::testing::FakeTransportFactory`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use signaling_bus::CandidateRecord;
use tokio::sync::mpsc;

use crate::error::{MeshError, MeshResult, TransportError};
use crate::peer::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    pub fn with_mid(mut self, sdp_mid: impl Into<String>, sdp_mline_index: u16) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self.sdp_mline_index = Some(sdp_mline_index);
        self
    }

    pub fn to_record(&self) -> CandidateRecord {
        CandidateRecord {
            sdp: self.candidate.clone(),
            sdp_mid: self.sdp_mid.clone().unwrap_or_default(),
            sdp_mline_index: self
                .sdp_mline_index
                .map(|index| index.to_string())
                .unwrap_or_default(),
        }
    }

    pub fn from_record(record: &CandidateRecord) -> MeshResult<Self> {
        if record.sdp.is_empty() {
            return Err(MeshError::Decode("candidate without sdp".into()));
        }
        let sdp_mline_index = match record.sdp_mline_index.trim() {
            "" => None,
            raw => Some(raw.parse::<u16>().map_err(|err| {
                MeshError::Decode(format!("sdpMLineIndex {raw:?}: {err}"))
            })?),
        };
        Ok(Self {
            candidate: record.sdp.clone(),
            sdp_mid: Some(record.sdp_mid.clone()).filter(|mid| !mid.is_empty()),
            sdp_mline_index,
        })
    }
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique handle for a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dc-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IceConnectivity {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for IceConnectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IceConnectivity::New => "new",
            IceConnectivity::Checking => "checking",
            IceConnectivity::Connected => "connected",
            IceConnectivity::Completed => "completed",
            IceConnectivity::Disconnected => "disconnected",
            IceConnectivity::Failed => "failed",
            IceConnectivity::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Asynchronous notifications raised by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    IceState(IceConnectivity),
    SignalingState(SignalingState),
    /// A channel opened by the remote side. The label is informational only.
    IncomingChannel { channel: ChannelId, label: String },
    ChannelState { channel: ChannelId, state: ChannelState },
    Message { channel: ChannelId, text: String },
}

type EventSink = dyn Fn(TransportEvent) -> bool + Send + Sync;

/// Callback target handed to a transport when it is created.
///
/// Bound to the connection that owns it, so everything emitted here is
/// attributed to that connection's peer regardless of channel labels.
#[derive(Clone)]
pub struct TransportEvents {
    peer: PeerId,
    sink: Arc<EventSink>,
}

impl TransportEvents {
    pub fn new<F>(peer: PeerId, sink: F) -> Self
    where
        F: Fn(TransportEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            peer,
            sink: Arc::new(sink),
        }
    }

    /// Events delivered into a plain channel, for driving a transport by hand.
    pub fn channel(peer: PeerId) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = Self::new(peer, move |event| tx.send(event).is_ok());
        (events, rx)
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Returns `false` once nobody is listening any more.
    pub fn emit(&self, event: TransportEvent) -> bool {
        (self.sink)(event)
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// One connection to one remote seat.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    /// Opens an ordered, reliable channel and returns its handle.
    async fn open_channel(&self, label: &str) -> Result<ChannelId, TransportError>;
    async fn send_on_channel(&self, channel: ChannelId, text: &str) -> Result<(), TransportError>;
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        peer: &PeerId,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_record_carries_index_as_string() {
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 5000 typ host").with_mid("0", 0);
        let record = candidate.to_record();
        assert_eq!(record.sdp_mid, "0");
        assert_eq!(record.sdp_mline_index, "0");
        assert_eq!(IceCandidate::from_record(&record).expect("decode"), candidate);
    }

    #[test]
    fn candidate_record_with_missing_fields_decodes_to_none() {
        let record = CandidateRecord {
            sdp: "candidate:2".into(),
            sdp_mid: String::new(),
            sdp_mline_index: String::new(),
        };
        let candidate = IceCandidate::from_record(&record).expect("decode");
        assert_eq!(candidate.sdp_mid, None);
        assert_eq!(candidate.sdp_mline_index, None);
    }

    #[test]
    fn malformed_records_are_decode_errors() {
        let bad_index = CandidateRecord {
            sdp: "candidate:3".into(),
            sdp_mid: "0".into(),
            sdp_mline_index: "zero".into(),
        };
        assert!(matches!(
            IceCandidate::from_record(&bad_index),
            Err(MeshError::Decode(_))
        ));
        let empty = CandidateRecord {
            sdp: String::new(),
            sdp_mid: "0".into(),
            sdp_mline_index: "0".into(),
        };
        assert!(matches!(
            IceCandidate::from_record(&empty),
            Err(MeshError::Decode(_))
        ));
    }

    #[test]
    fn channel_ids_are_unique() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }
}
