//! Peer-to-peer connection orchestration for a three-seat card table.
//!
//! The [`Orchestrator`] negotiates one connection per remote seat through a
//! [`TransportFactory`], buffers ICE candidates until they can be applied,
//! keeps per-peer message order across connection setup and send failures,
//! and reports progress as [`MeshEvent`]s. [`SignalingSession`] connects it to
//! a [`signaling_bus::SignalingChannel`].

pub mod candidates;
pub mod channels;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod peer;
pub mod queue;
pub mod signaling;
pub mod state;
pub mod testing;
pub mod transport;

pub use candidates::IceCandidateBuffer;
pub use channels::{ChannelDirection, ChannelOpened, DataChannelHandle, DataChannelRegistry};
pub use config::{DEFAULT_ICE_SERVER, IceServerConfig, MeshConfig};
pub use error::{MeshError, MeshResult, TransportError};
pub use events::{MeshEvent, MeshEvents};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use peer::{MAX_PARTICIPANTS, PeerId, PeerSet, document_key};
pub use queue::{Destination, OutboundMessage, OutboundMessageQueue};
pub use signaling::SignalingSession;
pub use state::{NegotiationRole, NegotiationState, PeerSnapshot};
pub use transport::{
    ChannelId, ChannelState, IceCandidate, IceConnectivity, PeerTransport, SdpKind,
    SessionDescription, SignalingState, TransportEvent, TransportEvents, TransportFactory,
};
