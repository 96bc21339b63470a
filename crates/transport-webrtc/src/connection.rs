use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use peer_mesh::{
    ChannelId, ChannelState, IceCandidate, MeshError, PeerTransport, SessionDescription,
    TransportError, TransportEvent, TransportEvents,
};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::convert::{
    candidate_from_init, candidate_init, channel_state, decode_text, from_rtc_description,
    ice_connectivity, signaling_state, to_negotiation_error, to_rtc_description, to_send_error,
};

type ChannelTable = Arc<Mutex<HashMap<ChannelId, Arc<RTCDataChannel>>>>;

/// One `RTCPeerConnection` bound to one remote seat.
pub struct WebRtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    channels: ChannelTable,
    events: TransportEvents,
}

impl WebRtcPeerTransport {
    pub(crate) fn attach(pc: Arc<RTCPeerConnection>, events: TransportEvents) -> Self {
        let channels: ChannelTable = Arc::new(Mutex::new(HashMap::new()));
        install_connection_handlers(&pc, &channels, &events);
        Self {
            pc,
            channels,
            events,
        }
    }

    fn channel(&self, channel: ChannelId) -> Option<Arc<RTCDataChannel>> {
        self.channels.lock().get(&channel).cloned()
    }
}

fn install_connection_handlers(
    pc: &Arc<RTCPeerConnection>,
    channels: &ChannelTable,
    events: &TransportEvents,
) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            // `None` marks the end of gathering; nothing to forward.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    sink.emit(TransportEvent::LocalCandidate(candidate_from_init(init)));
                }
                Err(err) => {
                    tracing::warn!(
                        target = "webrtc",
                        peer = %sink.peer(),
                        error = %err,
                        "failed to serialize local candidate"
                    );
                }
            }
        })
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", peer = %sink.peer(), ?state, "ice state changed");
            if let Some(state) = ice_connectivity(state) {
                sink.emit(TransportEvent::IceState(state));
            }
        })
    }));

    let sink = events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let sink = sink.clone();
        Box::pin(async move {
            if let Some(state) = signaling_state(state) {
                sink.emit(TransportEvent::SignalingState(state));
            }
        })
    }));

    let peer = events.peer().clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let peer = peer.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", %peer, ?state, "peer connection state changed");
        })
    }));

    let sink = events.clone();
    let table = channels.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let sink = sink.clone();
        let table = table.clone();
        Box::pin(async move {
            let id = ChannelId::next();
            tracing::debug!(
                target = "webrtc",
                peer = %sink.peer(),
                channel = %id,
                label = dc.label(),
                "remote opened data channel"
            );
            table.lock().insert(id, dc.clone());
            sink.emit(TransportEvent::IncomingChannel {
                channel: id,
                label: dc.label().to_string(),
            });
            install_channel_handlers(&dc, id, &sink);
            // The open callback may already have fired before we got here.
            if dc.ready_state() == RTCDataChannelState::Open {
                sink.emit(TransportEvent::ChannelState {
                    channel: id,
                    state: ChannelState::Open,
                });
            }
        })
    }));
}

fn install_channel_handlers(dc: &Arc<RTCDataChannel>, id: ChannelId, events: &TransportEvents) {
    let sink = events.clone();
    dc.on_open(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(TransportEvent::ChannelState {
                channel: id,
                state: ChannelState::Open,
            });
        })
    }));

    let sink = events.clone();
    dc.on_close(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(TransportEvent::ChannelState {
                channel: id,
                state: ChannelState::Closed,
            });
        })
    }));

    let sink = events.clone();
    dc.on_error(Box::new(move |err| {
        let sink = sink.clone();
        Box::pin(async move {
            tracing::warn!(
                target = "webrtc",
                peer = %sink.peer(),
                channel = %id,
                error = %err,
                "data channel error"
            );
        })
    }));

    let sink = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = sink.clone();
        Box::pin(async move {
            match decode_text(&msg.data) {
                Ok(text) => {
                    sink.emit(TransportEvent::Message { channel: id, text });
                }
                Err(err) => {
                    let err = MeshError::Decode(err.to_string());
                    tracing::warn!(
                        target = "webrtc",
                        peer = %sink.peer(),
                        channel = %id,
                        error = %err,
                        bytes = msg.data.len(),
                        "dropping non-text frame"
                    );
                }
            }
        })
    }));
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(candidate_init(candidate))
            .await
            .map_err(to_negotiation_error)
    }

    async fn open_channel(&self, label: &str) -> Result<ChannelId, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_negotiation_error)?;
        let id = ChannelId::next();
        install_channel_handlers(&dc, id, &self.events);
        self.channels.lock().insert(id, dc);
        tracing::debug!(
            target = "webrtc",
            peer = %self.events.peer(),
            channel = %id,
            label,
            "created data channel"
        );
        Ok(id)
    }

    async fn send_on_channel(&self, channel: ChannelId, text: &str) -> Result<(), TransportError> {
        let dc = self
            .channel(channel)
            .ok_or_else(|| TransportError::Send(format!("unknown channel {channel}")))?;
        let state = dc.ready_state();
        if state != RTCDataChannelState::Open {
            return Err(TransportError::Send(format!("channel {channel} is {state}")));
        }
        dc.send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(to_send_error)
    }

    async fn close(&self) {
        let drained: Vec<_> = self.channels.lock().drain().map(|(_, dc)| dc).collect();
        for dc in drained {
            if let Err(err) = dc.close().await {
                tracing::debug!(target = "webrtc", error = %err, "data channel close failed");
            }
        }
        if let Err(err) = self.pc.close().await {
            tracing::warn!(
                target = "webrtc",
                peer = %self.events.peer(),
                error = %err,
                "peer connection close failed"
            );
        }
    }
}

// Last-resort teardown when the lane drops us without calling `close`.
impl Drop for WebRtcPeerTransport {
    fn drop(&mut self) {
        if self.pc.connection_state() == RTCPeerConnectionState::Closed {
            return;
        }
        let pc = self.pc.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = pc.close().await;
            });
        }
    }
}
