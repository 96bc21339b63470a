//! Mappings between webrtc-rs types and the mesh transport vocabulary.

use peer_mesh::{
    ChannelState, IceCandidate, IceConnectivity, IceServerConfig, SdpKind, SessionDescription,
    SignalingState, TransportError,
};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

pub(crate) fn ice_server(config: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: config.urls.clone(),
        username: config.username.clone().unwrap_or_default(),
        credential: config.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// `None` for the unspecified placeholder state.
pub(crate) fn ice_connectivity(state: RTCIceConnectionState) -> Option<IceConnectivity> {
    let mapped = match state {
        RTCIceConnectionState::New => IceConnectivity::New,
        RTCIceConnectionState::Checking => IceConnectivity::Checking,
        RTCIceConnectionState::Connected => IceConnectivity::Connected,
        RTCIceConnectionState::Completed => IceConnectivity::Completed,
        RTCIceConnectionState::Disconnected => IceConnectivity::Disconnected,
        RTCIceConnectionState::Failed => IceConnectivity::Failed,
        RTCIceConnectionState::Closed => IceConnectivity::Closed,
        RTCIceConnectionState::Unspecified => return None,
    };
    Some(mapped)
}

pub(crate) fn signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    let mapped = match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Unspecified => return None,
    };
    Some(mapped)
}

pub(crate) fn channel_state(state: RTCDataChannelState) -> Option<ChannelState> {
    let mapped = match state {
        RTCDataChannelState::Connecting => ChannelState::Connecting,
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        RTCDataChannelState::Unspecified => return None,
    };
    Some(mapped)
}

pub(crate) fn candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

pub(crate) fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    }
}

pub(crate) fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(to_negotiation_error)
}

pub(crate) fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, TransportError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(TransportError::Negotiation(format!(
            "unsupported description type {other}"
        ))),
    }
}

/// Incoming frames must be UTF-8 text; anything else is dropped by the caller.
pub(crate) fn decode_text(data: &[u8]) -> Result<String, std::str::Utf8Error> {
    std::str::from_utf8(data).map(str::to_owned)
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

pub(crate) fn to_negotiation_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

pub(crate) fn to_send_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Send(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_credentials_carry_over() {
        let config = IceServerConfig {
            urls: vec!["turn:turn.example.net:3478".into()],
            username: Some("seat".into()),
            credential: Some("secret".into()),
        };
        let server = ice_server(&config);
        assert_eq!(server.urls, config.urls);
        assert_eq!(server.username, "seat");
        assert_eq!(server.credential, "secret");

        let stun = ice_server(&IceServerConfig::stun("stun:stun.example.net:3478"));
        assert!(stun.username.is_empty());
        assert!(stun.credential.is_empty());
    }

    #[test]
    fn unspecified_states_are_skipped() {
        assert_eq!(ice_connectivity(RTCIceConnectionState::Unspecified), None);
        assert_eq!(signaling_state(RTCSignalingState::Unspecified), None);
        assert_eq!(channel_state(RTCDataChannelState::Unspecified), None);
    }

    #[test]
    fn connectivity_states_map_one_to_one() {
        let pairs = [
            (RTCIceConnectionState::Checking, IceConnectivity::Checking),
            (RTCIceConnectionState::Connected, IceConnectivity::Connected),
            (RTCIceConnectionState::Completed, IceConnectivity::Completed),
            (RTCIceConnectionState::Disconnected, IceConnectivity::Disconnected),
            (RTCIceConnectionState::Failed, IceConnectivity::Failed),
        ];
        for (rtc, expected) in pairs {
            assert_eq!(ice_connectivity(rtc), Some(expected));
        }
        assert_eq!(
            signaling_state(RTCSignalingState::HaveRemoteOffer),
            Some(SignalingState::HaveRemoteOffer)
        );
        assert_eq!(channel_state(RTCDataChannelState::Open), Some(ChannelState::Open));
    }

    #[test]
    fn candidate_fields_survive_conversion() {
        let candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.5 50000 typ host")
            .with_mid("0", 0);
        let init = candidate_init(candidate.clone());
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
        assert!(init.username_fragment.is_none());
        assert_eq!(candidate_from_init(init), candidate);
    }

    #[test]
    fn garbage_sdp_is_a_negotiation_error() {
        let err = to_rtc_description(SessionDescription::offer("definitely not sdp"))
            .expect_err("unparseable");
        assert!(matches!(err, TransportError::Negotiation(_)));
    }

    #[test]
    fn binary_frames_must_be_utf8() {
        assert_eq!(decode_text(b"deal").as_deref(), Ok("deal"));
        assert!(decode_text(&[0xff, 0xfe]).is_err());
    }
}
