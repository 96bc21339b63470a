//! webrtc-rs binding for [`peer_mesh::TransportFactory`].
//!
//! Each connection gets its own `RTCPeerConnection` configured with the mesh's
//! ICE servers; data channels are created ordered and reliable and carry UTF-8
//! text frames.

mod connection;
mod convert;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peer_mesh::{MeshConfig, PeerId, PeerTransport, TransportError, TransportEvents, TransportFactory};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub use connection::WebRtcPeerTransport;

use crate::convert::{ice_server, to_setup_error};

/// ICE liveness timers handed to the setting engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceTimeouts {
    pub disconnected: Duration,
    pub failed: Duration,
    pub keepalive: Duration,
}

impl Default for IceTimeouts {
    fn default() -> Self {
        Self {
            disconnected: Duration::from_secs(3),
            failed: Duration::from_secs(10),
            keepalive: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebRtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
    timeouts: IceTimeouts,
}

impl WebRtcTransportFactory {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.iter().map(ice_server).collect(),
            timeouts: IceTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: IceTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn ice_server_urls(&self) -> Vec<&str> {
        self.ice_servers
            .iter()
            .flat_map(|server| server.urls.iter().map(String::as_str))
            .collect()
    }

    pub fn shared(self) -> Arc<dyn TransportFactory> {
        Arc::new(self)
    }

    fn setting_engine(&self) -> SettingEngine {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(self.timeouts.disconnected),
            Some(self.timeouts.failed),
            Some(self.timeouts.keepalive),
        );
        setting
    }
}

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media = MediaEngine::default();
    media.register_default_codecs().map_err(to_setup_error)?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media).map_err(to_setup_error)?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting)
        .build())
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn connect(
        &self,
        peer: &PeerId,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let api = build_api(self.setting_engine())?;
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(to_setup_error)?;
        tracing::debug!(
            target = "webrtc",
            %peer,
            ice_servers = self.ice_servers.len(),
            "peer connection created"
        );
        Ok(Box::new(WebRtcPeerTransport::attach(Arc::new(pc), events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_mesh::{IceServerConfig, PeerSet};

    fn config() -> MeshConfig {
        let seats = PeerSet::parse_list("east,north,west").expect("seats");
        MeshConfig::new(PeerId::parse("east").expect("peer"), seats)
    }

    #[test]
    fn factory_uses_configured_servers() {
        let config = config().with_ice_servers(vec![
            IceServerConfig::stun("stun:stun.example.net:3478"),
            IceServerConfig {
                urls: vec!["turn:turn.example.net:3478".into()],
                username: Some("u".into()),
                credential: Some("p".into()),
            },
        ]);
        let factory = WebRtcTransportFactory::new(&config);
        assert_eq!(
            factory.ice_server_urls(),
            vec!["stun:stun.example.net:3478", "turn:turn.example.net:3478"]
        );
    }

    #[test]
    fn default_config_points_at_public_stun() {
        let factory = WebRtcTransportFactory::new(&config());
        assert_eq!(factory.ice_server_urls(), vec![peer_mesh::DEFAULT_ICE_SERVER]);
    }

    #[test]
    fn api_builds_with_custom_timeouts() {
        let factory = WebRtcTransportFactory::new(&config()).with_timeouts(IceTimeouts {
            disconnected: Duration::from_secs(1),
            failed: Duration::from_secs(2),
            keepalive: Duration::from_millis(100),
        });
        assert!(build_api(factory.setting_engine()).is_ok());
    }
}
