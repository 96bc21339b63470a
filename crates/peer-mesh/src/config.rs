use crate::error::{MeshError, MeshResult};
use crate::peer::{PeerId, PeerSet};

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    fn needs_credentials(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub local: PeerId,
    pub participants: PeerSet,
    pub ice_servers: Vec<IceServerConfig>,
}

impl MeshConfig {
    pub fn new(local: PeerId, participants: PeerSet) -> Self {
        Self {
            local,
            participants,
            ice_servers: vec![IceServerConfig::stun(DEFAULT_ICE_SERVER)],
        }
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServerConfig>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn validate(&self) -> MeshResult<()> {
        if !self.participants.contains(&self.local) {
            return Err(MeshError::Configuration(format!(
                "local peer {} is not one of the participants",
                self.local
            )));
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(MeshError::Configuration("ice server without urls".into()));
            }
            if server.needs_credentials()
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(MeshError::Configuration(format!(
                    "turn server {:?} needs MESH_TURN_USERNAME and MESH_TURN_CREDENTIAL",
                    server.urls
                )));
            }
        }
        Ok(())
    }

    pub fn from_env() -> MeshResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds and validates a config from `MESH_*` variables supplied by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> MeshResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let local = lookup("MESH_LOCAL_PEER")
            .ok_or_else(|| MeshError::Configuration("MESH_LOCAL_PEER is not set".into()))?;
        let local = PeerId::parse(local.trim())?;
        let participants = lookup("MESH_PARTICIPANTS")
            .ok_or_else(|| MeshError::Configuration("MESH_PARTICIPANTS is not set".into()))?;
        let participants = PeerSet::parse_list(&participants)?;

        let urls: Vec<String> = lookup("MESH_ICE_SERVERS")
            .unwrap_or_else(|| DEFAULT_ICE_SERVER.into())
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(String::from)
            .collect();
        let username = lookup("MESH_TURN_USERNAME").filter(|v| !v.is_empty());
        let credential = lookup("MESH_TURN_CREDENTIAL").filter(|v| !v.is_empty());
        let (turn, stun): (Vec<String>, Vec<String>) = urls
            .into_iter()
            .partition(|url| url.starts_with("turn:") || url.starts_with("turns:"));

        let mut ice_servers = Vec::new();
        if !stun.is_empty() {
            ice_servers.push(IceServerConfig {
                urls: stun,
                username: None,
                credential: None,
            });
        }
        if !turn.is_empty() {
            ice_servers.push(IceServerConfig {
                urls: turn,
                username,
                credential,
            });
        }

        let config = Self::new(local, participants).with_ice_servers(ice_servers);
        config.validate()?;
        Ok(config)
    }
}
