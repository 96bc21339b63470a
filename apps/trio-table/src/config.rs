use std::time::Duration;

use clap::Parser;
use peer_mesh::{DEFAULT_ICE_SERVER, MeshConfig, MeshResult, PeerId, PeerSet};

/// Seats a three-player table in one process and passes a greeting around.
#[derive(Parser, Debug, Clone)]
#[command(name = "trio-table", version)]
pub struct AppConfig {
    /// Comma-separated seat ids.
    #[arg(long, env = "MESH_PARTICIPANTS", default_value = "east,north,west")]
    pub seats: String,

    /// Comma-separated STUN/TURN urls.
    #[arg(long, env = "MESH_ICE_SERVERS", default_value = DEFAULT_ICE_SERVER)]
    pub ice_servers: String,

    #[arg(long, env = "MESH_TURN_USERNAME")]
    pub turn_username: Option<String>,

    #[arg(long, env = "MESH_TURN_CREDENTIAL", hide_env_values = true)]
    pub turn_credential: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "info,peer_mesh=debug")]
    pub log_filter: String,

    /// How long to wait for every seat to connect and for greetings to arrive.
    #[arg(long, default_value_t = 20)]
    pub connect_timeout_secs: u64,

    #[arg(long, default_value = "hello from")]
    pub greeting: String,
}

impl AppConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn seats(&self) -> MeshResult<PeerSet> {
        PeerSet::parse_list(&self.seats)
    }

    /// Mesh config for one seat, validated the same way `MESH_*` variables are.
    pub fn mesh_config(&self, local: &PeerId) -> MeshResult<MeshConfig> {
        MeshConfig::from_lookup(|name| match name {
            "MESH_LOCAL_PEER" => Some(local.to_string()),
            "MESH_PARTICIPANTS" => Some(self.seats.clone()),
            "MESH_ICE_SERVERS" => Some(self.ice_servers.clone()),
            "MESH_TURN_USERNAME" => self.turn_username.clone(),
            "MESH_TURN_CREDENTIAL" => self.turn_credential.clone(),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> AppConfig {
        let mut argv = vec!["trio-table"];
        argv.extend_from_slice(args);
        AppConfig::try_parse_from(argv).expect("arguments parse")
    }

    #[test]
    fn per_seat_config_keeps_turn_credentials() {
        let config = parse(&[
            "--seats",
            "a,b,c",
            "--ice-servers",
            "stun:s.example:3478,turn:t.example:3478",
            "--turn-username",
            "u",
            "--turn-credential",
            "p",
        ]);
        let local = PeerId::parse("b").expect("peer");
        let mesh = config.mesh_config(&local).expect("valid");
        assert_eq!(mesh.local, local);
        assert_eq!(mesh.participants.len(), 3);
        let turn = mesh
            .ice_servers
            .iter()
            .find(|server| server.urls.iter().any(|url| url.starts_with("turn:")))
            .expect("turn entry");
        assert_eq!(turn.username.as_deref(), Some("u"));
        assert_eq!(turn.credential.as_deref(), Some("p"));
    }

    #[test]
    fn oversized_table_is_rejected() {
        let config = parse(&["--seats", "a,b,c,d"]);
        assert!(config.seats().is_err());
    }
}
