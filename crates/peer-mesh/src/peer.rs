use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use signaling_bus::{DocumentKey, KEY_SEPARATOR};

use crate::error::{MeshError, MeshResult};

/// Largest table the mesh is built for.
pub const MAX_PARTICIPANTS: usize = 3;

/// Identifier of one seat at the table.
///
/// Ids are lowercase and never contain the signaling key separator, so
/// `"<from>_to_<to>"` always splits back into the two ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn parse(raw: impl Into<String>) -> MeshResult<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(MeshError::Configuration("peer id must not be empty".into()));
        }
        if raw.contains(KEY_SEPARATOR) {
            return Err(MeshError::Configuration(format!(
                "peer id {raw:?} contains the reserved separator {KEY_SEPARATOR:?}"
            )));
        }
        // "a_to" + "_to_" + "b" would split back as ("a", "to_b").
        if raw.ends_with("_to") || raw.starts_with("to_") {
            return Err(MeshError::Configuration(format!(
                "peer id {raw:?} would make document keys ambiguous"
            )));
        }
        if raw.chars().any(|c| c.is_uppercase() || c.is_whitespace()) {
            return Err(MeshError::Configuration(format!(
                "peer id {raw:?} must be lowercase without whitespace"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Key of the signaling document `from` writes for `to`.
pub fn document_key(from: &PeerId, to: &PeerId) -> MeshResult<DocumentKey> {
    Ok(DocumentKey::new(from.as_str(), to.as_str())?)
}

/// The fixed set of seats in one session, kept sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSet {
    members: Vec<PeerId>,
}

impl PeerSet {
    pub fn new(members: impl IntoIterator<Item = PeerId>) -> MeshResult<Self> {
        let mut members: Vec<PeerId> = members.into_iter().collect();
        members.sort();
        let before = members.len();
        members.dedup();
        if members.len() != before {
            return Err(MeshError::Configuration(
                "participant list contains duplicates".into(),
            ));
        }
        if !(2..=MAX_PARTICIPANTS).contains(&members.len()) {
            return Err(MeshError::Configuration(format!(
                "a session needs between 2 and {MAX_PARTICIPANTS} participants, got {}",
                members.len()
            )));
        }
        Ok(Self { members })
    }

    /// Parses a comma separated list such as `"east,north,west"`.
    pub fn parse_list(raw: &str) -> MeshResult<Self> {
        let members = raw
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(PeerId::parse)
            .collect::<MeshResult<Vec<_>>>()?;
        Self::new(members)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.binary_search(peer).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerId> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Everyone except `local`.
    pub fn others<'a>(&'a self, local: &'a PeerId) -> impl Iterator<Item = &'a PeerId> + 'a {
        self.members.iter().filter(move |peer| *peer != local)
    }

    /// Glare tie-break: between two seats only the lower id sends the offer.
    pub fn offers_to(local: &PeerId, remote: &PeerId) -> bool {
        local < remote
    }
}
