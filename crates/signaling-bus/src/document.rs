use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{SignalingError, SignalingResult};

/// Literal separator between the sender and recipient halves of a key.
pub const KEY_SEPARATOR: &str = "_to_";

/// `"<from>_to_<to>"`: identifies the document one peer writes for another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    from: String,
    to: String,
}

impl DocumentKey {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> SignalingResult<Self> {
        let from = from.into();
        let to = to.into();
        validate_half(&from)?;
        validate_half(&to)?;
        if from == to {
            return Err(SignalingError::InvalidKey(format!(
                "{from}{KEY_SEPARATOR}{to}: sender and recipient are the same peer"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn parse(raw: &str) -> SignalingResult<Self> {
        let (from, to) = raw
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| SignalingError::InvalidKey(raw.to_string()))?;
        Self::new(from, to)
    }

    pub fn from_peer(&self) -> &str {
        &self.from
    }

    pub fn to_peer(&self) -> &str {
        &self.to
    }

    /// The key of the document travelling the other way.
    pub fn reversed(&self) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_SEPARATOR}{}", self.from, self.to)
    }
}

fn validate_half(half: &str) -> SignalingResult<()> {
    if half.is_empty()
        || half.contains(KEY_SEPARATOR)
        || half.ends_with("_to")
        || half.starts_with("to_")
        || half.chars().any(|c| c.is_uppercase() || c.is_whitespace())
    {
        return Err(SignalingError::InvalidKey(half.to_string()));
    }
    Ok(())
}

/// Wire shape of a single ICE candidate inside `iceCandidates`.
///
/// Every field is a string on the wire, including the m-line index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub sdp: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: String,
}

impl CandidateRecord {
    pub fn to_value(&self) -> SignalingResult<Value> {
        serde_json::to_value(self).map_err(|err| SignalingError::Transport(err.to_string()))
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }
}

/// One direction of a peer pair's rendezvous state.
///
/// `offer` and `answer` are last-write-wins. `iceCandidates` only grows; the
/// entries are kept as raw JSON so that a malformed entry written by another
/// client is reported by whoever decodes it instead of poisoning the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalingDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(rename = "iceCandidates", default)]
    pub ice_candidates: Vec<Value>,
}

impl SignalingDocument {
    /// Array-union append: an entry equal to an existing one is not added again.
    /// Returns whether the document changed.
    pub fn union_candidate(&mut self, candidate: Value) -> bool {
        if self.ice_candidates.contains(&candidate) {
            return false;
        }
        self.ice_candidates.push(candidate);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub key: DocumentKey,
    pub document: SignalingDocument,
}
