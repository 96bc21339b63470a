use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

mod document;
mod local;

pub use document::{
    CandidateRecord, ChangeKind, DocumentChange, DocumentKey, KEY_SEPARATOR, SignalingDocument,
};
pub use local::LocalSignalingStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling channel closed")]
    Closed,
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error("invalid signaling document key: {0}")]
    InvalidKey(String),
}

pub type SignalingResult<T> = Result<T, SignalingError>;

/// Rendezvous primitive carrying offers, answers and candidates between two
/// named peers.
///
/// Implementations give no delivery guarantee beyond what their backing
/// service provides; callers must tolerate repeated and coalesced changes.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn publish_offer(&self, key: &DocumentKey, sdp: &str) -> SignalingResult<()>;
    async fn publish_answer(&self, key: &DocumentKey, sdp: &str) -> SignalingResult<()>;
    async fn append_candidate(&self, key: &DocumentKey, candidate: Value) -> SignalingResult<()>;
    /// Subscribes to every document. Documents that already exist are
    /// delivered first as [`ChangeKind::Added`].
    async fn subscribe(&self) -> SignalingResult<Subscription>;
    async fn remove(&self, key: &DocumentKey) -> SignalingResult<()>;
}

/// Stream of document changes for one subscriber.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<DocumentChange>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<DocumentChange>) -> Self {
        Self { rx }
    }

    /// Next change, or `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<DocumentChange> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<DocumentChange> {
        self.rx.try_recv().ok()
    }
}
