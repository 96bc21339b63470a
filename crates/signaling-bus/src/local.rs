use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    ChangeKind, DocumentChange, DocumentKey, SignalingChannel, SignalingDocument, SignalingError,
    SignalingResult, Subscription,
};

/// In-process signaling store for tests and single-process tables.
#[derive(Debug, Default)]
pub struct LocalSignalingStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    documents: BTreeMap<DocumentKey, SignalingDocument>,
    subscribers: Vec<mpsc::UnboundedSender<DocumentChange>>,
    reject_writes: bool,
}

impl Inner {
    fn check_writable(&self) -> SignalingResult<()> {
        if self.reject_writes {
            return Err(SignalingError::Transport("store is rejecting writes".into()));
        }
        Ok(())
    }

    fn update<F>(&mut self, key: &DocumentKey, apply: F)
    where
        F: FnOnce(&mut SignalingDocument) -> bool,
    {
        let existed = self.documents.contains_key(key);
        let document = self.documents.entry(key.clone()).or_default();
        let changed = apply(document);
        if !changed && existed {
            return;
        }
        let change = DocumentChange {
            kind: if existed {
                ChangeKind::Modified
            } else {
                ChangeKind::Added
            },
            key: key.clone(),
            document: document.clone(),
        };
        self.notify(change);
    }

    fn notify(&mut self, change: DocumentChange) {
        self.subscribers
            .retain(|subscriber| subscriber.send(change.clone()).is_ok());
    }
}

impl LocalSignalingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, key: &DocumentKey) -> Option<SignalingDocument> {
        self.inner.lock().documents.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<DocumentKey> {
        self.inner.lock().documents.keys().cloned().collect()
    }

    /// Makes every subsequent write fail with a transport error until reset.
    pub fn set_reject_writes(&self, reject: bool) {
        self.inner.lock().reject_writes = reject;
    }

    pub fn subscriber_count(&self) -> usize {
        let mut guard = self.inner.lock();
        guard.subscribers.retain(|subscriber| !subscriber.is_closed());
        guard.subscribers.len()
    }
}

#[async_trait]
impl SignalingChannel for LocalSignalingStore {
    async fn publish_offer(&self, key: &DocumentKey, sdp: &str) -> SignalingResult<()> {
        let mut guard = self.inner.lock();
        guard.check_writable()?;
        tracing::trace!(target = "signaling_bus", key = %key, "publishing offer");
        guard.update(key, |document| {
            let changed = document.offer.as_deref() != Some(sdp);
            document.offer = Some(sdp.to_string());
            changed
        });
        Ok(())
    }

    async fn publish_answer(&self, key: &DocumentKey, sdp: &str) -> SignalingResult<()> {
        let mut guard = self.inner.lock();
        guard.check_writable()?;
        tracing::trace!(target = "signaling_bus", key = %key, "publishing answer");
        guard.update(key, |document| {
            let changed = document.answer.as_deref() != Some(sdp);
            document.answer = Some(sdp.to_string());
            changed
        });
        Ok(())
    }

    async fn append_candidate(&self, key: &DocumentKey, candidate: Value) -> SignalingResult<()> {
        let mut guard = self.inner.lock();
        guard.check_writable()?;
        tracing::trace!(target = "signaling_bus", key = %key, "appending candidate");
        guard.update(key, |document| document.union_candidate(candidate));
        Ok(())
    }

    async fn subscribe(&self) -> SignalingResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.inner.lock();
        // Seeding and registering under one lock: no write can fall between them.
        for (key, document) in &guard.documents {
            let change = DocumentChange {
                kind: ChangeKind::Added,
                key: key.clone(),
                document: document.clone(),
            };
            tx.send(change).map_err(|_| SignalingError::Closed)?;
        }
        guard.subscribers.push(tx);
        Ok(Subscription::new(rx))
    }

    async fn remove(&self, key: &DocumentKey) -> SignalingResult<()> {
        let mut guard = self.inner.lock();
        guard.check_writable()?;
        if let Some(document) = guard.documents.remove(key) {
            guard.notify(DocumentChange {
                kind: ChangeKind::Removed,
                key: key.clone(),
                document,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CandidateRecord;

    fn key(from: &str, to: &str) -> DocumentKey {
        DocumentKey::new(from, to).expect("valid key")
    }

    fn candidate(sdp: &str) -> Value {
        CandidateRecord {
            sdp: sdp.into(),
            sdp_mid: "0".into(),
            sdp_mline_index: "0".into(),
        }
        .to_value()
        .expect("record json")
    }

    #[tokio::test]
    async fn late_subscriber_sees_existing_documents() {
        let store = LocalSignalingStore::new();
        store
            .publish_offer(&key("north", "east"), "offer-1")
            .await
            .expect("publish ok");

        let mut sub = store.subscribe().await.expect("subscribe ok");
        let change = sub.next().await.expect("seeded change");
        assert_eq!(change.kind, ChangeKind::Added);
        assert_eq!(change.key, key("north", "east"));
        assert_eq!(change.document.offer.as_deref(), Some("offer-1"));
    }

    #[tokio::test]
    async fn writes_report_added_then_modified() {
        let store = LocalSignalingStore::new();
        let mut sub = store.subscribe().await.expect("subscribe ok");
        let k = key("east", "north");
        store.publish_answer(&k, "answer-1").await.expect("answer");
        store.append_candidate(&k, candidate("c1")).await.expect("c1");

        let first = sub.next().await.expect("first change");
        assert_eq!(first.kind, ChangeKind::Added);
        assert_eq!(first.document.answer.as_deref(), Some("answer-1"));
        let second = sub.next().await.expect("second change");
        assert_eq!(second.kind, ChangeKind::Modified);
        assert_eq!(second.document.ice_candidates.len(), 1);
    }

    #[tokio::test]
    async fn candidates_are_a_union_and_never_truncated() {
        let store = LocalSignalingStore::new();
        let k = key("north", "west");
        store.append_candidate(&k, candidate("c1")).await.expect("c1");
        store.append_candidate(&k, candidate("c2")).await.expect("c2");
        store.append_candidate(&k, candidate("c1")).await.expect("dup");
        store.publish_offer(&k, "offer").await.expect("offer");

        let doc = store.document(&k).expect("document");
        assert_eq!(doc.ice_candidates, vec![candidate("c1"), candidate("c2")]);
        assert_eq!(doc.offer.as_deref(), Some("offer"));
    }

    #[tokio::test]
    async fn duplicate_write_emits_nothing() {
        let store = LocalSignalingStore::new();
        let k = key("north", "west");
        store.publish_offer(&k, "offer").await.expect("offer");
        let mut sub = store.subscribe().await.expect("subscribe");
        assert!(sub.try_next().is_some());
        store.publish_offer(&k, "offer").await.expect("same offer");
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn rejected_writes_surface_transport_errors() {
        let store = LocalSignalingStore::new();
        store.set_reject_writes(true);
        let err = store
            .publish_offer(&key("north", "east"), "offer")
            .await
            .expect_err("write rejected");
        assert!(matches!(err, SignalingError::Transport(_)));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn remove_notifies_subscribers() {
        let store = LocalSignalingStore::new();
        let k = key("north", "east");
        store.publish_offer(&k, "offer").await.expect("offer");
        let mut sub = store.subscribe().await.expect("subscribe");
        let _seeded = sub.next().await;
        store.remove(&k).await.expect("remove");
        let change = sub.next().await.expect("removal");
        assert_eq!(change.kind, ChangeKind::Removed);
        assert!(store.document(&k).is_none());
    }
}
