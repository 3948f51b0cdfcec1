//! ChatHub: local WebSocket fan-out and peer push.
//!
//! Subscribers are WebSocket tasks holding the receiving end of an
//! unbounded channel; the hub pre-serializes each frame once and hands the
//! string to every live subscriber, dropping senders whose socket has gone
//! away. Delivery to remote nodes is a detached, per-peer-deadlined push;
//! the periodic sync loops are the safety net for any push that fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::clock;
use crate::error::PeerError;
use crate::identity::NodeIdentity;
use crate::registry::TrustRegistry;
use crate::rpc::PeerClient;
use crate::store::{CHAT_DOC, Store};
use crate::types::{ChatMessage, MAX_MESSAGE_CHARS};
use crate::wire::ChatPushRequest;

pub struct ChatHub {
    subscribers: parking_lot::Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    next_id: AtomicU64,
    store: Arc<Store>,
    identity: Arc<NodeIdentity>,
    registry: Arc<TrustRegistry>,
    client: Arc<PeerClient>,
    chat_cap: usize,
}

impl ChatHub {
    pub fn new(
        store: Arc<Store>,
        identity: Arc<NodeIdentity>,
        registry: Arc<TrustRegistry>,
        client: Arc<PeerClient>,
        chat_cap: usize,
    ) -> Self {
        Self {
            subscribers: parking_lot::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            store,
            identity,
            registry,
            client,
            chat_cap,
        }
    }

    // ── Subscribers ────────────────────────────────────────────────────

    pub fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, tx);
        tracing::debug!(subscriber = id, total = self.subscriber_count(), "chat subscriber added");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().remove(&id);
        tracing::debug!(subscriber = id, total = self.subscriber_count(), "chat subscriber removed");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn fanout(&self, payload: String) {
        let mut subs = self.subscribers.lock();
        subs.retain(|_, tx| tx.send(payload.clone()).is_ok());
    }

    /// Deliver one message to every local subscriber.
    pub fn broadcast(&self, msg: &ChatMessage) {
        let payload = serde_json::json!({"type": "message", "data": msg}).to_string();
        self.fanout(payload);
    }

    /// Deliver a batch (post-merge) to every local subscriber.
    pub fn broadcast_many(&self, msgs: &[ChatMessage]) {
        if msgs.is_empty() {
            return;
        }
        let payload = serde_json::json!({"type": "messages_batch", "data": msgs}).to_string();
        self.fanout(payload);
    }

    // ── Local sends ────────────────────────────────────────────────────

    /// Persist and fan out a message authored on this node, then push it to
    /// peers without waiting for them.
    pub async fn send_local(
        self: &Arc<Self>,
        content: &str,
        client_id: Option<String>,
    ) -> Result<ChatMessage, PeerError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(PeerError::InvariantViolation("message must not be empty".into()));
        }
        if content.chars().count() > MAX_MESSAGE_CHARS {
            return Err(PeerError::InvariantViolation(format!(
                "message exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }

        // ULIDs sort by creation time, which keeps chat ordering stable
        // across nodes whose messages carry equal timestamps.
        let msg = ChatMessage {
            id: ulid::Ulid::new().to_string(),
            node_id: self.identity.node_id().to_string(),
            node_name: self.identity.name().to_string(),
            content: content.to_string(),
            timestamp: clock::now(),
            client_id,
            status: Some("sent".into()),
            extra: serde_json::Map::new(),
        };

        self.append(&msg).await?;
        self.broadcast(&msg);
        self.spawn_push_to_peers(msg.clone());
        Ok(msg)
    }

    /// Accept a message pushed directly by a peer: dedupe by id, persist,
    /// fan out locally. Returns whether the message was new.
    pub async fn ingest_remote(&self, msg: ChatMessage) -> Result<bool, PeerError> {
        if msg.id.is_empty() {
            return Err(PeerError::Malformed("message without id".into()));
        }

        let cap = self.chat_cap;
        let mut inserted = false;
        let incoming = msg.clone();
        self.store
            .update(CHAT_DOC, Vec::new(), |mut messages: Vec<ChatMessage>| {
                if !messages.iter().any(|m| m.id == incoming.id) {
                    inserted = true;
                    messages.push(incoming);
                    if messages.len() > cap {
                        let excess = messages.len() - cap;
                        messages.drain(..excess);
                    }
                }
                messages
            })
            .await?;

        if inserted {
            self.broadcast(&msg);
        }
        Ok(inserted)
    }

    async fn append(&self, msg: &ChatMessage) -> Result<(), PeerError> {
        let cap = self.chat_cap;
        let msg = msg.clone();
        self.store
            .update(CHAT_DOC, Vec::new(), |mut messages: Vec<ChatMessage>| {
                messages.push(msg);
                if messages.len() > cap {
                    let excess = messages.len() - cap;
                    messages.drain(..excess);
                }
                messages
            })
            .await?;
        Ok(())
    }

    // ── Peer push ──────────────────────────────────────────────────────

    /// Fire-and-forget push to every trusted connectable peer. The caller
    /// never waits; each request has the client's own deadline and failures
    /// are only logged.
    pub fn spawn_push_to_peers(self: &Arc<Self>, msg: ChatMessage) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            hub.push_to_peers(msg).await;
        });
    }

    async fn push_to_peers(&self, msg: ChatMessage) {
        let peers = self
            .registry
            .discover_trusted_connectable_peers(self.identity.node_id())
            .await;
        if peers.is_empty() {
            return;
        }

        let req = Arc::new(ChatPushRequest {
            node_id: self.identity.node_id().to_string(),
            message: msg,
        });

        let mut set = JoinSet::new();
        for peer in peers {
            let client = Arc::clone(&self.client);
            let req = Arc::clone(&req);
            set.spawn(async move {
                match client.chat_push(&peer.url(), &req).await {
                    Ok(_) => tracing::debug!(peer = %peer.node_id, "chat push delivered"),
                    Err(e) => tracing::debug!(peer = %peer.node_id, "chat push failed: {e}"),
                }
            });
        }
        while set.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use clap::Parser;

    async fn test_hub() -> (tempfile::TempDir, Arc<ChatHub>) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::parse_from([
            "paddock-server",
            "--data-dir",
            &dir.path().to_string_lossy(),
        ]);
        let store = Arc::new(Store::open(&config.data_dir).unwrap());
        let identity = Arc::new(
            NodeIdentity::bootstrap(&config, Arc::clone(&store))
                .await
                .unwrap(),
        );
        let registry = Arc::new(TrustRegistry::new(Arc::clone(&store)));
        let client = Arc::new(PeerClient::new(Arc::clone(&identity), 1.0));
        let hub = Arc::new(ChatHub::new(store, identity, registry, client, 5));
        (dir, hub)
    }

    #[tokio::test]
    async fn send_local_persists_broadcasts_and_caps() {
        let (_dir, hub) = test_hub().await;
        let (id, mut rx) = hub.subscribe();

        let msg = hub.send_local("hello", Some("c1".into())).await.unwrap();
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.client_id.as_deref(), Some("c1"));

        let frame = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "message");
        assert_eq!(parsed["data"]["content"], "hello");

        // Cap of 5: older messages fall off.
        for i in 0..8 {
            hub.send_local(&format!("m{i}"), None).await.unwrap();
        }
        let chat: Vec<ChatMessage> = hub.store.read(CHAT_DOC, Vec::new()).await;
        assert_eq!(chat.len(), 5);
        assert_eq!(chat.last().unwrap().content, "m7");

        hub.unsubscribe(id);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn send_local_validates_content() {
        let (_dir, hub) = test_hub().await;
        assert!(hub.send_local("   ", None).await.is_err());
        let long = "x".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(hub.send_local(&long, None).await.is_err());
    }

    #[tokio::test]
    async fn ingest_remote_dedupes_by_id() {
        let (_dir, hub) = test_hub().await;
        let msg = ChatMessage {
            id: "remote-1".into(),
            node_id: "peer".into(),
            node_name: "peer".into(),
            content: "from afar".into(),
            timestamp: clock::now(),
            client_id: None,
            status: None,
            extra: serde_json::Map::new(),
        };

        assert!(hub.ingest_remote(msg.clone()).await.unwrap());
        assert!(!hub.ingest_remote(msg).await.unwrap(), "second push is a no-op");

        let chat: Vec<ChatMessage> = hub.store.read(CHAT_DOC, Vec::new()).await;
        assert_eq!(chat.len(), 1);
    }

    #[tokio::test]
    async fn dead_subscribers_are_dropped_on_broadcast() {
        let (_dir, hub) = test_hub().await;
        let (_id1, rx1) = hub.subscribe();
        let (_id2, mut rx2) = hub.subscribe();
        drop(rx1);

        hub.broadcast_many(&[ChatMessage {
            id: "b1".into(),
            node_id: "n".into(),
            node_name: "n".into(),
            content: "batch".into(),
            timestamp: clock::now(),
            client_id: None,
            status: None,
            extra: serde_json::Map::new(),
        }]);

        assert_eq!(hub.subscriber_count(), 1, "closed subscriber pruned");
        let frame = rx2.recv().await.unwrap();
        assert!(frame.contains("messages_batch"));
    }
}
