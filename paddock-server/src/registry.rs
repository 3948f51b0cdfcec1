//! Trust registry: the logical view over the `nodes` document.
//!
//! Mediates the join/approve lifecycle and the local operator actions.
//! Approvals and kicks bump `registered_at` so the change clears every
//! peer's delta filter and propagates through gossip; a plain local delete
//! deliberately does not propagate.

use std::sync::Arc;

use crate::clock;
use crate::error::PeerError;
use crate::identity::NodeIdentity;
use crate::store::{NODES_DOC, STATES_DOC, Store};
use crate::types::{NodeMode, NodeRecord, NodesDoc, StatesDoc, TrustStatus};

pub struct TrustRegistry {
    store: Arc<Store>,
}

impl TrustRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn all(&self) -> NodesDoc {
        self.store.read(NODES_DOC, NodesDoc::new()).await
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeRecord> {
        self.all().await.get(node_id).cloned()
    }

    /// Upsert the record describing this node, preserving timestamp
    /// monotonicity across restarts.
    pub async fn register_self(&self, identity: &NodeIdentity) -> Result<(), PeerError> {
        let template = identity.self_record(0.0);
        self.store
            .update(NODES_DOC, NodesDoc::new(), move |mut nodes| {
                let prev = nodes
                    .get(&template.node_id)
                    .map(|r| r.registered_at)
                    .unwrap_or(0.0);
                let mut rec = template;
                rec.registered_at = clock::bump(prev);
                nodes.insert(rec.node_id.clone(), rec);
                nodes
            })
            .await?;
        Ok(())
    }

    /// Save an inbound join request as `pending`.
    pub async fn save_pending(&self, mut record: NodeRecord) -> Result<(), PeerError> {
        record.trust_status = TrustStatus::Pending;
        record.registered_at = clock::now();
        self.upsert(record).await
    }

    pub async fn upsert(&self, record: NodeRecord) -> Result<(), PeerError> {
        self.store
            .update(NODES_DOC, NodesDoc::new(), move |mut nodes| {
                nodes.insert(record.node_id.clone(), record);
                nodes
            })
            .await?;
        Ok(())
    }

    // ── Operator actions ───────────────────────────────────────────────

    /// Approve a pending join: `pending → trusted`, fresh `registered_at`.
    pub async fn approve(&self, node_id: &str, self_id: &str) -> Result<(), PeerError> {
        if node_id == self_id {
            return Err(PeerError::InvariantViolation("cannot approve self".into()));
        }
        let record = self
            .get(node_id)
            .await
            .ok_or_else(|| PeerError::NotFound(node_id.to_string()))?;
        match record.trust_status {
            TrustStatus::Pending => {}
            TrustStatus::Trusted => return Ok(()),
            TrustStatus::Kicked => {
                return Err(PeerError::InvariantViolation(
                    "node was kicked; remove it before it can re-apply".into(),
                ));
            }
            other => {
                return Err(PeerError::InvariantViolation(format!(
                    "only pending nodes can be approved (current: {})",
                    other.as_str()
                )));
            }
        }

        let id = node_id.to_string();
        self.store
            .update(NODES_DOC, NodesDoc::new(), move |mut nodes| {
                if let Some(rec) = nodes.get_mut(&id) {
                    rec.trust_status = TrustStatus::Trusted;
                    rec.registered_at = clock::bump(rec.registered_at);
                }
                nodes
            })
            .await?;
        tracing::info!(node = node_id, "join approved");
        Ok(())
    }

    /// Reject a pending join: the record is removed entirely.
    pub async fn reject(&self, node_id: &str, self_id: &str) -> Result<(), PeerError> {
        if node_id == self_id {
            return Err(PeerError::InvariantViolation("cannot reject self".into()));
        }
        let record = self
            .get(node_id)
            .await
            .ok_or_else(|| PeerError::NotFound(node_id.to_string()))?;
        if record.trust_status != TrustStatus::Pending {
            return Err(PeerError::InvariantViolation(format!(
                "only pending nodes can be rejected (current: {})",
                record.trust_status.as_str()
            )));
        }

        let id = node_id.to_string();
        self.store
            .update(NODES_DOC, NodesDoc::new(), move |mut nodes| {
                nodes.remove(&id);
                nodes
            })
            .await?;
        tracing::info!(node = node_id, "join rejected");
        Ok(())
    }

    /// Kick a node from the network. Absorbing: propagates via gossip and
    /// every node starts refusing the kicked node's signatures.
    pub async fn kick(&self, node_id: &str, self_id: &str) -> Result<(), PeerError> {
        if node_id == self_id {
            return Err(PeerError::InvariantViolation("cannot kick self".into()));
        }
        let record = self
            .get(node_id)
            .await
            .ok_or_else(|| PeerError::NotFound(node_id.to_string()))?;
        if record.trust_status == TrustStatus::Kicked {
            return Ok(());
        }

        let id = node_id.to_string();
        self.store
            .update(NODES_DOC, NodesDoc::new(), move |mut nodes| {
                if let Some(rec) = nodes.get_mut(&id) {
                    rec.trust_status = TrustStatus::Kicked;
                    rec.kicked_at = Some(clock::now());
                    rec.registered_at = clock::bump(rec.registered_at);
                }
                nodes
            })
            .await?;
        tracing::warn!(node = node_id, "node kicked from the network");
        Ok(())
    }

    /// Remove a record (and its state) locally. Does not propagate.
    pub async fn remove(&self, node_id: &str, self_id: &str) -> Result<(), PeerError> {
        if node_id == self_id {
            return Err(PeerError::InvariantViolation("cannot delete self".into()));
        }
        let nodes = self.all().await;
        if !nodes.contains_key(node_id) {
            return Err(PeerError::NotFound(node_id.to_string()));
        }

        let id = node_id.to_string();
        self.store
            .update(NODES_DOC, NodesDoc::new(), {
                let id = id.clone();
                move |mut nodes: NodesDoc| {
                    nodes.remove(&id);
                    nodes
                }
            })
            .await?;
        self.store
            .update(STATES_DOC, StatesDoc::new(), move |mut states: StatesDoc| {
                states.remove(&id);
                states
            })
            .await?;
        tracing::info!(node = node_id, "node record removed locally");
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────────

    /// Peers eligible as communication targets: trusted, connectable,
    /// full-capable, not this node, with a usable URL.
    pub async fn discover_trusted_connectable_peers(&self, self_id: &str) -> Vec<NodeRecord> {
        self.all()
            .await
            .into_values()
            .filter(|n| {
                n.node_id != self_id
                    && matches!(n.mode, NodeMode::Full | NodeMode::TempFull)
                    && n.connectable
                    && n.trust_status == TrustStatus::Trusted
                    && !n.url().is_empty()
            })
            .collect()
    }

    /// All records a newly admitted peer is allowed to see: trusted ones
    /// plus this node's own record.
    pub async fn trusted_snapshot(&self) -> NodesDoc {
        self.all()
            .await
            .into_iter()
            .filter(|(_, n)| {
                matches!(n.trust_status, TrustStatus::Trusted | TrustStatus::Local)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str) -> NodeRecord {
        serde_json::from_value(serde_json::json!({
            "node_id": id,
            "name": id,
            "mode": "full",
            "connectable": true,
            "host": "127.0.0.1",
            "port": 8300,
            "registered_at": 100.0,
            "public_key": "02aa",
            "trust_status": "pending",
        }))
        .unwrap()
    }

    fn registry() -> (tempfile::TempDir, TrustRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        (dir, TrustRegistry::new(store))
    }

    #[tokio::test]
    async fn approve_flips_pending_to_trusted_and_bumps() {
        let (_dir, reg) = registry();
        reg.upsert(pending("n1")).await.unwrap();

        reg.approve("n1", "me").await.unwrap();
        let rec = reg.get("n1").await.unwrap();
        assert_eq!(rec.trust_status, TrustStatus::Trusted);
        assert!(rec.registered_at > 100.0, "approval must refresh registered_at");
    }

    #[tokio::test]
    async fn approve_rejects_self_and_kicked() {
        let (_dir, reg) = registry();
        let mut rec = pending("n1");
        rec.trust_status = TrustStatus::Kicked;
        rec.kicked_at = Some(clock::now());
        reg.upsert(rec).await.unwrap();

        assert!(matches!(
            reg.approve("me", "me").await,
            Err(PeerError::InvariantViolation(_))
        ));
        assert!(matches!(
            reg.approve("n1", "me").await,
            Err(PeerError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn reject_removes_only_pending() {
        let (_dir, reg) = registry();
        reg.upsert(pending("n1")).await.unwrap();
        reg.approve("n1", "me").await.unwrap();

        assert!(matches!(
            reg.reject("n1", "me").await,
            Err(PeerError::InvariantViolation(_))
        ));

        reg.upsert(pending("n2")).await.unwrap();
        reg.reject("n2", "me").await.unwrap();
        assert!(reg.get("n2").await.is_none());
    }

    #[tokio::test]
    async fn kick_marks_absorbing_state() {
        let (_dir, reg) = registry();
        reg.upsert(pending("n1")).await.unwrap();
        reg.approve("n1", "me").await.unwrap();

        reg.kick("n1", "me").await.unwrap();
        let rec = reg.get("n1").await.unwrap();
        assert_eq!(rec.trust_status, TrustStatus::Kicked);
        assert!(rec.kicked_at.is_some());

        // Idempotent
        reg.kick("n1", "me").await.unwrap();
    }

    #[tokio::test]
    async fn discovery_filters_by_trust_mode_and_reachability() {
        let (_dir, reg) = registry();

        let mut hub = pending("hub");
        hub.trust_status = TrustStatus::Trusted;
        reg.upsert(hub).await.unwrap();

        let mut natd = pending("natd");
        natd.trust_status = TrustStatus::Trusted;
        natd.connectable = false;
        reg.upsert(natd).await.unwrap();

        let mut relay = pending("relay");
        relay.trust_status = TrustStatus::Trusted;
        relay.mode = NodeMode::Relay;
        reg.upsert(relay).await.unwrap();

        reg.upsert(pending("applicant")).await.unwrap();

        let peers = reg.discover_trusted_connectable_peers("me").await;
        let ids: Vec<&str> = peers.iter().map(|p| p.node_id.as_str()).collect();
        assert_eq!(ids, vec!["hub"]);

        // Self is excluded even when trusted and connectable.
        let peers = reg.discover_trusted_connectable_peers("hub").await;
        assert!(peers.is_empty());
    }
}
