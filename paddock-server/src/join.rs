//! Outbound join flow.
//!
//! Driven by the operator action "join the network at URL X":
//!
//! 1. handshake with the target to learn its id and public key,
//! 2. submit a join request carrying our public identity,
//! 3. save the target locally (`waiting_approval` or `trusted`),
//! 4. poll join-status until an operator decides.
//!
//! The coordinator survives restarts: startup scans the registry for a
//! `waiting_approval` record and resumes polling it.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::clock;
use crate::engine::SyncEngine;
use crate::error::PeerError;
use crate::identity::NodeIdentity;
use crate::registry::TrustRegistry;
use crate::rpc::PeerClient;
use crate::store::{NODES_DOC, Store};
use crate::types::{NodeRecord, NodesDoc, TrustStatus};
use crate::wire::JoinDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    None,
    Polling,
    Trusted,
    Kicked,
    Failed,
}

impl JoinPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinPhase::None => "none",
            JoinPhase::Polling => "polling",
            JoinPhase::Trusted => "trusted",
            JoinPhase::Kicked => "kicked",
            JoinPhase::Failed => "failed",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            JoinPhase::None => "no join request in flight",
            JoinPhase::Polling => "waiting for operator approval",
            JoinPhase::Trusted => "joined the network",
            JoinPhase::Kicked => "this node was kicked from the network",
            JoinPhase::Failed => "join failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinStatusView {
    pub status: &'static str,
    pub target_id: String,
    pub target_url: String,
    pub message: &'static str,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub status: JoinDecision,
    pub message: String,
    pub node: NodeRecord,
}

#[derive(Default)]
struct JoinState {
    target_id: String,
    target_url: String,
    phase: Option<JoinPhase>,
}

pub struct JoinCoordinator {
    state: parking_lot::Mutex<JoinState>,
    poll_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    store: Arc<Store>,
    identity: Arc<NodeIdentity>,
    registry: Arc<TrustRegistry>,
    client: Arc<PeerClient>,
    engine: Arc<SyncEngine>,
    poll_interval: f64,
}

impl JoinCoordinator {
    pub fn new(
        store: Arc<Store>,
        identity: Arc<NodeIdentity>,
        registry: Arc<TrustRegistry>,
        client: Arc<PeerClient>,
        engine: Arc<SyncEngine>,
        poll_interval: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: parking_lot::Mutex::new(JoinState::default()),
            poll_task: tokio::sync::Mutex::new(None),
            store,
            identity,
            registry,
            client,
            engine,
            poll_interval,
        })
    }

    pub fn status(&self) -> JoinStatusView {
        let state = self.state.lock();
        let phase = state.phase.unwrap_or(JoinPhase::None);
        JoinStatusView {
            status: phase.as_str(),
            target_id: state.target_id.clone(),
            target_url: state.target_url.clone(),
            message: phase.message(),
        }
    }

    /// Resume polling after a restart if a join was left half-done.
    pub async fn resume_pending(self: &Arc<Self>) {
        let nodes = self.registry.all().await;
        // One poll at a time; the first waiting record wins.
        if let Some(rec) = nodes
            .values()
            .find(|r| r.trust_status == TrustStatus::WaitingApproval)
        {
            let url = rec.url();
            if url.is_empty() {
                tracing::warn!(node = %rec.node_id, "waiting_approval record has no address, not resuming");
                return;
            }
            tracing::info!(node = %rec.node_id, url = %url, "resuming join polling");
            self.start_polling(rec.node_id.clone(), url).await;
        }
    }

    /// Execute the join flow against `raw_host` (bare host, `host:port`, or
    /// a full URL).
    pub async fn join_network(self: &Arc<Self>, raw_host: &str) -> Result<JoinOutcome, PeerError> {
        let target = parse_target(raw_host)?;
        let target_url = target.url();

        let remote = match self.client.handshake(&target_url).await {
            Ok(info) => info,
            Err(e) => {
                self.state.lock().phase = Some(JoinPhase::Failed);
                return Err(e);
            }
        };
        if remote.node_id.is_empty() {
            return Err(PeerError::Malformed("handshake without node_id".into()));
        }
        if remote.node_id == self.identity.node_id() {
            return Err(PeerError::InvariantViolation("cannot join self".into()));
        }

        let decision = match self
            .client
            .join_request(&target_url, &self.identity.handshake_info())
            .await
        {
            Ok(d) => d,
            Err(e) => {
                self.state.lock().phase = Some(JoinPhase::Failed);
                return Err(e);
            }
        };

        if decision.status == JoinDecision::Kicked {
            self.state.lock().phase = Some(JoinPhase::Kicked);
            return Err(PeerError::AuthRejected(
                "that network has kicked this node; it cannot rejoin".into(),
            ));
        }

        let trusted = decision.status == JoinDecision::Trusted;
        if trusted && let Some(snapshot) = decision.nodes.clone() {
            self.adopt_snapshot(snapshot).await?;
        }

        // Save the target itself, with the address we actually reached it at.
        let record = NodeRecord {
            node_id: remote.node_id.clone(),
            name: if remote.name.is_empty() {
                target.host.clone()
            } else {
                remote.name.clone()
            },
            mode: remote.mode,
            connectable: remote.connectable,
            host: target.host.clone(),
            port: target.port.unwrap_or(8300),
            public_url: if remote.public_url.is_empty() {
                target_url.clone()
            } else {
                remote.public_url.clone()
            },
            registered_at: clock::now(),
            public_key: remote.public_key.clone(),
            trust_status: if trusted {
                TrustStatus::Trusted
            } else {
                TrustStatus::WaitingApproval
            },
            kicked_at: None,
            extra: serde_json::Map::new(),
        };
        self.registry.upsert(record.clone()).await?;

        if trusted {
            tracing::info!(target = %remote.node_id, "already trusted by the network");
            {
                let mut state = self.state.lock();
                state.target_id = remote.node_id.clone();
                state.target_url = target_url.clone();
                state.phase = Some(JoinPhase::Trusted);
            }
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                engine.trigger_sync_now().await;
            });
            Ok(JoinOutcome {
                status: JoinDecision::Trusted,
                message: "joined the network".into(),
                node: record,
            })
        } else {
            tracing::info!(target = %remote.node_id, url = %target_url, "join request submitted, polling for approval");
            self.start_polling(remote.node_id, target_url).await;
            Ok(JoinOutcome {
                status: JoinDecision::Pending,
                message: "join request submitted, waiting for operator approval".into(),
                node: record,
            })
        }
    }

    async fn start_polling(self: &Arc<Self>, target_id: String, target_url: String) {
        {
            let mut state = self.state.lock();
            state.target_id = target_id;
            state.target_url = target_url;
            state.phase = Some(JoinPhase::Polling);
        }

        let mut slot = self.poll_task.lock().await;
        if let Some(old) = slot.take() {
            old.abort();
        }
        let coordinator = Arc::clone(self);
        *slot = Some(tokio::spawn(coordinator.poll_loop()));
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs_f64(self.poll_interval)).await;

            let (target_id, target_url) = {
                let state = self.state.lock();
                if state.phase != Some(JoinPhase::Polling) {
                    return;
                }
                (state.target_id.clone(), state.target_url.clone())
            };

            let resp = match self
                .client
                .join_status(
                    &target_url,
                    self.identity.node_id(),
                    self.identity.public_key_hex(),
                )
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::debug!(target = %target_id, "join-status poll failed: {e}");
                    continue;
                }
            };

            match resp.status {
                JoinDecision::Trusted => {
                    tracing::info!(target = %target_id, "join request approved");
                    if let Some(snapshot) = resp.nodes {
                        if let Err(e) = self.adopt_snapshot(snapshot).await {
                            tracing::error!("failed to adopt network snapshot: {e}");
                        }
                    }
                    self.mark_target_trusted(&target_id).await;
                    self.state.lock().phase = Some(JoinPhase::Trusted);
                    self.engine.trigger_sync_now().await;
                    return;
                }
                JoinDecision::Kicked => {
                    tracing::warn!(target = %target_id, "join request refused: node is kicked");
                    self.state.lock().phase = Some(JoinPhase::Kicked);
                    return;
                }
                other => {
                    tracing::debug!(target = %target_id, status = ?other, "still waiting for approval");
                }
            }
        }
    }

    /// Merge a trusted-nodes snapshot handed over at admission time. New
    /// entries arrive as trusted; records still marked `waiting_approval`
    /// are upgraded.
    async fn adopt_snapshot(&self, snapshot: NodesDoc) -> Result<(), PeerError> {
        let self_id = self.identity.node_id().to_string();
        self.store
            .update(NODES_DOC, NodesDoc::new(), move |mut nodes| {
                for (nid, mut info) in snapshot {
                    if nid == self_id {
                        continue;
                    }
                    let adopt = match nodes.get(&nid) {
                        None => true,
                        Some(existing) => {
                            existing.trust_status == TrustStatus::WaitingApproval
                        }
                    };
                    if adopt {
                        // The remote's own record arrives as `self`.
                        if matches!(info.trust_status, TrustStatus::Local) {
                            info.trust_status = TrustStatus::Trusted;
                        }
                        if info.trust_status == TrustStatus::Trusted {
                            nodes.insert(nid, info);
                        }
                    }
                }
                nodes
            })
            .await?;
        Ok(())
    }

    async fn mark_target_trusted(&self, target_id: &str) {
        let id = target_id.to_string();
        let result = self
            .store
            .update(NODES_DOC, NodesDoc::new(), move |mut nodes| {
                if let Some(rec) = nodes.get_mut(&id) {
                    rec.trust_status = TrustStatus::Trusted;
                    rec.registered_at = clock::bump(rec.registered_at);
                }
                nodes
            })
            .await;
        if let Err(e) = result {
            tracing::error!("failed to persist join approval: {e}");
        }
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.poll_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

// ── Target parsing ─────────────────────────────────────────────────────

struct ParsedTarget {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl ParsedTarget {
    fn url(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}", self.scheme, self.host, port),
            None => format!("{}://{}", self.scheme, self.host),
        }
    }
}

/// Accepts a bare host, `host:port`, or a full URL.
fn parse_target(raw: &str) -> Result<ParsedTarget, PeerError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(PeerError::InvariantViolation("host must not be empty".into()));
    }

    if raw.contains("://") {
        let parsed = url::Url::parse(raw)
            .map_err(|e| PeerError::InvariantViolation(format!("invalid URL: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| PeerError::InvariantViolation("URL has no host".into()))?
            .to_string();
        return Ok(ParsedTarget {
            scheme: parsed.scheme().to_string(),
            host,
            port: parsed.port(),
        });
    }

    // Bare `host` or `host:port` ([v6] literals keep their colons).
    if let Some((host, port)) = raw.rsplit_once(':')
        && !raw.starts_with('[')
        && let Ok(port) = port.parse::<u16>()
    {
        return Ok(ParsedTarget {
            scheme: "http".into(),
            host: host.to_string(),
            port: Some(port),
        });
    }

    Ok(ParsedTarget {
        scheme: "http".into(),
        host: raw.to_string(),
        port: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_host() {
        let t = parse_target("192.168.1.100").unwrap();
        assert_eq!(t.url(), "http://192.168.1.100");
    }

    #[test]
    fn parses_host_with_port() {
        let t = parse_target("192.168.1.100:9000").unwrap();
        assert_eq!(t.url(), "http://192.168.1.100:9000");
        assert_eq!(t.port, Some(9000));
    }

    #[test]
    fn parses_full_url() {
        let t = parse_target("https://mesh.example.com").unwrap();
        assert_eq!(t.url(), "https://mesh.example.com");

        let t = parse_target("http://10.1.2.3:8443/").unwrap();
        assert_eq!(t.url(), "http://10.1.2.3:8443");
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(parse_target("  ").is_err());
        assert!(parse_target("http://").is_err());
    }
}
