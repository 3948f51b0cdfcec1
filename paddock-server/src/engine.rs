//! Role-dependent synchronization engine.
//!
//! Exactly one main loop runs at a time, chosen by role:
//!
//! - Hub Full (connectable): `gossip_loop`, a random bounded fan-out of
//!   bidirectional syncs, period stretched by log2 of the hub count.
//! - NAT'd Full: `active_sync_loop`, outbound sync with every hub each
//!   round.
//! - Relay: `heartbeat_loop`, reporting to the first reachable hub and
//!   downloading the global view and queued tasks.
//!
//! A self-state loop runs unconditionally and republishes this node's
//! liveness every heartbeat interval. When a relay exhausts
//! `max_heartbeat_failures` consecutive all-failed rounds it promotes
//! itself to temp-full, swaps its main loop, and starts a recovery watcher
//! that demotes it as soon as any hub answers a handshake again.
//!
//! Loops never exit on transient errors; a failed iteration logs and waits
//! one interval.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::task::{JoinHandle, JoinSet};

use crate::clock;
use crate::collector::Collector;
use crate::config::ServerConfig;
use crate::cursors::SyncCursors;
use crate::error::PeerError;
use crate::hub::ChatHub;
use crate::identity::NodeIdentity;
use crate::merge;
use crate::registry::TrustRegistry;
use crate::rpc::PeerClient;
use crate::store::{CHAT_DOC, NODES_DOC, SNIPPETS_DOC, STATES_DOC, SYNC_META_DOC, Store};
use crate::tasks::{Executor, TaskQueue, TaskSpec};
use crate::types::{
    ChatMessage, NodeRecord, NodeState, NodeStatus, NodesDoc, Snippet, StatesDoc,
};
use crate::wire::{
    HeartbeatRequest, HeartbeatResponse, SyncRequest, SyncResponse, TriggerSyncReport,
};

pub struct SyncEngine {
    config: ServerConfig,
    store: Arc<Store>,
    identity: Arc<NodeIdentity>,
    registry: Arc<TrustRegistry>,
    cursors: Arc<SyncCursors>,
    client: Arc<PeerClient>,
    hub: Arc<ChatHub>,
    tasks: Arc<TaskQueue>,
    executor: Arc<Executor>,
    collector: Arc<Collector>,

    /// Locally monotonic document version, bumped with every self-state
    /// write and raised to the max seen from peers.
    version: AtomicU64,
    heartbeat_failures: AtomicU32,
    running: AtomicBool,

    main_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    state_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    recovery_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Result of merging one remote delta into the local documents.
struct Applied {
    nodes: NodesDoc,
    states: StatesDoc,
    chat: Vec<ChatMessage>,
    snippets: Vec<Snippet>,
    /// Chat messages the merge introduced, for local fan-out.
    fresh_chat: Vec<ChatMessage>,
}

impl SyncEngine {
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        identity: Arc<NodeIdentity>,
        registry: Arc<TrustRegistry>,
        cursors: Arc<SyncCursors>,
        client: Arc<PeerClient>,
        hub: Arc<ChatHub>,
        tasks: Arc<TaskQueue>,
        executor: Arc<Executor>,
        collector: Arc<Collector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            identity,
            registry,
            cursors,
            client,
            hub,
            tasks,
            executor,
            collector,
            version: AtomicU64::new(0),
            heartbeat_failures: AtomicU32::new(0),
            running: AtomicBool::new(false),
            main_task: tokio::sync::Mutex::new(None),
            state_task: tokio::sync::Mutex::new(None),
            recovery_task: tokio::sync::Mutex::new(None),
        })
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::Relaxed);

        if !self.store.exists(SYNC_META_DOC).await {
            let _ = self.store.write(SYNC_META_DOC, &serde_json::json!({})).await;
        }

        self.update_self_state().await;

        let engine = Arc::clone(self);
        *self.state_task.lock().await = Some(tokio::spawn(engine.self_state_loop()));

        self.spawn_main_loop().await;
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        for slot in [&self.main_task, &self.state_task, &self.recovery_task] {
            if let Some(handle) = slot.lock().await.take() {
                handle.abort();
                let _ = handle.await;
            }
        }
        tracing::info!("sync engine stopped");
    }

    /// Replace the main loop after a role or reachability change. The
    /// self-state loop is untouched; the failure counter starts over.
    pub async fn restart(self: &Arc<Self>) {
        if let Some(handle) = self.main_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.heartbeat_failures.store(0, Ordering::Relaxed);
        self.spawn_main_loop().await;
    }

    fn spawn_main_loop(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let engine = Arc::clone(self);
            let handle = if self.identity.is_full() && self.identity.connectable() {
                tracing::info!("starting gossip loop (hub)");
                tokio::spawn(engine.gossip_loop())
            } else if self.identity.is_full() {
                tracing::info!("starting active sync loop (not connectable)");
                tokio::spawn(engine.active_sync_loop())
            } else {
                tracing::info!("starting heartbeat loop (relay)");
                tokio::spawn(engine.heartbeat_loop())
            };
            *self.main_task.lock().await = Some(handle);
        })
    }

    // ── Gossip (Hub Full) ──────────────────────────────────────────────

    async fn gossip_loop(self: Arc<Self>) {
        let base = self.config.sync_interval;
        let max_fanout = self.config.max_fanout.max(1);

        while self.running() {
            let peers = self
                .registry
                .discover_trusted_connectable_peers(self.identity.node_id())
                .await;
            let hub_count = peers.len();
            // Larger meshes gossip a little slower; coverage comes from the
            // random fan-out, not the frequency.
            let interval = base + (hub_count.max(1) as f64).log2() * 5.0;

            if !peers.is_empty() {
                let selected: Vec<NodeRecord> = {
                    let mut rng = rand::thread_rng();
                    peers
                        .choose_multiple(&mut rng, max_fanout.min(hub_count))
                        .cloned()
                        .collect()
                };
                tracing::debug!(
                    fanout = selected.len(),
                    hubs = hub_count,
                    interval_secs = interval,
                    "gossip round"
                );

                let mut set = JoinSet::new();
                for peer in selected {
                    let engine = Arc::clone(&self);
                    set.spawn(async move {
                        if let Err(e) = engine.sync_with_peer(&peer).await {
                            tracing::warn!(peer = %peer.node_id, "gossip sync failed: {e}");
                            engine.mark_offline(&peer.node_id).await;
                        }
                    });
                }
                while set.join_next().await.is_some() {}
            }

            tokio::time::sleep(Duration::from_secs_f64(interval)).await;
        }
    }

    // ── Active sync (NAT'd Full) ───────────────────────────────────────

    async fn active_sync_loop(self: Arc<Self>) {
        let interval = self.config.sync_interval;
        let max_failures = self.config.max_heartbeat_failures;

        while self.running() {
            let peers = self
                .registry
                .discover_trusted_connectable_peers(self.identity.node_id())
                .await;

            if peers.is_empty() {
                tracing::debug!("no trusted connectable peers yet, waiting");
                tokio::time::sleep(Duration::from_secs_f64(interval)).await;
                continue;
            }

            let mut any_success = false;
            for peer in &peers {
                match self.sync_with_peer(peer).await {
                    Ok(()) => any_success = true,
                    Err(e) => tracing::debug!(peer = %peer.node_id, "active sync failed: {e}"),
                }
            }

            if any_success {
                self.heartbeat_failures.store(0, Ordering::Relaxed);
            } else {
                let failures = self.heartbeat_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(failures, max_failures, "active sync round failed entirely");
                if failures >= max_failures && self.failover().await {
                    return;
                }
            }

            tokio::time::sleep(Duration::from_secs_f64(interval)).await;
        }
    }

    // ── Heartbeat (Relay) ──────────────────────────────────────────────

    async fn heartbeat_loop(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval;
        let max_failures = self.config.max_heartbeat_failures;

        while self.running() {
            let peers = self
                .registry
                .discover_trusted_connectable_peers(self.identity.node_id())
                .await;

            if peers.is_empty() {
                tracing::debug!("no trusted connectable peers yet, waiting");
                tokio::time::sleep(Duration::from_secs_f64(interval)).await;
                continue;
            }

            let mut any_success = false;
            for peer in &peers {
                if self.send_heartbeat(peer).await {
                    any_success = true;
                    break;
                }
            }

            if any_success {
                self.heartbeat_failures.store(0, Ordering::Relaxed);
            } else {
                let failures = self.heartbeat_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(failures, max_failures, "heartbeat round failed entirely");
                if failures >= max_failures && self.failover().await {
                    return;
                }
            }

            tokio::time::sleep(Duration::from_secs_f64(interval)).await;
        }
    }

    // ── Failover ───────────────────────────────────────────────────────

    /// Called when the failure threshold is crossed. Returns true when the
    /// role changed and the calling loop must exit: a relay promotes to
    /// temp-full and hands over to a full-capability loop. A NAT'd full
    /// node has no role to change; it keeps retrying.
    fn failover(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            tracing::warn!("every known trusted connectable peer is unreachable");
            self.heartbeat_failures.store(0, Ordering::Relaxed);

            if !self.identity.is_relay() {
                tracing::warn!("keeping full mode, will retry next round");
                return false;
            }

            self.identity.promote_to_temp_full().await;

            let handle = if self.identity.connectable() {
                let engine = Arc::clone(self);
                tokio::spawn(engine.gossip_loop())
            } else {
                tracing::warn!("temp-full without public reachability, running isolated");
                let engine = Arc::clone(self);
                tokio::spawn(engine.active_sync_loop())
            };
            *self.main_task.lock().await = Some(handle);

            let watcher = Arc::clone(self);
            *self.recovery_task.lock().await = Some(tokio::spawn(watcher.watch_recovery()));
            true
        })
    }

    /// Poll handshake on every hub until one answers, then demote back to
    /// the original role and restore its loop.
    async fn watch_recovery(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval;

        while self.running() && self.identity.is_temp_full() {
            tokio::time::sleep(Duration::from_secs_f64(interval)).await;

            let peers = self
                .registry
                .discover_trusted_connectable_peers(self.identity.node_id())
                .await;
            for peer in peers {
                if self.client.handshake(&peer.url()).await.is_ok() {
                    tracing::info!(peer = %peer.node_id, "hub reachable again, ending temp-full");
                    self.identity.demote_from_temp_full().await;
                    self.restart().await;
                    return;
                }
            }
        }
    }

    // ── Self state ─────────────────────────────────────────────────────

    async fn self_state_loop(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval;
        loop {
            tokio::time::sleep(Duration::from_secs_f64(interval)).await;
            if !self.running() {
                return;
            }
            self.update_self_state().await;
        }
    }

    pub async fn update_self_state(&self) {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let state = NodeState {
            node_id: self.identity.node_id().to_string(),
            status: NodeStatus::Online,
            last_seen: clock::now(),
            system_info: self.collector.snapshot(),
            version,
            extra: serde_json::Map::new(),
        };
        let result = self
            .store
            .update(STATES_DOC, StatesDoc::new(), move |mut states| {
                states.insert(state.node_id.clone(), state);
                states
            })
            .await;
        if let Err(e) = result {
            tracing::error!("self state update failed: {e}");
        }
    }

    async fn mark_offline(&self, node_id: &str) {
        let id = node_id.to_string();
        let result = self
            .store
            .update(STATES_DOC, StatesDoc::new(), move |mut states| {
                if let Some(state) = states.get_mut(&id) {
                    state.status = NodeStatus::Offline;
                }
                states
            })
            .await;
        if let Err(e) = result {
            tracing::error!(node = node_id, "offline mark failed: {e}");
        }
    }

    // ── One exchange ───────────────────────────────────────────────────

    /// Bidirectional incremental sync with one peer. The cursor advances to
    /// the clock taken before the request was built, and only on success.
    pub async fn sync_with_peer(self: &Arc<Self>, peer: &NodeRecord) -> Result<(), PeerError> {
        let peer_id = peer.node_id.clone();
        let url = peer.url();

        let since = self.cursors.get(&peer_id).await;
        let sync_start = clock::now();

        let nodes: NodesDoc = self.store.read(NODES_DOC, NodesDoc::new()).await;
        let states: StatesDoc = self.store.read(STATES_DOC, StatesDoc::new()).await;
        let chat: Vec<ChatMessage> = self.store.read(CHAT_DOC, Vec::new()).await;
        let snippets: Vec<Snippet> = self.store.read(SNIPPETS_DOC, Vec::new()).await;

        let req = SyncRequest {
            node_id: self.identity.node_id().to_string(),
            since,
            nodes: filter_nodes_since(&nodes, since),
            states: filter_states_since(&states, since),
            chat: filter_chat_since(&chat, since),
            snippets: filter_snippets_since(&snippets, since),
            system_info: (!self.identity.connectable()).then(|| self.collector.snapshot()),
        };

        let resp = self.client.sync(&url, &req).await?;

        let applied = self
            .apply_remote_delta(resp.nodes, resp.states, resp.chat, resp.snippets)
            .await?;
        if !applied.fresh_chat.is_empty() {
            self.hub.broadcast_many(&applied.fresh_chat);
        }

        self.version.fetch_max(resp.current_version, Ordering::Relaxed);
        self.cursors.set(&peer_id, sync_start).await;

        tracing::debug!(
            peer = %peer_id,
            sent_nodes = req.nodes.len(),
            sent_chat = req.chat.len(),
            got_chat = applied.fresh_chat.len(),
            "incremental sync complete"
        );
        Ok(())
    }

    /// One relay heartbeat. Returns success; on failure the drained task
    /// results go back into the outbox for the next attempt.
    pub async fn send_heartbeat(self: &Arc<Self>, peer: &NodeRecord) -> bool {
        let peer_id = peer.node_id.clone();
        let url = peer.url();

        let since = self.cursors.get(&peer_id).await;
        let sync_start = clock::now();
        let task_results = self.tasks.take_outbox();

        let req = HeartbeatRequest {
            node_id: self.identity.node_id().to_string(),
            mode: self.identity.mode(),
            since,
            system_info: self.collector.snapshot(),
            task_results: task_results.clone(),
        };

        match self.client.heartbeat(&url, &req).await {
            Ok(resp) => {
                match self
                    .apply_remote_delta(resp.nodes, resp.states, resp.chat, resp.snippets)
                    .await
                {
                    Ok(applied) => {
                        if !applied.fresh_chat.is_empty() {
                            self.hub.broadcast_many(&applied.fresh_chat);
                        }
                    }
                    Err(e) => tracing::error!(peer = %peer_id, "heartbeat merge failed: {e}"),
                }

                for spec in resp.tasks {
                    self.spawn_relay_task(spec);
                }

                self.version.fetch_max(resp.current_version, Ordering::Relaxed);
                self.cursors.set(&peer_id, sync_start).await;
                tracing::debug!(peer = %peer_id, since, "heartbeat delivered");
                resp.accepted
            }
            Err(e) => {
                self.tasks.requeue_results(task_results);
                tracing::debug!(peer = %peer_id, "heartbeat failed: {e}");
                false
            }
        }
    }

    fn spawn_relay_task(self: &Arc<Self>, spec: TaskSpec) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(task = %spec.task_id, "executing task from hub");
            let result = engine.executor.run(&spec).await;
            engine.tasks.push_result(result);
        });
    }

    // ── Merging ────────────────────────────────────────────────────────

    /// Merge a remote delta into the store, one document at a time, each
    /// under its own lock. Returns the merged documents plus the chat
    /// messages the merge introduced.
    async fn apply_remote_delta(
        &self,
        nodes: NodesDoc,
        states: StatesDoc,
        chat: Vec<ChatMessage>,
        snippets: Vec<Snippet>,
    ) -> Result<Applied, PeerError> {
        let merged_nodes = self
            .store
            .update(NODES_DOC, NodesDoc::new(), move |local| {
                merge::merge_nodes(&local, &nodes)
            })
            .await?;
        let merged_states = self
            .store
            .update(STATES_DOC, StatesDoc::new(), move |local| {
                merge::merge_states(&local, &states)
            })
            .await?;

        let cap = self.config.chat_max_messages;
        let mut fresh_chat = Vec::new();
        let fresh_ref = &mut fresh_chat;
        let merged_chat = self
            .store
            .update(CHAT_DOC, Vec::new(), move |local: Vec<ChatMessage>| {
                let merged = merge::merge_chat(&local, &chat, cap);
                *fresh_ref = merge::new_messages(&local, &merged);
                merged
            })
            .await?;

        let merged_snippets = self
            .store
            .update(SNIPPETS_DOC, Vec::new(), move |local: Vec<Snippet>| {
                merge::merge_snippets(&local, &snippets)
            })
            .await?;

        Ok(Applied {
            nodes: merged_nodes,
            states: merged_states,
            chat: merged_chat,
            snippets: merged_snippets,
            fresh_chat,
        })
    }

    // ── Inbound handlers (called by the peer API) ──────────────────────

    /// Handle an inbound sync: merge the caller's deltas, fan newly learned
    /// chat out locally, answer with our deltas computed from the *merged*
    /// state against the caller's cursor.
    pub async fn handle_sync(&self, req: SyncRequest) -> Result<SyncResponse, PeerError> {
        let applied = self
            .apply_remote_delta(req.nodes, req.states, req.chat, req.snippets)
            .await?;
        if !applied.fresh_chat.is_empty() {
            self.hub.broadcast_many(&applied.fresh_chat);
        }

        Ok(SyncResponse {
            node_id: self.identity.node_id().to_string(),
            current_version: self.version(),
            nodes: filter_nodes_since(&applied.nodes, req.since),
            states: filter_states_since(&applied.states, req.since),
            chat: filter_chat_since(&applied.chat, req.since),
            snippets: filter_snippets_since(&applied.snippets, req.since),
        })
    }

    /// Handle an inbound relay heartbeat: refresh the (already verified)
    /// sender's liveness and mode, ingest its task results, and answer with
    /// the global view plus whatever tasks are queued for it.
    pub async fn handle_heartbeat(
        &self,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, PeerError> {
        let sender = req.node_id.clone();
        let version = self.version();

        let state = NodeState {
            node_id: sender.clone(),
            status: NodeStatus::Online,
            last_seen: clock::now(),
            system_info: req.system_info.clone(),
            version,
            extra: serde_json::Map::new(),
        };
        self.store
            .update(STATES_DOC, StatesDoc::new(), move |mut states| {
                states.insert(state.node_id.clone(), state);
                states
            })
            .await?;

        // Propagate a mode change (relay ↔ temp-full) through the mesh.
        let mode = req.mode;
        let sender_for_update = sender.clone();
        self.store
            .update(NODES_DOC, NodesDoc::new(), move |mut nodes| {
                if let Some(rec) = nodes.get_mut(&sender_for_update)
                    && rec.mode != mode
                {
                    rec.mode = mode;
                    rec.registered_at = clock::bump(rec.registered_at);
                }
                nodes
            })
            .await?;

        if !req.task_results.is_empty() {
            self.tasks.ingest_results(&sender, &req.task_results);
        }

        let nodes: NodesDoc = self.store.read(NODES_DOC, NodesDoc::new()).await;
        let states: StatesDoc = self.store.read(STATES_DOC, StatesDoc::new()).await;
        let chat: Vec<ChatMessage> = self.store.read(CHAT_DOC, Vec::new()).await;
        let snippets: Vec<Snippet> = self.store.read(SNIPPETS_DOC, Vec::new()).await;

        Ok(HeartbeatResponse {
            accepted: true,
            nodes: filter_nodes_since(&nodes, req.since),
            states: filter_states_since(&states, req.since),
            chat: filter_chat_since(&chat, req.since),
            snippets: filter_snippets_since(&snippets, req.since),
            current_version: self.version(),
            tasks: self.tasks.drain_for(&sender),
        })
    }

    // ── Manual trigger ─────────────────────────────────────────────────

    /// One immediate sync/heartbeat round, for the UI's "sync now" button.
    pub async fn trigger_sync_now(self: &Arc<Self>) -> TriggerSyncReport {
        let peers = self
            .registry
            .discover_trusted_connectable_peers(self.identity.node_id())
            .await;
        let mode = self.identity.mode();

        if peers.is_empty() {
            return TriggerSyncReport {
                success: false,
                mode,
                synced_peers: 0,
                failed_peers: 0,
                total_peers: 0,
                elapsed: 0.0,
                message: "no trusted connectable peers discovered".into(),
            };
        }

        let start = clock::now();
        let mut synced = 0;
        let mut failed = 0;

        if self.identity.is_full() {
            for peer in &peers {
                match self.sync_with_peer(peer).await {
                    Ok(()) => synced += 1,
                    Err(e) => {
                        tracing::debug!(peer = %peer.node_id, "manual sync failed: {e}");
                        failed += 1;
                    }
                }
            }
        } else {
            for peer in &peers {
                if self.send_heartbeat(peer).await {
                    synced += 1;
                    break;
                }
                failed += 1;
            }
        }

        self.update_self_state().await;

        let elapsed = ((clock::now() - start) * 100.0).round() / 100.0;
        TriggerSyncReport {
            success: synced > 0,
            mode,
            synced_peers: synced,
            failed_peers: failed,
            total_peers: peers.len(),
            elapsed,
            message: if synced > 0 {
                format!("synced with {synced} peer(s)")
            } else {
                "every peer failed".into()
            },
        }
    }
}

// ── Delta filters ──────────────────────────────────────────────────────

pub fn filter_nodes_since(nodes: &NodesDoc, since: f64) -> NodesDoc {
    if since <= 0.0 {
        return nodes.clone();
    }
    nodes
        .iter()
        .filter(|(_, n)| n.registered_at > since)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub fn filter_states_since(states: &StatesDoc, since: f64) -> StatesDoc {
    if since <= 0.0 {
        return states.clone();
    }
    states
        .iter()
        .filter(|(_, s)| s.last_seen > since)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub fn filter_chat_since(chat: &[ChatMessage], since: f64) -> Vec<ChatMessage> {
    if since <= 0.0 {
        return chat.to_vec();
    }
    chat.iter().filter(|m| m.timestamp > since).cloned().collect()
}

pub fn filter_snippets_since(snippets: &[Snippet], since: f64) -> Vec<Snippet> {
    if since <= 0.0 {
        return snippets.to_vec();
    }
    snippets
        .iter()
        .filter(|s| s.updated_at > since)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrustStatus;
    use clap::Parser;

    async fn test_engine(extra_args: &[&str]) -> (tempfile::TempDir, Arc<SyncEngine>) {
        let dir = tempfile::tempdir().unwrap();
        let mut args = vec![
            "paddock-server".to_string(),
            "--data-dir".to_string(),
            dir.path().to_string_lossy().to_string(),
        ];
        args.extend(extra_args.iter().map(|s| s.to_string()));
        let config = ServerConfig::parse_from(args);

        let store = Arc::new(Store::open(&config.data_dir).unwrap());
        let identity = Arc::new(
            NodeIdentity::bootstrap(&config, Arc::clone(&store))
                .await
                .unwrap(),
        );
        let registry = Arc::new(TrustRegistry::new(Arc::clone(&store)));
        registry.register_self(&identity).await.unwrap();
        let cursors = Arc::new(SyncCursors::new(Arc::clone(&store)));
        let client = Arc::new(PeerClient::new(Arc::clone(&identity), config.peer_timeout));
        let hub = Arc::new(ChatHub::new(
            Arc::clone(&store),
            Arc::clone(&identity),
            Arc::clone(&registry),
            Arc::clone(&client),
            config.chat_max_messages,
        ));
        let engine = SyncEngine::new(
            config,
            store,
            identity,
            registry,
            cursors,
            client,
            hub,
            Arc::new(TaskQueue::new()),
            Arc::new(Executor),
            Arc::new(Collector::new()),
        );
        (dir, engine)
    }

    fn remote_record(id: &str, registered_at: f64) -> NodeRecord {
        serde_json::from_value(serde_json::json!({
            "node_id": id,
            "name": id,
            "mode": "full",
            "connectable": true,
            "host": "127.0.0.1",
            "port": 8300,
            "registered_at": registered_at,
            "public_key": "02bb",
            "trust_status": "trusted",
        }))
        .unwrap()
    }

    fn message(id: &str, ts: f64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            node_id: "remote".into(),
            node_name: "remote".into(),
            content: "hello".into(),
            timestamp: ts,
            client_id: None,
            status: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn delta_filters_honor_since() {
        let mut nodes = NodesDoc::new();
        nodes.insert("old".into(), remote_record("old", 100.0));
        nodes.insert("new".into(), remote_record("new", 200.0));

        let delta = filter_nodes_since(&nodes, 150.0);
        assert!(delta.contains_key("new") && !delta.contains_key("old"));

        // since = 0 means full state
        assert_eq!(filter_nodes_since(&nodes, 0.0).len(), 2);

        let chat = vec![message("a", 100.0), message("b", 200.0)];
        let delta = filter_chat_since(&chat, 150.0);
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].id, "b");
    }

    #[tokio::test]
    async fn handle_sync_merges_and_answers_with_merged_delta() {
        let (_dir, engine) = test_engine(&[]).await;

        // Local history the caller has never seen.
        engine
            .store
            .write(CHAT_DOC, &vec![message("local-old", 100.0), message("local-new", 900.0)])
            .await
            .unwrap();

        let mut req_nodes = NodesDoc::new();
        req_nodes.insert("joiner".into(), remote_record("joiner", 950.0));
        let req = SyncRequest {
            node_id: "remote".into(),
            since: 500.0,
            nodes: req_nodes,
            states: StatesDoc::new(),
            chat: vec![message("from-remote", 901.0)],
            snippets: vec![],
            system_info: None,
        };

        let resp = engine.handle_sync(req).await.unwrap();

        // The caller's record was merged into our document.
        let nodes = engine.registry.all().await;
        assert_eq!(nodes["joiner"].trust_status, TrustStatus::Trusted);

        // Response is delta-filtered by the request's cursor and computed
        // from the merged state: it includes the remote's own message back
        // (timestamp > since) and our new one, but not the old one.
        let ids: Vec<&str> = resp.chat.iter().map(|m| m.id.as_str()).collect();
        assert!(ids.contains(&"local-new"));
        assert!(ids.contains(&"from-remote"));
        assert!(!ids.contains(&"local-old"));

        // Our merged chat document now holds all three.
        let chat: Vec<ChatMessage> = engine.store.read(CHAT_DOC, Vec::new()).await;
        assert_eq!(chat.len(), 3);
    }

    #[tokio::test]
    async fn handle_heartbeat_updates_state_and_delivers_tasks() {
        let (_dir, engine) = test_engine(&[]).await;

        let mut relay = remote_record("relay-1", 100.0);
        relay.mode = crate::types::NodeMode::Relay;
        relay.connectable = false;
        engine.registry.upsert(relay).await.unwrap();

        engine.tasks.enqueue(
            "relay-1",
            TaskSpec {
                task_id: "t1".into(),
                command: "uptime".into(),
                timeout: 30.0,
                created_at: clock::now(),
                extra: serde_json::Map::new(),
            },
        );

        let resp = engine
            .handle_heartbeat(HeartbeatRequest {
                node_id: "relay-1".into(),
                mode: crate::types::NodeMode::Relay,
                since: 0.0,
                system_info: serde_json::json!({"cpu_percent": 1.0}),
                task_results: vec![],
            })
            .await
            .unwrap();

        assert!(resp.accepted);
        assert_eq!(resp.tasks.len(), 1);
        assert_eq!(resp.tasks[0].task_id, "t1");
        // Queue drained; a second heartbeat gets nothing.
        assert_eq!(engine.tasks.pending_count("relay-1"), 0);

        let states: StatesDoc = engine.store.read(STATES_DOC, StatesDoc::new()).await;
        assert_eq!(states["relay-1"].status, NodeStatus::Online);
        assert!(states["relay-1"].last_seen > 0.0);
    }

    #[tokio::test]
    async fn heartbeat_mode_change_bumps_registration() {
        let (_dir, engine) = test_engine(&[]).await;

        let mut relay = remote_record("relay-1", 100.0);
        relay.mode = crate::types::NodeMode::Relay;
        engine.registry.upsert(relay).await.unwrap();

        engine
            .handle_heartbeat(HeartbeatRequest {
                node_id: "relay-1".into(),
                mode: crate::types::NodeMode::TempFull,
                since: 0.0,
                system_info: serde_json::Value::Null,
                task_results: vec![],
            })
            .await
            .unwrap();

        let rec = engine.registry.get("relay-1").await.unwrap();
        assert_eq!(rec.mode, crate::types::NodeMode::TempFull);
        assert!(rec.registered_at > 100.0, "mode change must propagate");
    }

    #[tokio::test]
    async fn trigger_sync_without_peers_reports_failure() {
        let (_dir, engine) = test_engine(&[]).await;
        let report = engine.trigger_sync_now().await;
        assert!(!report.success);
        assert_eq!(report.total_peers, 0);
    }
}
