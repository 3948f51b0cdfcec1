//! Composition root.
//!
//! Everything is built here, once, during bootstrap, and handed to the HTTP
//! layer as one `Arc<Core>`. There are no globals: handlers and loops reach
//! services through this struct.

use std::sync::Arc;

use crate::auth::AuthService;
use crate::collector::Collector;
use crate::config::ServerConfig;
use crate::cursors::SyncCursors;
use crate::engine::SyncEngine;
use crate::hub::ChatHub;
use crate::identity::NodeIdentity;
use crate::join::JoinCoordinator;
use crate::registry::TrustRegistry;
use crate::rpc::PeerClient;
use crate::store::Store;
use crate::tasks::{Executor, TaskQueue};

pub struct Core {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub identity: Arc<NodeIdentity>,
    pub registry: Arc<TrustRegistry>,
    pub cursors: Arc<SyncCursors>,
    pub client: Arc<PeerClient>,
    pub hub: Arc<ChatHub>,
    pub engine: Arc<SyncEngine>,
    pub join: Arc<JoinCoordinator>,
    pub tasks: Arc<TaskQueue>,
    pub auth: Arc<AuthService>,
    pub started_at: std::time::Instant,
}

impl Core {
    /// Build every service. Errors here are fatal bootstrap failures; the
    /// process must not come up half-initialized.
    pub async fn bootstrap(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(Store::open(&config.data_dir)?);
        let identity = Arc::new(NodeIdentity::bootstrap(&config, Arc::clone(&store)).await?);

        let registry = Arc::new(TrustRegistry::new(Arc::clone(&store)));
        registry
            .register_self(&identity)
            .await
            .map_err(|e| anyhow::anyhow!("cannot register self record: {e}"))?;

        let cursors = Arc::new(SyncCursors::new(Arc::clone(&store)));
        let client = Arc::new(PeerClient::new(Arc::clone(&identity), config.peer_timeout));
        let hub = Arc::new(ChatHub::new(
            Arc::clone(&store),
            Arc::clone(&identity),
            Arc::clone(&registry),
            Arc::clone(&client),
            config.chat_max_messages,
        ));
        let tasks = Arc::new(TaskQueue::new());

        let engine = SyncEngine::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&identity),
            Arc::clone(&registry),
            Arc::clone(&cursors),
            Arc::clone(&client),
            Arc::clone(&hub),
            Arc::clone(&tasks),
            Arc::new(Executor),
            Arc::new(Collector::new()),
        );

        let join = JoinCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&identity),
            Arc::clone(&registry),
            Arc::clone(&client),
            Arc::clone(&engine),
            config.heartbeat_interval,
        );

        let auth = Arc::new(AuthService::bootstrap(&store).await?);

        tracing::info!(
            node = identity.node_id(),
            name = identity.name(),
            mode = identity.mode().as_str(),
            connectable = identity.connectable(),
            "node identity ready"
        );

        Ok(Arc::new(Self {
            config,
            store,
            identity,
            registry,
            cursors,
            client,
            hub,
            engine,
            join,
            tasks,
            auth,
            started_at: std::time::Instant::now(),
        }))
    }

    /// Start the background loops. Separate from bootstrap so tests can
    /// drive a fully built core by hand.
    pub async fn start(&self) {
        self.engine.start().await;
        self.join.resume_pending().await;
    }

    pub async fn shutdown(&self) {
        self.join.stop().await;
        self.engine.stop().await;
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
