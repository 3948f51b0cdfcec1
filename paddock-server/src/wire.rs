//! Wire schemas for peer RPC.
//!
//! All bodies are JSON. Delta fields default to empty so an older peer that
//! omits a section still decodes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tasks::{TaskResult, TaskSpec};
use crate::types::{ChatMessage, NodeMode, NodesDoc, Snippet, StatesDoc};

/// Public identity returned by `GET /peer/handshake` and sent as the body
/// of `POST /peer/join-request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeInfo {
    pub node_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "full_mode")]
    pub mode: NodeMode,
    #[serde(default)]
    pub connectable: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub public_url: String,
    #[serde(default)]
    pub public_key: String,
}

fn full_mode() -> NodeMode {
    NodeMode::Full
}

fn default_port() -> u16 {
    8300
}

/// `POST /peer/sync` request: the caller's deltas since its cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub node_id: String,
    #[serde(default)]
    pub since: f64,
    #[serde(default)]
    pub nodes: NodesDoc,
    #[serde(default)]
    pub states: StatesDoc,
    #[serde(default)]
    pub chat: Vec<ChatMessage>,
    #[serde(default)]
    pub snippets: Vec<Snippet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_info: Option<Value>,
}

/// `POST /peer/sync` response: the handler's deltas, computed from the
/// merged state using the request's `since`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub node_id: String,
    #[serde(default)]
    pub current_version: u64,
    #[serde(default)]
    pub nodes: NodesDoc,
    #[serde(default)]
    pub states: StatesDoc,
    #[serde(default)]
    pub chat: Vec<ChatMessage>,
    #[serde(default)]
    pub snippets: Vec<Snippet>,
}

/// `POST /peer/heartbeat` request (relay → hub).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    #[serde(default = "relay_mode")]
    pub mode: NodeMode,
    #[serde(default)]
    pub since: f64,
    #[serde(default)]
    pub system_info: Value,
    #[serde(default)]
    pub task_results: Vec<TaskResult>,
}

fn relay_mode() -> NodeMode {
    NodeMode::Relay
}

/// `POST /peer/heartbeat` response: global view plus queued tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub accepted: bool,
    #[serde(default)]
    pub nodes: NodesDoc,
    #[serde(default)]
    pub states: StatesDoc,
    #[serde(default)]
    pub chat: Vec<ChatMessage>,
    #[serde(default)]
    pub snippets: Vec<Snippet>,
    #[serde(default)]
    pub current_version: u64,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

/// `POST /peer/chat-push` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPushRequest {
    pub node_id: String,
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPushResponse {
    pub ok: bool,
}

/// Join outcome as reported by the approving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinDecision {
    Pending,
    Trusted,
    Kicked,
    /// No record of the asking node (e.g. rejected and removed).
    Unknown,
}

/// Response of `POST /peer/join-request` and `GET /peer/join-status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub status: JoinDecision,
    #[serde(default)]
    pub message: String,
    /// Snapshot of the network's trusted nodes, present once trusted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodesDoc>,
}

/// Summary returned by the manual trigger-sync endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSyncReport {
    pub success: bool,
    pub mode: NodeMode,
    pub synced_peers: usize,
    pub failed_peers: usize,
    pub total_peers: usize,
    #[serde(default)]
    pub elapsed: f64,
    #[serde(default)]
    pub message: String,
}
