//! Shared data model for the four replicated documents.
//!
//! Every record carries a flattened `extra` map so fields written by a newer
//! binary survive a read-modify-write cycle on an older one (forward
//! compatibility on the wire and on disk).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `nodes` document: node_id → registration record.
pub type NodesDoc = BTreeMap<String, NodeRecord>;

/// The `states` document: node_id → liveness snapshot.
pub type StatesDoc = BTreeMap<String, NodeState>;

/// The `chat` document: messages ordered by timestamp.
pub type ChatDoc = Vec<ChatMessage>;

/// The `snippets` document: shared snippets including tombstones.
pub type SnippetsDoc = Vec<Snippet>;

fn is_false(v: &bool) -> bool {
    !*v
}

// ── Node registration ──────────────────────────────────────────────────

/// Node operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeMode {
    Full,
    Relay,
    /// Transient promotion applied when a constrained node loses every hub.
    TempFull,
}

impl NodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeMode::Full => "full",
            NodeMode::Relay => "relay",
            NodeMode::TempFull => "temp_full",
        }
    }
}

/// Trust lifecycle of a node record.
///
/// `Local` marks the one record describing this node itself; it is never
/// overwritten by remote input. `Kicked` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustStatus {
    #[serde(rename = "self")]
    Local,
    Pending,
    Trusted,
    WaitingApproval,
    Kicked,
}

impl TrustStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustStatus::Local => "self",
            TrustStatus::Pending => "pending",
            TrustStatus::Trusted => "trusted",
            TrustStatus::WaitingApproval => "waiting_approval",
            TrustStatus::Kicked => "kicked",
        }
    }
}

fn default_port() -> u16 {
    8300
}

fn default_mode() -> NodeMode {
    NodeMode::Full
}

fn default_trust() -> TrustStatus {
    TrustStatus::Pending
}

/// One entry of the `nodes` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_mode")]
    pub mode: NodeMode,
    #[serde(default)]
    pub connectable: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub public_url: String,
    /// Bumped on every local change to force propagation; monotonic per
    /// record (see `clock::bump`).
    #[serde(default)]
    pub registered_at: f64,
    /// Hex of the node's compressed secp256k1 public key.
    #[serde(default)]
    pub public_key: String,
    #[serde(default = "default_trust")]
    pub trust_status: TrustStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kicked_at: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl NodeRecord {
    /// Base URL a peer can be reached at: `public_url` when set, otherwise
    /// derived from `host`/`port`.
    pub fn url(&self) -> String {
        if !self.public_url.is_empty() {
            self.public_url.trim_end_matches('/').to_string()
        } else if !self.host.is_empty() {
            format!("http://{}:{}", self.host, self.port)
        } else {
            String::new()
        }
    }
}

// ── Liveness ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

/// One entry of the `states` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub last_seen: f64,
    /// Opaque Collector snapshot; never interpreted by the engine.
    #[serde(default)]
    pub system_info: Value,
    /// Locally monotonic per node.
    #[serde(default)]
    pub version: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// ── Chat ───────────────────────────────────────────────────────────────

/// Maximum accepted message length in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub node_id: String,
    #[serde(default)]
    pub node_name: String,
    pub content: String,
    pub timestamp: f64,
    /// Echo of the sender UI's optimistic-update id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

// ── Snippets ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SnippetCategory {
    Account,
    Server,
    Command,
    #[default]
    Note,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnippetField {
    pub key: String,
    #[serde(default)]
    pub value: String,
    /// Sensitive values are masked by the UI until revealed.
    #[serde(default)]
    pub sensitive: bool,
}

/// One shared snippet. Deletion is a tombstone (`_deleted = true`) so a
/// stale replica cannot resurrect it; read APIs filter tombstones out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snippet {
    pub id: String,
    #[serde(default)]
    pub category: SnippetCategory,
    pub title: String,
    #[serde(default)]
    pub fields: Vec<SnippetField>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub updated_at: f64,
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_status_wire_names() {
        assert_eq!(serde_json::to_string(&TrustStatus::Local).unwrap(), "\"self\"");
        assert_eq!(
            serde_json::to_string(&TrustStatus::WaitingApproval).unwrap(),
            "\"waiting_approval\""
        );
        let s: TrustStatus = serde_json::from_str("\"kicked\"").unwrap();
        assert_eq!(s, TrustStatus::Kicked);
    }

    #[test]
    fn unknown_fields_round_trip() {
        let raw = r#"{
            "node_id": "alpha-1a2b",
            "name": "alpha",
            "mode": "full",
            "connectable": true,
            "host": "10.0.0.1",
            "port": 8300,
            "registered_at": 1000.5,
            "trust_status": "trusted",
            "labels": {"rack": "r7"},
            "firmware": "v2"
        }"#;
        let rec: NodeRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(rec.extra.get("firmware").unwrap(), "v2");

        let back = serde_json::to_value(&rec).unwrap();
        assert_eq!(back["labels"]["rack"], "r7");
        assert_eq!(back["firmware"], "v2");
    }

    #[test]
    fn record_url_prefers_public_url() {
        let mut rec: NodeRecord =
            serde_json::from_str(r#"{"node_id":"n1","host":"10.0.0.2","port":9000}"#).unwrap();
        assert_eq!(rec.url(), "http://10.0.0.2:9000");
        rec.public_url = "https://mesh.example.com/".into();
        assert_eq!(rec.url(), "https://mesh.example.com");
    }

    #[test]
    fn tombstone_flag_uses_wire_name() {
        let raw = r#"{"id":"s1","title":"t","_deleted":true}"#;
        let s: Snippet = serde_json::from_str(raw).unwrap();
        assert!(s.deleted);
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["_deleted"], true);
    }
}
