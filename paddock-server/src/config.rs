//! Node configuration.
//!
//! One clap-derive struct parsed in `main`; every knob also has a
//! `PADDOCK_*` environment fallback so containers can configure the node
//! without a wrapper script.

use std::path::PathBuf;

use clap::Parser;

/// Mode as configured. `Auto` resolves at startup: a configured
/// `primary_server` selects relay, otherwise the node runs full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfiguredMode {
    Full,
    Relay,
    Auto,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "paddock-server", about = "Peer-to-peer control-plane mesh node")]
pub struct ServerConfig {
    /// Listen address for the HTTP/WebSocket server
    #[arg(long, env = "PADDOCK_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port
    #[arg(long, env = "PADDOCK_PORT", default_value_t = 8300)]
    pub port: u16,

    /// Node id; generated as `<hostname>-<4 hex>` on first boot when unset
    #[arg(long, env = "PADDOCK_NODE_ID")]
    pub node_id: Option<String>,

    /// Display name; defaults to the hostname
    #[arg(long, env = "PADDOCK_NODE_NAME")]
    pub node_name: Option<String>,

    /// Operating mode
    #[arg(long, value_enum, env = "PADDOCK_MODE", default_value = "auto")]
    pub mode: ConfiguredMode,

    /// The node is reachable from outside its LAN (makes a Full node a hub)
    #[arg(long, env = "PADDOCK_CONNECTABLE")]
    pub connectable: bool,

    /// Public base URL peers should use to reach this node
    #[arg(long, env = "PADDOCK_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Hub URL a relay reports to; its presence selects relay under `auto`
    #[arg(long, env = "PADDOCK_PRIMARY_SERVER")]
    pub primary_server: Option<String>,

    /// Data directory for the document store
    #[arg(long, env = "PADDOCK_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Gossip base period in seconds (scaled by log2 of the hub count)
    #[arg(long, env = "PADDOCK_SYNC_INTERVAL", default_value_t = 30.0)]
    pub sync_interval: f64,

    /// Heartbeat and self-state period in seconds
    #[arg(long, env = "PADDOCK_HEARTBEAT_INTERVAL", default_value_t = 10.0)]
    pub heartbeat_interval: f64,

    /// Timeout for a single outbound peer call, in seconds
    #[arg(long, env = "PADDOCK_PEER_TIMEOUT", default_value_t = 10.0)]
    pub peer_timeout: f64,

    /// Peers contacted per gossip round
    #[arg(long, env = "PADDOCK_MAX_FANOUT", default_value_t = 3)]
    pub max_fanout: usize,

    /// Consecutive all-failed rounds before failover
    #[arg(long, env = "PADDOCK_MAX_HEARTBEAT_FAILURES", default_value_t = 3)]
    pub max_heartbeat_failures: u32,

    /// Chat history cap applied after every append and merge
    #[arg(long, env = "PADDOCK_CHAT_MAX_MESSAGES", default_value_t = 500)]
    pub chat_max_messages: usize,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServerConfig::parse_from(["paddock-server"]);
        assert_eq!(cfg.port, 8300);
        assert_eq!(cfg.sync_interval, 30.0);
        assert_eq!(cfg.heartbeat_interval, 10.0);
        assert_eq!(cfg.peer_timeout, 10.0);
        assert_eq!(cfg.max_fanout, 3);
        assert_eq!(cfg.max_heartbeat_failures, 3);
        assert_eq!(cfg.chat_max_messages, 500);
        assert_eq!(cfg.mode, ConfiguredMode::Auto);
        assert!(!cfg.connectable);
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = ServerConfig::parse_from([
            "paddock-server",
            "--mode",
            "relay",
            "--primary-server",
            "http://hub:8300",
            "--heartbeat-interval",
            "0.5",
        ]);
        assert_eq!(cfg.mode, ConfiguredMode::Relay);
        assert_eq!(cfg.primary_server.as_deref(), Some("http://hub:8300"));
        assert_eq!(cfg.heartbeat_interval, 0.5);
    }
}
