//! Error taxonomy for the mesh engine.
//!
//! Background loops never exit on `Transient` or `AuthRejected`; they count
//! consecutive failures and let the engine decide about failover. Handlers
//! convert everything non-fatal into a 4xx/5xx with an `{error}` body.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    /// Network timeout, 5xx from a peer, or a decode hiccup. Retried on the
    /// next tick.
    #[error("transient: {0}")]
    Transient(String),

    /// The peer answered 403. The body usually names the reason (unknown
    /// node, untrusted, kicked).
    #[error("rejected by peer: {0}")]
    AuthRejected(String),

    /// An inbound request failed hash, window, or signature checks.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// A state transition that the trust lifecycle forbids (approve a
    /// non-pending record, kick self, ...).
    #[error("{0}")]
    InvariantViolation(String),

    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage: {0}")]
    Storage(#[from] std::io::Error),

    #[error("encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PeerError {
    /// Classify a reqwest failure: status 403 is an auth rejection carrying
    /// the peer's reason, everything else is transient.
    pub fn from_http(status: Option<reqwest::StatusCode>, detail: String) -> Self {
        match status {
            Some(s) if s == reqwest::StatusCode::FORBIDDEN => PeerError::AuthRejected(detail),
            _ => PeerError::Transient(detail),
        }
    }
}

impl From<reqwest::Error> for PeerError {
    fn from(e: reqwest::Error) -> Self {
        PeerError::from_http(e.status(), e.to_string())
    }
}
