//! Signed HTTP client for peer RPC.
//!
//! Every signed call serializes the body once, signs those exact bytes, and
//! sends body + signature headers together, so the verifier hashes the same
//! bytes the signer did. The four bootstrap calls (handshake, join-request,
//! join-status) are deliberately unsigned; a joining node has no trust yet.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::PeerError;
use crate::identity::{HDR_BODY_HASH, HDR_NODE_ID, HDR_NODE_SIG, HDR_NODE_TS, NodeIdentity};
use crate::wire::{
    ChatPushRequest, ChatPushResponse, HandshakeInfo, HeartbeatRequest, HeartbeatResponse,
    JoinResponse, SyncRequest, SyncResponse,
};

pub struct PeerClient {
    http: reqwest::Client,
    identity: Arc<NodeIdentity>,
    timeout: Duration,
}

impl PeerClient {
    pub fn new(identity: Arc<NodeIdentity>, timeout_secs: f64) -> Self {
        Self {
            http: reqwest::Client::new(),
            identity,
            timeout: Duration::from_secs_f64(timeout_secs.max(0.1)),
        }
    }

    fn endpoint(base_url: &str, path: &str) -> String {
        format!("{}/api/v1/peer/{path}", base_url.trim_end_matches('/'))
    }

    async fn signed_post<B: Serialize, R: DeserializeOwned>(
        &self,
        base_url: &str,
        path: &str,
        payload: &B,
    ) -> Result<R, PeerError> {
        let body = serde_json::to_vec(payload)?;
        let sig = self.identity.sign_request(&body)?;

        let resp = self
            .http
            .post(Self::endpoint(base_url, path))
            .timeout(self.timeout)
            .header("content-type", "application/json")
            .header(HDR_NODE_ID, sig.node_id.as_str())
            .header(HDR_NODE_TS, sig.timestamp.as_str())
            .header(HDR_BODY_HASH, sig.body_hash.as_str())
            .header(HDR_NODE_SIG, sig.signature.as_str())
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(PeerError::from_http(
                Some(status),
                format!("{path}: {status}: {detail}"),
            ));
        }
        resp.json::<R>()
            .await
            .map_err(|e| PeerError::Transient(format!("{path}: bad response body: {e}")))
    }

    // ── Signed endpoints ───────────────────────────────────────────────

    pub async fn sync(&self, base_url: &str, req: &SyncRequest) -> Result<SyncResponse, PeerError> {
        self.signed_post(base_url, "sync", req).await
    }

    pub async fn heartbeat(
        &self,
        base_url: &str,
        req: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, PeerError> {
        self.signed_post(base_url, "heartbeat", req).await
    }

    pub async fn chat_push(
        &self,
        base_url: &str,
        req: &ChatPushRequest,
    ) -> Result<ChatPushResponse, PeerError> {
        self.signed_post(base_url, "chat-push", req).await
    }

    // ── Bootstrap endpoints (unsigned) ─────────────────────────────────

    pub async fn handshake(&self, base_url: &str) -> Result<HandshakeInfo, PeerError> {
        let resp = self
            .http
            .get(Self::endpoint(base_url, "handshake"))
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;
        resp.json()
            .await
            .map_err(|e| PeerError::Transient(format!("handshake: bad response body: {e}")))
    }

    /// Submit a join request. A 403 here still carries a meaningful body
    /// (`status: kicked`), so the response is decoded for any status that
    /// produced JSON.
    pub async fn join_request(
        &self,
        base_url: &str,
        info: &HandshakeInfo,
    ) -> Result<JoinResponse, PeerError> {
        let resp = self
            .http
            .post(Self::endpoint(base_url, "join-request"))
            .timeout(self.timeout)
            .json(info)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        match serde_json::from_slice::<JoinResponse>(&bytes) {
            Ok(decision) => Ok(decision),
            Err(_) => Err(PeerError::from_http(
                Some(status),
                format!(
                    "join-request: {status}: {}",
                    String::from_utf8_lossy(&bytes)
                ),
            )),
        }
    }

    pub async fn join_status(
        &self,
        base_url: &str,
        node_id: &str,
        public_key: &str,
    ) -> Result<JoinResponse, PeerError> {
        let resp = self
            .http
            .get(Self::endpoint(base_url, "join-status"))
            .timeout(self.timeout)
            .query(&[("node_id", node_id), ("public_key", public_key)])
            .send()
            .await?
            .error_for_status()?;
        resp.json()
            .await
            .map_err(|e| PeerError::Transient(format!("join-status: bad response body: {e}")))
    }
}
