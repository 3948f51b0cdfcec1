//! Merge operators for the replicated documents.
//!
//! These are last-writer-wins maps with two trust-specific twists: `kicked`
//! is absorbing (resolved by `kicked_at` when both sides agree), and
//! `trusted` propagates over `pending`/`waiting_approval` regardless of
//! timestamps. Apply order for `nodes`, per key:
//!
//! 1. remote kicked        → greater `kicked_at` wins, kicked stays kicked
//! 2. local kicked         → keep local
//! 3. remote trusted over local pending/waiting → adopt (approval spread)
//! 4. remote `self`        → treated as trusted here
//! 5. newer `registered_at` wins, but never downgrades a trusted record
//!
//! The local self record is never a merge target. All operators are
//! idempotent and, ties aside, commutative and associative; timestamps are
//! bumped monotonically per record precisely so ties do not occur in
//! practice.

use std::collections::HashSet;

use crate::types::{
    ChatMessage, NodeRecord, NodesDoc, Snippet, SnippetsDoc, StatesDoc, TrustStatus,
};

/// A remote node describing itself sends `trust_status = "self"`; locally
/// that means "a live, already-admitted peer".
fn normalize_remote(rec: &NodeRecord) -> NodeRecord {
    let mut rec = rec.clone();
    if rec.trust_status == TrustStatus::Local {
        rec.trust_status = TrustStatus::Trusted;
    }
    rec
}

/// Merge a remote `nodes` delta into the local document.
pub fn merge_nodes(local: &NodesDoc, remote: &NodesDoc) -> NodesDoc {
    let mut merged = local.clone();

    for (id, remote_rec) in remote {
        let incoming = normalize_remote(remote_rec);

        let Some(local_rec) = merged.get(id) else {
            merged.insert(id.clone(), incoming);
            continue;
        };

        // Never mutate the record describing this node itself.
        if local_rec.trust_status == TrustStatus::Local {
            continue;
        }

        if incoming.trust_status == TrustStatus::Kicked {
            let local_kicked_at = if local_rec.trust_status == TrustStatus::Kicked {
                local_rec.kicked_at.unwrap_or(f64::NEG_INFINITY)
            } else {
                f64::NEG_INFINITY
            };
            if incoming.kicked_at.unwrap_or(f64::NEG_INFINITY) > local_kicked_at
                || local_rec.trust_status != TrustStatus::Kicked
            {
                merged.insert(id.clone(), incoming);
            }
            continue;
        }

        if local_rec.trust_status == TrustStatus::Kicked {
            continue;
        }

        // Approval propagation: a trusted record anywhere upgrades a
        // pending or still-waiting one.
        if incoming.trust_status == TrustStatus::Trusted
            && matches!(
                local_rec.trust_status,
                TrustStatus::Pending | TrustStatus::WaitingApproval
            )
        {
            merged.insert(id.clone(), incoming);
            continue;
        }

        if incoming.registered_at > local_rec.registered_at {
            let local_trust = local_rec.trust_status;
            let mut adopted = incoming;
            // A newer record refreshes metadata but must not silently
            // demote a node we already trust.
            if local_trust == TrustStatus::Trusted && adopted.trust_status != TrustStatus::Trusted {
                adopted.trust_status = local_trust;
            }
            merged.insert(id.clone(), adopted);
        }
    }

    merged
}

/// Merge a remote `states` delta: per key, the greater `last_seen` wins.
pub fn merge_states(local: &StatesDoc, remote: &StatesDoc) -> StatesDoc {
    let mut merged = local.clone();
    for (id, state) in remote {
        match merged.get(id) {
            Some(existing) if state.last_seen <= existing.last_seen => {}
            _ => {
                merged.insert(id.clone(), state.clone());
            }
        }
    }
    merged
}

/// Merge chat lists: union by id, ordered by `(timestamp, id)`, capped to
/// the newest `cap` entries.
pub fn merge_chat(local: &[ChatMessage], remote: &[ChatMessage], cap: usize) -> Vec<ChatMessage> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut merged: Vec<ChatMessage> = Vec::with_capacity(local.len() + remote.len());

    for msg in local.iter().chain(remote.iter()) {
        if msg.id.is_empty() || !seen.insert(msg.id.as_str()) {
            continue;
        }
        merged.push(msg.clone());
    }

    merged.sort_by(|a, b| {
        a.timestamp
            .partial_cmp(&b.timestamp)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    if merged.len() > cap {
        let excess = merged.len() - cap;
        merged.drain(..excess);
    }
    merged
}

/// Merge snippet lists: union by id, newer `updated_at` wins. Tombstones are
/// ordinary entries here; only read APIs filter them.
pub fn merge_snippets(local: &[Snippet], remote: &[Snippet]) -> SnippetsDoc {
    let mut by_id: std::collections::BTreeMap<String, Snippet> = std::collections::BTreeMap::new();

    for s in local.iter().chain(remote.iter()) {
        if s.id.is_empty() {
            continue;
        }
        match by_id.get(&s.id) {
            Some(existing) if s.updated_at <= existing.updated_at => {}
            _ => {
                by_id.insert(s.id.clone(), s.clone());
            }
        }
    }

    let mut merged: Vec<Snippet> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        a.created_at
            .partial_cmp(&b.created_at)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    merged
}

/// Messages present in `after` but not in `before`; what a merge introduced
/// and the ChatHub still has to deliver locally.
pub fn new_messages(before: &[ChatMessage], after: &[ChatMessage]) -> Vec<ChatMessage> {
    let known: HashSet<&str> = before.iter().map(|m| m.id.as_str()).collect();
    after
        .iter()
        .filter(|m| !known.contains(m.id.as_str()))
        .cloned()
        .collect()
}
