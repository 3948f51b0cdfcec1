//! Replica convergence tests.
//!
//! These drive the merge operators the way the sync engine does, across
//! several simulated replicas and exchange orders, and check that every
//! replica ends up element-wise identical.

use std::collections::BTreeMap;

use paddock_server::merge::{merge_chat, merge_nodes, merge_snippets, merge_states};
use paddock_server::types::{
    ChatMessage, NodeRecord, NodesDoc, Snippet, StatesDoc, TrustStatus,
};

fn record(id: &str, trust: &str, registered_at: f64) -> NodeRecord {
    serde_json::from_value(serde_json::json!({
        "node_id": id,
        "name": id,
        "mode": "full",
        "connectable": true,
        "host": "10.0.0.1",
        "port": 8300,
        "registered_at": registered_at,
        "public_key": "02aa",
        "trust_status": trust,
    }))
    .unwrap()
}

fn kicked(id: &str, kicked_at: f64) -> NodeRecord {
    let mut rec = record(id, "kicked", kicked_at);
    rec.kicked_at = Some(kicked_at);
    rec
}

fn doc(records: &[NodeRecord]) -> NodesDoc {
    records
        .iter()
        .map(|r| (r.node_id.clone(), r.clone()))
        .collect()
}

fn msg(id: &str, ts: f64) -> ChatMessage {
    ChatMessage {
        id: id.into(),
        node_id: "src".into(),
        node_name: "src".into(),
        content: format!("payload {id}"),
        timestamp: ts,
        client_id: None,
        status: None,
        extra: serde_json::Map::new(),
    }
}

fn snippet(id: &str, updated_at: f64, deleted: bool) -> Snippet {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "category": "note",
        "title": format!("snippet {id}"),
        "fields": [],
        "hidden": false,
        "created_at": 1.0,
        "updated_at": updated_at,
        "_deleted": deleted,
    }))
    .unwrap()
}

fn json<T: serde::Serialize>(v: &T) -> serde_json::Value {
    serde_json::to_value(v).unwrap()
}

// ── Nodes ──────────────────────────────────────────────────────────────

/// Three replicas with different partial histories converge regardless of
/// the order in which they exchange deltas.
#[test]
fn nodes_converge_across_exchange_orders() {
    let a = doc(&[
        record("n1", "trusted", 100.0),
        record("n2", "pending", 90.0),
    ]);
    let b = doc(&[record("n2", "trusted", 120.0), record("n3", "trusted", 50.0)]);
    let c = doc(&[kicked("n3", 200.0), record("n4", "trusted", 10.0)]);

    // Path 1: a ← b ← c, then the result pushed everywhere.
    let path1 = merge_nodes(&merge_nodes(&a, &b), &c);
    // Path 2: c ← a ← b.
    let path2 = merge_nodes(&merge_nodes(&c, &a), &b);
    // Path 3: b ← c ← a.
    let path3 = merge_nodes(&merge_nodes(&b, &c), &a);

    assert_eq!(json(&path1), json(&path2));
    assert_eq!(json(&path2), json(&path3));

    // And the converged state is what the rules promise.
    assert_eq!(path1["n2"].trust_status, TrustStatus::Trusted);
    assert_eq!(path1["n3"].trust_status, TrustStatus::Kicked);
}

/// A kick issued on one replica wins everywhere, even against replicas that
/// kept syncing the trusted record with fresher timestamps.
#[test]
fn kick_survives_concurrent_refreshes() {
    let kicked_view = doc(&[kicked("victim", 500.0)]);
    let stale_view = doc(&[record("victim", "trusted", 600.0)]);

    let at_a = merge_nodes(&kicked_view, &stale_view);
    let at_b = merge_nodes(&stale_view, &kicked_view);

    assert_eq!(at_a["victim"].trust_status, TrustStatus::Kicked);
    assert_eq!(json(&at_a), json(&at_b));

    // Second-generation spread: a replica that only ever saw the stale view
    // receives the merged state.
    let at_c = merge_nodes(&stale_view, &at_a);
    assert_eq!(at_c["victim"].trust_status, TrustStatus::Kicked);
}

/// Approval reaches a replica that still holds the pending record via an
/// intermediate replica (no direct exchange with the approver).
#[test]
fn approval_propagates_transitively() {
    let approver = doc(&[record("newbie", "trusted", 300.0)]);
    let middle = doc(&[record("newbie", "pending", 100.0)]);
    let far = doc(&[record("newbie", "pending", 100.0)]);

    let middle = merge_nodes(&middle, &approver);
    let far = merge_nodes(&far, &middle);

    assert_eq!(far["newbie"].trust_status, TrustStatus::Trusted);
}

// ── States ─────────────────────────────────────────────────────────────

#[test]
fn states_converge_to_latest_observation() {
    let mk = |seen: f64, status: &str| -> StatesDoc {
        let mut d = StatesDoc::new();
        d.insert(
            "n1".into(),
            serde_json::from_value(serde_json::json!({
                "node_id": "n1",
                "status": status,
                "last_seen": seen,
                "system_info": null,
                "version": 1,
            }))
            .unwrap(),
        );
        d
    };

    let a = mk(100.0, "offline");
    let b = mk(160.0, "online");
    assert_eq!(json(&merge_states(&a, &b)), json(&merge_states(&b, &a)));
    assert_eq!(
        merge_states(&a, &b)["n1"].last_seen,
        160.0,
        "latest observation wins"
    );
}

// ── Chat ───────────────────────────────────────────────────────────────

#[test]
fn chat_converges_and_respects_cap() {
    let a: Vec<ChatMessage> = (0..8).map(|i| msg(&format!("a{i}"), i as f64)).collect();
    let b: Vec<ChatMessage> = (0..8).map(|i| msg(&format!("b{i}"), 0.5 + i as f64)).collect();

    let ab = merge_chat(&a, &b, 10);
    let ba = merge_chat(&b, &a, 10);
    assert_eq!(json(&ab), json(&ba), "merge order must not matter");
    assert_eq!(ab.len(), 10, "cap applies after merge");

    // The cap keeps the newest messages.
    assert!(ab.iter().all(|m| m.timestamp >= 3.0));
}

#[test]
fn chat_is_idempotent_under_resend() {
    let a = vec![msg("m1", 1.0), msg("m2", 2.0)];
    let once = merge_chat(&a, &a, 500);
    let twice = merge_chat(&once, &a, 500);
    assert_eq!(json(&once), json(&twice));
    assert_eq!(once.len(), 2);
}

// ── Snippets: the partition scenario ───────────────────────────────────

/// N1 creates a snippet and deletes it during a partition; H comes back
/// holding only the stale live copy. After a full mesh exchange the
/// tombstone wins on every replica.
#[test]
fn tombstone_outlives_partitioned_stale_copy() {
    let live = snippet("s1", 100.0, false);
    let tomb = snippet("s1", 250.0, true);

    // Before the partition H and N2 both learned the live snippet.
    let h = merge_snippets(&[], &[live.clone()]);
    let n2 = merge_snippets(&[], &[live.clone()]);

    // N1 deletes while H is away.
    let n1 = merge_snippets(&[live], &[tomb]);

    // Partition heals: full mesh exchange in an arbitrary order.
    let n2 = merge_snippets(&n2, &n1);
    let h = merge_snippets(&h, &n2);
    let n1 = merge_snippets(&n1, &h);

    for (name, replica) in [("h", &h), ("n1", &n1), ("n2", &n2)] {
        assert_eq!(replica.len(), 1, "{name} must hold exactly the tombstone");
        assert!(replica[0].deleted, "{name} must see the deletion");
        assert_eq!(replica[0].updated_at, 250.0);
    }
}

/// The documents converge as a set even when each replica applies deltas in
/// a different interleaving (associativity + commutativity smoke test over
/// a larger mixed batch).
#[test]
fn mixed_batches_converge_regardless_of_interleaving() {
    let batches: Vec<NodesDoc> = vec![
        doc(&[record("a", "trusted", 10.0), record("b", "pending", 5.0)]),
        doc(&[record("b", "trusted", 20.0)]),
        doc(&[kicked("a", 30.0), record("c", "trusted", 1.0)]),
        doc(&[record("c", "trusted", 40.0), record("d", "pending", 2.0)]),
    ];

    // Apply in several different orders.
    let orders: Vec<Vec<usize>> = vec![
        vec![0, 1, 2, 3],
        vec![3, 2, 1, 0],
        vec![1, 3, 0, 2],
        vec![2, 0, 3, 1],
    ];

    let mut results: Vec<serde_json::Value> = Vec::new();
    for order in orders {
        let mut replica: NodesDoc = BTreeMap::new();
        for i in order {
            replica = merge_nodes(&replica, &batches[i]);
        }
        results.push(json(&replica));
    }
    for pair in results.windows(2) {
        assert_eq!(pair[0], pair[1]);
    }
}
