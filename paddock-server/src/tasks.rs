//! Relay task plumbing.
//!
//! Hubs queue tasks per relay node; the queue drains into the next
//! heartbeat response for that relay. The relay runs each task through the
//! [`Executor`] and uploads results with its next heartbeat. Queues are
//! bounded; when a relay never heartbeats, the oldest entries are dropped.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::clock;

/// Most tasks a hub will hold per relay before dropping the oldest.
const PER_NODE_QUEUE_CAP: usize = 64;

fn default_task_timeout() -> f64 {
    60.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub command: String,
    /// Execution deadline in seconds.
    #[serde(default = "default_task_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub created_at: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskOutcome,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub finished_at: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Default)]
pub struct TaskQueue {
    /// Hub side: tasks waiting for a relay's next heartbeat, per node id.
    pending: parking_lot::Mutex<HashMap<String, VecDeque<TaskSpec>>>,
    /// Relay side: finished results waiting to be uploaded.
    outbox: parking_lot::Mutex<Vec<TaskResult>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task for a relay. Bounded: the oldest entry is dropped once
    /// the per-node cap is reached.
    pub fn enqueue(&self, node_id: &str, spec: TaskSpec) {
        let mut pending = self.pending.lock();
        let queue = pending.entry(node_id.to_string()).or_default();
        if queue.len() >= PER_NODE_QUEUE_CAP {
            if let Some(dropped) = queue.pop_front() {
                tracing::warn!(
                    node = node_id,
                    task = %dropped.task_id,
                    "relay task queue full, dropping oldest"
                );
            }
        }
        queue.push_back(spec);
    }

    /// Hand every queued task to the relay that just heartbeated.
    pub fn drain_for(&self, node_id: &str) -> Vec<TaskSpec> {
        self.pending
            .lock()
            .remove(node_id)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, node_id: &str) -> usize {
        self.pending.lock().get(node_id).map_or(0, |q| q.len())
    }

    /// Relay side: remember a finished result for the next heartbeat.
    pub fn push_result(&self, result: TaskResult) {
        self.outbox.lock().push(result);
    }

    /// Relay side: take everything queued for upload.
    pub fn take_outbox(&self) -> Vec<TaskResult> {
        std::mem::take(&mut *self.outbox.lock())
    }

    /// Relay side: put results back after a failed upload so the next
    /// heartbeat retries them.
    pub fn requeue_results(&self, results: Vec<TaskResult>) {
        if results.is_empty() {
            return;
        }
        let mut outbox = self.outbox.lock();
        let mut merged = results;
        merged.append(&mut outbox);
        *outbox = merged;
    }

    /// Hub side: accept results uploaded by a relay.
    pub fn ingest_results(&self, node_id: &str, results: &[TaskResult]) {
        for r in results {
            tracing::info!(
                node = node_id,
                task = %r.task_id,
                status = ?r.status,
                "relay task result received"
            );
        }
    }
}

/// Runs one command with a deadline. The single named interface the engine
/// has to command execution; everything else about execution (shell
/// environment, audit trail) lives outside this crate.
pub struct Executor;

impl Executor {
    pub async fn run(&self, spec: &TaskSpec) -> TaskResult {
        let started = std::time::Instant::now();
        let fut = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&spec.command)
            .output();

        let deadline = std::time::Duration::from_secs_f64(spec.timeout.max(1.0));
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                if !output.stderr.is_empty() {
                    text.push_str(&String::from_utf8_lossy(&output.stderr));
                }
                // Keep results small enough for a heartbeat body.
                if text.len() > 64 * 1024 {
                    text.truncate(64 * 1024);
                }
                TaskResult {
                    task_id: spec.task_id.clone(),
                    status: if output.status.success() {
                        TaskOutcome::Completed
                    } else {
                        TaskOutcome::Failed
                    },
                    output: text,
                    exit_code: output.status.code(),
                    finished_at: clock::now(),
                    extra: serde_json::Map::new(),
                }
            }
            Ok(Err(e)) => TaskResult {
                task_id: spec.task_id.clone(),
                status: TaskOutcome::Failed,
                output: format!("spawn failed: {e}"),
                exit_code: None,
                finished_at: clock::now(),
                extra: serde_json::Map::new(),
            },
            Err(_) => {
                tracing::warn!(
                    task = %spec.task_id,
                    elapsed = started.elapsed().as_secs_f64(),
                    "task timed out"
                );
                TaskResult {
                    task_id: spec.task_id.clone(),
                    status: TaskOutcome::Timeout,
                    output: String::new(),
                    exit_code: None,
                    finished_at: clock::now(),
                    extra: serde_json::Map::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str) -> TaskSpec {
        TaskSpec {
            task_id: ulid::Ulid::new().to_string(),
            command: command.into(),
            timeout: 5.0,
            created_at: clock::now(),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn queue_drains_per_node() {
        let q = TaskQueue::new();
        q.enqueue("relay-1", spec("echo a"));
        q.enqueue("relay-1", spec("echo b"));
        q.enqueue("relay-2", spec("echo c"));

        assert_eq!(q.pending_count("relay-1"), 2);
        assert_eq!(q.drain_for("relay-1").len(), 2);
        assert_eq!(q.pending_count("relay-1"), 0);
        assert_eq!(q.pending_count("relay-2"), 1);
    }

    #[test]
    fn queue_is_bounded() {
        let q = TaskQueue::new();
        for i in 0..(PER_NODE_QUEUE_CAP + 10) {
            q.enqueue("relay-1", spec(&format!("echo {i}")));
        }
        assert_eq!(q.pending_count("relay-1"), PER_NODE_QUEUE_CAP);
        let drained = q.drain_for("relay-1");
        // Oldest were dropped; the newest survives.
        assert_eq!(drained.last().unwrap().command, format!("echo {}", PER_NODE_QUEUE_CAP + 9));
    }

    #[test]
    fn failed_upload_requeues_in_order() {
        let q = TaskQueue::new();
        let r = |id: &str| TaskResult {
            task_id: id.into(),
            status: TaskOutcome::Completed,
            output: String::new(),
            exit_code: Some(0),
            finished_at: clock::now(),
            extra: serde_json::Map::new(),
        };
        q.push_result(r("t1"));
        let taken = q.take_outbox();
        q.push_result(r("t2"));
        q.requeue_results(taken);

        let order: Vec<String> = q.take_outbox().into_iter().map(|x| x.task_id).collect();
        assert_eq!(order, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn executor_reports_exit_status() {
        let ex = Executor;
        let ok = ex.run(&spec("true")).await;
        assert_eq!(ok.status, TaskOutcome::Completed);
        assert_eq!(ok.exit_code, Some(0));

        let bad = ex.run(&spec("false")).await;
        assert_eq!(bad.status, TaskOutcome::Failed);
    }

    #[tokio::test]
    async fn executor_enforces_deadline() {
        let ex = Executor;
        let mut s = spec("sleep 30");
        s.timeout = 1.0;
        let result = ex.run(&s).await;
        assert_eq!(result.status, TaskOutcome::Timeout);
    }
}
