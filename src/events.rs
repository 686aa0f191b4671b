//! Event Sink: the observability fan-out every Orchestrator phase
//! transition streams through. Out of core scope — this is
//! the trait the Orchestrator calls through, plus a minimal in-memory
//! broadcast implementation good enough for the HTTP surface and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use crate::errors::clip;

const EVENT_MESSAGE_MAX_LEN: usize = 300;
const CHANNEL_CAPACITY: usize = 256;

/// `{type, data, timestamp}`, the fixed envelope every emission uses.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: Value,
    pub timestamp: chrono::DateTime<Utc>,
}

/// The seven envelope kinds an Orchestrator run can emit.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, run_id: &str, kind: &'static str, data: Value);

    async fn step_update(&self, run_id: &str, step: &str, status: &str, extra: Value) {
        let mut data = merge_object(serde_json::json!({"step": step, "status": status}), extra);
        if let Some(obj) = data.as_object_mut() {
            obj.entry("label").or_insert_with(|| Value::String(humanize_step(step)));
        }
        self.emit(run_id, "step_update", data).await;
    }

    async fn log(&self, run_id: &str, agent: &str, level: &str, message: &str) {
        let message = clip(message, EVENT_MESSAGE_MAX_LEN);
        self.emit(run_id, "log", serde_json::json!({"agent": agent, "level": level, "message": message}))
            .await;
    }

    async fn failure(&self, run_id: &str, failure: &crate::types::Failure) {
        self.emit(
            run_id,
            "failure",
            serde_json::json!({
                "file": failure.file,
                "bug_type": failure.bug_kind,
                "line": failure.line,
                "message": clip(&failure.error_message, EVENT_MESSAGE_MAX_LEN),
            }),
        )
        .await;
    }

    async fn fix(&self, run_id: &str, fix: &crate::types::Fix, iteration: u32) {
        self.emit(
            run_id,
            "fix",
            serde_json::json!({
                "file": fix.file,
                "bug_type": fix.bug_kind,
                "line": fix.line,
                "diff": fix.diff,
                "status": fix.status,
                "summary": fix.summary,
                "commit_message": fix.commit_message,
                "confidence": fix.confidence,
                "root_cause": clip(&fix.root_cause, EVENT_MESSAGE_MAX_LEN),
                "iteration": iteration,
            }),
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn iteration(
        &self,
        run_id: &str,
        iteration: u32,
        max_retries: u32,
        passed: bool,
        failures_remaining: usize,
        fixes_applied: usize,
    ) {
        self.emit(
            run_id,
            "iteration",
            serde_json::json!({
                "iteration": iteration,
                "max_retries": max_retries,
                "passed": passed,
                "failures_remaining": failures_remaining,
                "fixes_applied": fixes_applied,
            }),
        )
        .await;
    }

    /// Flattens `results.score` onto the top level and mirrors
    /// `final_status` (lowercased) into `status`, matching the frontend's
    /// `send_result` contract.
    async fn result(&self, run_id: &str, results: &Value) {
        let mut flat = results.clone();
        if let Some(obj) = flat.as_object_mut() {
            let score = obj.get("score").cloned().unwrap_or(Value::Null);
            let final_status = obj
                .get("final_status")
                .and_then(Value::as_str)
                .unwrap_or("FAILED")
                .to_lowercase();
            obj.insert("status".to_string(), Value::String(final_status));
            if let Some(score_obj) = score.as_object() {
                obj.insert("score".to_string(), score_obj.get("final_score").cloned().unwrap_or(Value::from(0)));
                obj.insert(
                    "speed_bonus".to_string(),
                    score_obj.get("speed_bonus").cloned().unwrap_or(Value::from(0)),
                );
                obj.insert(
                    "efficiency_penalty".to_string(),
                    score_obj.get("efficiency_penalty").cloned().unwrap_or(Value::from(0)),
                );
            }
        }
        self.emit(run_id, "result", flat).await;
    }

    async fn error(&self, run_id: &str, message: &str) {
        self.emit(run_id, "error", serde_json::json!({"message": clip(message, EVENT_MESSAGE_MAX_LEN)}))
            .await;
    }
}

fn merge_object(mut base: Value, extra: Value) -> Value {
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}

fn humanize_step(step: &str) -> String {
    step.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// In-memory fan-out keyed by run id, one `broadcast` channel per run.
/// Subscribers whose receiver has been dropped are pruned lazily, on the
/// next `subscribe`/`emit` touching that run's entry — there is no
/// active sweep.
#[derive(Default)]
pub struct BroadcastEventSink {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Envelope>>>>,
}

impl BroadcastEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every envelope emitted for `run_id` from this point
    /// forward. Creates the channel if this is the first subscriber.
    pub async fn subscribe(&self, run_id: &str) -> broadcast::Receiver<Envelope> {
        let mut channels = self.channels.write().await;
        channels
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop a run's channel once it has no further emissions coming
    /// (run complete). Any receivers already holding a clone keep
    /// draining the buffered tail.
    pub async fn forget(&self, run_id: &str) {
        self.channels.write().await.remove(run_id);
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, run_id: &str, kind: &'static str, data: Value) {
        let envelope = Envelope { kind, data, timestamp: Utc::now() };
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(run_id) {
            // No receivers is not an error: the run may simply have no
            // live observer right now.
            let _ = sender.send(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_step_update_envelope() {
        let sink = BroadcastEventSink::new();
        let mut rx = sink.subscribe("run-1").await;
        sink.step_update("run-1", "run_tests", "running", Value::Null).await;
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.kind, "step_update");
        assert_eq!(envelope.data["step"], "run_tests");
        assert_eq!(envelope.data["label"], "Run Tests");
    }

    #[tokio::test]
    async fn emit_with_no_subscribers_does_not_panic() {
        let sink = BroadcastEventSink::new();
        sink.error("run-without-subscribers", "boom").await;
    }

    #[tokio::test]
    async fn result_flattens_score_and_mirrors_status() {
        let sink = BroadcastEventSink::new();
        let mut rx = sink.subscribe("run-1").await;
        let results = serde_json::json!({
            "final_status": "PASSED",
            "score": {"base": 100, "speed_bonus": 10, "efficiency_penalty": 0, "final_score": 110},
        });
        sink.result("run-1", &results).await;
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.data["status"], "passed");
        assert_eq!(envelope.data["score"], 110);
        assert_eq!(envelope.data["speed_bonus"], 10);
    }

    #[tokio::test]
    async fn forget_drops_the_channel_for_a_run() {
        let sink = BroadcastEventSink::new();
        let _rx = sink.subscribe("run-1").await;
        sink.forget("run-1").await;
        assert!(sink.channels.read().await.get("run-1").is_none());
    }
}
