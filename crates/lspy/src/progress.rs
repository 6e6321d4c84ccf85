//! Progress & partial-result collector (C6): accumulates `$/progress` notifications keyed by
//! token and delivers them to subscribers, aggregating partial results for the request they
//! belong to.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::error::LspError;
use crate::message::Id;

/// Either flavor of progress token: string or integer, per the LSP spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProgressToken {
    Number(i64),
    String(String),
}

impl From<Id> for ProgressToken {
    fn from(id: Id) -> Self {
        match id {
            Id::Number(n) => ProgressToken::Number(n),
            Id::String(s) => ProgressToken::String(s),
        }
    }
}

impl From<&str> for ProgressToken {
    fn from(value: &str) -> Self {
        ProgressToken::String(value.to_string())
    }
}

impl From<i64> for ProgressToken {
    fn from(value: i64) -> Self {
        ProgressToken::Number(value)
    }
}

struct Bucket {
    partials: Vec<Value>,
    sender: mpsc::UnboundedSender<Value>,
}

/// The final outcome of a request that declared a `partialResultToken`, matching §4.6.
#[derive(Debug, Clone)]
pub enum PartialOutcome {
    Resolved { partial_results: Vec<Value>, final_result: Value },
    Cancelled { partial_results: Vec<Value> },
}

impl PartialOutcome {
    /// Collapses to the final value, discarding any accumulated partials, for callers that sent a
    /// plain request and never registered a `partialResultToken`. A cancelled outcome surfaces as
    /// [`LspError::RequestCancelled`], matching what `send_request` would have returned for a
    /// request without a partial-result token.
    pub fn into_result(self) -> Result<Value, LspError> {
        match self {
            PartialOutcome::Resolved { final_result, .. } => Ok(final_result),
            PartialOutcome::Cancelled { .. } => Err(LspError::RequestCancelled),
        }
    }
}

/// Tracks open progress buckets for a single peer. One instance per peer.
#[derive(Clone)]
pub struct ProgressCollector {
    buckets: Arc<Mutex<HashMap<ProgressToken, Bucket>>>,
}

impl ProgressCollector {
    pub fn new() -> Self {
        ProgressCollector { buckets: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Opens a bucket for `token`, returning a receiver that yields each partial value in arrival
    /// order as it's appended. Called when a partial-enabled request is sent (§4.6).
    pub async fn start(&self, token: ProgressToken) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.buckets.lock().await.insert(token, Bucket { partials: Vec::new(), sender: tx });
        rx
    }

    /// Routes an inbound `$/progress{token, value}` notification. If no bucket exists for the
    /// token, the progress is an orphan and is dropped silently, not an error (§3 invariants).
    pub async fn on_progress(&self, token: &ProgressToken, value: Value) {
        let mut guard = self.buckets.lock().await;
        if let Some(bucket) = guard.get_mut(token) {
            bucket.partials.push(value.clone());
            let _ = bucket.sender.send(value);
        }
    }

    /// Ends the bucket for `token` on a successful final response, returning the accumulated
    /// partial list in arrival order.
    pub async fn finish_resolved(&self, token: &ProgressToken, final_result: Value) -> PartialOutcome {
        let partials = self.take(token).await;
        PartialOutcome::Resolved { partial_results: partials, final_result }
    }

    /// Ends the bucket for `token` on cancellation, returning the accumulated partial list.
    pub async fn finish_cancelled(&self, token: &ProgressToken) -> PartialOutcome {
        let partials = self.take(token).await;
        PartialOutcome::Cancelled { partial_results: partials }
    }

    async fn take(&self, token: &ProgressToken) -> Vec<Value> {
        self.buckets.lock().await.remove(token).map(|bucket| bucket.partials).unwrap_or_default()
    }
}

impl Default for ProgressCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partial_results_arrive_in_order_and_resolve_with_final() {
        let collector = ProgressCollector::new();
        let token: ProgressToken = "t1".into();
        let mut rx = collector.start(token.clone()).await;

        collector.on_progress(&token, serde_json::json!(["a"])).await;
        collector.on_progress(&token, serde_json::json!(["b"])).await;
        collector.on_progress(&token, serde_json::json!(["c"])).await;

        assert_eq!(rx.recv().await.unwrap(), serde_json::json!(["a"]));
        assert_eq!(rx.recv().await.unwrap(), serde_json::json!(["b"]));
        assert_eq!(rx.recv().await.unwrap(), serde_json::json!(["c"]));

        let outcome = collector.finish_resolved(&token, serde_json::json!(["d"])).await;
        match outcome {
            PartialOutcome::Resolved { partial_results, final_result } => {
                assert_eq!(
                    partial_results,
                    vec![serde_json::json!(["a"]), serde_json::json!(["b"]), serde_json::json!(["c"])]
                );
                assert_eq!(final_result, serde_json::json!(["d"]));
            }
            other => panic!("expected resolved outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn orphan_progress_is_dropped_silently() {
        let collector = ProgressCollector::new();
        // No bucket was ever started for this token.
        collector.on_progress(&"orphan".into(), serde_json::json!(1)).await;
    }

    #[tokio::test]
    async fn cancellation_flushes_partials_collected_so_far() {
        let collector = ProgressCollector::new();
        let token: ProgressToken = 7i64.into();
        let _rx = collector.start(token.clone()).await;
        collector.on_progress(&token, serde_json::json!("x")).await;

        let outcome = collector.finish_cancelled(&token).await;
        match outcome {
            PartialOutcome::Cancelled { partial_results } => {
                assert_eq!(partial_results, vec![serde_json::json!("x")]);
            }
            other => panic!("expected cancelled outcome, got {other:?}"),
        }
    }
}
