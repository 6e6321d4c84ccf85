//! Pending request tracker (C4): correlates outbound requests to inbound responses, with
//! timeouts, cancellation, and per-request metadata, over an arbitrary transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::LspError;
use crate::message::Id;

/// Per-pending-request scratch data the dispatcher attaches when it creates an entry. `method` is
/// used to classify the eventual response for middleware (§4.4).
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub method: String,
}

struct Entry {
    sender: oneshot::Sender<Result<serde_json::Value, LspError>>,
    metadata: RequestMetadata,
    timeout_task: Option<JoinHandle<()>>,
}

/// Tracks in-flight outbound requests keyed by [`Id`]. One instance per peer.
pub struct PendingTracker {
    next_id: AtomicU64,
    entries: Arc<Mutex<HashMap<Id, Entry>>>,
}

impl PendingTracker {
    pub fn new() -> Self {
        PendingTracker { next_id: AtomicU64::new(1), entries: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Allocates a fresh id. A monotonic counter is sufficient — per-peer uniqueness is all the
    /// protocol requires (§9).
    pub fn next_id(&self) -> Id {
        Id::Number(self.next_id.fetch_add(1, Ordering::SeqCst) as i64)
    }

    /// Registers a pending entry for `id` and returns the receiving half of its completion
    /// channel. If `timeout` elapses before `resolve`/`reject`/`cancel` is called, the entry is
    /// removed and the awaitable is rejected with [`LspError::RequestTimedOut`].
    pub async fn create(
        &self,
        id: Id,
        metadata: RequestMetadata,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<Result<serde_json::Value, LspError>> {
        let (tx, rx) = oneshot::channel();

        let timeout_task = timeout.map(|duration| {
            let entries = self.entries.clone();
            let timeout_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let removed = { entries.lock().await.remove(&timeout_id) };
                if let Some(entry) = removed {
                    let _ = entry.sender.send(Err(LspError::RequestTimedOut(duration)));
                }
            })
        });

        let entry = Entry { sender: tx, metadata, timeout_task };
        self.entries.lock().await.insert(id, entry);
        rx
    }

    /// Resolves a pending entry with a successful result. A call for an unknown id (already
    /// resolved, timed out, or cancelled) is a silent no-op — a late response is simply discarded
    /// (§4.4, §9).
    pub async fn resolve(&self, id: &Id, result: serde_json::Value) {
        if let Some(entry) = self.remove(id).await {
            let _ = entry.sender.send(Ok(result));
        }
    }

    /// Rejects a pending entry with an error. Same unknown-id semantics as [`Self::resolve`].
    pub async fn reject(&self, id: &Id, error: LspError) {
        if let Some(entry) = self.remove(id).await {
            let _ = entry.sender.send(Err(error));
        }
    }

    /// Looks up the metadata registered for `id` without removing the entry. Used by the
    /// dispatcher/middleware pipeline to classify an inbound response by method.
    pub async fn metadata(&self, id: &Id) -> Option<RequestMetadata> {
        self.entries.lock().await.get(id).map(|entry| entry.metadata.clone())
    }

    /// Rejects every pending entry atomically with `error`, used on disconnect (§5).
    pub async fn clear(&self, error: LspError) {
        let mut guard = self.entries.lock().await;
        for (_, entry) in guard.drain() {
            if let Some(task) = entry.timeout_task {
                task.abort();
            }
            let _ = entry.sender.send(Err(clone_lsp_error(&error)));
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn remove(&self, id: &Id) -> Option<Entry> {
        let entry = self.entries.lock().await.remove(id);
        if let Some(entry) = &entry {
            if let Some(task) = &entry.timeout_task {
                task.abort();
            }
        }
        entry
    }
}

impl Default for PendingTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// `LspError` does not implement `Clone` (it wraps `std::io::Error`), so `clear` needs a way to
/// hand the same logical error to every pending entry.
fn clone_lsp_error(error: &LspError) -> LspError {
    match error {
        LspError::Disconnected => LspError::Disconnected,
        LspError::TransportClosed => LspError::TransportClosed,
        other => LspError::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_fulfils_the_awaitable() {
        let tracker = PendingTracker::new();
        let id = tracker.next_id();
        let rx = tracker.create(id.clone(), RequestMetadata { method: "foo".into() }, None).await;
        tracker.resolve(&id, serde_json::json!(42)).await;
        assert_eq!(rx.await.unwrap().unwrap(), serde_json::json!(42));
    }

    #[tokio::test]
    async fn unknown_id_resolve_is_a_no_op() {
        let tracker = PendingTracker::new();
        tracker.resolve(&Id::Number(999), serde_json::json!(1)).await;
        assert_eq!(tracker.len().await, 0);
    }

    #[tokio::test]
    async fn timeout_rejects_and_removes_entry() {
        let tracker = PendingTracker::new();
        let id = tracker.next_id();
        let rx = tracker
            .create(id.clone(), RequestMetadata::default(), Some(Duration::from_millis(10)))
            .await;
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(LspError::RequestTimedOut(_))));
        assert_eq!(tracker.len().await, 0);
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_discarded_silently() {
        let tracker = PendingTracker::new();
        let id = tracker.next_id();
        let rx = tracker
            .create(id.clone(), RequestMetadata::default(), Some(Duration::from_millis(5)))
            .await;
        let _ = rx.await;
        // Response arrives after the entry has already timed out and been removed.
        tracker.resolve(&id, serde_json::json!("late")).await;
    }

    #[tokio::test]
    async fn clear_rejects_all_pending_entries() {
        let tracker = PendingTracker::new();
        let id1 = tracker.next_id();
        let id2 = tracker.next_id();
        let rx1 = tracker.create(id1, RequestMetadata::default(), None).await;
        let rx2 = tracker.create(id2, RequestMetadata::default(), None).await;
        tracker.clear(LspError::Disconnected).await;
        assert!(matches!(rx1.await.unwrap(), Err(LspError::Disconnected)));
        assert!(matches!(rx2.await.unwrap(), Err(LspError::Disconnected)));
    }
}
