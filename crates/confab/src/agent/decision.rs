//! Out-of-band decision routing for permission and preview requests.
//!
//! The dispatch gate suspends on external decisions in Ask mode. Rather than
//! blocking inside an event handler, the runner emits a request event
//! carrying a request id and then awaits a oneshot receiver. The owner of
//! the [`DecisionRouter`] resolves the id from anywhere (another task, a UI
//! thread, a test) and the gate resumes. Unknown or already-resolved ids
//! are ignored, so late decisions after an abort are harmless.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

/// A permission decision for a single tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDecision {
    pub approved: bool,
    /// Reason shown to the model when denied.
    pub reason: Option<String>,
}

impl PermissionDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }
}

/// Decision for a single previewed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewItemDecision {
    pub path: String,
    /// Replacement content supplied by the approver. `None` keeps the
    /// proposed content unchanged.
    pub edited_content: Option<String>,
}

/// A decision for a whole preview batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewVerdict {
    pub approved: bool,
    /// Per-item decisions, matched to the batch by path.
    pub items: Vec<PreviewItemDecision>,
}

impl PreviewVerdict {
    pub fn approve() -> Self {
        Self {
            approved: true,
            items: Vec::new(),
        }
    }

    pub fn reject() -> Self {
        Self {
            approved: false,
            items: Vec::new(),
        }
    }
}

// ── Request channel ────────────────────────────────────────────────

/// Request-id keyed oneshot registry for one decision type.
struct RequestChannel<T> {
    pending: Mutex<HashMap<u64, oneshot::Sender<T>>>,
}

impl<T> RequestChannel<T> {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn issue(&self, id: u64) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        rx
    }

    fn resolve(&self, id: u64, decision: T) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match sender {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    fn cancel(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}

// ── DecisionRouter ─────────────────────────────────────────────────

/// Routes externally-made permission and preview decisions to suspended
/// tool dispatches.
///
/// Ids are unique across both decision kinds, so a UI can treat them as
/// opaque request handles.
pub struct DecisionRouter {
    next_id: AtomicU64,
    permissions: RequestChannel<PermissionDecision>,
    previews: RequestChannel<PreviewVerdict>,
}

impl DecisionRouter {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            permissions: RequestChannel::new(),
            previews: RequestChannel::new(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a pending permission request. Returns the request id to put
    /// in the event and the receiver the gate awaits.
    pub fn request_permission(&self) -> (u64, oneshot::Receiver<PermissionDecision>) {
        let id = self.next_id();
        (id, self.permissions.issue(id))
    }

    /// Register a pending preview request.
    pub fn request_preview(&self) -> (u64, oneshot::Receiver<PreviewVerdict>) {
        let id = self.next_id();
        (id, self.previews.issue(id))
    }

    /// Resolve a pending permission request. Returns `false` when the id is
    /// unknown or the gate already gave up waiting.
    pub fn resolve_permission(&self, request_id: u64, decision: PermissionDecision) -> bool {
        let delivered = self.permissions.resolve(request_id, decision);
        if !delivered {
            debug!("Permission decision for unknown request {request_id} dropped");
        }
        delivered
    }

    /// Resolve a pending preview request.
    pub fn resolve_preview(&self, request_id: u64, verdict: PreviewVerdict) -> bool {
        let delivered = self.previews.resolve(request_id, verdict);
        if !delivered {
            debug!("Preview verdict for unknown request {request_id} dropped");
        }
        delivered
    }

    /// Drop a pending request without resolving it (e.g. after an abort).
    pub fn cancel(&self, request_id: u64) {
        self.permissions.cancel(request_id);
        self.previews.cancel(request_id);
    }

    /// Ids of requests still waiting on a decision.
    pub fn pending_requests(&self) -> Vec<u64> {
        let mut ids = self.permissions.pending_ids();
        ids.extend(self.previews.pending_ids());
        ids.sort_unstable();
        ids
    }
}

impl Default for DecisionRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permission_round_trip() {
        let router = DecisionRouter::new();
        let (id, rx) = router.request_permission();
        assert!(router.resolve_permission(id, PermissionDecision::approve()));
        let decision = rx.await.unwrap();
        assert!(decision.approved);
    }

    #[tokio::test]
    async fn denial_carries_reason() {
        let router = DecisionRouter::new();
        let (id, rx) = router.request_permission();
        router.resolve_permission(id, PermissionDecision::deny("out of scope"));
        let decision = rx.await.unwrap();
        assert!(!decision.approved);
        assert_eq!(decision.reason.as_deref(), Some("out of scope"));
    }

    #[tokio::test]
    async fn unknown_id_is_rejected() {
        let router = DecisionRouter::new();
        assert!(!router.resolve_permission(999, PermissionDecision::approve()));
    }

    #[tokio::test]
    async fn ids_are_unique_across_kinds() {
        let router = DecisionRouter::new();
        let (a, _rx_a) = router.request_permission();
        let (b, _rx_b) = router.request_preview();
        assert_ne!(a, b);
        assert_eq!(router.pending_requests(), vec![a, b]);
    }

    #[tokio::test]
    async fn cancel_drops_the_waiter() {
        let router = DecisionRouter::new();
        let (id, rx) = router.request_permission();
        router.cancel(id);
        assert!(rx.await.is_err());
        assert!(!router.resolve_permission(id, PermissionDecision::approve()));
    }

    #[tokio::test]
    async fn preview_edits_round_trip() {
        let router = DecisionRouter::new();
        let (id, rx) = router.request_preview();
        router.resolve_preview(
            id,
            PreviewVerdict {
                approved: true,
                items: vec![PreviewItemDecision {
                    path: "src/lib.rs".into(),
                    edited_content: Some("fn main() {}".into()),
                }],
            },
        );
        let verdict = rx.await.unwrap();
        assert!(verdict.approved);
        assert_eq!(verdict.items[0].edited_content.as_deref(), Some("fn main() {}"));
    }
}
