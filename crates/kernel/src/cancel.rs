//! Cooperative cancellation tokens.
//!
//! Lifted directly from `gateway/src/runtime/cancel.rs`'s `CancelToken`
//! (an `Arc<AtomicBool>` checked at suspension points) rather than reached
//! for `tokio_util::sync::CancellationToken` — the teacher's own runtime
//! already solves this with a plain flag, and `sa-kernel` follows it.
//! Extended with a parent/child link so the Orchestrator (C14) can cancel
//! an entire run and have every in-flight task observe it, matching
//! §5's "cancellation propagates from the Orchestrator down to the
//! in-flight provider request".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            parent: None,
        }
    }

    /// A token whose `is_cancelled` also observes `self` being cancelled,
    /// without the child being able to cancel its parent.
    pub fn child(&self) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self.parent.as_ref().map(|p| p.is_cancelled()).unwrap_or(false)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled() {
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn cancel_is_observed() {
        let t = CancelToken::new();
        t.cancel();
        assert!(t.is_cancelled());
    }

    #[test]
    fn parent_cancellation_propagates_to_child() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_cancellation_does_not_propagate_to_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
