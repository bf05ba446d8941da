//! Single-slot rendezvous between an in-flight task and the voice loop.
//!
//! The action task marks the bridge pending before its question is spoken,
//! then suspends in [`ClarificationBridge::wait_for_answer`]. The voice
//! loop, seeing the pending flag, routes the next transcript here instead
//! of starting a new task.

use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
struct BridgeInner {
    pending: bool,
    /// Waker registered by `wait_for_answer`.
    waiter: Option<oneshot::Sender<Option<String>>>,
    /// Answer that arrived before the waiter registered.
    early_answer: Option<Option<String>>,
}

/// Suspends execution while a question is asked and answered over the same
/// microphone. Shared, internally synchronized, at most one question at a
/// time.
#[derive(Default)]
pub struct ClarificationBridge {
    inner: Arc<Mutex<BridgeInner>>,
}

impl ClarificationBridge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a question is about to be spoken. Must precede
    /// [`wait_for_answer`](Self::wait_for_answer).
    pub fn mark_pending(&self) {
        let mut inner = self.lock();
        inner.pending = true;
        inner.early_answer = None;
    }

    /// Whether a question is awaiting an answer.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.lock().pending
    }

    /// Suspend until an answer arrives, or `None` on cancel.
    pub async fn wait_for_answer(&self) -> Option<String> {
        let rx = {
            let mut inner = self.lock();
            if let Some(answer) = inner.early_answer.take() {
                inner.pending = false;
                return answer;
            }
            let (tx, rx) = oneshot::channel();
            inner.waiter = Some(tx);
            rx
        };
        rx.await.unwrap_or(None)
    }

    /// Deliver the user's answer. Returns `false` if nothing was pending.
    pub fn provide_answer(&self, text: &str) -> bool {
        let mut inner = self.lock();
        if !inner.pending {
            return false;
        }
        inner.pending = false;
        match inner.waiter.take() {
            Some(tx) => {
                let _ = tx.send(Some(text.to_owned()));
            }
            None => inner.early_answer = Some(Some(text.to_owned())),
        }
        true
    }

    /// Wake the suspended task with no answer so no continuation leaks.
    pub fn cancel(&self) {
        let mut inner = self.lock();
        if !inner.pending && inner.waiter.is_none() {
            return;
        }
        debug!("clarification cancelled");
        inner.pending = false;
        inner.early_answer = None;
        if let Some(tx) = inner.waiter.take() {
            let _ = tx.send(None);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BridgeInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
