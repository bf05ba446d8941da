//! Serialized narration queue.
//!
//! Speaks queued text one utterance at a time without blocking the action
//! loop, and coordinates with microphone lifetime so spoken text is never
//! transcribed. Playback is delegated to a swappable TTS backend with a
//! completion-callback contract; the queue advances on callback.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Debounce between an interrupt and its deferred enqueue, letting the
/// audio graph quiesce before the preempting utterance starts.
const PREEMPT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Plays one utterance at a time and reports completion.
///
/// `speak` must invoke `on_done` exactly once when playback finishes
/// naturally. After `stop`, the pending `on_done` may or may not fire; the
/// queue guards against both.
pub trait TtsBackend: Send + Sync {
    fn speak(&self, text: &str, on_done: Box<dyn FnOnce() + Send>);
    fn stop(&self);
}

struct Entry {
    text: String,
    done_tx: Option<oneshot::Sender<()>>,
}

struct QueueInner {
    queue: VecDeque<Entry>,
    /// Waiter of the utterance currently playing.
    current_waiter: Option<oneshot::Sender<()>>,
    speaking: bool,
    muted: bool,
    /// Inside the interrupt→deferred-enqueue debounce window. While set,
    /// the queue still reports active so observers do not race to open the
    /// microphone before the preempting utterance starts.
    pending_preempt: bool,
    /// Bumped on interrupt/mute so a stale backend callback becomes a no-op.
    playback_gen: u64,
}

/// FIFO TTS speaker with mute, interrupt, stale-skip, and preempt semantics.
pub struct NarrationQueue {
    inner: Arc<Mutex<QueueInner>>,
    tts: Arc<dyn TtsBackend>,
}

impl NarrationQueue {
    #[must_use]
    pub fn new(tts: Arc<dyn TtsBackend>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                queue: VecDeque::new(),
                current_waiter: None,
                speaking: false,
                muted: false,
                pending_preempt: false,
                playback_gen: 0,
            })),
            tts,
        }
    }

    /// Append `text` and start speaking if idle. Non-blocking.
    ///
    /// Muted queues silently drop; empty or whitespace-only text is
    /// rejected at enqueue.
    pub fn enqueue(&self, text: &str) {
        self.push(text, None);
    }

    /// Append `text` and wait until exactly that utterance has finished.
    ///
    /// Returns immediately when muted or when the text is rejected. An
    /// interrupt while waiting also wakes the caller.
    pub async fn enqueue_and_wait(&self, text: &str) {
        let Some(rx) = self.push_waitable(text) else {
            return;
        };
        let _ = rx.await;
    }

    fn push(&self, text: &str, done_tx: Option<oneshot::Sender<()>>) {
        if text.trim().is_empty() {
            return;
        }
        {
            let mut inner = self.lock();
            if inner.muted {
                debug!("narration muted, dropping: {text}");
                return;
            }
            inner.queue.push_back(Entry {
                text: text.to_owned(),
                done_tx,
            });
        }
        advance(&self.inner, &self.tts);
    }

    fn push_waitable(&self, text: &str) -> Option<oneshot::Receiver<()>> {
        if text.trim().is_empty() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        {
            let inner = self.lock();
            if inner.muted {
                return None;
            }
        }
        self.push(text, Some(tx));
        Some(rx)
    }

    /// Stop the current utterance immediately and clear the queue.
    ///
    /// Returns whether anything was playing.
    pub fn interrupt(&self) -> bool {
        let was_playing = {
            let mut inner = self.lock();
            let was_playing = inner.speaking;
            inner.queue.clear();
            inner.speaking = false;
            inner.current_waiter = None;
            inner.playback_gen += 1;
            was_playing
        };
        self.tts.stop();
        was_playing
    }

    /// Interrupt, then schedule `text` after a short debounce.
    ///
    /// Between the interrupt and the deferred enqueue the queue still
    /// reports active, closing the race where the voice loop would reopen
    /// the microphone and kill the upcoming speech.
    pub fn interrupt_and_enqueue(&self, text: &str) {
        {
            let mut inner = self.lock();
            inner.pending_preempt = true;
        }
        self.interrupt();

        let inner = Arc::clone(&self.inner);
        let tts = Arc::clone(&self.tts);
        let text = text.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(PREEMPT_DEBOUNCE).await;
            {
                let mut guard = inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                guard.pending_preempt = false;
                if guard.muted || text.trim().is_empty() {
                    return;
                }
                guard.queue.push_back(Entry { text, done_tx: None });
            }
            advance(&inner, &tts);
        });
    }

    /// Stop current speech, clear the queue, and reject enqueues until
    /// [`unmute`](Self::unmute).
    pub fn mute(&self) {
        {
            let mut inner = self.lock();
            inner.muted = true;
            inner.queue.clear();
            inner.speaking = false;
            inner.current_waiter = None;
            inner.pending_preempt = false;
            inner.playback_gen += 1;
        }
        self.tts.stop();
    }

    /// Re-enable enqueues.
    pub fn unmute(&self) {
        self.lock().muted = false;
    }

    /// Drop queued entries but let the in-progress utterance finish.
    pub fn skip_stale(&self) {
        self.lock().queue.clear();
    }

    /// True iff speaking, queue non-empty, or inside the preempt debounce.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let inner = self.lock();
        inner.speaking || !inner.queue.is_empty() || inner.pending_preempt
    }

    /// Wait until the queue drains or `max_wait` elapses.
    pub async fn drain(&self, max_wait: Duration) {
        let deadline = tokio::time::Instant::now() + max_wait;
        while self.is_active() {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Start the next queued utterance if nothing is speaking.
///
/// Free function so the completion callback can re-enter without holding a
/// `NarrationQueue` reference. The backend is never called under the lock;
/// a synchronously-completing backend therefore cannot deadlock.
fn advance(inner: &Arc<Mutex<QueueInner>>, tts: &Arc<dyn TtsBackend>) {
    let (text, gen) = {
        let mut guard = inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.speaking || guard.muted {
            return;
        }
        let Some(entry) = guard.queue.pop_front() else {
            return;
        };
        guard.speaking = true;
        guard.current_waiter = entry.done_tx;
        (entry.text, guard.playback_gen)
    };

    let inner_cb = Arc::clone(inner);
    let tts_cb = Arc::clone(tts);
    let on_done = Box::new(move || {
        {
            let mut guard = inner_cb
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if guard.playback_gen != gen || !guard.speaking {
                // Interrupted or muted since this utterance started.
                return;
            }
            guard.speaking = false;
            if let Some(waiter) = guard.current_waiter.take() {
                let _ = waiter.send(());
            }
        }
        advance(&inner_cb, &tts_cb);
    });
    tts.speak(&text, on_done);
}

/// Backend that discards speech instantly. Used by the text REPL.
pub struct SilentTts;

impl TtsBackend for SilentTts {
    fn speak(&self, _text: &str, on_done: Box<dyn FnOnce() + Send>) {
        on_done();
    }
    fn stop(&self) {}
}
