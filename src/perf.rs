//! Voice-to-first-action latency tracking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

/// Samples retained for the session summary.
const SAMPLE_CAPACITY: usize = 50;

/// Ring buffer of per-utterance voice-to-first-action latencies.
#[derive(Debug, Default)]
pub struct PerfTracker {
    samples: Mutex<VecDeque<Duration>>,
}

impl PerfTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, latency: Duration) {
        let mut samples = self
            .samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if samples.len() == SAMPLE_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(latency);
        info!(
            "voice-to-first-action: {:.0}ms (n={})",
            latency.as_secs_f64() * 1000.0,
            samples.len()
        );
    }

    /// Median and worst latency over the retained window.
    #[must_use]
    pub fn summary(&self) -> Option<PerfSummary> {
        let samples = self
            .samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = samples.iter().copied().collect();
        sorted.sort_unstable();
        Some(PerfSummary {
            count: sorted.len(),
            median: sorted[sorted.len() / 2],
            max: *sorted.last().unwrap_or(&Duration::ZERO),
        })
    }
}

/// Aggregate latency figures.
#[derive(Debug, Clone, Copy)]
pub struct PerfSummary {
    pub count: usize,
    pub median: Duration,
    pub max: Duration,
}

/// Per-utterance guard that emits exactly one outcome.
///
/// Created when the microphone opens; `emit_action` stamps the latency of
/// the first executed action, `emit_no_action` closes utterances that never
/// acted. Both are idempotent; whichever fires first wins.
pub struct PerfGuard {
    tracker: Arc<PerfTracker>,
    started: Instant,
    emitted: AtomicBool,
}

impl PerfGuard {
    #[must_use]
    pub fn new(tracker: Arc<PerfTracker>) -> Self {
        Self {
            tracker,
            started: Instant::now(),
            emitted: AtomicBool::new(false),
        }
    }

    /// Record voice-to-first-action latency. No-op after the first emit.
    pub fn emit_action(&self) {
        if self.emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tracker.record(self.started.elapsed());
    }

    /// Close the utterance without an action. No-op after the first emit.
    pub fn emit_no_action(&self) {
        if self.emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "utterance ended without action after {:.0}ms",
            self.started.elapsed().as_secs_f64() * 1000.0
        );
    }
}
