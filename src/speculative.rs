//! Speculative inference dispatch.
//!
//! Between "the user has stopped producing new words" and "STT has
//! finalized" there is commonly a one-to-three-second gap. A single-slot
//! dispatcher fires the model call early on a stable partial transcript;
//! once the final transcript lands, the result is claimed if the partial
//! turned out to be a faithful prefix of what the user said, and discarded
//! otherwise. Stale completions are neutralized by a generation token
//! rather than by touching user state.

use crate::config::SpeculationConfig;
use crate::error::Result;
use crate::inference::stream::ModelTurn;
use crate::voice::is_simple_command;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Poll interval while a claim waits on an in-flight call.
const CLAIM_POLL: Duration = Duration::from_millis(50);

/// Slot lifecycle. `Claimed` and `Cancelled` are terminal for the attempt;
/// a resolved slot accepts the next fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Inflight,
    Ready,
    Claimed,
    Cancelled,
}

impl SlotState {
    fn is_resolved(self) -> bool {
        matches!(self, Self::Idle | Self::Claimed | Self::Cancelled)
    }
}

struct SlotInner {
    state: SlotState,
    utterance_id: u64,
    generation: u64,
    partial: String,
    fired_at: Option<Instant>,
    ready_at: Option<Instant>,
    result: Option<ModelTurn>,
    last_fire: Option<Instant>,
    // Hit-rate accounting for runtime auto-disable.
    observed: u32,
    hits: u32,
    consecutive_misses: u32,
    disabled: bool,
}

/// Single-slot speculative dispatcher. Shared, internally synchronized.
pub struct SpeculativeDispatcher {
    inner: Arc<Mutex<SlotInner>>,
    config: SpeculationConfig,
}

impl SpeculativeDispatcher {
    #[must_use]
    pub fn new(config: SpeculationConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlotInner {
                state: SlotState::Idle,
                utterance_id: 0,
                generation: 0,
                partial: String::new(),
                fired_at: None,
                ready_at: None,
                result: None,
                last_fire: None,
                observed: 0,
                hits: 0,
                consecutive_misses: 0,
                disabled: false,
            })),
            config,
        }
    }

    /// Whether firing is currently worthwhile.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled && !self.lock().disabled
    }

    /// Fire the speculative call for `partial`.
    ///
    /// Rejected (returning `false`) unless the slot is resolved, the
    /// partial has at least two words, and the cooldown since the last
    /// fire has elapsed. `call` is the actual inference future; its result
    /// is installed only if the generation still matches.
    pub fn fire<F>(&self, utterance_id: u64, partial: &str, call: F) -> bool
    where
        F: Future<Output = Result<ModelTurn>> + Send + 'static,
    {
        if !self.enabled() {
            return false;
        }
        if partial.split_whitespace().count() < 2 {
            return false;
        }
        let generation = {
            let mut inner = self.lock();
            if !inner.state.is_resolved() {
                return false;
            }
            if let Some(last) = inner.last_fire {
                if last.elapsed() < Duration::from_millis(self.config.cooldown_ms) {
                    debug!("speculative fire suppressed by cooldown");
                    return false;
                }
            }
            inner.generation += 1;
            inner.state = SlotState::Inflight;
            inner.utterance_id = utterance_id;
            inner.partial = partial.to_owned();
            inner.fired_at = Some(Instant::now());
            inner.ready_at = None;
            inner.result = None;
            inner.last_fire = Some(Instant::now());
            inner.generation
        };
        info!("speculative fire on partial: \"{partial}\"");

        let slot = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = call.await;
            let mut inner = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if inner.generation != generation {
                // Cancelled or superseded while in flight.
                return;
            }
            match outcome {
                Ok(turn) => {
                    inner.state = SlotState::Ready;
                    inner.ready_at = Some(Instant::now());
                    inner.result = Some(turn);
                }
                Err(e) => {
                    debug!("speculative call failed: {e}");
                    inner.state = SlotState::Cancelled;
                }
            }
        });
        true
    }

    /// Claim the speculative result for the finalized transcript.
    ///
    /// Waits briefly for an in-flight call, then succeeds only when the
    /// utterance matches, the call took long enough to have processed real
    /// audio, and the partial is similar to the final transcript. A failed
    /// claim cancels the slot.
    pub async fn claim(&self, utterance_id: u64, final_text: &str) -> Option<ModelTurn> {
        let deadline = Instant::now() + Duration::from_millis(self.config.claim_wait_ms);
        loop {
            {
                let inner = self.lock();
                match inner.state {
                    SlotState::Inflight => {}
                    SlotState::Ready => break,
                    _ => return None,
                }
            }
            if Instant::now() >= deadline {
                debug!("claim timed out waiting for inflight call");
                self.cancel();
                return None;
            }
            sleep(CLAIM_POLL).await;
        }

        let claimed = {
            let mut inner = self.lock();
            let matches_utterance = inner.utterance_id == utterance_id;
            let processed_long_enough = match (inner.fired_at, inner.ready_at) {
                (Some(fired), Some(ready)) => {
                    ready.duration_since(fired)
                        >= Duration::from_millis(self.config.min_processing_ms)
                }
                _ => false,
            };
            let similar = is_similar(&inner.partial, final_text);
            if inner.state == SlotState::Ready
                && matches_utterance
                && processed_long_enough
                && similar
            {
                inner.state = SlotState::Claimed;
                inner.result.take()
            } else {
                debug!(
                    "claim rejected (utterance={matches_utterance}, \
                     timing={processed_long_enough}, similar={similar})"
                );
                None
            }
        };

        match claimed {
            Some(turn) => {
                self.resolve(true);
                info!("speculative hit: \"{final_text}\"");
                Some(turn)
            }
            None => {
                self.cancel();
                None
            }
        }
    }

    /// Cancel any in-flight or ready speculation. Safe to call repeatedly.
    pub fn cancel(&self) {
        let fired = {
            let mut inner = self.lock();
            let fired = !inner.state.is_resolved();
            inner.generation += 1;
            inner.state = SlotState::Cancelled;
            inner.result = None;
            fired
        };
        if fired {
            self.resolve(false);
        }
    }

    /// Record a hit/miss outcome and apply the auto-disable rules.
    fn resolve(&self, hit: bool) {
        let mut inner = self.lock();
        inner.observed += 1;
        if hit {
            inner.hits += 1;
            inner.consecutive_misses = 0;
        } else {
            inner.consecutive_misses += 1;
        }

        if inner.disabled {
            return;
        }
        let hit_rate = f64::from(inner.hits) / f64::from(inner.observed.max(1));
        let cold_streak =
            inner.hits == 0 && inner.consecutive_misses > self.config.max_consecutive_misses;
        let low_rate = inner.observed >= self.config.min_utterances
            && hit_rate < f64::from(self.config.min_hit_rate);
        if cold_streak || low_rate {
            warn!(
                "speculative execution disabled for this session \
                 ({}/{} hits)",
                inner.hits, inner.observed
            );
            inner.disabled = true;
        }
    }

    /// Current slot state, for the voice loop's bookkeeping.
    #[must_use]
    pub fn state(&self) -> SlotState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ── similarity predicate ─────────────────────────────────────────────

/// Filler words carrying no routing signal.
const STOPWORDS: &[&str] = &["the", "a", "an", "please", "can", "you", "could", "would"];

/// Leading verbs of short imperative commands. For very short inputs the
/// first token must be one of these and match on both sides.
const COMMAND_VERBS: &[&str] = &[
    "open", "go", "click", "search", "find", "type", "close", "switch", "tab", "run", "show",
    "hide", "scroll", "select", "copy", "paste", "delete", "send", "reply", "forward", "navigate",
    "maximize", "minimize",
];

fn normalize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(str::to_owned)
        .collect()
}

/// Order-preserving token similarity between a stable partial and the
/// final transcript. Any passing tier means similar.
#[must_use]
pub fn is_similar(partial: &str, final_text: &str) -> bool {
    let p = normalize(partial);
    let f = normalize(final_text);

    // The final must not have lost words relative to the partial.
    if f.len() < (p.len().saturating_sub(1)).max(2) {
        return false;
    }

    // Gate 1: both sides must route the same way.
    if is_simple_command(partial) != is_simple_command(final_text) {
        return false;
    }

    // Gate 2: short commands hinge on their verb.
    if p.len() <= 3 || f.len() <= 3 {
        match (p.first(), f.first()) {
            (Some(pv), Some(fv)) if pv == fv && COMMAND_VERBS.contains(&pv.as_str()) => {}
            _ => return false,
        }
    }

    // Tier A: exact token sequence.
    if p == f {
        return true;
    }
    // Tier B: the partial is a prefix of the final.
    if p.len() >= 2 && f.len() >= p.len() && f[..p.len()] == p[..] {
        return true;
    }
    // Tier C: equal short sequences differing by near-identical tokens.
    if p.len() == f.len()
        && (2..=3).contains(&p.len())
        && p[0] == f[0]
        && p[1..]
            .iter()
            .zip(&f[1..])
            .all(|(a, b)| levenshtein(a, b) <= 1)
    {
        return true;
    }
    // Tier D: whole-string edit distance under 15% of the longer side.
    let pj = p.join(" ");
    let fj = f.join(" ");
    let longer = pj.len().max(fj.len());
    longer > 0 && levenshtein(&pj, &fj) * 100 < longer * 15
}

/// Classic two-row Levenshtein distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
