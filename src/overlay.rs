//! Process-wide handle to the on-screen guidance overlay.
//!
//! The overlay widget itself is host-UI code living on the main thread; the
//! core only ever asks it to show or clear a highlight. The handle is
//! installed exactly once at startup and read from any task.

use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Minimal surface of the guidance overlay.
pub trait Overlay: Send + Sync {
    /// Highlight a point in logical screen coordinates with a short caption.
    fn show_highlight(&self, x: i32, y: i32, instruction: &str);

    /// Remove any visible highlight.
    fn clear(&self);
}

static OVERLAY: OnceLock<Arc<dyn Overlay>> = OnceLock::new();

/// Install the process-wide overlay handle. Later installs are ignored.
pub fn install(overlay: Arc<dyn Overlay>) {
    if OVERLAY.set(overlay).is_err() {
        debug!("overlay already installed, ignoring");
    }
}

/// The installed overlay, if any.
#[must_use]
pub fn handle() -> Option<Arc<dyn Overlay>> {
    OVERLAY.get().cloned()
}

/// Overlay that draws nothing. Used in text mode and tests.
pub struct NoopOverlay;

impl Overlay for NoopOverlay {
    fn show_highlight(&self, _x: i32, _y: i32, _instruction: &str) {}
    fn clear(&self) {}
}
