//! Computer actions: parsing model tool input, the dispatch seam, and
//! repeat-click detection.
//!
//! Model-returned JSON uses open-form string keys; parsing tolerates missing
//! or unknown fields and maps unknown action names to `None` so the caller
//! can log and continue instead of aborting the batch.

use crate::error::Result;
use crate::screen::ScaleMap;
use serde_json::Value;

/// Scroll direction for the `scroll` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }
}

/// One atomic input event, in model (bitmap) coordinates until rescaled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenAction {
    LeftClick { x: i32, y: i32 },
    RightClick { x: i32, y: i32 },
    DoubleClick { x: i32, y: i32 },
    MiddleClick { x: i32, y: i32 },
    Type { text: String },
    Key { chord: String },
    Scroll { x: i32, y: i32, direction: ScrollDirection, amount: u32 },
    MouseMove { x: i32, y: i32 },
    Drag { start_x: i32, start_y: i32, end_x: i32, end_y: i32 },
    /// Reserved by the tool schema; the executor always supplies screenshots.
    Screenshot,
    CursorPosition,
}

impl ScreenAction {
    /// Parse a tool-use input object.
    ///
    /// Returns `None` for unknown action names; missing coordinates default
    /// to the origin rather than failing the batch.
    #[must_use]
    pub fn parse(input: &Value) -> Option<Self> {
        let name = input.get("action").and_then(Value::as_str)?;
        let (x, y) = coordinate(input, "coordinate");
        match name {
            "left_click" => Some(Self::LeftClick { x, y }),
            "right_click" => Some(Self::RightClick { x, y }),
            "double_click" => Some(Self::DoubleClick { x, y }),
            "middle_click" => Some(Self::MiddleClick { x, y }),
            "type" => Some(Self::Type {
                text: text_field(input, "text"),
            }),
            "key" => Some(Self::Key {
                chord: text_field(input, "key"),
            }),
            "scroll" => {
                let direction = input
                    .get("scroll_direction")
                    .and_then(Value::as_str)
                    .and_then(ScrollDirection::parse)
                    .unwrap_or(ScrollDirection::Down);
                let amount = input
                    .get("scroll_amount")
                    .and_then(Value::as_u64)
                    .unwrap_or(3) as u32;
                Some(Self::Scroll { x, y, direction, amount })
            }
            "mouse_move" => Some(Self::MouseMove { x, y }),
            "left_click_drag" => {
                let (start_x, start_y) = coordinate(input, "start_coordinate");
                Some(Self::Drag { start_x, start_y, end_x: x, end_y: y })
            }
            "screenshot" => Some(Self::Screenshot),
            "cursor_position" => Some(Self::CursorPosition),
            _ => None,
        }
    }

    /// Rescale model-space coordinates into logical screen space.
    #[must_use]
    pub fn to_screen(&self, scale: &ScaleMap) -> Self {
        let map = |x: i32, y: i32| scale.to_screen(x, y);
        match *self {
            Self::LeftClick { x, y } => {
                let (x, y) = map(x, y);
                Self::LeftClick { x, y }
            }
            Self::RightClick { x, y } => {
                let (x, y) = map(x, y);
                Self::RightClick { x, y }
            }
            Self::DoubleClick { x, y } => {
                let (x, y) = map(x, y);
                Self::DoubleClick { x, y }
            }
            Self::MiddleClick { x, y } => {
                let (x, y) = map(x, y);
                Self::MiddleClick { x, y }
            }
            Self::Scroll { x, y, direction, amount } => {
                let (x, y) = map(x, y);
                Self::Scroll { x, y, direction, amount }
            }
            Self::MouseMove { x, y } => {
                let (x, y) = map(x, y);
                Self::MouseMove { x, y }
            }
            Self::Drag { start_x, start_y, end_x, end_y } => {
                let (start_x, start_y) = map(start_x, start_y);
                let (end_x, end_y) = map(end_x, end_y);
                Self::Drag { start_x, start_y, end_x, end_y }
            }
            ref other => other.clone(),
        }
    }

    /// Model-space click coordinates, when this action is a click.
    #[must_use]
    pub fn click_point(&self) -> Option<(i32, i32)> {
        match *self {
            Self::LeftClick { x, y } | Self::RightClick { x, y } | Self::DoubleClick { x, y } => {
                Some((x, y))
            }
            _ => None,
        }
    }
}

fn coordinate(input: &Value, key: &str) -> (i32, i32) {
    let arr = input.get(key).and_then(Value::as_array);
    let at = |i: usize| {
        arr.and_then(|a| a.get(i))
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32
    };
    (at(0), at(1))
}

fn text_field(input: &Value, key: &str) -> String {
    input
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

/// Executes atomic input events in logical screen coordinates.
///
/// One operation at a time; implementations are internally synchronized.
pub trait ActionSink: Send + Sync {
    /// Perform one input event.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AgentError::Action`] if event dispatch fails.
    fn perform(&self, action: &ScreenAction) -> Result<()>;

    /// Maximize the currently focused window. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if window manipulation fails.
    fn maximize_foreground_window(&self) -> Result<()>;

    /// Current cursor position in logical coordinates.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor cannot be queried.
    fn cursor_position(&self) -> Result<(i32, i32)>;
}

/// Half-width of the repeat-click window, in model pixels.
const REPEAT_CLICK_WINDOW: i32 = 30;

/// Warning injected into the last tool-result when the model keeps clicking
/// the same spot. Part of the model-facing protocol.
pub const REPEAT_CLICK_WARNING: &str = "WARNING: You have clicked the same spot repeatedly \
without the screen changing as expected. Clicking there is not working. Switch strategies: \
use keyboard navigation (Tab, arrow keys, Return) and app-specific shortcuts instead of \
clicking again.";

/// Detects consecutive clicks stuck in one spot during an action batch.
///
/// Typing resets the record; escape, tab, scroll, and mouse moves do not.
#[derive(Debug, Default)]
pub struct ClickTracker {
    clicks: Vec<(i32, i32)>,
}

impl ClickTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one executed action (model-space coordinates). Returns the
    /// repeat-click warning when the threshold is crossed, at most once per
    /// stuck sequence.
    pub fn observe(&mut self, action: &ScreenAction) -> Option<&'static str> {
        if matches!(action, ScreenAction::Type { .. }) {
            self.clicks.clear();
            return None;
        }
        let Some((x, y)) = action.click_point() else {
            return None;
        };

        if let Some(&(fx, fy)) = self.clicks.first() {
            if (x - fx).abs() > REPEAT_CLICK_WINDOW || (y - fy).abs() > REPEAT_CLICK_WINDOW {
                // Wandered out of the window: this click starts a new record.
                self.clicks.clear();
                self.clicks.push((x, y));
                return None;
            }
        }
        self.clicks.push((x, y));

        if self.clicks.len() >= 2 {
            self.clicks.clear();
            return Some(REPEAT_CLICK_WARNING);
        }
        None
    }
}
