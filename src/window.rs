// src/window.rs
use chrono::TimeDelta;

use crate::drivers::error::QueryError;
use crate::types::Timestamp;

/// Shortest window the slider can select.
pub const MIN_WINDOW: TimeDelta = TimeDelta::seconds(60);
/// Longest window, equal to the store horizon.
pub const MAX_WINDOW: TimeDelta = TimeDelta::seconds(24 * 3600);

/// Logarithmic slider mapping: `MIN_WINDOW * (MAX_WINDOW / MIN_WINDOW)^p`.
///
/// `p` is clamped to `[0, 1]`; NaN counts as 0.
pub fn window_duration(p: f64) -> TimeDelta {
    let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
    let min_ms = MIN_WINDOW.num_milliseconds() as f64;
    let ratio = MAX_WINDOW.num_milliseconds() as f64 / min_ms;
    let ms = (min_ms * ratio.powf(p)).round() as i64;
    TimeDelta::milliseconds(ms).clamp(MIN_WINDOW, MAX_WINDOW)
}

/// Inverse of [`window_duration`], for putting the slider where a window already is.
pub fn slider_position(duration: TimeDelta) -> f64 {
    let d = duration.clamp(MIN_WINDOW, MAX_WINDOW).num_milliseconds() as f64;
    let min_ms = MIN_WINDOW.num_milliseconds() as f64;
    let ratio = MAX_WINDOW.num_milliseconds() as f64 / min_ms;
    ((d / min_ms).ln() / ratio.ln()).clamp(0.0, 1.0)
}

/// Contiguous time range, `start <= end` always.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    start: Timestamp,
    end: Timestamp,
    live: bool,
}

impl TimeWindow {
    /// Fixed historical range. Rejects `start > end` instead of swapping.
    pub fn pinned(start: Timestamp, end: Timestamp) -> Result<Self, QueryError> {
        if start > end {
            return Err(QueryError::InvalidWindow { start, end });
        }
        Ok(Self {
            start,
            end,
            live: false,
        })
    }

    /// Window ending at `end` (normally now) that follows the clock.
    pub fn live_ending(end: Timestamp, duration: TimeDelta) -> Self {
        Self {
            start: end - duration.max(TimeDelta::zero()),
            end,
            live: true,
        }
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts <= self.end
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrollMode {
    /// End tracks the current time.
    AutoScroll,
    /// Both bounds fixed after a manual pan or zoom.
    Pinned { start: Timestamp, end: Timestamp },
}

/// Turns the slider position plus the scroll mode into the window to query.
#[derive(Clone, Debug)]
pub struct WindowResolver {
    position: f64,
    mode: ScrollMode,
}

impl Default for WindowResolver {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl WindowResolver {
    pub fn new(position: f64) -> Self {
        Self {
            position: clamp_position(position),
            mode: ScrollMode::AutoScroll,
        }
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn mode(&self) -> ScrollMode {
        self.mode
    }

    pub fn duration(&self) -> TimeDelta {
        window_duration(self.position)
    }

    /// Moves the slider. A pinned window keeps its end and grows or shrinks backwards.
    pub fn set_position(&mut self, p: f64) {
        self.position = clamp_position(p);
        if let ScrollMode::Pinned { end, .. } = self.mode {
            self.mode = ScrollMode::Pinned {
                start: end - self.duration(),
                end,
            };
        }
    }

    /// Sets the slider and returns the window for `now`.
    pub fn resolve(&mut self, p: f64, now: Timestamp) -> TimeWindow {
        self.set_position(p);
        self.current(now)
    }

    pub fn current(&self, now: Timestamp) -> TimeWindow {
        match self.mode {
            ScrollMode::AutoScroll => TimeWindow::live_ending(now, self.duration()),
            ScrollMode::Pinned { start, end } => TimeWindow {
                start,
                end,
                live: false,
            },
        }
    }

    /// Fixes an explicit range, e.g. after a zoom box. The slider follows the new width.
    pub fn pin(&mut self, window: TimeWindow) {
        self.position = slider_position(window.duration());
        self.mode = ScrollMode::Pinned {
            start: window.start(),
            end: window.end(),
        };
    }

    /// Shifts the window by `delta` (negative looks back). Leaves auto-scroll.
    pub fn pan(&mut self, delta: TimeDelta, now: Timestamp) {
        let window = self.current(now);
        self.mode = ScrollMode::Pinned {
            start: window.start() + delta,
            end: window.end() + delta,
        };
    }

    /// Back to auto-scroll.
    pub fn home(&mut self) {
        self.mode = ScrollMode::AutoScroll;
    }

    pub fn is_auto_scroll(&self) -> bool {
        self.mode == ScrollMode::AutoScroll
    }
}

fn clamp_position(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}
