//! Zoom/pan state of the time ruler and the tick layout derived from it.
//!
//! `offset` is the timeline time (seconds) at the left edge of the view and
//! `zoom` the number of seconds covered by [`TICK_TARGET_WIDTH`] pixels. Major
//! ticks snap to a fixed list of readable increments; the minor-tick pattern is
//! picked so subdivisions stay even for that increment.

use crate::emitter::{Emitter, Event, ListenerId, Listeners};

/// Preferred distance between two major ticks, in pixels.
pub const TICK_TARGET_WIDTH: f64 = 96.0;

pub const DEFAULT_ZOOM: f64 = 10.0;
pub const ZOOM_STEP: f64 = 0.25;

/// Closest zoom: 24 steps in from the default scale of 1.
pub fn min_zoom() -> f64 {
    (1.0 - ZOOM_STEP).powi(24)
}

/// Widest zoom: 48 steps out from the default scale of 1.
pub fn max_zoom() -> f64 {
    (1.0 + ZOOM_STEP).powi(48)
}

/// Pixels per second at a ratio of 1.
pub const BASE_WIDTH: f64 = 16.0;

const RATIO_MIN: f64 = 0.1;
const RATIO_MAX: f64 = 1000.0;

const INCREMENT_STEPS: [f64; 30] = [
    0.001, 0.002, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, // sub-second
    1.0, 2.0, 5.0, 10.0, 15.0, 20.0, 30.0, // seconds
    60.0, 120.0, 300.0, 600.0, 900.0, 1200.0, 1800.0, // minutes
    3600.0, 7200.0, 10800.0, 18000.0, 21600.0, 43200.0, 86400.0, // hours
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineState {
    pub offset: f64,
    pub zoom: f64,
}

impl Default for TimelineState {
    fn default() -> Self {
        Self {
            offset: 0.0,
            zoom: DEFAULT_ZOOM,
        }
    }
}

impl TimelineState {
    /// Seconds per pixel.
    pub fn offset_scale(&self) -> f64 {
        self.zoom / TICK_TARGET_WIDTH
    }

    /// Timeline time under pixel `px` of the view.
    pub fn time_at(&self, px: f64) -> f64 {
        self.offset + px * self.offset_scale()
    }

    /// View pixel of timeline time `time`. Negative when scrolled past it.
    pub fn position_of(&self, time: f64) -> f64 {
        (time - self.offset) / self.offset_scale()
    }
}

/// What a ruler renderer needs: draw major ticks at
/// `tick_offset + n * tick_increment` labelled `time_start + n * time_increment`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineView {
    /// Position of the first major tick (px, <= 0).
    pub tick_offset: f64,
    /// Distance between major ticks (px).
    pub tick_increment: f64,
    /// Minor tick heights between two major ticks; 1 is the tallest.
    pub tick_intermediate: &'static [u8],
    /// Time at the first major tick (seconds).
    pub time_start: f64,
    /// Time between major ticks (seconds).
    pub time_increment: f64,
    /// Scroll position (px).
    pub scroll_offset: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekUnit {
    Px,
    Sec,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimelineAction {
    /// Zoom around the cursor. Positive factors zoom out (more seconds per
    /// pixel), negative ones zoom in.
    Zoom {
        factor: f64,
        cursor_position: f64,
        container_width: f64,
    },
    /// Scroll to (or by, when `relative`) `offset`.
    Seek {
        offset: f64,
        unit: SeekUnit,
        relative: bool,
    },
}

fn optimal_time_increment(offset_scale: f64) -> f64 {
    let target = TICK_TARGET_WIDTH * offset_scale;
    let mut best = target;
    let mut best_delta = f64::INFINITY;

    let (mut low, mut high) = (0usize, INCREMENT_STEPS.len());
    while low < high {
        let mid = (low + high) / 2;
        let step = INCREMENT_STEPS[mid];
        let delta = (step - target).abs();
        if delta < best_delta {
            best = step;
            best_delta = delta;
        }

        if step == target {
            break;
        } else if step < target {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    best
}

fn tick_intermediate(time_increment: f64) -> &'static [u8] {
    let base = if time_increment > 3600.0 {
        (time_increment / 3600.0) as u64
    } else if time_increment > 60.0 {
        (time_increment / 60.0) as u64
    } else if time_increment < 1.0 {
        match (time_increment * 1000.0) as u64 {
            1 => return &[],
            2 => return &[1],
            ms => ms,
        }
    } else {
        time_increment as u64
    };

    if base % 3 == 0 && base % 5 != 0 {
        &[1, 1]
    } else {
        &[1, 2, 1, 2]
    }
}

pub fn compute_view(state: &TimelineState) -> TimelineView {
    let offset_scale = state.offset_scale();
    let scroll_offset = state.offset / offset_scale;
    let time_increment = optimal_time_increment(offset_scale);
    let tick_increment = time_increment / offset_scale;

    TimelineView {
        tick_offset: -scroll_offset % tick_increment,
        tick_increment,
        tick_intermediate: tick_intermediate(time_increment),
        time_start: (scroll_offset / tick_increment).trunc() * time_increment,
        time_increment,
        scroll_offset,
    }
}

/// Pure reducer over [`TimelineState`].
pub fn apply(state: TimelineState, action: TimelineAction) -> TimelineState {
    match action {
        TimelineAction::Zoom {
            factor,
            cursor_position,
            container_width,
        } => {
            if !(container_width > 0.0) || !factor.is_finite() {
                return state;
            }
            let cursor_fraction = cursor_position / container_width;
            let prev_width = container_width * state.offset_scale();

            let step = 1.0 + ZOOM_STEP * factor.abs();
            let zoom = if factor < 0.0 {
                (state.zoom / step).max(min_zoom())
            } else {
                (state.zoom * step).min(max_zoom())
            };

            let new_width = container_width * zoom / TICK_TARGET_WIDTH;
            let offset = state.offset + (prev_width - new_width) * cursor_fraction;
            TimelineState {
                offset: offset.max(0.0),
                zoom,
            }
        }
        TimelineAction::Seek {
            offset,
            unit,
            relative,
        } => {
            let offset = match unit {
                SeekUnit::Px => offset * state.offset_scale(),
                SeekUnit::Sec => offset,
            };
            let offset = if relative {
                state.offset + offset
            } else {
                offset
            };
            TimelineState {
                offset: offset.max(0.0),
                zoom: state.zoom,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimelineEventKind {
    Change,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineEvent {
    pub kind: TimelineEventKind,
    pub state: TimelineState,
    pub view: TimelineView,
}

impl Event for TimelineEvent {
    type Kind = TimelineEventKind;

    fn kind(&self) -> TimelineEventKind {
        self.kind
    }
}

/// Timeline state with its cached view. Emits `Change` whenever an action
/// actually moves the state.
#[derive(Debug)]
pub struct Timeline {
    state: TimelineState,
    view: TimelineView,
    emitter: Emitter<TimelineEvent>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::with_state(TimelineState::default())
    }
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: TimelineState) -> Self {
        Self {
            view: compute_view(&state),
            state,
            emitter: Emitter::new(),
        }
    }

    pub fn state(&self) -> TimelineState {
        self.state
    }

    pub fn view(&self) -> &TimelineView {
        &self.view
    }

    pub fn add_listener(
        &self,
        kind: TimelineEventKind,
        handler: impl Fn(&TimelineEvent) + 'static,
    ) -> ListenerId {
        self.emitter.listeners().add(kind, handler)
    }

    pub fn remove_listener(&self, kind: TimelineEventKind, id: ListenerId) -> bool {
        self.emitter.listeners().remove(kind, id)
    }

    pub fn listeners(&self) -> &Listeners<TimelineEvent> {
        self.emitter.listeners()
    }

    /// Returns true if the state changed.
    pub fn dispatch(&mut self, action: TimelineAction) -> bool {
        self.set_state(apply(self.state, action))
    }

    pub fn zoom(&mut self, factor: f64, cursor_position: f64, container_width: f64) -> bool {
        self.dispatch(TimelineAction::Zoom {
            factor,
            cursor_position,
            container_width,
        })
    }

    pub fn seek(&mut self, offset: f64, unit: SeekUnit, relative: bool) -> bool {
        self.dispatch(TimelineAction::Seek {
            offset,
            unit,
            relative,
        })
    }

    pub fn set_state(&mut self, state: TimelineState) -> bool {
        if state == self.state {
            return false;
        }
        self.state = state;
        self.view = compute_view(&state);
        self.emitter.dispatch(&TimelineEvent {
            kind: TimelineEventKind::Change,
            state,
            view: self.view,
        });
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Up,
    Down,
}

/// Step a pixel ratio by 4/5 (`Up`) or 5/4 (`Down`). A step that would leave
/// `(0.1, 1000)` returns the ratio unchanged.
pub fn scale_ratio(ratio: f64, direction: ScaleDirection) -> f64 {
    let scaled = match direction {
        ScaleDirection::Up => ratio * 4.0 / 5.0,
        ScaleDirection::Down => ratio * 5.0 / 4.0,
    };
    if scaled > RATIO_MIN && scaled < RATIO_MAX {
        scaled
    } else {
        ratio
    }
}

pub fn time_to_px(ratio: f64, seconds: f64) -> f64 {
    ratio * seconds * BASE_WIDTH
}

pub fn px_to_time(ratio: f64, px: f64) -> f64 {
    px / BASE_WIDTH / ratio
}
