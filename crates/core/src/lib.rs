//! Multitrack scheduling core.
//!
//! A [`Player`] owns [`Track`]s, a track owns [`Sequence`]s. Playback runs
//! against an audio clock opened through a [`ContextFactory`]; the host calls
//! [`Player::poll`] once per frame to pick up natural completion and analyser
//! data. [`Timeline`] is the ruler view-model and is independent of playback.

pub mod config;
pub mod emitter;
pub mod error;
pub mod format;
pub mod player;
pub mod sequence;
pub mod timeline;
pub mod track;

pub use config::EngineConfig;
pub use emitter::{Emitter, Event, ListenerId, Listeners};
pub use error::{ConfigError, InsertError, PlayerError, SequenceError, TrackError};
pub use format::{format_time, format_time_scale};
pub use player::{AnalysisFrame, Player, PlayerEvent, PlayerEventKind, PlayerState};
pub use sequence::{PlayOptions, Sequence, SequenceEvent, SequenceEventKind, SequenceId};
pub use timeline::{
    ScaleDirection, SeekUnit, Timeline, TimelineAction, TimelineEvent, TimelineEventKind,
    TimelineState, TimelineView, compute_view, px_to_time, scale_ratio, time_to_px,
};
pub use track::{SequenceGaps, Track, TrackEvent, TrackEventKind, TrackId};

pub use daw_graph::{AudioArc, AudioContext, ContextFactory, GraphError};
