use std::path::PathBuf;

use daw_graph::GraphError;

use crate::sequence::{Sequence, SequenceId};
use crate::track::TrackId;

#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error("sequence time must be finite and >= 0, got {0}")]
    InvalidTime(f64),

    #[error("playback rate must be finite and > 0, got {0}")]
    InvalidPlaybackRate(f64),

    #[error("cannot split sequence {sequence} at {at}s")]
    InvalidSplit { sequence: SequenceId, at: f64 },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("sequence {sequence} overlaps sequence {existing} on track {track}")]
    Overlap {
        track: TrackId,
        sequence: SequenceId,
        existing: SequenceId,
    },

    #[error("sequence {sequence} already belongs to track {owner}")]
    Ownership { sequence: SequenceId, owner: TrackId },

    #[error("track {0} is already playing")]
    AlreadyPlaying(TrackId),

    #[error("sequence {sequence} not found on track {track}")]
    SequenceNotFound { track: TrackId, sequence: SequenceId },

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// A rejected [`Track::add_sequence`](crate::Track::add_sequence). Carries the
/// sequence back so the caller keeps the clip.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct InsertError {
    #[source]
    pub error: TrackError,
    pub sequence: Sequence,
}

impl InsertError {
    pub fn into_sequence(self) -> Sequence {
        self.sequence
    }
}

impl From<InsertError> for TrackError {
    fn from(err: InsertError) -> Self {
        err.error
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("failed to open audio device: {0}")]
    Device(#[source] GraphError),

    #[error("failed to start track: {0}")]
    Track(#[from] TrackError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config '{path}': {field} {reason}")]
    Invalid {
        path: PathBuf,
        field: &'static str,
        reason: &'static str,
    },
}
