//! Audio graph boundary shared by the playback core and the device backends.
//!
//! The core never talks to an audio device directly. It opens an
//! [`AudioContext`] through a [`ContextFactory`], reads the context clock and
//! builds a small node graph per playback session:
//!
//! ```text
//! source ──▶ track gain ──▶ master gain ──▶ analyser ──▶ destination
//! ```
//!
//! `daw_engine` implements these traits on top of cpal. [`manual::ManualDevice`]
//! implements them with a clock that only moves when told to.

mod abort;
mod buffer;
pub mod manual;

pub use abort::{AbortHandle, AbortRegistration, abortable};
pub use buffer::{AudioArc, resample_audio_arc};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("audio context is closed")]
    Closed,

    #[error("audio command queue is full")]
    QueueFull,

    #[error("audio graph is full: {0}")]
    Capacity(&'static str),

    #[error("invalid node state: {0}")]
    InvalidState(&'static str),

    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("resampling failed: {0}")]
    Resample(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The device output. Every context exposes it under this id.
    pub const DESTINATION: NodeId = NodeId(0);
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Opens clock sessions on an audio device.
pub trait ContextFactory {
    type Context: AudioContext + 'static;

    /// Open a new session. The returned context clock starts at (or near) zero.
    fn open(&self, sample_rate_hint: Option<u32>) -> Result<Self::Context, GraphError>;
}

/// One open clock session and the node graph attached to it.
pub trait AudioContext {
    /// Seconds elapsed on the device clock since the session was opened.
    fn current_time(&self) -> f64;

    fn sample_rate(&self) -> u32;

    fn destination(&self) -> NodeId {
        NodeId::DESTINATION
    }

    fn create_gain(&mut self, output: NodeId) -> Result<Box<dyn GainNode>, GraphError>;

    fn create_analyser(
        &mut self,
        output: NodeId,
        frame_size: usize,
    ) -> Result<Box<dyn AnalyserNode>, GraphError>;

    fn create_buffer_source(
        &mut self,
        buffer: AudioArc,
        output: NodeId,
    ) -> Result<Box<dyn SourceNode>, GraphError>;

    /// Release the device. Nodes created from this context become inert.
    fn close(&mut self) -> Result<(), GraphError>;

    fn is_closed(&self) -> bool;
}

/// A one-shot buffer player. Dropping the node stops it.
pub trait SourceNode {
    fn id(&self) -> SourceId;

    /// Schedule playback at context time `when`, skipping the first `offset`
    /// seconds of the buffer. A `when` in the past starts immediately.
    fn start(&mut self, when: f64, offset: f64) -> Result<(), GraphError>;

    /// Halt rendering. A start that has not fired yet never becomes audible.
    fn stop(&mut self);

    fn set_playback_rate(&mut self, rate: f64);

    fn playback_rate(&self) -> f64;

    /// True once the buffer played to its end. A stopped source never reports
    /// ended.
    fn has_ended(&self) -> bool;
}

pub trait GainNode {
    fn id(&self) -> NodeId;

    fn gain(&self) -> f32;

    fn set_gain(&mut self, gain: f32);

    fn disconnect(&mut self);
}

/// Exposes the most recent time-domain samples that passed through it.
pub trait AnalyserNode {
    fn id(&self) -> NodeId;

    fn frame_size(&self) -> usize;

    /// Fill `out` with the latest samples, oldest first.
    fn read_time_domain(&mut self, out: &mut [f32]);

    fn disconnect(&mut self);
}
