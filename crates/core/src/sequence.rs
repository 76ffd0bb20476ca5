use std::fmt;

use daw_graph::{AudioArc, AudioContext, NodeId, SourceNode};
use log::debug;
use uuid::Uuid;

use crate::emitter::{Emitter, Event, ListenerId, Listeners};
use crate::error::SequenceError;
use crate::track::TrackId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceId(Uuid);

impl SequenceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SequenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceEventKind {
    Play,
    Seek,
    Stop,
    Change,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequenceEvent {
    pub kind: SequenceEventKind,
    pub sequence: SequenceId,
}

impl Event for SequenceEvent {
    type Kind = SequenceEventKind;

    fn kind(&self) -> SequenceEventKind {
        self.kind
    }
}

/// Where and when a sequence (or a whole track) starts rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayOptions {
    /// Node to connect to. Defaults to the context destination.
    pub output: Option<NodeId>,
    /// Context time that timeline position `playback_start_time` maps to.
    /// Defaults to the context's current time.
    pub reference_time: Option<f64>,
    /// Timeline position (seconds) playback starts from.
    pub playback_start_time: f64,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            output: None,
            reference_time: None,
            playback_start_time: 0.0,
        }
    }
}

struct Playback {
    output: NodeId,
    source: Option<Box<dyn SourceNode>>,
}

/// A buffer anchored at a timeline position.
///
/// The sequence owns its playback state: `play` schedules a source on the
/// context it is handed, `stop` (or dropping the sequence) silences it. The
/// context itself is only borrowed for the duration of each call.
pub struct Sequence {
    id: SequenceId,
    time: f64,
    buffer: AudioArc,
    playback_rate: f64,
    selected: bool,
    track: Option<TrackId>,
    playback: Option<Playback>,
    emitter: Emitter<SequenceEvent>,
}

fn validate_time(time: f64) -> Result<f64, SequenceError> {
    if time.is_finite() && time >= 0.0 {
        Ok(time)
    } else {
        Err(SequenceError::InvalidTime(time))
    }
}

fn validate_rate(rate: f64) -> Result<f64, SequenceError> {
    if rate.is_finite() && rate > 0.0 {
        Ok(rate)
    } else {
        Err(SequenceError::InvalidPlaybackRate(rate))
    }
}

impl Sequence {
    pub fn new(buffer: AudioArc, time: f64) -> Result<Self, SequenceError> {
        Ok(Self {
            id: SequenceId::new(),
            time: validate_time(time)?,
            buffer,
            playback_rate: 1.0,
            selected: false,
            track: None,
            playback: None,
            emitter: Emitter::new(),
        })
    }

    pub fn with_playback_rate(mut self, rate: f64) -> Result<Self, SequenceError> {
        self.playback_rate = validate_rate(rate)?;
        Ok(self)
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Move the anchor. Never starts audio; a playing sequence keeps its
    /// current schedule until the next seek or play.
    pub fn set_time(&mut self, time: f64) -> Result<(), SequenceError> {
        let time = validate_time(time)?;
        if time != self.time {
            self.time = time;
            self.emit(SequenceEventKind::Change);
        }
        Ok(())
    }

    pub fn buffer(&self) -> &AudioArc {
        &self.buffer
    }

    /// Length of the buffer in seconds at its native rate.
    pub fn duration(&self) -> f64 {
        self.buffer.duration_secs()
    }

    /// Timeline length: buffer duration divided by the playback rate.
    pub fn playback_duration(&self) -> f64 {
        self.buffer.duration_secs() / self.playback_rate
    }

    pub fn end_time(&self) -> f64 {
        self.time + self.playback_duration()
    }

    pub fn playback_rate(&self) -> f64 {
        self.playback_rate
    }

    /// Change the rate. A source that is already scheduled or rendering picks
    /// the new rate up immediately; its start instant is not recomputed.
    pub fn set_playback_rate(&mut self, rate: f64) -> Result<(), SequenceError> {
        let rate = validate_rate(rate)?;
        if rate == self.playback_rate {
            return Ok(());
        }

        self.playback_rate = rate;
        if let Some(source) = self.active_source_mut() {
            source.set_playback_rate(rate);
        }
        self.emit(SequenceEventKind::Change);
        Ok(())
    }

    pub fn selected(&self) -> bool {
        self.selected
    }

    pub fn set_selected(&mut self, selected: bool) {
        if selected != self.selected {
            self.selected = selected;
            self.emit(SequenceEventKind::Change);
        }
    }

    /// The track this sequence has been placed on, if any.
    pub fn track(&self) -> Option<TrackId> {
        self.track
    }

    pub(crate) fn set_track(&mut self, track: Option<TrackId>) {
        self.track = track;
    }

    /// A source is scheduled or rendering.
    pub fn is_playing(&self) -> bool {
        self.playback
            .as_ref()
            .is_some_and(|playback| playback.source.is_some())
    }

    /// A playback session is open, even if nothing is left to render.
    pub fn is_active(&self) -> bool {
        self.playback.is_some()
    }

    pub fn add_listener(
        &self,
        kind: SequenceEventKind,
        handler: impl Fn(&SequenceEvent) + 'static,
    ) -> ListenerId {
        self.emitter.listeners().add(kind, handler)
    }

    pub fn remove_listener(&self, kind: SequenceEventKind, id: ListenerId) -> bool {
        self.emitter.listeners().remove(kind, id)
    }

    pub fn listeners(&self) -> &Listeners<SequenceEvent> {
        self.emitter.listeners()
    }

    /// Start rendering relative to `options.reference_time`.
    ///
    /// A sequence anchored after the start position is scheduled in the
    /// future; one that straddles it starts at the reference time, skipping
    /// the part already behind the playhead; one entirely in the past opens a
    /// session but renders nothing. No-op while a source is already live.
    pub fn play(
        &mut self,
        context: &mut dyn AudioContext,
        options: &PlayOptions,
    ) -> Result<(), SequenceError> {
        if self.is_playing() {
            return Ok(());
        }

        let reference_time = options
            .reference_time
            .unwrap_or_else(|| context.current_time());
        let output = options.output.unwrap_or_else(|| context.destination());

        self.playback = Some(Playback {
            output,
            source: None,
        });
        if let Err(err) =
            self.start_source(context, options.playback_start_time, reference_time)
        {
            self.playback = None;
            return Err(err);
        }

        debug!(
            "sequence {} play from {:.3}s at t={:.3}",
            self.id, options.playback_start_time, reference_time
        );
        self.emit(SequenceEventKind::Play);
        Ok(())
    }

    /// Reschedule an open session from timeline position `time`. Does nothing
    /// without a session.
    pub fn seek(
        &mut self,
        context: &mut dyn AudioContext,
        time: f64,
        reference_time: Option<f64>,
    ) -> Result<(), SequenceError> {
        let Some(playback) = self.playback.as_mut() else {
            return Ok(());
        };
        if let Some(mut source) = playback.source.take() {
            source.stop();
        }

        let reference_time = reference_time.unwrap_or_else(|| context.current_time());
        if let Err(err) = self.start_source(context, time, reference_time) {
            self.playback = None;
            self.emit(SequenceEventKind::Stop);
            return Err(err);
        }

        self.emit(SequenceEventKind::Seek);
        Ok(())
    }

    /// Halt rendering and close the session. Idempotent.
    pub fn stop(&mut self) {
        let Some(playback) = self.playback.take() else {
            return;
        };
        if let Some(mut source) = playback.source {
            source.stop();
        }

        debug!("sequence {} stopped", self.id);
        self.emit(SequenceEventKind::Stop);
    }

    /// Check for natural completion. Returns true when the source ran out
    /// during this call; the session is closed and `Stop` is emitted.
    pub fn poll(&mut self) -> bool {
        let ended = self
            .playback
            .as_ref()
            .and_then(|playback| playback.source.as_ref())
            .is_some_and(|source| source.has_ended());

        if ended {
            self.playback = None;
            debug!("sequence {} ended", self.id);
            self.emit(SequenceEventKind::Stop);
        }
        ended
    }

    /// Cut the sequence `at` seconds (timeline time) after its anchor.
    ///
    /// Both halves get fresh ids, keep the playback rate and are not placed on
    /// any track.
    pub fn split(&self, at: f64) -> Result<(Sequence, Sequence), SequenceError> {
        if !(at > 0.0 && at < self.playback_duration()) {
            return Err(SequenceError::InvalidSplit {
                sequence: self.id,
                at,
            });
        }

        let split_frame =
            (at * self.playback_rate * self.buffer.sample_rate() as f64).round() as usize;
        let frames = self.buffer.frames();
        if split_frame == 0 || split_frame >= frames {
            return Err(SequenceError::InvalidSplit {
                sequence: self.id,
                at,
            });
        }

        let left = Sequence::new(self.buffer.slice_frames(0..split_frame), self.time)?
            .with_playback_rate(self.playback_rate)?;
        let right_time = self.time + split_frame as f64 / self.buffer.sample_rate() as f64
            / self.playback_rate;
        let right = Sequence::new(self.buffer.slice_frames(split_frame..frames), right_time)?
            .with_playback_rate(self.playback_rate)?;

        Ok((left, right))
    }

    /// A copy with a new identity, not placed on any track.
    pub fn duplicate(&self) -> Sequence {
        Sequence {
            id: SequenceId::new(),
            track: None,
            ..self.clone()
        }
    }

    fn start_source(
        &mut self,
        context: &mut dyn AudioContext,
        playback_start_time: f64,
        reference_time: f64,
    ) -> Result<(), SequenceError> {
        let time = self.time;
        let rate = self.playback_rate;
        if time + self.playback_duration() < playback_start_time {
            return Ok(());
        }
        let Some(playback) = self.playback.as_mut() else {
            return Ok(());
        };

        let mut source = context.create_buffer_source(self.buffer.clone(), playback.output)?;
        source.set_playback_rate(rate);

        let source_offset = time - playback_start_time;
        if source_offset >= 0.0 {
            source.start(reference_time + source_offset, 0.0)?;
        } else {
            // timeline seconds behind the playhead, converted to buffer seconds
            source.start(reference_time, -source_offset * rate)?;
        }

        playback.source = Some(source);
        Ok(())
    }

    fn active_source_mut(&mut self) -> Option<&mut Box<dyn SourceNode>> {
        self.playback
            .as_mut()
            .and_then(|playback| playback.source.as_mut())
    }

    fn emit(&self, kind: SequenceEventKind) {
        self.emitter.dispatch(&SequenceEvent {
            kind,
            sequence: self.id,
        });
    }
}

/// Clones share the identity (id and owning track) of the original but start
/// idle and without listeners. Placing a clone of an owned sequence on a track
/// is rejected as double ownership; use [`Sequence::duplicate`] for a copy
/// with its own identity.
impl Clone for Sequence {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            time: self.time,
            buffer: self.buffer.clone(),
            playback_rate: self.playback_rate,
            selected: self.selected,
            track: self.track,
            playback: None,
            emitter: Emitter::new(),
        }
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("id", &self.id)
            .field("time", &self.time)
            .field("buffer", &self.buffer)
            .field("playback_rate", &self.playback_rate)
            .field("track", &self.track)
            .field("playing", &self.is_playing())
            .finish()
    }
}
