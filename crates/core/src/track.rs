use std::fmt;

use daw_graph::{AudioContext, GainNode};
use log::debug;
use uuid::Uuid;

use crate::emitter::{Emitter, Event, ListenerId, Listeners};
use crate::error::{InsertError, SequenceError, TrackError};
use crate::sequence::{PlayOptions, Sequence, SequenceId};

/// Default slack (seconds) when comparing sequence intervals for overlap.
pub const DEFAULT_OVERLAP_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(Uuid);

impl TrackId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackEventKind {
    Play,
    Stop,
    Change,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackEvent {
    pub kind: TrackEventKind,
    pub track: TrackId,
}

impl Event for TrackEvent {
    type Kind = TrackEventKind;

    fn kind(&self) -> TrackEventKind {
        self.kind
    }
}

/// Free timeline space around a sequence, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequenceGaps {
    /// Distance to the end of the previous sequence, or to zero if there is none.
    pub before: f64,
    /// Distance to the start of the next sequence; infinite for the last one.
    pub after: f64,
}

/// An ordered, overlap-free lane of sequences.
pub struct Track {
    id: TrackId,
    name: String,
    locked: bool,
    muted: bool,
    sequences: Vec<Sequence>,
    overlap_tolerance: f64,
    gain: Option<Box<dyn GainNode>>,
    emitter: Emitter<TrackEvent>,
}

impl Track {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TrackId::new(),
            name: name.into(),
            locked: false,
            muted: false,
            sequences: Vec::new(),
            overlap_tolerance: DEFAULT_OVERLAP_TOLERANCE,
            gain: None,
            emitter: Emitter::new(),
        }
    }

    pub fn with_overlap_tolerance(mut self, tolerance: f64) -> Self {
        self.overlap_tolerance = tolerance.max(0.0);
        self
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        if name != self.name {
            self.name = name;
            self.emit(TrackEventKind::Change);
        }
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Advisory flag for editing tools. Playback ignores it.
    pub fn set_locked(&mut self, locked: bool) {
        if locked != self.locked {
            self.locked = locked;
            self.emit(TrackEventKind::Change);
        }
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        if muted == self.muted {
            return;
        }
        self.muted = muted;
        if let Some(gain) = self.gain.as_mut() {
            gain.set_gain(if muted { 0.0 } else { 1.0 });
        }
        self.emit(TrackEventKind::Change);
    }

    pub fn overlap_tolerance(&self) -> f64 {
        self.overlap_tolerance
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn sequence(&self, id: SequenceId) -> Option<&Sequence> {
        self.sequences.iter().find(|sequence| sequence.id() == id)
    }

    pub fn sequence_count(&self) -> usize {
        self.sequences.len()
    }

    /// End of the last sequence, 0 for an empty track.
    pub fn duration(&self) -> f64 {
        self.sequences
            .iter()
            .map(Sequence::end_time)
            .fold(0.0, f64::max)
    }

    /// Some sequence still has a source scheduled or rendering.
    pub fn is_playing(&self) -> bool {
        self.sequences.iter().any(Sequence::is_playing)
    }

    /// A playback session (the track gain stage) is open.
    pub fn is_active(&self) -> bool {
        self.gain.is_some()
    }

    pub fn add_listener(
        &self,
        kind: TrackEventKind,
        handler: impl Fn(&TrackEvent) + 'static,
    ) -> ListenerId {
        self.emitter.listeners().add(kind, handler)
    }

    pub fn remove_listener(&self, kind: TrackEventKind, id: ListenerId) -> bool {
        self.emitter.listeners().remove(kind, id)
    }

    pub fn listeners(&self) -> &Listeners<TrackEvent> {
        self.emitter.listeners()
    }

    /// Place a sequence on this track.
    ///
    /// Rejected if the sequence already belongs to a track, or if its
    /// interval intersects one already here. The sequence comes back inside
    /// the error in both cases.
    pub fn add_sequence(&mut self, mut sequence: Sequence) -> Result<SequenceId, InsertError> {
        if let Some(owner) = sequence.track() {
            return Err(InsertError {
                error: TrackError::Ownership {
                    sequence: sequence.id(),
                    owner,
                },
                sequence,
            });
        }

        if let Some(existing) = self.find_overlap(sequence.time(), sequence.end_time(), None) {
            return Err(InsertError {
                error: TrackError::Overlap {
                    track: self.id,
                    sequence: sequence.id(),
                    existing,
                },
                sequence,
            });
        }

        let id = sequence.id();
        sequence.set_track(Some(self.id));
        self.insert_sorted(sequence);
        self.emit(TrackEventKind::Change);
        Ok(id)
    }

    /// Detach a sequence, stopping it first. `None` if it is not on this track.
    pub fn remove_sequence(&mut self, id: SequenceId) -> Option<Sequence> {
        let index = self.index_of(id)?;
        let mut sequence = self.sequences.remove(index);
        sequence.stop();
        sequence.set_track(None);
        self.emit(TrackEventKind::Change);
        Some(sequence)
    }

    /// Re-anchor a sequence, keeping the track sorted and overlap-free.
    pub fn move_sequence(&mut self, id: SequenceId, time: f64) -> Result<(), TrackError> {
        let index = self.require(id)?;
        if !(time.is_finite() && time >= 0.0) {
            return Err(SequenceError::InvalidTime(time).into());
        }

        let end = time + self.sequences[index].playback_duration();
        if let Some(existing) = self.find_overlap(time, end, Some(id)) {
            return Err(TrackError::Overlap {
                track: self.id,
                sequence: id,
                existing,
            });
        }

        let mut sequence = self.sequences.remove(index);
        sequence.set_time(time)?;
        self.insert_sorted(sequence);
        self.emit(TrackEventKind::Change);
        Ok(())
    }

    /// Change a sequence's playback rate. Rejected if the stretched sequence
    /// would run into its neighbour.
    pub fn set_sequence_playback_rate(
        &mut self,
        id: SequenceId,
        rate: f64,
    ) -> Result<(), TrackError> {
        let index = self.require(id)?;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(SequenceError::InvalidPlaybackRate(rate).into());
        }

        let sequence = &self.sequences[index];
        let start = sequence.time();
        let end = start + sequence.duration() / rate;
        if let Some(existing) = self.find_overlap(start, end, Some(id)) {
            return Err(TrackError::Overlap {
                track: self.id,
                sequence: id,
                existing,
            });
        }

        self.sequences[index].set_playback_rate(rate)?;
        self.emit(TrackEventKind::Change);
        Ok(())
    }

    pub fn set_sequence_selected(&mut self, id: SequenceId, selected: bool) -> Result<(), TrackError> {
        let index = self.require(id)?;
        self.sequences[index].set_selected(selected);
        Ok(())
    }

    /// Replace a sequence by its two halves, cut `at` seconds after its anchor.
    pub fn split_sequence(
        &mut self,
        id: SequenceId,
        at: f64,
    ) -> Result<(SequenceId, SequenceId), TrackError> {
        let index = self.require(id)?;
        let (mut left, mut right) = self.sequences[index].split(at)?;

        let mut original = self.sequences.remove(index);
        original.stop();
        original.set_track(None);

        let ids = (left.id(), right.id());
        left.set_track(Some(self.id));
        right.set_track(Some(self.id));
        self.sequences.insert(index, right);
        self.sequences.insert(index, left);

        debug!("track {} split sequence {} at {:.3}s", self.id, id, at);
        self.emit(TrackEventKind::Change);
        Ok(ids)
    }

    pub fn sequence_gaps(&self, id: SequenceId) -> Option<SequenceGaps> {
        let index = self.index_of(id)?;
        let sequence = &self.sequences[index];

        let before = match index.checked_sub(1) {
            Some(prev) => sequence.time() - self.sequences[prev].end_time(),
            None => sequence.time(),
        };
        let after = match self.sequences.get(index + 1) {
            Some(next) => next.time() - sequence.end_time(),
            None => f64::INFINITY,
        };

        Some(SequenceGaps {
            before: before.max(0.0),
            after: after.max(0.0),
        })
    }

    /// Open a playback session: a gain stage on `options.output` and a start
    /// issued to every sequence against one shared reference time.
    ///
    /// Either every sequence starts or none stays scheduled: the first failure
    /// stops the ones already started and is returned.
    pub fn play(
        &mut self,
        context: &mut dyn AudioContext,
        options: &PlayOptions,
    ) -> Result<(), TrackError> {
        if self.gain.is_some() {
            return Err(TrackError::AlreadyPlaying(self.id));
        }

        let output = options.output.unwrap_or_else(|| context.destination());
        let mut gain = context.create_gain(output)?;
        gain.set_gain(if self.muted { 0.0 } else { 1.0 });

        let child = PlayOptions {
            output: Some(gain.id()),
            reference_time: Some(
                options
                    .reference_time
                    .unwrap_or_else(|| context.current_time()),
            ),
            playback_start_time: options.playback_start_time,
        };

        let results: Vec<Result<(), SequenceError>> = self
            .sequences
            .iter_mut()
            .map(|sequence| sequence.play(context, &child))
            .collect();

        if let Some(err) = results.into_iter().find_map(Result::err) {
            for sequence in &mut self.sequences {
                sequence.stop();
            }
            gain.disconnect();
            return Err(err.into());
        }

        self.gain = Some(gain);
        debug!(
            "track {} playing {} sequences from {:.3}s",
            self.id,
            self.sequences.len(),
            options.playback_start_time
        );
        self.emit(TrackEventKind::Play);
        Ok(())
    }

    /// Reschedule every sequence from `time`. Does nothing without a session.
    pub fn seek(
        &mut self,
        context: &mut dyn AudioContext,
        time: f64,
        reference_time: Option<f64>,
    ) -> Result<(), TrackError> {
        let Some(gain) = self.gain.as_ref() else {
            return Ok(());
        };

        let reference_time = reference_time.unwrap_or_else(|| context.current_time());
        let child = PlayOptions {
            output: Some(gain.id()),
            reference_time: Some(reference_time),
            playback_start_time: time,
        };

        let results: Vec<Result<(), SequenceError>> = self
            .sequences
            .iter_mut()
            .map(|sequence| {
                if sequence.is_active() {
                    sequence.seek(context, time, Some(reference_time))
                } else {
                    sequence.play(context, &child)
                }
            })
            .collect();

        if let Some(err) = results.into_iter().find_map(Result::err) {
            self.stop();
            return Err(err.into());
        }
        Ok(())
    }

    /// Stop every sequence and close the session. Idempotent.
    pub fn stop(&mut self) {
        for sequence in &mut self.sequences {
            sequence.stop();
        }
        self.finish();
    }

    /// Collect natural completions. Returns true when the last sequence ran
    /// out during this call; the session is closed and `Stop` is emitted.
    pub fn poll(&mut self) -> bool {
        if self.gain.is_none() {
            return false;
        }

        for sequence in &mut self.sequences {
            sequence.poll();
        }
        if self.is_playing() {
            return false;
        }

        self.stop();
        true
    }

    fn finish(&mut self) {
        let Some(mut gain) = self.gain.take() else {
            return;
        };
        gain.disconnect();
        debug!("track {} stopped", self.id);
        self.emit(TrackEventKind::Stop);
    }

    fn find_overlap(&self, start: f64, end: f64, ignore: Option<SequenceId>) -> Option<SequenceId> {
        self.sequences
            .iter()
            .filter(|other| Some(other.id()) != ignore)
            .find(|other| {
                let (other_start, other_end) = (other.time(), other.end_time());
                // slack never exceeds half the shorter clip
                let eps = self
                    .overlap_tolerance
                    .min((end - start).min(other_end - other_start).max(0.0) / 2.0);
                (start < other_end - eps && other_start < end - eps)
                    || (start - other_start).abs() <= self.overlap_tolerance
            })
            .map(Sequence::id)
    }

    fn insert_sorted(&mut self, sequence: Sequence) {
        let index = self
            .sequences
            .partition_point(|other| other.time() <= sequence.time());
        self.sequences.insert(index, sequence);
    }

    fn index_of(&self, id: SequenceId) -> Option<usize> {
        self.sequences.iter().position(|sequence| sequence.id() == id)
    }

    fn require(&self, id: SequenceId) -> Result<usize, TrackError> {
        self.index_of(id).ok_or(TrackError::SequenceNotFound {
            track: self.id,
            sequence: id,
        })
    }

    fn emit(&self, kind: TrackEventKind) {
        self.emitter.dispatch(&TrackEvent {
            kind,
            track: self.id,
        });
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("locked", &self.locked)
            .field("muted", &self.muted)
            .field("sequences", &self.sequences)
            .field("active", &self.is_active())
            .finish()
    }
}
