//! The transport: play/pause/seek/stop over a set of tracks and one clock.
//!
//! While stopped the player holds no device at all. `play` from `Ready` opens a
//! context through the factory and builds the shared output stage
//! (master gain into an analyser into the destination); `stop`, natural end and
//! a failed start all close it again. Logical position lives in `pause_time`;
//! while playing it advances with the context clock from `resume_time`.
//!
//! The host drives [`Player::poll`] once per display frame. Each poll collects
//! finished sequences, stops the transport when nothing is left to render and
//! otherwise emits a `TimeUpdate` carrying the current analyser frame.

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::mem;
use std::rc::Rc;

use daw_graph::{AnalyserNode, AudioContext, ContextFactory, GainNode, GraphError};
use log::{debug, warn};

use crate::config::EngineConfig;
use crate::emitter::{Emitter, Event, ListenerId, Listeners};
use crate::error::{PlayerError, TrackError};
use crate::sequence::PlayOptions;
use crate::track::{Track, TrackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Ready,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerEventKind {
    Play,
    Pause,
    Seek,
    Stop,
    TimeUpdate,
    Change,
    VolumeChange,
}

#[derive(Debug, Clone)]
pub enum PlayerEvent {
    Play,
    Pause,
    Seek { time: f64 },
    Stop,
    TimeUpdate { current_time: f64, frame: AnalysisFrame },
    /// The track list changed.
    Change,
    VolumeChange { volume: f64 },
}

impl Event for PlayerEvent {
    type Kind = PlayerEventKind;

    fn kind(&self) -> PlayerEventKind {
        match self {
            PlayerEvent::Play => PlayerEventKind::Play,
            PlayerEvent::Pause => PlayerEventKind::Pause,
            PlayerEvent::Seek { .. } => PlayerEventKind::Seek,
            PlayerEvent::Stop => PlayerEventKind::Stop,
            PlayerEvent::TimeUpdate { .. } => PlayerEventKind::TimeUpdate,
            PlayerEvent::Change => PlayerEventKind::Change,
            PlayerEvent::VolumeChange { .. } => PlayerEventKind::VolumeChange,
        }
    }
}

struct AnalyserTap {
    node: RefCell<Box<dyn AnalyserNode>>,
    frame: RefCell<Vec<f32>>,
    fresh: Cell<bool>,
}

impl AnalyserTap {
    fn new(node: Box<dyn AnalyserNode>) -> Self {
        let frame = vec![0.0; node.frame_size()];
        Self {
            node: RefCell::new(node),
            frame: RefCell::new(frame),
            fresh: Cell::new(false),
        }
    }

    fn invalidate(&self) {
        self.fresh.set(false);
    }
}

/// Time-domain samples of the master output for one poll tick.
///
/// The analyser is only read on the first call to [`AnalysisFrame::samples`]
/// after a tick; later calls in the same tick reuse that read.
#[derive(Clone)]
pub struct AnalysisFrame {
    tap: Rc<AnalyserTap>,
}

impl AnalysisFrame {
    pub fn len(&self) -> usize {
        self.tap.frame.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn samples(&self) -> Ref<'_, [f32]> {
        if !self.tap.fresh.get() {
            let mut frame = self.tap.frame.borrow_mut();
            self.tap.node.borrow_mut().read_time_domain(&mut frame);
            self.tap.fresh.set(true);
        }
        Ref::map(self.tap.frame.borrow(), Vec::as_slice)
    }
}

impl fmt::Debug for AnalysisFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisFrame")
            .field("len", &self.len())
            .field("fresh", &self.tap.fresh.get())
            .finish()
    }
}

struct ActiveSession<C> {
    context: C,
    master: Box<dyn GainNode>,
    analyser: Rc<AnalyserTap>,
}

enum TransportSession<C> {
    Idle,
    Active(ActiveSession<C>),
}

pub struct Player<F: ContextFactory> {
    factory: F,
    config: EngineConfig,
    state: PlayerState,
    tracks: Vec<Track>,
    volume: f64,
    pause_time: f64,
    resume_time: f64,
    session: TransportSession<F::Context>,
    emitter: Emitter<PlayerEvent>,
}

impl<F: ContextFactory> Player<F> {
    pub fn new(factory: F) -> Self {
        Self::with_config(factory, EngineConfig::default())
    }

    pub fn with_config(factory: F, config: EngineConfig) -> Self {
        let volume = clamp_volume(config.initial_volume, &config).unwrap_or(0.0);
        Self {
            factory,
            config,
            state: PlayerState::Ready,
            tracks: Vec::new(),
            volume,
            pause_time: 0.0,
            resume_time: 0.0,
            session: TransportSession::Idle,
            emitter: Emitter::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlayerState::Playing
    }

    pub fn add_listener(
        &self,
        kind: PlayerEventKind,
        handler: impl Fn(&PlayerEvent) + 'static,
    ) -> ListenerId {
        self.emitter.listeners().add(kind, handler)
    }

    pub fn remove_listener(&self, kind: PlayerEventKind, id: ListenerId) -> bool {
        self.emitter.listeners().remove(kind, id)
    }

    pub fn listeners(&self) -> &Listeners<PlayerEvent> {
        self.emitter.listeners()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn track_mut(&mut self, index: usize) -> Option<&mut Track> {
        self.tracks.get_mut(index)
    }

    pub fn track_by_id(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|track| track.id() == id)
    }

    pub fn track_by_id_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|track| track.id() == id)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Insert a track at `index` (clamped), or append it.
    pub fn add_track(&mut self, track: Track, index: Option<usize>) -> TrackId {
        let id = track.id();
        let index = index.map_or(self.tracks.len(), |i| i.min(self.tracks.len()));
        self.tracks.insert(index, track);
        self.emitter.dispatch(&PlayerEvent::Change);
        id
    }

    /// Append an empty track using the configured overlap tolerance.
    pub fn create_track(&mut self, name: impl Into<String>) -> TrackId {
        let track = Track::new(name).with_overlap_tolerance(self.config.overlap_tolerance);
        self.add_track(track, None)
    }

    /// Replace the track at `index`, stopping the one taken out.
    pub fn set_track(&mut self, index: usize, track: Track) -> Option<Track> {
        let slot = self.tracks.get_mut(index)?;
        let mut previous = mem::replace(slot, track);
        previous.stop();
        self.emitter.dispatch(&PlayerEvent::Change);
        Some(previous)
    }

    /// Stop playback and take the track at `index` out.
    pub fn remove_track(&mut self, index: usize) -> Option<Track> {
        if index >= self.tracks.len() {
            return None;
        }
        self.stop();
        let track = self.tracks.remove(index);
        self.emitter.dispatch(&PlayerEvent::Change);
        Some(track)
    }

    /// Stop playback and swap the whole track list.
    pub fn set_tracks(&mut self, tracks: Vec<Track>) -> Vec<Track> {
        self.stop();
        let previous = mem::replace(&mut self.tracks, tracks);
        self.emitter.dispatch(&PlayerEvent::Change);
        previous
    }

    /// Longest track, ignoring tracks without a finite duration.
    pub fn total_duration(&self) -> f64 {
        self.tracks
            .iter()
            .map(Track::duration)
            .filter(|duration| duration.is_finite())
            .fold(0.0, f64::max)
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Clamped to `[0, max_volume]`; applied live to the master gain.
    pub fn set_volume(&mut self, volume: f64) {
        let Some(volume) = clamp_volume(volume, &self.config) else {
            return;
        };
        self.volume = volume;
        if let TransportSession::Active(session) = &mut self.session {
            session.master.set_gain(self.volume as f32);
        }
        self.emitter.dispatch(&PlayerEvent::VolumeChange {
            volume: self.volume,
        });
    }

    /// Timeline position in seconds.
    pub fn current_time(&self) -> f64 {
        match (&self.state, &self.session) {
            (PlayerState::Playing, TransportSession::Active(session)) => {
                let elapsed = session.context.current_time() - self.resume_time;
                (self.pause_time + elapsed)
                    .min(self.total_duration())
                    .max(0.0)
            }
            _ => self.pause_time,
        }
    }

    /// Start or resume playback from the current position.
    ///
    /// No-op while playing or without tracks. Fails only when the device
    /// cannot be opened or a track cannot start; the player is then back in
    /// `Ready` with nothing scheduled.
    pub fn play(&mut self) -> Result<(), PlayerError> {
        if self.state == PlayerState::Playing || self.tracks.is_empty() {
            return Ok(());
        }

        if self.state == PlayerState::Ready {
            self.open_session()?;
        }

        match self.start_tracks() {
            Ok(reference_time) => {
                self.resume_time = reference_time;
                self.state = PlayerState::Playing;
                debug!("transport playing from {:.3}s", self.pause_time);
                self.emitter.dispatch(&PlayerEvent::Play);
                Ok(())
            }
            Err(err) => {
                warn!("transport failed to start: {err}");
                self.close_session();
                self.state = PlayerState::Ready;
                Err(err)
            }
        }
    }

    /// Alias of [`Player::play`] for a paused transport.
    pub fn resume(&mut self) -> Result<(), PlayerError> {
        if self.state != PlayerState::Paused {
            return Ok(());
        }
        self.play()
    }

    pub fn play_from(&mut self, time: f64) -> Result<(), PlayerError> {
        self.seek(time)?;
        self.play()
    }

    /// Freeze the position and silence every track. The clock session stays
    /// open.
    pub fn pause(&mut self) {
        if self.state != PlayerState::Playing {
            return;
        }

        self.pause_time = self.current_time();
        for track in &mut self.tracks {
            track.stop();
        }
        self.state = PlayerState::Paused;
        debug!("transport paused at {:.3}s", self.pause_time);
        self.emitter.dispatch(&PlayerEvent::Pause);
    }

    /// Move the playhead. Negative times clamp to 0. While playing, every
    /// track is rescheduled against a fresh clock reading.
    pub fn seek(&mut self, time: f64) -> Result<(), PlayerError> {
        let time = if time.is_finite() { time.max(0.0) } else { 0.0 };
        self.pause_time = time;

        if self.state == PlayerState::Playing {
            if let Err(err) = self.reschedule_tracks(time) {
                warn!("transport failed to seek: {err}");
                self.stop();
                return Err(err);
            }
        }

        debug!("transport seek to {time:.3}s");
        self.emitter.dispatch(&PlayerEvent::Seek { time });
        Ok(())
    }

    /// Stop every track, release the device and rewind to 0. No-op in `Ready`.
    pub fn stop(&mut self) {
        if self.state == PlayerState::Ready {
            return;
        }

        for track in &mut self.tracks {
            track.stop();
        }
        self.close_session();
        self.pause_time = 0.0;
        self.resume_time = 0.0;
        self.state = PlayerState::Ready;
        debug!("transport stopped");
        self.emitter.dispatch(&PlayerEvent::Stop);
    }

    /// One analysis tick. Returns the current time while playing.
    ///
    /// Stops the transport (emitting a single `Stop`) once no track has
    /// anything left to render.
    pub fn poll(&mut self) -> Option<f64> {
        if self.state != PlayerState::Playing {
            return None;
        }

        for track in &mut self.tracks {
            track.poll();
        }
        if !self.tracks.iter().any(Track::is_playing) {
            debug!("transport reached the end");
            self.stop();
            return None;
        }

        let current_time = self.current_time();
        if let TransportSession::Active(session) = &self.session {
            session.analyser.invalidate();
            let frame = AnalysisFrame {
                tap: session.analyser.clone(),
            };
            self.emitter.dispatch(&PlayerEvent::TimeUpdate {
                current_time,
                frame,
            });
        }
        Some(current_time)
    }

    fn open_session(&mut self) -> Result<(), PlayerError> {
        let mut context = self
            .factory
            .open(self.config.sample_rate_hint)
            .map_err(PlayerError::Device)?;

        let graph = build_output_stage(&mut context, self.config.analyser_frame_size);
        let (mut master, analyser) = match graph {
            Ok(graph) => graph,
            Err(err) => {
                if let Err(close_err) = context.close() {
                    warn!("failed to close audio context: {close_err}");
                }
                return Err(PlayerError::Device(err));
            }
        };
        master.set_gain(self.volume as f32);

        debug!("opened audio context at {} Hz", context.sample_rate());
        self.session = TransportSession::Active(ActiveSession {
            context,
            master,
            analyser: Rc::new(AnalyserTap::new(analyser)),
        });
        Ok(())
    }

    fn close_session(&mut self) {
        let TransportSession::Active(mut session) =
            mem::replace(&mut self.session, TransportSession::Idle)
        else {
            return;
        };

        session.master.disconnect();
        session.analyser.node.borrow_mut().disconnect();
        if let Err(err) = session.context.close() {
            warn!("failed to close audio context: {err}");
        }
    }

    /// Issue a start to every track against one clock reading. Any failure
    /// stops all of them.
    fn start_tracks(&mut self) -> Result<f64, PlayerError> {
        let TransportSession::Active(session) = &mut self.session else {
            return Err(PlayerError::Device(GraphError::Closed));
        };

        let reference_time = session.context.current_time();
        let options = PlayOptions {
            output: Some(session.master.id()),
            reference_time: Some(reference_time),
            playback_start_time: self.pause_time,
        };

        let results: Vec<Result<(), TrackError>> = self
            .tracks
            .iter_mut()
            .map(|track| track.play(&mut session.context, &options))
            .collect();

        if let Some(err) = results.into_iter().find_map(Result::err) {
            for track in &mut self.tracks {
                track.stop();
            }
            return Err(err.into());
        }
        Ok(reference_time)
    }

    fn reschedule_tracks(&mut self, time: f64) -> Result<(), PlayerError> {
        let TransportSession::Active(session) = &mut self.session else {
            return Err(PlayerError::Device(GraphError::Closed));
        };

        let now = session.context.current_time();
        self.resume_time = now;
        let options = PlayOptions {
            output: Some(session.master.id()),
            reference_time: Some(now),
            playback_start_time: time,
        };

        let results: Vec<Result<(), TrackError>> = self
            .tracks
            .iter_mut()
            .map(|track| {
                if track.is_active() {
                    track.seek(&mut session.context, time, Some(now))
                } else {
                    track.play(&mut session.context, &options)
                }
            })
            .collect();

        match results.into_iter().find_map(Result::err) {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

/// `None` for NaN. A negative or NaN ceiling counts as 0.
fn clamp_volume(volume: f64, config: &EngineConfig) -> Option<f64> {
    if volume.is_nan() {
        return None;
    }
    Some(volume.clamp(0.0, config.max_volume.max(0.0)))
}

fn build_output_stage<C: AudioContext>(
    context: &mut C,
    frame_size: usize,
) -> Result<(Box<dyn GainNode>, Box<dyn AnalyserNode>), GraphError> {
    let destination = context.destination();
    let analyser = context.create_analyser(destination, frame_size)?;
    let master = context.create_gain(analyser.id())?;
    Ok((master, analyser))
}

impl<F: ContextFactory> fmt::Debug for Player<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player")
            .field("state", &self.state)
            .field("tracks", &self.tracks.len())
            .field("volume", &self.volume)
            .field("pause_time", &self.pause_time)
            .field("resume_time", &self.resume_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Sequence;
    use approx::assert_relative_eq;
    use daw_graph::AudioArc;
    use daw_graph::manual::ManualDevice;

    fn player_with_clip(device: &ManualDevice, duration: f64, time: f64) -> Player<ManualDevice> {
        let mut player = Player::new(device.clone());
        let id = player.create_track("a");
        let sequence = Sequence::new(AudioArc::silence(duration, 48000, 1), time).unwrap();
        player
            .track_by_id_mut(id)
            .unwrap()
            .add_sequence(sequence)
            .unwrap();
        player
    }

    #[test]
    fn play_without_tracks_is_a_no_op() {
        let device = ManualDevice::new();
        let mut player = Player::new(device.clone());

        player.play().unwrap();

        assert_eq!(player.state(), PlayerState::Ready);
        assert_eq!(device.sessions_opened(), 0);
    }

    #[test]
    fn misuse_is_silent() {
        let device = ManualDevice::new();
        let mut player = player_with_clip(&device, 1.0, 0.0);

        player.pause();
        player.stop();
        player.resume().unwrap();
        assert_eq!(player.state(), PlayerState::Ready);
        assert!(player.poll().is_none());
    }

    fn master_gain(device: &ManualDevice) -> Option<f32> {
        let track_gain = device.sources().first()?.output;
        device.gain_of(device.gain_output(track_gain)?)
    }

    #[test]
    fn volume_is_clamped_and_applied_live() {
        let device = ManualDevice::new();
        let mut player = player_with_clip(&device, 1.0, 0.0);
        let volumes = Rc::new(RefCell::new(Vec::new()));
        let sink = volumes.clone();
        player.add_listener(PlayerEventKind::VolumeChange, move |event| {
            if let PlayerEvent::VolumeChange { volume } = event {
                sink.borrow_mut().push(*volume);
            }
        });

        player.set_volume(0.5);
        player.play().unwrap();
        assert_eq!(master_gain(&device), Some(0.5));

        player.set_volume(10.0);
        assert_relative_eq!(player.volume(), 3.0);
        assert_eq!(master_gain(&device), Some(3.0));

        player.set_volume(-1.0);
        assert_relative_eq!(player.volume(), 0.0);
        assert_eq!(master_gain(&device), Some(0.0));

        player.set_volume(f64::NAN);
        assert_eq!(*volumes.borrow(), vec![0.5, 3.0, 0.0]);
    }

    #[test]
    fn out_of_range_config_does_not_panic() {
        let config = EngineConfig {
            max_volume: -1.0,
            initial_volume: f64::NAN,
            ..Default::default()
        };
        let mut player = Player::with_config(ManualDevice::new(), config);
        assert_eq!(player.volume(), 0.0);

        player.set_volume(2.0);
        assert_eq!(player.volume(), 0.0);

        let config = EngineConfig {
            max_volume: f64::NAN,
            ..Default::default()
        };
        let mut player = Player::with_config(ManualDevice::new(), config);
        player.set_volume(2.0);
        assert_eq!(player.volume(), 0.0);
    }

    #[test]
    fn seek_reports_the_clamped_time() {
        let device = ManualDevice::new();
        let mut player = player_with_clip(&device, 4.0, 0.0);
        let seeks = Rc::new(RefCell::new(Vec::new()));
        let sink = seeks.clone();
        player.add_listener(PlayerEventKind::Seek, move |event| {
            if let PlayerEvent::Seek { time } = event {
                sink.borrow_mut().push(*time);
            }
        });

        player.seek(1.5).unwrap();
        player.play().unwrap();
        player.seek(-2.0).unwrap();
        player.seek(f64::INFINITY).unwrap();

        assert_eq!(*seeks.borrow(), vec![1.5, 0.0, 0.0]);
    }

    #[test]
    fn current_time_never_exceeds_total_duration() {
        let device = ManualDevice::new();
        let mut player = player_with_clip(&device, 1.0, 0.0);
        player.play().unwrap();

        device.advance(5.0);
        assert_relative_eq!(player.current_time(), 1.0);
    }

    #[test]
    fn seek_clamps_negative_times() {
        let device = ManualDevice::new();
        let mut player = player_with_clip(&device, 1.0, 0.0);

        player.seek(-3.0).unwrap();
        assert_eq!(player.current_time(), 0.0);
    }

    #[test]
    fn stop_closes_the_device() {
        let device = ManualDevice::new();
        let mut player = player_with_clip(&device, 1.0, 0.0);

        player.play().unwrap();
        assert!(device.is_open());
        player.stop();

        assert!(!device.is_open());
        assert_eq!(player.current_time(), 0.0);
        assert_eq!(device.connected_gains(), 0);
    }

    #[test]
    fn analysis_frame_reads_lazily_once_per_tick() {
        let device = ManualDevice::new();
        device.set_analyser_level(0.5);
        let mut player = player_with_clip(&device, 2.0, 0.0);

        let frames = Rc::new(RefCell::new(Vec::new()));
        let sink = frames.clone();
        player.add_listener(PlayerEventKind::TimeUpdate, move |event| {
            if let PlayerEvent::TimeUpdate { frame, .. } = event {
                sink.borrow_mut().push(frame.clone());
            }
        });

        player.play().unwrap();
        device.advance(0.1);
        assert!(player.poll().is_some());
        assert_eq!(device.analyser_reads(), 0);

        let frame = frames.borrow()[0].clone();
        assert_eq!(frame.len(), 1024);
        assert!(frame.samples().iter().all(|&s| s == 0.5));
        let _ = frame.samples();
        assert_eq!(device.analyser_reads(), 1);

        device.advance(0.1);
        player.poll();
        let _ = frame.samples();
        assert_eq!(device.analyser_reads(), 2);
    }

    #[test]
    fn track_list_changes_emit_change() {
        let device = ManualDevice::new();
        let mut player = Player::new(device);
        let changes = Rc::new(Cell::new(0));
        let counter = changes.clone();
        player.add_listener(PlayerEventKind::Change, move |_| counter.set(counter.get() + 1));

        player.create_track("a");
        player.add_track(Track::new("b"), Some(0));
        player.set_track(1, Track::new("c"));
        player.remove_track(0);
        player.set_tracks(Vec::new());

        assert_eq!(changes.get(), 5);
        assert_eq!(player.track_count(), 0);
    }

    #[test]
    fn add_track_clamps_index() {
        let mut player = Player::new(ManualDevice::new());
        player.create_track("a");
        player.add_track(Track::new("b"), Some(10));
        assert_eq!(player.track(1).unwrap().name(), "b");
    }
}
