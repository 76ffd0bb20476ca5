//! Audio-thread side of the engine: the node graph and the mixer.
//!
//! Everything here runs inside the cpal callback. Nodes arrive as
//! [`Command`]s over an rtrb queue; storage is preallocated and anything that
//! owns heap memory is wrapped in basedrop so dropping it here only queues the
//! free for the main thread's collector.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use basedrop::{Owned, Shared};
use cpal::{FromSample, Sample};
use daw_graph::{AbortRegistration, AudioArc, NodeId, SourceId};

pub(crate) const MAX_NODES: usize = 64;
pub(crate) const MAX_SOURCES: usize = 256;
const MAX_CHANNELS: usize = 32;
const MAX_ROUTE_DEPTH: usize = 16;

pub(crate) struct ScheduledSource {
    pub id: SourceId,
    pub buffer: Shared<AudioArc>,
    pub output: NodeId,
    /// Device frame at which the first sample plays.
    pub start_frame: u64,
    /// Read position in source frames.
    pub position: f64,
    pub playback_rate: f64,
    /// Source rate over device rate.
    pub rate_ratio: f64,
    pub registration: AbortRegistration,
}

pub(crate) enum Command {
    AddGain {
        id: NodeId,
        output: NodeId,
        gain: f32,
    },
    SetGain {
        id: NodeId,
        gain: f32,
    },
    AddAnalyser {
        id: NodeId,
        output: NodeId,
        tap: Owned<rtrb::Producer<f32>>,
    },
    RemoveNode {
        id: NodeId,
    },
    StartSource(Owned<ScheduledSource>),
    SetRate {
        id: SourceId,
        rate: f64,
    },
}

struct GainStage {
    id: NodeId,
    output: NodeId,
    gain: f32,
}

struct AnalyserStage {
    id: NodeId,
    output: NodeId,
    tap: Owned<rtrb::Producer<f32>>,
    bus: f32,
}

#[derive(Clone, Copy)]
struct Route {
    gain: f32,
    /// Analyser on the path and the gain applied before reaching it.
    tap: Option<(usize, f32)>,
}

impl Route {
    const SILENT: Route = Route {
        gain: 0.0,
        tap: None,
    };
}

struct Voice {
    source: Owned<ScheduledSource>,
    route: Route,
    ended: bool,
}

pub(crate) struct Graph {
    channels: usize,
    clock: Arc<AtomicU64>,
    gains: Vec<GainStage>,
    analysers: Vec<AnalyserStage>,
    voices: Vec<Voice>,
}

impl Graph {
    pub fn new(channels: usize, clock: Arc<AtomicU64>) -> Self {
        Self {
            channels: channels.clamp(1, MAX_CHANNELS),
            clock,
            gains: Vec::with_capacity(MAX_NODES),
            analysers: Vec::with_capacity(MAX_NODES),
            voices: Vec::with_capacity(MAX_SOURCES),
        }
    }

    pub fn apply(&mut self, command: Command) {
        match command {
            Command::AddGain { id, output, gain } => {
                if self.gains.len() < MAX_NODES {
                    self.gains.push(GainStage { id, output, gain });
                }
            }
            Command::SetGain { id, gain } => {
                if let Some(stage) = self.gains.iter_mut().find(|stage| stage.id == id) {
                    stage.gain = gain;
                }
            }
            Command::AddAnalyser { id, output, tap } => {
                if self.analysers.len() < MAX_NODES {
                    self.analysers.push(AnalyserStage {
                        id,
                        output,
                        tap,
                        bus: 0.0,
                    });
                }
            }
            Command::RemoveNode { id } => {
                self.gains.retain(|stage| stage.id != id);
                self.analysers.retain(|stage| stage.id != id);
            }
            Command::StartSource(source) => {
                if self.voices.len() < MAX_SOURCES {
                    self.voices.push(Voice {
                        source,
                        route: Route::SILENT,
                        ended: false,
                    });
                } else {
                    // no free slot: completes without rendering
                    source.registration.finish();
                }
            }
            Command::SetRate { id, rate } => {
                if let Some(voice) = self.voices.iter_mut().find(|v| v.source.id == id) {
                    voice.source.playback_rate = rate;
                }
            }
        }
    }

    fn route(&self, mut node: NodeId) -> Route {
        let mut gain = 1.0;
        let mut tap = None;

        for _ in 0..MAX_ROUTE_DEPTH {
            if node == NodeId::DESTINATION {
                return Route { gain, tap };
            }
            if let Some(stage) = self.gains.iter().find(|stage| stage.id == node) {
                gain *= stage.gain;
                node = stage.output;
                continue;
            }
            if let Some(index) = self.analysers.iter().position(|stage| stage.id == node) {
                tap.get_or_insert((index, gain));
                node = self.analysers[index].output;
                continue;
            }
            break;
        }
        Route::SILENT
    }

    /// Fill one interleaved output buffer and advance the clock.
    pub fn render<T>(&mut self, data: &mut [T])
    where
        T: Sample + FromSample<f32>,
    {
        self.voices
            .retain(|voice| !voice.source.registration.is_aborted());

        for i in 0..self.voices.len() {
            let route = self.route(self.voices[i].source.output);
            self.voices[i].route = route;
        }

        let channels = self.channels;
        let start = self.clock.load(Ordering::Acquire);
        let mut mixed = [0.0f32; MAX_CHANNELS];
        let mut rendered = 0u64;

        for (i, frame) in data.chunks_mut(channels).enumerate() {
            let now = start + i as u64;
            mixed[..channels].fill(0.0);
            for stage in &mut self.analysers {
                stage.bus = 0.0;
            }

            for voice in &mut self.voices {
                if voice.ended || now < voice.source.start_frame {
                    continue;
                }
                let source: &mut ScheduledSource = &mut voice.source;
                let buffer: &AudioArc = &source.buffer;
                let source_channels = buffer.channels() as usize;
                let index = source.position as usize;
                if index >= buffer.frames() {
                    voice.ended = true;
                    continue;
                }

                let samples = &buffer.samples()[index * source_channels..][..source_channels];
                for (ch, out) in mixed[..channels].iter_mut().enumerate() {
                    let sample = samples[ch % source_channels];
                    *out += sample * voice.route.gain;
                    if let Some((analyser, gain)) = voice.route.tap {
                        if let Some(stage) = self.analysers.get_mut(analyser) {
                            stage.bus += sample * gain / channels as f32;
                        }
                    }
                }
                source.position += source.playback_rate * source.rate_ratio;
            }

            for (ch, sample) in frame.iter_mut().enumerate() {
                *sample = T::from_sample(mixed[ch]);
            }
            for stage in &mut self.analysers {
                let _ = stage.tap.push(stage.bus);
            }
            rendered += 1;
        }

        for voice in &mut self.voices {
            let buffer: &AudioArc = &voice.source.buffer;
            if !voice.ended && voice.source.position as usize >= buffer.frames() {
                voice.ended = true;
            }
            if voice.ended {
                voice.source.registration.finish();
            }
        }
        self.voices.retain(|voice| !voice.ended);
        self.clock.fetch_add(rendered, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Collector;
    use daw_graph::abortable;

    fn ramp(frames: usize) -> AudioArc {
        AudioArc::new((0..frames).map(|i| i as f32).collect(), 4, 1)
    }

    fn schedule(
        collector: &Collector,
        buffer: AudioArc,
        output: NodeId,
        start_frame: u64,
    ) -> (daw_graph::AbortHandle, Command) {
        let (handle, registration) = abortable();
        let source = ScheduledSource {
            id: SourceId(100),
            buffer: Shared::new(&collector.handle(), buffer),
            output,
            start_frame,
            position: 0.0,
            playback_rate: 1.0,
            rate_ratio: 1.0,
            registration,
        };
        (handle, Command::StartSource(Owned::new(&collector.handle(), source)))
    }

    #[test]
    fn source_plays_at_its_start_frame() {
        let collector = Collector::new();
        let mut graph = Graph::new(1, Arc::new(AtomicU64::new(0)));
        let (_handle, command) = schedule(&collector, ramp(3), NodeId::DESTINATION, 2);
        graph.apply(command);

        let mut out = [0.0f32; 6];
        graph.render(&mut out);

        assert_eq!(out, [0.0, 0.0, 0.0, 1.0, 2.0, 0.0]);
        assert_eq!(graph.clock.load(Ordering::Acquire), 6);
    }

    #[test]
    fn gains_multiply_along_the_path() {
        let collector = Collector::new();
        let mut graph = Graph::new(2, Arc::new(AtomicU64::new(0)));
        graph.apply(Command::AddGain {
            id: NodeId(1),
            output: NodeId::DESTINATION,
            gain: 0.5,
        });
        graph.apply(Command::AddGain {
            id: NodeId(2),
            output: NodeId(1),
            gain: 4.0,
        });
        let (_handle, command) = schedule(&collector, ramp(4), NodeId(2), 0);
        graph.apply(command);

        let mut out = [0.0f32; 4];
        graph.render(&mut out);

        // mono source fans out to both channels
        assert_eq!(out, [0.0, 0.0, 2.0, 2.0]);
    }

    #[test]
    fn aborted_source_never_renders() {
        let collector = Collector::new();
        let mut graph = Graph::new(1, Arc::new(AtomicU64::new(0)));
        let (handle, command) = schedule(&collector, ramp(4), NodeId::DESTINATION, 0);
        graph.apply(command);
        handle.abort();

        let mut out = [0.0f32; 4];
        graph.render(&mut out);

        assert_eq!(out, [0.0; 4]);
        assert!(!handle.is_finished());
    }

    #[test]
    fn finished_source_reports_completion() {
        let collector = Collector::new();
        let mut graph = Graph::new(1, Arc::new(AtomicU64::new(0)));
        let (handle, command) = schedule(&collector, ramp(2), NodeId::DESTINATION, 0);
        graph.apply(command);

        let mut out = [0.0f32; 2];
        graph.render(&mut out);
        assert!(handle.is_finished());
        assert!(graph.voices.is_empty());
    }

    #[test]
    fn removed_gain_silences_its_sources() {
        let collector = Collector::new();
        let mut graph = Graph::new(1, Arc::new(AtomicU64::new(0)));
        graph.apply(Command::AddGain {
            id: NodeId(1),
            output: NodeId::DESTINATION,
            gain: 1.0,
        });
        let (_handle, command) = schedule(&collector, ramp(4), NodeId(1), 0);
        graph.apply(command);
        graph.apply(Command::RemoveNode { id: NodeId(1) });

        let mut out = [0.0f32; 4];
        graph.render(&mut out);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn analyser_sees_signal_before_destination() {
        let collector = Collector::new();
        let handle = collector.handle();
        let mut graph = Graph::new(1, Arc::new(AtomicU64::new(0)));
        let (tap, mut consumer) = rtrb::RingBuffer::new(16);
        graph.apply(Command::AddAnalyser {
            id: NodeId(1),
            output: NodeId::DESTINATION,
            tap: Owned::new(&handle, tap),
        });
        let (_source, command) = schedule(&collector, ramp(3), NodeId(1), 0);
        graph.apply(command);

        let mut out = [0.0f32; 3];
        graph.render(&mut out);

        let tapped: Vec<f32> = std::iter::from_fn(|| consumer.pop().ok()).collect();
        assert_eq!(tapped, vec![0.0, 1.0, 2.0]);
        assert_eq!(out, [0.0, 1.0, 2.0]);
    }

    #[test]
    fn overflowing_source_is_reported_finished() {
        let collector = Collector::new();
        let mut graph = Graph::new(1, Arc::new(AtomicU64::new(0)));
        let mut handles = Vec::new();
        for _ in 0..=MAX_SOURCES {
            let (handle, command) = schedule(&collector, ramp(4), NodeId::DESTINATION, 1000);
            graph.apply(command);
            handles.push(handle);
        }

        assert_eq!(graph.voices.len(), MAX_SOURCES);
        assert!(handles[..MAX_SOURCES].iter().all(|h| !h.is_finished()));
        assert!(handles[MAX_SOURCES].is_finished());
    }

    #[test]
    fn playback_rate_steps_through_the_buffer() {
        let collector = Collector::new();
        let mut graph = Graph::new(1, Arc::new(AtomicU64::new(0)));
        let (_handle, command) = schedule(&collector, ramp(8), NodeId::DESTINATION, 0);
        graph.apply(command);
        graph.apply(Command::SetRate {
            id: SourceId(100),
            rate: 2.0,
        });

        let mut out = [0.0f32; 4];
        graph.render(&mut out);
        assert_eq!(out, [0.0, 2.0, 4.0, 6.0]);
    }
}
