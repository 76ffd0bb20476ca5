//! Main-thread handles for nodes living on the audio thread.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use basedrop::{Collector, Owned, Shared};
use daw_graph::{
    AbortHandle, AnalyserNode, AudioArc, GainNode, GraphError, NodeId, SourceId, SourceNode,
    abortable,
};
use log::warn;

use crate::render::{Command, MAX_NODES, MAX_SOURCES, ScheduledSource};

/// Control-side end of the command queue, shared by the context and every
/// node handle it creates.
///
/// Mirrors the audio thread's occupancy so a full graph is reported to the
/// caller instead of silently dropping the command.
pub(crate) struct Link {
    pub commands: rtrb::Producer<Command>,
    pub collector: Collector,
    pub sample_rate: u32,
    pub next_id: u64,
    pub closed: bool,
    nodes: usize,
    voices: Vec<AbortHandle>,
}

impl Link {
    pub fn new(commands: rtrb::Producer<Command>, sample_rate: u32) -> Self {
        Self {
            commands,
            collector: Collector::new(),
            sample_rate,
            next_id: 0,
            closed: false,
            nodes: 0,
            voices: Vec::with_capacity(MAX_SOURCES),
        }
    }

    pub fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn send(&mut self, command: Command) -> Result<(), GraphError> {
        if self.closed {
            return Err(GraphError::Closed);
        }
        self.collector.collect();
        self.commands.push(command).map_err(|_| {
            warn!("audio command queue is full");
            GraphError::QueueFull
        })
    }

    /// Send a command that adds a gain or analyser stage.
    pub fn add_node(&mut self, command: Command) -> Result<(), GraphError> {
        if self.nodes >= MAX_NODES {
            warn!("audio graph has no room for another node");
            return Err(GraphError::Capacity("too many nodes"));
        }
        self.send(command)?;
        self.nodes += 1;
        Ok(())
    }

    pub fn remove_node(&mut self, id: NodeId) {
        if self.send(Command::RemoveNode { id }).is_ok() {
            self.nodes = self.nodes.saturating_sub(1);
        }
    }

    fn has_voice_slot(&mut self) -> bool {
        self.voices
            .retain(|handle| !handle.is_finished() && !handle.is_aborted());
        self.voices.len() < MAX_SOURCES
    }
}

pub(crate) type SharedLink = Rc<RefCell<Link>>;

pub(crate) struct CpalSource {
    pub link: SharedLink,
    pub id: SourceId,
    pub output: NodeId,
    pub buffer: Option<AudioArc>,
    pub rate: f64,
    pub handle: Option<AbortHandle>,
}

impl SourceNode for CpalSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn start(&mut self, when: f64, offset: f64) -> Result<(), GraphError> {
        if self.buffer.is_none() {
            return Err(GraphError::InvalidState("source already started"));
        }

        let mut link = self.link.borrow_mut();
        if !link.has_voice_slot() {
            warn!("audio graph has no room for another source");
            return Err(GraphError::Capacity("too many sources"));
        }
        let Some(buffer) = self.buffer.take() else {
            return Err(GraphError::InvalidState("source already started"));
        };

        let device_rate = link.sample_rate as f64;
        let (handle, registration) = abortable();
        let source = ScheduledSource {
            id: self.id,
            output: self.output,
            start_frame: (when.max(0.0) * device_rate).round() as u64,
            position: offset.max(0.0) * buffer.sample_rate() as f64,
            playback_rate: self.rate,
            rate_ratio: buffer.sample_rate() as f64 / device_rate,
            buffer: Shared::new(&link.collector.handle(), buffer),
            registration,
        };
        let source = Owned::new(&link.collector.handle(), source);

        link.send(Command::StartSource(source))?;
        link.voices.push(handle.clone());
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.buffer = None;
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    fn set_playback_rate(&mut self, rate: f64) {
        self.rate = rate;
        if self.handle.is_some() {
            let _ = self.link.borrow_mut().send(Command::SetRate { id: self.id, rate });
        }
    }

    fn playback_rate(&self) -> f64 {
        self.rate
    }

    fn has_ended(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| handle.is_finished() && !handle.is_aborted())
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) struct CpalGain {
    pub link: SharedLink,
    pub id: NodeId,
    pub gain: f32,
    pub connected: bool,
}

impl GainNode for CpalGain {
    fn id(&self) -> NodeId {
        self.id
    }

    fn gain(&self) -> f32 {
        self.gain
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
        if self.connected {
            let _ = self
                .link
                .borrow_mut()
                .send(Command::SetGain { id: self.id, gain });
        }
    }

    fn disconnect(&mut self) {
        if std::mem::take(&mut self.connected) {
            self.link.borrow_mut().remove_node(self.id);
        }
    }
}

impl Drop for CpalGain {
    fn drop(&mut self) {
        self.disconnect();
    }
}

pub(crate) struct CpalAnalyser {
    pub link: SharedLink,
    pub id: NodeId,
    pub frame_size: usize,
    pub tap: rtrb::Consumer<f32>,
    pub window: VecDeque<f32>,
    pub connected: bool,
}

impl AnalyserNode for CpalAnalyser {
    fn id(&self) -> NodeId {
        self.id
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn read_time_domain(&mut self, out: &mut [f32]) {
        while let Ok(sample) = self.tap.pop() {
            if self.window.len() == self.frame_size {
                self.window.pop_front();
            }
            self.window.push_back(sample);
        }

        // right-align so the newest sample is always last
        let pad = out.len().saturating_sub(self.window.len());
        out[..pad].fill(0.0);
        let skip = self.window.len().saturating_sub(out.len());
        for (slot, sample) in out[pad..].iter_mut().zip(self.window.iter().skip(skip)) {
            *slot = *sample;
        }
    }

    fn disconnect(&mut self) {
        if std::mem::take(&mut self.connected) {
            self.link.borrow_mut().remove_node(self.id);
        }
    }
}

impl Drop for CpalAnalyser {
    fn drop(&mut self) {
        self.disconnect();
    }
}

pub(crate) fn new_tap(link: &Link, frame_size: usize) -> (Owned<rtrb::Producer<f32>>, rtrb::Consumer<f32>) {
    let capacity = (link.sample_rate as usize / 4).max(frame_size);
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    (Owned::new(&link.collector.handle(), producer), consumer)
}
