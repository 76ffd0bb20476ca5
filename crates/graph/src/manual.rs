//! Deterministic audio device.
//!
//! `ManualDevice` never renders audio. Its clock only moves through
//! [`ManualDevice::advance`] / [`ManualDevice::set_time`], and every source it
//! hands out is recorded so callers can check exactly what would have been
//! audible and when.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::{
    AbortHandle, AbortRegistration, AnalyserNode, AudioArc, AudioContext, ContextFactory,
    GainNode, GraphError, NodeId, SourceId, SourceNode, abortable,
};

const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// A scheduled start as requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    /// Requested context time.
    pub when: f64,
    /// Seconds skipped at the head of the buffer.
    pub offset: f64,
    /// Context time at which `start` was called.
    pub requested_at: f64,
}

#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub id: SourceId,
    /// Which `open()` call the source belongs to (1-based).
    pub session: u64,
    pub output: NodeId,
    pub buffer_duration: f64,
    pub playback_rate: f64,
    pub schedule: Option<Schedule>,
    pub stopped_at: Option<f64>,
    registration: Option<AbortRegistration>,
}

impl SourceRecord {
    /// Context time at which the first sample is rendered.
    pub fn start_time(&self) -> Option<f64> {
        self.schedule.map(|s| s.when.max(s.requested_at))
    }

    /// Context time at which the buffer runs out, assuming the current rate
    /// held for the whole playback.
    pub fn end_time(&self) -> Option<f64> {
        let schedule = self.schedule?;
        let remaining = (self.buffer_duration - schedule.offset).max(0.0);
        Some(schedule.when.max(schedule.requested_at) + remaining / self.playback_rate)
    }

    pub fn is_aborted(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(AbortRegistration::is_aborted)
    }

    pub fn is_audible_at(&self, time: f64) -> bool {
        let (Some(start), Some(end)) = (self.start_time(), self.end_time()) else {
            return false;
        };
        let before_stop = self.stopped_at.is_none_or(|stopped| time < stopped);
        start <= time && time < end && before_stop
    }

    fn has_ended_at(&self, time: f64) -> bool {
        self.stopped_at.is_none() && self.end_time().is_some_and(|end| time >= end)
    }
}

#[derive(Debug)]
struct DeviceState {
    time: f64,
    sample_rate: u32,
    session: u64,
    open: bool,
    fail_next_open: bool,
    start_budget: Option<usize>,
    next_id: u64,
    sources: Vec<SourceRecord>,
    /// Connected gains: node -> (output, value).
    gains: HashMap<NodeId, (NodeId, f32)>,
    analyser_reads: usize,
    analyser_level: f32,
}

impl DeviceState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn finish_ended_sources(&mut self) {
        let time = self.time;
        for record in &self.sources {
            if record.has_ended_at(time) {
                if let Some(registration) = &record.registration {
                    registration.finish();
                }
            }
        }
    }
}

/// Cloneable handle on a deterministic device. Every clone drives the same
/// clock.
#[derive(Debug, Clone)]
pub struct ManualDevice {
    state: Rc<RefCell<DeviceState>>,
}

impl Default for ManualDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualDevice {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(DeviceState {
                time: 0.0,
                sample_rate: DEFAULT_SAMPLE_RATE,
                session: 0,
                open: false,
                fail_next_open: false,
                start_budget: None,
                next_id: 0,
                sources: Vec::new(),
                gains: HashMap::new(),
                analyser_reads: 0,
                analyser_level: 0.0,
            })),
        }
    }

    pub fn now(&self) -> f64 {
        self.state.borrow().time
    }

    pub fn advance(&self, seconds: f64) {
        let mut state = self.state.borrow_mut();
        state.time += seconds.max(0.0);
        state.finish_ended_sources();
    }

    pub fn set_time(&self, time: f64) {
        let mut state = self.state.borrow_mut();
        state.time = time;
        state.finish_ended_sources();
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().open
    }

    pub fn sessions_opened(&self) -> u64 {
        self.state.borrow().session
    }

    /// Make the next `open()` fail with `GraphError::DeviceUnavailable`.
    pub fn fail_next_open(&self) {
        self.state.borrow_mut().fail_next_open = true;
    }

    /// Allow `count` more successful source starts, then refuse the rest.
    pub fn fail_start_after(&self, count: usize) {
        self.state.borrow_mut().start_budget = Some(count);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.borrow_mut();
        state.fail_next_open = false;
        state.start_budget = None;
    }

    pub fn sources(&self) -> Vec<SourceRecord> {
        self.state.borrow().sources.clone()
    }

    pub fn source(&self, id: SourceId) -> Option<SourceRecord> {
        self.state
            .borrow()
            .sources
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    pub fn audible_sources_at(&self, time: f64) -> Vec<SourceRecord> {
        self.state
            .borrow()
            .sources
            .iter()
            .filter(|record| record.is_audible_at(time))
            .cloned()
            .collect()
    }

    /// Current value of a connected gain node.
    pub fn gain_of(&self, node: NodeId) -> Option<f32> {
        self.state.borrow().gains.get(&node).map(|&(_, value)| value)
    }

    /// Node a connected gain feeds into.
    pub fn gain_output(&self, node: NodeId) -> Option<NodeId> {
        self.state.borrow().gains.get(&node).map(|&(output, _)| output)
    }

    pub fn connected_gains(&self) -> usize {
        self.state.borrow().gains.len()
    }

    pub fn analyser_reads(&self) -> usize {
        self.state.borrow().analyser_reads
    }

    /// Constant value analysers report for every sample.
    pub fn set_analyser_level(&self, level: f32) {
        self.state.borrow_mut().analyser_level = level;
    }
}

impl ContextFactory for ManualDevice {
    type Context = ManualContext;

    fn open(&self, sample_rate_hint: Option<u32>) -> Result<ManualContext, GraphError> {
        let mut state = self.state.borrow_mut();
        if state.fail_next_open {
            state.fail_next_open = false;
            return Err(GraphError::DeviceUnavailable(
                "manual device refused to open".into(),
            ));
        }

        state.session += 1;
        state.time = 0.0;
        state.open = true;
        state.sample_rate = sample_rate_hint.unwrap_or(DEFAULT_SAMPLE_RATE);

        Ok(ManualContext {
            state: self.state.clone(),
            session: state.session,
            sample_rate: state.sample_rate,
            closed: false,
        })
    }
}

#[derive(Debug)]
pub struct ManualContext {
    state: Rc<RefCell<DeviceState>>,
    session: u64,
    sample_rate: u32,
    closed: bool,
}

impl ManualContext {
    pub fn session(&self) -> u64 {
        self.session
    }

    fn ensure_open(&self) -> Result<(), GraphError> {
        if self.closed {
            Err(GraphError::Closed)
        } else {
            Ok(())
        }
    }
}

impl AudioContext for ManualContext {
    fn current_time(&self) -> f64 {
        self.state.borrow().time
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn create_gain(&mut self, output: NodeId) -> Result<Box<dyn GainNode>, GraphError> {
        self.ensure_open()?;
        let mut state = self.state.borrow_mut();
        let id = NodeId(state.allocate_id());
        state.gains.insert(id, (output, 1.0));

        Ok(Box::new(ManualGain {
            state: self.state.clone(),
            id,
            gain: 1.0,
        }))
    }

    fn create_analyser(
        &mut self,
        _output: NodeId,
        frame_size: usize,
    ) -> Result<Box<dyn AnalyserNode>, GraphError> {
        self.ensure_open()?;
        let id = NodeId(self.state.borrow_mut().allocate_id());

        Ok(Box::new(ManualAnalyser {
            state: self.state.clone(),
            id,
            frame_size,
        }))
    }

    fn create_buffer_source(
        &mut self,
        buffer: AudioArc,
        output: NodeId,
    ) -> Result<Box<dyn SourceNode>, GraphError> {
        self.ensure_open()?;
        let mut state = self.state.borrow_mut();
        let id = SourceId(state.allocate_id());
        state.sources.push(SourceRecord {
            id,
            session: self.session,
            output,
            buffer_duration: buffer.duration_secs(),
            playback_rate: 1.0,
            schedule: None,
            stopped_at: None,
            registration: None,
        });

        Ok(Box::new(ManualSource {
            state: self.state.clone(),
            id,
            rate: 1.0,
            handle: None,
        }))
    }

    fn close(&mut self) -> Result<(), GraphError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut state = self.state.borrow_mut();
        let time = state.time;
        for record in state.sources.iter_mut() {
            if record.session == self.session && record.stopped_at.is_none() {
                record.stopped_at = Some(time);
            }
        }
        if state.session == self.session {
            state.open = false;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

struct ManualSource {
    state: Rc<RefCell<DeviceState>>,
    id: SourceId,
    rate: f64,
    handle: Option<AbortHandle>,
}

impl ManualSource {
    fn with_record<R>(&self, f: impl FnOnce(&mut SourceRecord, f64) -> R) -> Option<R> {
        let mut state = self.state.borrow_mut();
        let time = state.time;
        state
            .sources
            .iter_mut()
            .find(|record| record.id == self.id)
            .map(|record| f(record, time))
    }
}

impl SourceNode for ManualSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn start(&mut self, when: f64, offset: f64) -> Result<(), GraphError> {
        if self.handle.is_some() {
            return Err(GraphError::InvalidState("source already started"));
        }

        {
            let mut state = self.state.borrow_mut();
            if let Some(budget) = state.start_budget.as_mut() {
                if *budget == 0 {
                    return Err(GraphError::DeviceUnavailable(
                        "manual device refused to start source".into(),
                    ));
                }
                *budget -= 1;
            }
        }

        let (handle, registration) = abortable();
        self.with_record(|record, time| {
            record.schedule = Some(Schedule {
                when,
                offset: offset.max(0.0),
                requested_at: time,
            });
            record.registration = Some(registration);
        })
        .ok_or(GraphError::Closed)?;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        let Some(handle) = &self.handle else {
            return;
        };
        if handle.is_aborted() {
            return;
        }
        handle.abort();
        self.with_record(|record, time| {
            if record.stopped_at.is_none() {
                record.stopped_at = Some(time);
            }
        });
    }

    fn set_playback_rate(&mut self, rate: f64) {
        self.rate = rate;
        self.with_record(|record, _| record.playback_rate = rate);
    }

    fn playback_rate(&self) -> f64 {
        self.rate
    }

    fn has_ended(&self) -> bool {
        self.with_record(|record, time| record.has_ended_at(time))
            .unwrap_or(false)
    }
}

impl Drop for ManualSource {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ManualGain {
    state: Rc<RefCell<DeviceState>>,
    id: NodeId,
    gain: f32,
}

impl GainNode for ManualGain {
    fn id(&self) -> NodeId {
        self.id
    }

    fn gain(&self) -> f32 {
        self.gain
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
        if let Some((_, value)) = self.state.borrow_mut().gains.get_mut(&self.id) {
            *value = gain;
        }
    }

    fn disconnect(&mut self) {
        self.state.borrow_mut().gains.remove(&self.id);
    }
}

impl Drop for ManualGain {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct ManualAnalyser {
    state: Rc<RefCell<DeviceState>>,
    id: NodeId,
    frame_size: usize,
}

impl AnalyserNode for ManualAnalyser {
    fn id(&self) -> NodeId {
        self.id
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn read_time_domain(&mut self, out: &mut [f32]) {
        let mut state = self.state.borrow_mut();
        state.analyser_reads += 1;
        out.fill(state.analyser_level);
    }

    fn disconnect(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_second() -> AudioArc {
        AudioArc::silence(1.0, 48000, 1)
    }

    #[test]
    fn open_resets_clock() {
        let device = ManualDevice::new();
        device.advance(5.0);

        let context = device.open(None).unwrap();
        assert_eq!(context.current_time(), 0.0);
        assert!(device.is_open());
        assert_eq!(device.sessions_opened(), 1);
    }

    #[test]
    fn fail_next_open_fails_once() {
        let device = ManualDevice::new();
        device.fail_next_open();

        assert!(matches!(
            device.open(None),
            Err(GraphError::DeviceUnavailable(_))
        ));
        assert!(device.open(None).is_ok());
    }

    #[test]
    fn source_ends_after_buffer_duration() {
        let device = ManualDevice::new();
        let mut context = device.open(None).unwrap();
        let mut source = context
            .create_buffer_source(one_second(), NodeId::DESTINATION)
            .unwrap();

        source.start(0.5, 0.0).unwrap();
        device.advance(1.4);
        assert!(!source.has_ended());
        device.advance(0.1);
        assert!(source.has_ended());
    }

    #[test]
    fn stop_before_start_is_never_audible() {
        let device = ManualDevice::new();
        let mut context = device.open(None).unwrap();
        let mut source = context
            .create_buffer_source(one_second(), NodeId::DESTINATION)
            .unwrap();

        source.start(2.0, 0.0).unwrap();
        device.advance(1.0);
        source.stop();

        let record = device.source(source.id()).unwrap();
        assert!(record.is_aborted());
        assert!(!record.is_audible_at(2.5));
        assert!(!source.has_ended());
    }

    #[test]
    fn dropping_a_source_stops_it() {
        let device = ManualDevice::new();
        let mut context = device.open(None).unwrap();
        let mut source = context
            .create_buffer_source(one_second(), NodeId::DESTINATION)
            .unwrap();
        source.start(0.0, 0.0).unwrap();
        let id = source.id();

        device.advance(0.25);
        drop(source);

        assert_eq!(device.source(id).unwrap().stopped_at, Some(0.25));
    }

    #[test]
    fn offset_and_rate_shorten_playback() {
        let device = ManualDevice::new();
        let mut context = device.open(None).unwrap();
        let mut source = context
            .create_buffer_source(one_second(), NodeId::DESTINATION)
            .unwrap();
        source.set_playback_rate(2.0);
        source.start(0.0, 0.5).unwrap();

        let record = device.source(source.id()).unwrap();
        assert_eq!(record.end_time(), Some(0.25));
    }

    #[test]
    fn start_budget_refuses_extra_starts() {
        let device = ManualDevice::new();
        let mut context = device.open(None).unwrap();
        device.fail_start_after(1);

        let mut first = context
            .create_buffer_source(one_second(), NodeId::DESTINATION)
            .unwrap();
        let mut second = context
            .create_buffer_source(one_second(), NodeId::DESTINATION)
            .unwrap();

        assert!(first.start(0.0, 0.0).is_ok());
        assert!(second.start(0.0, 0.0).is_err());
    }

    #[test]
    fn closed_context_refuses_new_nodes() {
        let device = ManualDevice::new();
        let mut context = device.open(None).unwrap();
        context.close().unwrap();

        assert!(!device.is_open());
        assert!(matches!(
            context.create_gain(NodeId::DESTINATION),
            Err(GraphError::Closed)
        ));
    }

    #[test]
    fn gain_values_are_observable() {
        let device = ManualDevice::new();
        let mut context = device.open(None).unwrap();
        let mut gain = context.create_gain(NodeId::DESTINATION).unwrap();

        gain.set_gain(0.0);
        assert_eq!(device.gain_of(gain.id()), Some(0.0));
        assert_eq!(device.gain_output(gain.id()), Some(NodeId::DESTINATION));

        gain.disconnect();
        assert_eq!(device.gain_of(gain.id()), None);
    }
}
