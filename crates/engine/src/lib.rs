//! Hardware audio clock on top of cpal.
//!
//! [`CpalDevice`] opens the default output device. The resulting
//! [`CpalContext`] owns the output stream; the stream callback renders the node
//! graph built through the [`AudioContext`] methods and advances a frame
//! counter that serves as the context clock.

mod nodes;
mod render;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cpal::{
    FromSample, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use daw_graph::{
    AnalyserNode, AudioArc, AudioContext, ContextFactory, GainNode, GraphError, NodeId, SourceId,
    SourceNode,
};
use log::{debug, error};

use nodes::{CpalAnalyser, CpalGain, CpalSource, Link, SharedLink};
use render::{Command, Graph};

const COMMAND_QUEUE_SIZE: usize = 1024;

/// The system's default output device.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevice;

impl CpalDevice {
    pub fn new() -> Self {
        Self
    }
}

impl ContextFactory for CpalDevice {
    type Context = CpalContext;

    fn open(&self, sample_rate_hint: Option<u32>) -> Result<CpalContext, GraphError> {
        open_context(sample_rate_hint).map_err(|err| match err.downcast::<GraphError>() {
            Ok(err) => err,
            Err(err) => GraphError::DeviceUnavailable(format!("{err:#}")),
        })
    }
}

pub struct CpalContext {
    link: SharedLink,
    clock: Arc<AtomicU64>,
    sample_rate: u32,
    channels: u16,
    stream: Option<cpal::Stream>,
}

impl CpalContext {
    pub fn channels(&self) -> u16 {
        self.channels
    }
}

fn open_context(sample_rate_hint: Option<u32>) -> anyhow::Result<CpalContext> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("no output device found"))?;

    let config = pick_config(&device, sample_rate_hint)?;
    let sample_format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();
    let sample_rate = stream_config.sample_rate.0;
    let channels = stream_config.channels;

    let (command_tx, command_rx) = rtrb::RingBuffer::<Command>::new(COMMAND_QUEUE_SIZE);
    let clock = Arc::new(AtomicU64::new(0));
    let graph = Graph::new(channels as usize, clock.clone());

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, graph, command_rx)?,
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, graph, command_rx)?,
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, graph, command_rx)?,
        sample_format => {
            return Err(GraphError::UnsupportedFormat(sample_format.to_string()).into());
        }
    };
    stream.play()?;

    debug!(
        "opened output stream: {} Hz, {} channels, {sample_format}",
        sample_rate, channels
    );

    Ok(CpalContext {
        link: Rc::new(RefCell::new(Link::new(command_tx, sample_rate))),
        clock,
        sample_rate,
        channels,
        stream: Some(stream),
    })
}

fn pick_config(
    device: &cpal::Device,
    sample_rate_hint: Option<u32>,
) -> anyhow::Result<cpal::SupportedStreamConfig> {
    let default = device.default_output_config()?;
    let Some(rate) = sample_rate_hint else {
        return Ok(default);
    };
    if default.sample_rate().0 == rate {
        return Ok(default);
    }

    let matching = device
        .supported_output_configs()?
        .filter(|range| range.sample_format() == default.sample_format())
        .find_map(|range| range.try_with_sample_rate(cpal::SampleRate(rate)));

    Ok(matching.unwrap_or_else(|| {
        debug!("device does not support {rate} Hz, using {}", default.sample_rate().0);
        default
    }))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut graph: Graph,
    mut command_rx: rtrb::Consumer<Command>,
) -> anyhow::Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            while let Ok(command) = command_rx.pop() {
                graph.apply(command);
            }
            graph.render(data);
        },
        |err| error!("stream error: {err}"),
        None,
    )?;

    Ok(stream)
}

impl AudioContext for CpalContext {
    fn current_time(&self) -> f64 {
        self.clock.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn create_gain(&mut self, output: NodeId) -> Result<Box<dyn GainNode>, GraphError> {
        let mut link = self.link.borrow_mut();
        let id = NodeId(link.allocate_id());
        link.add_node(Command::AddGain {
            id,
            output,
            gain: 1.0,
        })?;

        Ok(Box::new(CpalGain {
            link: self.link.clone(),
            id,
            gain: 1.0,
            connected: true,
        }))
    }

    fn create_analyser(
        &mut self,
        output: NodeId,
        frame_size: usize,
    ) -> Result<Box<dyn AnalyserNode>, GraphError> {
        let mut link = self.link.borrow_mut();
        let id = NodeId(link.allocate_id());
        let (tap, consumer) = nodes::new_tap(&link, frame_size);
        link.add_node(Command::AddAnalyser { id, output, tap })?;

        Ok(Box::new(CpalAnalyser {
            link: self.link.clone(),
            id,
            frame_size,
            tap: consumer,
            window: VecDeque::with_capacity(frame_size),
            connected: true,
        }))
    }

    fn create_buffer_source(
        &mut self,
        buffer: AudioArc,
        output: NodeId,
    ) -> Result<Box<dyn SourceNode>, GraphError> {
        let mut link = self.link.borrow_mut();
        if link.closed {
            return Err(GraphError::Closed);
        }
        let id = SourceId(link.allocate_id());

        Ok(Box::new(CpalSource {
            link: self.link.clone(),
            id,
            output,
            buffer: Some(buffer),
            rate: 1.0,
            handle: None,
        }))
    }

    fn close(&mut self) -> Result<(), GraphError> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        self.link.borrow_mut().closed = true;

        let result = stream
            .pause()
            .map_err(|err| GraphError::DeviceUnavailable(err.to_string()));
        drop(stream);
        self.link.borrow_mut().collector.collect();
        debug!("closed output stream");
        result
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

impl Drop for CpalContext {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
