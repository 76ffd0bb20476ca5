use std::ops::Range;
use std::sync::Arc;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::GraphError;

/// Decoded audio shared between sequences and scheduled sources.
///
/// Samples are interleaved (`[L, R, L, R, ..]` for stereo) and held behind an
/// `Arc<[f32]>`, so a clone is a reference count bump. Splitting a sequence
/// copies the affected frames into a new buffer; nothing ever mutates one in
/// place.
///
/// ```
/// use daw_graph::AudioArc;
///
/// let clip = AudioArc::new(vec![0.0, 0.5, 1.0, 0.5], 44100, 2);
/// assert_eq!(clip.frames(), 2);
/// assert_eq!(clip.clone().frames(), 2);
/// ```
#[derive(Clone)]
pub struct AudioArc {
    samples: Arc<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioArc {
    /// # Panics
    ///
    /// Panics on zero channels, a zero sample rate, or a sample count that is
    /// not a whole number of frames.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self::from_arc(Arc::from(samples), sample_rate, channels)
    }

    /// Wrap already shared samples. Panics under the same conditions as
    /// [`AudioArc::new`].
    pub fn from_arc(samples: Arc<[f32]>, sample_rate: u32, channels: u16) -> Self {
        assert!(channels > 0, "channels must be greater than 0");
        assert!(sample_rate > 0, "sample_rate must be greater than 0");
        assert!(
            samples.len() % channels as usize == 0,
            "samples.len() must be divisible by channels"
        );
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// A silent buffer lasting `duration_secs`.
    pub fn silence(duration_secs: f64, sample_rate: u32, channels: u16) -> Self {
        let frames = (duration_secs.max(0.0) * sample_rate as f64).round() as usize;
        Self::new(vec![0.0; frames * channels as usize], sample_rate, channels)
    }

    #[inline]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_arc(&self) -> &Arc<[f32]> {
        &self.samples
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Samples per channel.
    #[inline]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Samples of a single channel, in frame order.
    ///
    /// ```
    /// use daw_graph::AudioArc;
    ///
    /// let stereo = AudioArc::new(vec![0.0, 1.0, 0.5, 1.5], 44100, 2);
    /// assert_eq!(stereo.channel(1).collect::<Vec<_>>(), vec![1.0, 1.5]);
    /// ```
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = f32> + '_ {
        assert!(
            channel < self.channels as usize,
            "channel index out of bounds"
        );
        self.samples
            .iter()
            .skip(channel)
            .step_by(self.channels as usize)
            .copied()
    }

    /// Copy `range` (in frames, clamped to the buffer) into a new buffer.
    pub fn slice_frames(&self, range: Range<usize>) -> Self {
        let frames = self.frames();
        let start = range.start.min(frames);
        let end = range.end.clamp(start, frames);
        let width = self.channels as usize;
        Self::new(
            self.samples[start * width..end * width].to_vec(),
            self.sample_rate,
            self.channels,
        )
    }

    /// Convert to `target_sample_rate`, sharing the samples when the rate
    /// already matches.
    pub fn resample(&self, target_sample_rate: u32) -> Result<Self, GraphError> {
        resample_audio_arc(self, target_sample_rate)
    }

    fn to_planar(&self) -> Vec<Vec<f32>> {
        (0..self.channels as usize)
            .map(|channel| self.channel(channel).collect())
            .collect()
    }

    fn from_planar(planes: &[Vec<f32>], sample_rate: u32) -> Self {
        let frames = planes.first().map_or(0, Vec::len);
        let samples = (0..frames)
            .flat_map(|frame| planes.iter().map(move |plane| plane[frame]))
            .collect();
        Self::new(samples, sample_rate, planes.len() as u16)
    }
}

impl std::fmt::Debug for AudioArc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioArc")
            .field("frames", &self.frames())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("duration_secs", &self.duration_secs())
            .finish()
    }
}

/// Sinc resampling through rubato.
pub fn resample_audio_arc(
    audio: &AudioArc,
    target_sample_rate: u32,
) -> Result<AudioArc, GraphError> {
    if audio.sample_rate == target_sample_rate {
        return Ok(audio.clone());
    }
    if target_sample_rate == 0 {
        return Err(GraphError::Resample("target sample rate is 0".into()));
    }
    if audio.is_empty() {
        return Ok(AudioArc::new(Vec::new(), target_sample_rate, audio.channels));
    }

    let frames = audio.frames();
    log::debug!(
        "resampling {frames} frames from {} Hz to {target_sample_rate} Hz",
        audio.sample_rate
    );

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = target_sample_rate as f64 / audio.sample_rate as f64;
    let mut resampler =
        SincFixedIn::<f32>::new(ratio, 2.0, params, frames, audio.channels as usize)
            .map_err(|err| GraphError::Resample(err.to_string()))?;

    let planes = resampler
        .process(&audio.to_planar(), None)
        .map_err(|err| GraphError::Resample(err.to_string()))?;

    Ok(AudioArc::from_planar(&planes, target_sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    fn tone(frequency: f32, sample_rate: u32, secs: f32, channels: u16) -> AudioArc {
        let frames = (sample_rate as f32 * secs) as usize;
        let samples = (0..frames)
            .flat_map(|i| {
                let value = (TAU * frequency * i as f32 / sample_rate as f32).sin();
                std::iter::repeat_n(value, channels as usize)
            })
            .collect();
        AudioArc::new(samples, sample_rate, channels)
    }

    #[test]
    fn frames_count_per_channel() {
        let audio = AudioArc::new(vec![0.0, 0.1, 0.2, 0.3], 44100, 2);
        assert_eq!(audio.frames(), 2);
        assert_eq!(audio.samples().len(), 4);
        assert!(!audio.is_empty());
    }

    #[test]
    #[should_panic(expected = "channels must be greater than 0")]
    fn rejects_zero_channels() {
        AudioArc::new(vec![0.0], 44100, 0);
    }

    #[test]
    #[should_panic(expected = "samples.len() must be divisible by channels")]
    fn rejects_partial_frames() {
        AudioArc::new(vec![0.0; 5], 44100, 2);
    }

    #[test]
    fn clones_share_samples() {
        let audio = AudioArc::silence(0.1, 44100, 2);
        let copy = audio.clone();
        assert!(Arc::ptr_eq(audio.samples_arc(), copy.samples_arc()));
    }

    #[test]
    fn silence_has_the_requested_length() {
        let audio = AudioArc::silence(2.0, 48000, 1);
        assert_eq!(audio.frames(), 96000);
        assert!((audio.duration_secs() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn slice_clamps_to_the_buffer() {
        let audio = AudioArc::new(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0], 44100, 2);

        assert_eq!(audio.slice_frames(1..3).samples(), &[2.0, 3.0, 4.0, 5.0]);
        assert_eq!(audio.slice_frames(2..10).frames(), 1);
        assert!(audio.slice_frames(5..8).is_empty());
    }

    #[test]
    fn planar_conversion_keeps_channel_order() {
        let audio = AudioArc::new(vec![0.0, 1.0, 2.0, 3.0], 44100, 2);
        let planes = audio.to_planar();
        assert_eq!(planes, vec![vec![0.0, 2.0], vec![1.0, 3.0]]);
        assert_eq!(AudioArc::from_planar(&planes, 44100).samples(), audio.samples());
    }

    #[test]
    fn resample_at_same_rate_is_a_clone() {
        let audio = tone(440.0, 44100, 0.1, 2);
        let same = audio.resample(44100).unwrap();
        assert!(Arc::ptr_eq(audio.samples_arc(), same.samples_arc()));
    }

    #[test]
    fn upsampling_scales_the_frame_count() {
        let audio = tone(440.0, 44100, 0.1, 2);
        let resampled = audio.resample(48000).unwrap();

        assert_eq!(resampled.sample_rate(), 48000);
        assert_eq!(resampled.channels(), 2);
        let expected = audio.frames() as f64 * 48000.0 / 44100.0;
        let drift = (resampled.frames() as f64 - expected).abs();
        assert!(drift <= expected * 0.03, "got {} frames", resampled.frames());
    }

    #[test]
    fn empty_buffers_resample_to_empty() {
        let resampled = AudioArc::new(vec![], 44100, 1).resample(48000).unwrap();
        assert!(resampled.is_empty());
        assert_eq!(resampled.sample_rate(), 48000);
    }

    #[test]
    fn zero_target_rate_is_an_error() {
        let audio = AudioArc::silence(0.1, 44100, 1);
        assert!(matches!(audio.resample(0), Err(GraphError::Resample(_))));
    }
}
