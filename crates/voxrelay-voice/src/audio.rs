//! PCM decoding, resampling and fixed-size framing.
//!
//! Synthesis backends hand back raw little-endian 16-bit PCM in chunks of
//! whatever size the network or the child process produced. The media room
//! wants exact 10 ms frames at 48 kHz. [`FramePipeline`] bridges the two:
//!
//! - bytes are decoded to samples, carrying a dangling odd byte into the
//!   next chunk;
//! - samples are resampled to the publish rate. Integer upsampling ratios
//!   (24 kHz -> 48 kHz) use plain sample duplication, which is cheap and adds
//!   no latency. Other ratios go through a cubic polynomial resampler;
//! - the resampled stream is cut into frames of exactly
//!   `samples_per_channel * num_channels` samples. Whatever is left below
//!   one frame stays buffered for the next chunk and is discarded, never sent
//!   short, when the utterance ends.

use crate::error::VoiceError;
use rubato::{FastFixedIn, PolynomialDegree, Resampler as _};
use std::fmt;
use std::time::Duration;

/// Input block size for the polynomial resampler.
const INTERPOLATOR_CHUNK: usize = 1024;

/// Rate, channel layout and frame duration of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub num_channels: u32,
    pub frame_duration_ms: u32,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, num_channels: u32, frame_duration_ms: u32) -> Self {
        Self {
            sample_rate,
            num_channels,
            frame_duration_ms,
        }
    }

    /// Samples per channel in one frame (480 for 10 ms at 48 kHz).
    pub fn samples_per_channel(&self) -> u32 {
        (u64::from(self.sample_rate) * u64::from(self.frame_duration_ms) / 1000) as u32
    }

    /// Interleaved sample count of one frame.
    pub fn frame_len(&self) -> usize {
        self.samples_per_channel() as usize * self.num_channels as usize
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.frame_duration_ms))
    }
}

/// One fixed-size block of interleaved 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Vec<i16>,
    pub sample_rate: u32,
    pub num_channels: u32,
    pub samples_per_channel: u32,
}

impl AudioFrame {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(f64::from(self.samples_per_channel) / f64::from(self.sample_rate))
    }

    /// Returns `true` when the frame carries exactly the samples `format` asks for.
    pub fn matches(&self, format: &AudioFormat) -> bool {
        self.sample_rate == format.sample_rate
            && self.num_channels == format.num_channels
            && self.samples_per_channel == format.samples_per_channel()
            && self.data.len() == format.frame_len()
    }
}

/// Decodes little-endian 16-bit PCM. A trailing odd byte is ignored.
pub fn decode_pcm16le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Repeats every sample frame (one sample per channel) `factor` times.
pub fn duplicate_samples(samples: &[i16], factor: usize, channels: usize) -> Vec<i16> {
    let channels = channels.max(1);
    let mut out = Vec::with_capacity(samples.len() * factor);
    for group in samples.chunks(channels) {
        for _ in 0..factor {
            out.extend_from_slice(group);
        }
    }
    out
}

/// Converts between sample rates.
pub struct Resampler {
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    mode: Mode,
}

enum Mode {
    Passthrough,
    Duplicate(usize),
    Interpolate(Box<Interpolator>),
}

impl fmt::Debug for Resampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match &self.mode {
            Mode::Passthrough => "passthrough".to_string(),
            Mode::Duplicate(factor) => format!("duplicate x{}", factor),
            Mode::Interpolate(_) => "cubic".to_string(),
        };
        f.debug_struct("Resampler")
            .field("input_rate", &self.input_rate)
            .field("output_rate", &self.output_rate)
            .field("channels", &self.channels)
            .field("mode", &mode)
            .finish()
    }
}

impl Resampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: u32) -> Result<Self, VoiceError> {
        if input_rate == 0 || output_rate == 0 || channels == 0 {
            return Err(VoiceError::Config(format!(
                "invalid resampler parameters: {} Hz -> {} Hz, {} channels",
                input_rate, output_rate, channels
            )));
        }
        let channels = channels as usize;

        let mode = if input_rate == output_rate {
            Mode::Passthrough
        } else if output_rate % input_rate == 0 {
            Mode::Duplicate((output_rate / input_rate) as usize)
        } else {
            Mode::Interpolate(Box::new(Interpolator::new(
                input_rate,
                output_rate,
                channels,
            )?))
        };

        Ok(Self {
            input_rate,
            output_rate,
            channels,
            mode,
        })
    }

    /// Duplication factor when the ratio is an integer upsample.
    pub fn duplication_factor(&self) -> Option<usize> {
        match self.mode {
            Mode::Passthrough => Some(1),
            Mode::Duplicate(factor) => Some(factor),
            Mode::Interpolate(_) => None,
        }
    }

    /// Resamples interleaved samples. Output may lag input for the
    /// interpolating path; [`Resampler::flush`] drains it.
    pub fn process(&mut self, samples: &[i16]) -> Result<Vec<i16>, VoiceError> {
        match &mut self.mode {
            Mode::Passthrough => Ok(samples.to_vec()),
            Mode::Duplicate(factor) => Ok(duplicate_samples(samples, *factor, self.channels)),
            Mode::Interpolate(inner) => inner.process(samples),
        }
    }

    pub fn flush(&mut self) -> Result<Vec<i16>, VoiceError> {
        match &mut self.mode {
            Mode::Interpolate(inner) => inner.flush(),
            _ => Ok(Vec::new()),
        }
    }
}

struct Interpolator {
    inner: FastFixedIn<f32>,
    pending: Vec<Vec<f32>>,
    next_channel: usize,
}

impl Interpolator {
    fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self, VoiceError> {
        let inner = FastFixedIn::<f32>::new(
            f64::from(output_rate) / f64::from(input_rate),
            1.0,
            PolynomialDegree::Cubic,
            INTERPOLATOR_CHUNK,
            channels,
        )
        .map_err(|e| VoiceError::Audio(format!("failed to build resampler: {}", e)))?;

        Ok(Self {
            inner,
            pending: vec![Vec::new(); channels],
            next_channel: 0,
        })
    }

    fn buffered_frames(&self) -> usize {
        self.pending.iter().map(Vec::len).min().unwrap_or(0)
    }

    fn take(&mut self, frames: usize) -> Vec<Vec<f32>> {
        self.pending
            .iter_mut()
            .map(|channel| channel.drain(..frames).collect())
            .collect()
    }

    fn process(&mut self, samples: &[i16]) -> Result<Vec<i16>, VoiceError> {
        let channels = self.pending.len();
        for &sample in samples {
            self.pending[self.next_channel].push(f32::from(sample) / 32768.0);
            self.next_channel = (self.next_channel + 1) % channels;
        }

        let mut out = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.buffered_frames() < needed {
                break;
            }
            let block = self.take(needed);
            let resampled = self
                .inner
                .process(&block, None)
                .map_err(|e| VoiceError::Audio(format!("resampling failed: {}", e)))?;
            interleave_into(&resampled, &mut out);
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<i16>, VoiceError> {
        let available = self.buffered_frames();
        if available == 0 {
            return Ok(Vec::new());
        }
        let block = self.take(available);
        let resampled = self
            .inner
            .process_partial(Some(block.as_slice()), None)
            .map_err(|e| VoiceError::Audio(format!("resampling failed: {}", e)))?;

        let mut out = Vec::new();
        interleave_into(&resampled, &mut out);
        Ok(out)
    }
}

fn interleave_into(channels: &[Vec<f32>], out: &mut Vec<i16>) {
    let frames = channels.first().map_or(0, Vec::len);
    out.reserve(frames * channels.len());
    for i in 0..frames {
        for channel in channels {
            let scaled = (channel[i] * 32768.0).clamp(f32::from(i16::MIN), f32::from(i16::MAX));
            out.push(scaled as i16);
        }
    }
}

/// Cuts a sample stream into exact-size frames.
#[derive(Debug)]
pub struct Framer {
    format: AudioFormat,
    frame_len: usize,
    pending: Vec<i16>,
    cursor: usize,
}

impl Framer {
    pub fn new(format: AudioFormat) -> Result<Self, VoiceError> {
        let frame_len = format.frame_len();
        if frame_len == 0 {
            return Err(VoiceError::Config(format!(
                "frame format yields empty frames: {:?}",
                format
            )));
        }
        Ok(Self {
            format,
            frame_len,
            pending: Vec::new(),
            cursor: 0,
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Appends samples behind whatever remainder is still buffered.
    pub fn push(&mut self, samples: &[i16]) {
        if self.cursor > 0 {
            self.pending.drain(..self.cursor);
            self.cursor = 0;
        }
        self.pending.extend_from_slice(samples);
    }

    pub fn next_frame(&mut self) -> Option<AudioFrame> {
        if self.buffered() < self.frame_len {
            return None;
        }
        let end = self.cursor + self.frame_len;
        let data = self.pending[self.cursor..end].to_vec();
        self.cursor = end;

        Some(AudioFrame {
            data,
            sample_rate: self.format.sample_rate,
            num_channels: self.format.num_channels,
            samples_per_channel: self.format.samples_per_channel(),
        })
    }

    /// Drains every complete frame currently buffered.
    pub fn frames(&mut self) -> impl Iterator<Item = AudioFrame> + '_ {
        std::iter::from_fn(move || self.next_frame())
    }

    /// Samples waiting for enough company to form a frame.
    pub fn buffered(&self) -> usize {
        self.pending.len() - self.cursor
    }

    /// Ends the stream, returning the number of samples discarded.
    pub fn finish(self) -> usize {
        self.buffered()
    }
}

/// Copies every mono sample into each of `channels` interleaved slots.
pub fn upmix_mono(samples: &[i16], channels: usize) -> Vec<i16> {
    duplicate_samples(samples, channels.max(1), 1)
}

/// Decode, resample and frame one utterance.
///
/// The source may be mono or already carry the publish channel count. Mono
/// is resampled first and spread over the publish channels afterwards.
#[derive(Debug)]
pub struct FramePipeline {
    carry: Option<u8>,
    source_channels: usize,
    publish_channels: usize,
    /// Samples of a channel group split across chunks.
    partial: Vec<i16>,
    resampler: Resampler,
    framer: Framer,
}

impl FramePipeline {
    pub fn new(
        source_rate: u32,
        source_channels: u32,
        format: AudioFormat,
    ) -> Result<Self, VoiceError> {
        if source_channels == 0
            || (source_channels != 1 && source_channels != format.num_channels)
        {
            return Err(VoiceError::Config(format!(
                "cannot publish {}-channel audio as {} channels",
                source_channels, format.num_channels
            )));
        }

        Ok(Self {
            carry: None,
            source_channels: source_channels as usize,
            publish_channels: format.num_channels as usize,
            partial: Vec::new(),
            resampler: Resampler::new(source_rate, format.sample_rate, source_channels)?,
            framer: Framer::new(format)?,
        })
    }

    /// Feeds one backend chunk and returns the frames it completed, in order.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<Vec<AudioFrame>, VoiceError> {
        let samples = self.decode(bytes);
        let samples = self.whole_groups(samples);
        let resampled = self.resampler.process(&samples)?;
        self.push_resampled(&resampled);
        Ok(self.framer.frames().collect())
    }

    /// Flushes the resampler and returns the last complete frames plus the
    /// number of trailing samples that did not fill a frame.
    pub fn finish(mut self) -> Result<(Vec<AudioFrame>, usize), VoiceError> {
        let tail = self.resampler.flush()?;
        self.push_resampled(&tail);
        let frames: Vec<AudioFrame> = self.framer.frames().collect();
        Ok((frames, self.framer.finish()))
    }

    fn push_resampled(&mut self, samples: &[i16]) {
        if self.source_channels == self.publish_channels {
            self.framer.push(samples);
        } else {
            self.framer.push(&upmix_mono(samples, self.publish_channels));
        }
    }

    /// Holds back an incomplete trailing channel group until the next chunk.
    fn whole_groups(&mut self, samples: Vec<i16>) -> Vec<i16> {
        if self.source_channels == 1 {
            return samples;
        }
        let mut joined = std::mem::take(&mut self.partial);
        joined.extend(samples);
        let whole = joined.len() - joined.len() % self.source_channels;
        self.partial = joined.split_off(whole);
        joined
    }

    fn decode(&mut self, bytes: &[u8]) -> Vec<i16> {
        let mut samples = Vec::with_capacity(bytes.len() / 2 + 1);
        let mut rest = bytes;

        if let Some(low) = self.carry.take() {
            match rest.split_first() {
                Some((&high, tail)) => {
                    samples.push(i16::from_le_bytes([low, high]));
                    rest = tail;
                }
                None => {
                    self.carry = Some(low);
                    return samples;
                }
            }
        }

        let mut pairs = rest.chunks_exact(2);
        samples.extend(
            pairs
                .by_ref()
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        );
        self.carry = pairs.remainder().first().copied();
        samples
    }
}
