//! PCM transcoding: synthesizer format → voice sink format.
//!
//! Input is s16le mono at the synthesizer's rate (24kHz for Gemini).
//! Output is s16le interleaved stereo at 48kHz, what the voice driver
//! mixes natively. The resample runs in fixed-size chunks through a sinc
//! resampler so long utterances never need a single huge FFT/window pass.

use std::io::{Cursor, Read};
use std::time::Duration;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

use crate::error::TranscodeError;
use crate::tts::SynthesizedAudio;

pub const SOURCE_SAMPLE_RATE: u32 = 24_000;
pub const TARGET_SAMPLE_RATE: u32 = 48_000;
pub const TARGET_CHANNELS: u16 = 2;

const CHUNK_FRAMES: usize = 1024;

/// Readable stream of s16le interleaved PCM ready for the sink.
#[derive(Debug)]
pub struct PcmStream {
    reader: Cursor<Vec<u8>>,
    sample_rate: u32,
    channels: u16,
}

impl PcmStream {
    pub fn new(bytes: Vec<u8>, sample_rate: u32, channels: u16) -> Self {
        Self {
            reader: Cursor::new(bytes),
            sample_rate,
            channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Total byte length, independent of how much has been read.
    pub fn len(&self) -> usize {
        self.reader.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duration(&self) -> Duration {
        let frame_bytes = 2 * self.channels.max(1) as usize;
        let frames = self.len() / frame_bytes;
        Duration::from_secs_f64(frames as f64 / self.sample_rate.max(1) as f64)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.reader.into_inner()
    }
}

impl Read for PcmStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Mono → stereo, any rate → 48kHz.
#[derive(Debug, Clone, Copy)]
pub struct Transcoder {
    target_rate: u32,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self {
            target_rate: TARGET_SAMPLE_RATE,
        }
    }
}

impl Transcoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transcode on the blocking pool; resampling is CPU-bound.
    pub async fn transcode_audio(&self, audio: SynthesizedAudio) -> Result<PcmStream, TranscodeError> {
        let transcoder = *self;
        tokio::task::spawn_blocking(move || transcoder.transcode(&audio.pcm, audio.sample_rate))
            .await
            .map_err(|e| TranscodeError::Join(e.to_string()))?
    }

    pub fn transcode(&self, pcm: &[u8], source_rate: u32) -> Result<PcmStream, TranscodeError> {
        if pcm.len() % 2 != 0 {
            return Err(TranscodeError::OddLength(pcm.len()));
        }

        let samples: Vec<f32> = pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect();

        let resampled = if source_rate == self.target_rate || samples.is_empty() {
            samples
        } else {
            resample(&samples, source_rate, self.target_rate)?
        };

        let mut out = Vec::with_capacity(resampled.len() * 2 * TARGET_CHANNELS as usize);
        for sample in resampled {
            let bytes = ((sample * 32767.0).clamp(-32768.0, 32767.0) as i16).to_le_bytes();
            for _ in 0..TARGET_CHANNELS {
                out.extend_from_slice(&bytes);
            }
        }

        debug!(
            in_bytes = pcm.len(),
            out_bytes = out.len(),
            source_rate,
            target_rate = self.target_rate,
            "transcoded PCM"
        );

        Ok(PcmStream::new(out, self.target_rate, TARGET_CHANNELS))
    }
}

/// Chunked sinc resample of a mono signal. Output length is exactly
/// `input_len * target / source` frames, with the filter delay removed.
fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>, TranscodeError> {
    if source_rate == 0 {
        return Err(TranscodeError::Setup("source sample rate is 0".into()));
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = target_rate as f64 / source_rate as f64;

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, CHUNK_FRAMES, 1)
        .map_err(|e| TranscodeError::Setup(e.to_string()))?;

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut out: Vec<f32> = Vec::with_capacity(expected + delay + CHUNK_FRAMES * 4);

    let mut chunks = samples.chunks_exact(CHUNK_FRAMES);
    for chunk in &mut chunks {
        let input = [chunk];
        let frames = resampler
            .process(&input[..], None)
            .map_err(|e| TranscodeError::Resample(e.to_string()))?;
        out.extend_from_slice(&frames[0]);
    }

    let rest = [chunks.remainder()];
    if !rest[0].is_empty() {
        let frames = resampler
            .process_partial(Some(&rest[..]), None)
            .map_err(|e| TranscodeError::Resample(e.to_string()))?;
        out.extend_from_slice(&frames[0]);
    }

    // Flush the filter tail.
    let mut flushes = 0;
    while out.len() < expected + delay && flushes < 8 {
        let frames = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| TranscodeError::Resample(e.to_string()))?;
        out.extend_from_slice(&frames[0]);
        flushes += 1;
    }

    let mut out = out.split_off(delay.min(out.len()));
    out.resize(expected, 0.0);
    Ok(out)
}
