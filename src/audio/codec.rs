//! PCM16 wire codec for the conversational engine
//!
//! Pure conversions between float sample buffers and the base64 PCM16 payloads
//! that cross the engine boundary. Nothing here touches a device or a socket,
//! so every function is safe to call from the capture callback.
//!
//! # Wire format
//!
//! - Outbound: mono PCM16 little-endian at 16kHz, base64, MIME `audio/pcm;rate=16000`
//! - Inbound: PCM16 little-endian at 24kHz, base64, interleaved when multi-channel

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sample rate the engine expects for microphone audio
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized speech returned by the engine
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Channel count of synthesized speech returned by the engine
pub const OUTPUT_CHANNELS: u16 = 1;

/// Scale between normalized floats and signed 16-bit samples
pub const PCM_SCALE: f32 = 32768.0;

/// Errors produced while decoding an inbound audio payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload of {len} bytes is not a multiple of {frame_bytes} ({channels} channel(s) of PCM16)")]
    MisalignedLength {
        len: usize,
        channels: u16,
        frame_bytes: usize,
    },
    #[error("invalid channel count: {0}")]
    InvalidChannelCount(u16),
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
}

/// A window of normalized mono samples captured from the microphone
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Samples in [-1.0, 1.0]; values outside are clamped by `encode`
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl RawFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Duration of this frame in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Outbound wire unit: `{ "data": <base64>, "mimeType": "audio/pcm;rate=16000" }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedFrame {
    pub data: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Decoded PCM ready for playback
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    /// One sample vector per channel, all the same length
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    /// Create a mono buffer from samples
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            channels: vec![samples],
            sample_rate,
        }
    }

    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Playback duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Average all channels into a single mono track
    pub fn to_mono(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            n => (0..self.frames())
                .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / n as f32)
                .collect(),
        }
    }
}

/// MIME type announced for PCM16 at the given rate
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Convert one normalized sample to PCM16.
///
/// Input is clamped to [-1.0, 1.0] before scaling so out-of-range values
/// saturate instead of wrapping; +1.0 maps to `i16::MAX`.
pub fn sample_to_pcm16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let scaled = sample.clamp(-1.0, 1.0) * PCM_SCALE;
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert one PCM16 sample back to a normalized float
pub fn pcm16_to_sample(value: i16) -> f32 {
    value as f32 / PCM_SCALE
}

/// Encode a raw frame into the outbound wire representation
pub fn encode(frame: &RawFrame) -> EncodedFrame {
    let mut bytes = Vec::with_capacity(frame.samples.len() * 2);
    for &sample in &frame.samples {
        bytes.extend_from_slice(&sample_to_pcm16(sample).to_le_bytes());
    }

    EncodedFrame {
        data: STANDARD.encode(&bytes),
        mime_type: pcm_mime_type(frame.sample_rate),
    }
}

/// Decode raw PCM16 bytes into a playback buffer.
///
/// Fails when the byte length does not divide evenly into `channels`
/// interleaved 16-bit samples.
pub fn decode(payload: &[u8], sample_rate: u32, channels: u16) -> Result<PlaybackBuffer, DecodeError> {
    if channels == 0 {
        return Err(DecodeError::InvalidChannelCount(channels));
    }
    if sample_rate == 0 {
        return Err(DecodeError::InvalidSampleRate(sample_rate));
    }

    let frame_bytes = 2 * channels as usize;
    if payload.len() % frame_bytes != 0 {
        return Err(DecodeError::MisalignedLength {
            len: payload.len(),
            channels,
            frame_bytes,
        });
    }

    let frames = payload.len() / frame_bytes;
    let mut out = vec![Vec::with_capacity(frames); channels as usize];

    for (i, pair) in payload.chunks_exact(2).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        out[i % channels as usize].push(pcm16_to_sample(value));
    }

    Ok(PlaybackBuffer {
        channels: out,
        sample_rate,
    })
}

/// Decode a base64 payload into raw bytes
pub fn decode_base64(payload: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD
        .decode(payload)
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))
}

/// Average interleaved multi-channel samples down to mono
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let n = channels as usize;
    interleaved
        .chunks(n)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample mono audio between rates.
///
/// Integer down-ratios (48kHz → 16kHz) average each group of samples;
/// any other ratio uses linear interpolation.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    // Guard against division by zero
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    if source_rate > target_rate && source_rate % target_rate == 0 {
        let ratio = (source_rate / target_rate) as usize;
        return samples
            .chunks(ratio)
            .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
            .collect();
    }

    let step = source_rate as f64 / target_rate as f64;
    let out_len = ((samples.len() as f64) / step).round().max(1.0) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[next] - samples[idx]) * frac
        })
        .collect()
}
