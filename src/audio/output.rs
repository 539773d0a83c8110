//! Speaker output and playback clock
//!
//! `AudioOutput` is the capability the playback scheduler drives: a clock in
//! seconds, and the ability to start a buffer at an exact clock time or stop
//! it early. `CpalOutput` renders scheduled voices sample-accurately on a
//! CPAL output stream; its clock is the number of frames rendered so far.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use thiserror::Error;
use tokio::sync::mpsc;

use super::codec::{resample, PlaybackBuffer};
use super::worker::StreamWorker;
use crate::playback::BufferHandle;

/// Channel on which outputs report buffers that finished playing naturally
pub type CompletionSender = mpsc::UnboundedSender<BufferHandle>;

/// Receiving end of `CompletionSender`
pub type CompletionReceiver = mpsc::UnboundedReceiver<BufferHandle>;

/// Errors raised by an audio output
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    #[error("no usable speaker: {0}")]
    DeviceUnavailable(String),
    #[error("speaker stream failed: {0}")]
    StreamFailed(String),
    #[error("audio output is not open")]
    NotOpen,
}

/// Playback capability driven by the scheduler
pub trait AudioOutput: Send {
    /// Acquire the output device. Finished buffers are reported on `completions`.
    fn open(&mut self, completions: CompletionSender) -> Result<(), PlaybackError>;

    /// Current playback clock in seconds
    fn now(&self) -> f64;

    /// Begin playing `buffer` when the clock reaches `start_time`
    fn play_at(
        &mut self,
        handle: BufferHandle,
        buffer: &PlaybackBuffer,
        start_time: f64,
    ) -> Result<(), PlaybackError>;

    /// Stop a scheduled or playing buffer immediately; it is never reported as finished
    fn stop(&mut self, handle: BufferHandle);

    /// Release the device. Idempotent.
    fn close(&mut self);
}

impl<O: AudioOutput + ?Sized> AudioOutput for Box<O> {
    fn open(&mut self, completions: CompletionSender) -> Result<(), PlaybackError> {
        (**self).open(completions)
    }

    fn now(&self) -> f64 {
        (**self).now()
    }

    fn play_at(
        &mut self,
        handle: BufferHandle,
        buffer: &PlaybackBuffer,
        start_time: f64,
    ) -> Result<(), PlaybackError> {
        (**self).play_at(handle, buffer, start_time)
    }

    fn stop(&mut self, handle: BufferHandle) {
        (**self).stop(handle)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// A buffer placed on the render timeline
struct Voice {
    handle: BufferHandle,
    samples: Vec<f32>,
    start_frame: u64,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// State shared between the owner and the render callback
struct Renderer {
    voices: Mutex<Vec<Voice>>,
    frames_rendered: AtomicU64,
    sample_rate: AtomicU32,
    completions: Mutex<Option<CompletionSender>>,
}

impl Renderer {
    fn new() -> Self {
        Self {
            voices: Mutex::new(Vec::new()),
            frames_rendered: AtomicU64::new(0),
            sample_rate: AtomicU32::new(0),
            completions: Mutex::new(None),
        }
    }

    fn voices(&self) -> MutexGuard<'_, Vec<Voice>> {
        // A poisoned lock only means a callback panicked mid-render; the
        // voice list itself is still consistent.
        self.voices.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn now(&self) -> f64 {
        let rate = self.sample_rate.load(Ordering::Acquire);
        if rate == 0 {
            return 0.0;
        }
        self.frames_rendered.load(Ordering::Acquire) as f64 / rate as f64
    }

    /// Mix every active voice into `out` (interleaved, `channels` wide)
    fn render(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        let base = self.frames_rendered.load(Ordering::Acquire);
        let end = base + frames as u64;

        out.iter_mut().for_each(|s| *s = 0.0);

        let mut finished = Vec::new();
        {
            let mut voices = self.voices();
            for voice in voices.iter() {
                if voice.start_frame >= end || voice.end_frame() <= base {
                    continue;
                }
                let from = voice.start_frame.max(base);
                let to = voice.end_frame().min(end);
                for frame in from..to {
                    let value = voice.samples[(frame - voice.start_frame) as usize];
                    let offset = (frame - base) as usize * channels;
                    for ch in 0..channels {
                        out[offset + ch] += value;
                    }
                }
            }

            voices.retain(|voice| {
                if voice.end_frame() <= end {
                    finished.push(voice.handle);
                    false
                } else {
                    true
                }
            });
        }

        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }

        self.frames_rendered.store(end, Ordering::Release);

        if !finished.is_empty() {
            let guard = self.completions.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(tx) = guard.as_ref() {
                for handle in finished {
                    let _ = tx.send(handle);
                }
            }
        }
    }
}

/// Speaker output on the default (or named) CPAL output device
pub struct CpalOutput {
    device_name: Option<String>,
    renderer: Arc<Renderer>,
    worker: Option<StreamWorker>,
}

impl CpalOutput {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            renderer: Arc::new(Renderer::new()),
            worker: None,
        }
    }

    /// Device sample rate, or 0 before `open`
    pub fn sample_rate(&self) -> u32 {
        self.renderer.sample_rate.load(Ordering::Acquire)
    }
}

impl Default for CpalOutput {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AudioOutput for CpalOutput {
    fn open(&mut self, completions: CompletionSender) -> Result<(), PlaybackError> {
        *self
            .renderer
            .completions
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(completions);

        if self.worker.is_some() {
            return Ok(());
        }

        let device_name = self.device_name.clone();
        let renderer = self.renderer.clone();
        let worker = StreamWorker::spawn(
            "speaker-output",
            move || {
                let (device, config, sample_format) = select_output(device_name.as_deref())?;
                renderer
                    .sample_rate
                    .store(config.sample_rate.0, Ordering::Release);
                build_output_stream(&device, &config, sample_format, renderer)
            },
            PlaybackError::StreamFailed,
        )?;

        self.worker = Some(worker);
        log::info!("Speaker output opened at {} Hz", self.sample_rate());
        Ok(())
    }

    fn now(&self) -> f64 {
        self.renderer.now()
    }

    fn play_at(
        &mut self,
        handle: BufferHandle,
        buffer: &PlaybackBuffer,
        start_time: f64,
    ) -> Result<(), PlaybackError> {
        if self.worker.is_none() {
            return Err(PlaybackError::NotOpen);
        }

        let rate = self.sample_rate();
        let (start_frame, end_frame) = frame_span(start_time, buffer.duration(), rate);
        let samples = fit_to_length(
            resample(&buffer.to_mono(), buffer.sample_rate, rate),
            (end_frame - start_frame) as usize,
        );

        self.renderer.voices().push(Voice {
            handle,
            samples,
            start_frame,
        });
        Ok(())
    }

    fn stop(&mut self, handle: BufferHandle) {
        self.renderer.voices().retain(|v| v.handle != handle);
    }

    fn close(&mut self) {
        self.renderer.voices().clear();
        *self
            .renderer
            .completions
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = None;

        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            log::info!("Speaker output closed");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Device frames `[start, end)` covered by a buffer.
///
/// Both ends are rounded from absolute times, so a buffer scheduled where the
/// previous one ended starts on that buffer's end frame.
fn frame_span(start_time: f64, duration: f64, rate: u32) -> (u64, u64) {
    let to_frame = |t: f64| (t.max(0.0) * rate as f64).round() as u64;
    let start = to_frame(start_time);
    let end = to_frame(start_time + duration).max(start);
    (start, end)
}

/// Trim or pad (holding the last sample) to exactly `len` frames
fn fit_to_length(mut samples: Vec<f32>, len: usize) -> Vec<f32> {
    let pad = samples.last().copied().unwrap_or(0.0);
    samples.resize(len, pad);
    samples
}

fn select_output(name: Option<&str>) -> Result<(Device, StreamConfig, SampleFormat), PlaybackError> {
    let host = cpal::default_host();

    let mut device = None;
    if let Some(wanted) = name {
        if let Ok(devices) = host.output_devices() {
            device = devices
                .into_iter()
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false));
        }
        if device.is_none() {
            log::warn!("Output device {:?} not found, using default", wanted);
        }
    }

    let device = match device {
        Some(d) => d,
        None => host.default_output_device().ok_or_else(|| {
            PlaybackError::DeviceUnavailable("no output device found".to_string())
        })?,
    };
    log::info!("Using audio output device: {:?}", device.name());

    let supported = device
        .default_output_config()
        .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();

    Ok((device, config, sample_format))
}

fn build_output_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    renderer: Arc<Renderer>,
) -> Result<cpal::Stream, PlaybackError> {
    match sample_format {
        SampleFormat::F32 => build_typed::<f32>(device, config, renderer),
        SampleFormat::I16 => build_typed::<i16>(device, config, renderer),
        SampleFormat::U16 => build_typed::<u16>(device, config, renderer),
        other => Err(PlaybackError::DeviceUnavailable(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }
}

fn build_typed<T>(
    device: &Device,
    config: &StreamConfig,
    renderer: Arc<Renderer>,
) -> Result<cpal::Stream, PlaybackError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let mut mix: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mix.resize(data.len(), 0.0);
                renderer.render(&mut mix, channels);
                for (out, &value) in data.iter_mut().zip(mix.iter()) {
                    *out = T::from_sample(value);
                }
            },
            |err| log::error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| PlaybackError::StreamFailed(e.to_string()))
}
