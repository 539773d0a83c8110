//! Microphone capture using CPAL
//!
//! `CpalCapture` opens an input device and emits fixed-size mono 16kHz
//! `RawFrame` windows through a callback. The callback runs on the audio
//! thread: it must only hand the frame on (encode + enqueue), never block.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use thiserror::Error;

use super::codec::{downmix, resample, RawFrame, INPUT_SAMPLE_RATE};
use super::worker::StreamWorker;

/// Default capture window: 100ms at 16kHz
pub const DEFAULT_FRAME_DURATION_MS: u32 = 100;

/// Errors that can occur while acquiring or running the microphone
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("no usable microphone: {0}")]
    DeviceUnavailable(String),
    #[error("microphone stream failed: {0}")]
    StreamFailed(String),
    #[error("capture start cancelled")]
    Cancelled,
}

/// Callbacks invoked from the audio thread
pub struct CaptureCallbacks {
    /// Receives each completed window; must return quickly
    pub on_frame: Box<dyn FnMut(RawFrame) + Send + 'static>,
    /// Receives device errors raised after the stream started
    pub on_error: Box<dyn Fn(CaptureError) + Send + Sync + 'static>,
}

impl CaptureCallbacks {
    pub fn new<F, E>(on_frame: F, on_error: E) -> Self
    where
        F: FnMut(RawFrame) + Send + 'static,
        E: Fn(CaptureError) + Send + Sync + 'static,
    {
        Self {
            on_frame: Box::new(on_frame),
            on_error: Box::new(on_error),
        }
    }
}

/// Capability owning the microphone
pub trait CaptureSource: Send {
    /// Acquire the device and begin emitting frames.
    /// Calling `start` while already active is a no-op.
    fn start(&mut self, callbacks: CaptureCallbacks) -> Result<(), CaptureError>;

    /// Release the device. Idempotent.
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Turns device callback buffers into fixed windows of mono 16kHz samples
pub struct FrameAssembler {
    source_rate: u32,
    source_channels: u16,
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(source_rate: u32, source_channels: u16, frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            source_rate,
            source_channels,
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Number of samples per emitted window at 16kHz
    pub fn frame_samples_for(duration_ms: u32) -> usize {
        (INPUT_SAMPLE_RATE as usize * duration_ms as usize / 1000).max(1)
    }

    /// Feed interleaved device samples, emitting every completed window
    pub fn push<F: FnMut(RawFrame)>(&mut self, interleaved: &[f32], mut emit: F) {
        let mono = downmix(interleaved, self.source_channels);
        let converted = resample(&mono, self.source_rate, INPUT_SAMPLE_RATE);
        self.pending.extend(converted);

        while self.pending.len() >= self.frame_samples {
            let window: Vec<f32> = self.pending.drain(..self.frame_samples).collect();
            emit(RawFrame::new(window, INPUT_SAMPLE_RATE));
        }
    }
}

/// Map a backend error message to the capture taxonomy
fn classify_backend_error(message: &str) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not permitted")
    {
        CaptureError::PermissionDenied
    } else {
        CaptureError::DeviceUnavailable(message.to_string())
    }
}

fn build_error(err: cpal::BuildStreamError) -> CaptureError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            CaptureError::DeviceUnavailable("device not available".to_string())
        }
        cpal::BuildStreamError::BackendSpecific { err } => classify_backend_error(&err.description),
        other => CaptureError::DeviceUnavailable(other.to_string()),
    }
}

fn config_error(err: cpal::DefaultStreamConfigError) -> CaptureError {
    match err {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            CaptureError::DeviceUnavailable("device not available".to_string())
        }
        cpal::DefaultStreamConfigError::BackendSpecific { err } => {
            classify_backend_error(&err.description)
        }
        other => CaptureError::DeviceUnavailable(other.to_string()),
    }
}

/// Find the input device by name, or the host default
fn select_input_device(name: Option<&str>) -> Result<Device, CaptureError> {
    let host = cpal::default_host();

    if let Some(wanted) = name {
        let devices = host
            .input_devices()
            .map_err(|e| classify_backend_error(&e.to_string()))?;
        for device in devices {
            if device.name().map(|n| n == wanted).unwrap_or(false) {
                return Ok(device);
            }
        }
        log::warn!("Input device {:?} not found, using default", wanted);
    }

    host.default_input_device()
        .ok_or_else(|| CaptureError::DeviceUnavailable("no input device found".to_string()))
}

/// Microphone capture on the default (or named) CPAL input device
pub struct CpalCapture {
    device_name: Option<String>,
    frame_duration_ms: u32,
    worker: Option<StreamWorker>,
}

impl CpalCapture {
    pub fn new(device_name: Option<String>, frame_duration_ms: u32) -> Self {
        Self {
            device_name,
            frame_duration_ms,
            worker: None,
        }
    }
}

impl Default for CpalCapture {
    fn default() -> Self {
        Self::new(None, DEFAULT_FRAME_DURATION_MS)
    }
}

impl CaptureSource for CpalCapture {
    fn start(&mut self, callbacks: CaptureCallbacks) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            log::debug!("Capture already active");
            return Ok(());
        }

        let device_name = self.device_name.clone();
        let frame_samples = FrameAssembler::frame_samples_for(self.frame_duration_ms);

        let worker = StreamWorker::spawn(
            "mic-capture",
            move || build_input_stream(device_name.as_deref(), frame_samples, callbacks),
            |e| classify_backend_error(&e),
        )?;

        self.worker = Some(worker);
        log::info!("Microphone capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            log::info!("Microphone capture stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input_stream(
    device_name: Option<&str>,
    frame_samples: usize,
    callbacks: CaptureCallbacks,
) -> Result<cpal::Stream, CaptureError> {
    let device = select_input_device(device_name)?;
    log::info!("Using audio input device: {:?}", device.name());

    let supported = device.default_input_config().map_err(config_error)?;
    log::info!(
        "Input config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();

    match sample_format {
        SampleFormat::I16 => build_typed::<i16>(&device, &config, frame_samples, callbacks),
        SampleFormat::U16 => build_typed::<u16>(&device, &config, frame_samples, callbacks),
        SampleFormat::F32 => build_typed::<f32>(&device, &config, frame_samples, callbacks),
        other => Err(CaptureError::DeviceUnavailable(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }
}

fn build_typed<T>(
    device: &Device,
    config: &StreamConfig,
    frame_samples: usize,
    callbacks: CaptureCallbacks,
) -> Result<cpal::Stream, CaptureError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let CaptureCallbacks {
        mut on_frame,
        on_error,
    } = callbacks;

    let mut assembler = FrameAssembler::new(config.sample_rate.0, config.channels, frame_samples);
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));
                assembler.push(&scratch, |frame| on_frame(frame));
            },
            move |err| {
                log::error!("Audio input stream error: {}", err);
                on_error(CaptureError::StreamFailed(err.to_string()));
            },
            None,
        )
        .map_err(build_error)
}
