//! Audio I/O for the voice concierge
//!
//! Microphone capture and speaker output use CPAL; the PCM16 wire codec is
//! pure and usable without any device.

pub mod capture;
pub mod codec;
pub mod output;
mod worker;

pub use capture::{CaptureCallbacks, CaptureError, CaptureSource, CpalCapture, FrameAssembler};
pub use codec::{
    decode, decode_base64, encode, DecodeError, EncodedFrame, PlaybackBuffer, RawFrame,
    INPUT_SAMPLE_RATE, OUTPUT_CHANNELS, OUTPUT_SAMPLE_RATE,
};
pub use output::{AudioOutput, CompletionReceiver, CompletionSender, CpalOutput, PlaybackError};
