//! Playback bookkeeping: the active-buffer registry and the gapless scheduler

pub mod registry;
pub mod scheduler;

pub use registry::{BufferHandle, BufferRegistry};
pub use scheduler::{PlaybackScheduler, ScheduledPlayback};
