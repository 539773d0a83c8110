//! Gapless, cancelable playback scheduling
//!
//! Decoded buffers arrive with network jitter. Each one is placed on the
//! output timeline at `max(next_start_time, now)` so consecutive chunks play
//! back-to-back, and the cursor advances by the buffer's duration. An
//! interruption stops everything in the registry and pulls the cursor back
//! to the current clock.

use crate::audio::codec::PlaybackBuffer;
use crate::audio::output::{AudioOutput, CompletionSender, PlaybackError};

use super::registry::{BufferHandle, BufferRegistry};

/// Where a buffer landed on the timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub handle: BufferHandle,
    pub start_time: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, Copy)]
struct ActiveBuffer {
    start_time: f64,
    duration: f64,
}

pub struct PlaybackScheduler<O: AudioOutput> {
    output: O,
    active: BufferRegistry<ActiveBuffer>,
    next_start_time: f64,
    open: bool,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            active: BufferRegistry::new(),
            next_start_time: 0.0,
            open: false,
        }
    }

    /// Acquire the output and anchor the timeline at its clock
    pub fn open(&mut self, completions: CompletionSender) -> Result<(), PlaybackError> {
        if self.open {
            return Ok(());
        }
        self.output.open(completions)?;
        self.open = true;
        self.reset_timeline();
        Ok(())
    }

    /// Move the cursor to the current clock (session start)
    pub fn reset_timeline(&mut self) {
        self.next_start_time = self.output.now();
        log::debug!("Playback timeline reset to {:.3}s", self.next_start_time);
    }

    /// Place `buffer` directly after everything already scheduled
    pub fn schedule(&mut self, buffer: PlaybackBuffer) -> Result<ScheduledPlayback, PlaybackError> {
        if !self.open {
            return Err(PlaybackError::NotOpen);
        }

        let duration = buffer.duration();
        let start_time = self.next_start_time.max(self.output.now());

        let handle = self.active.insert(ActiveBuffer {
            start_time,
            duration,
        });
        if let Err(e) = self.output.play_at(handle, &buffer, start_time) {
            self.active.remove(handle);
            return Err(e);
        }

        self.next_start_time = start_time + duration;
        log::trace!(
            "Scheduled {} at {:.3}s for {:.3}s ({} active)",
            handle,
            start_time,
            duration,
            self.active.len()
        );

        Ok(ScheduledPlayback {
            handle,
            start_time,
            duration,
        })
    }

    /// Record a natural completion. Returns false for stale or unknown handles.
    pub fn on_finished(&mut self, handle: BufferHandle) -> bool {
        self.active.remove(handle).is_some()
    }

    /// Stop every active buffer, clear the set and rewind the cursor to now.
    /// Returns how many buffers were stopped.
    pub fn interrupt(&mut self) -> usize {
        let now = self.output.now();
        let unplayed: f64 = self
            .active
            .iter()
            .map(|(_, b)| (b.start_time + b.duration - b.start_time.max(now)).max(0.0))
            .sum();

        let stopped = self.stop_all();
        self.next_start_time = now;
        if stopped > 0 {
            log::debug!(
                "Interrupted playback, stopped {} buffers ({:.3}s unplayed)",
                stopped,
                unplayed
            );
        }
        stopped
    }

    /// Stop everything and release the output. Idempotent.
    pub fn close(&mut self) {
        self.stop_all();
        if self.open {
            self.output.close();
            self.open = false;
        }
    }

    fn stop_all(&mut self) -> usize {
        let drained = self.active.drain();
        for (handle, _) in &drained {
            self.output.stop(*handle);
        }
        drained.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }
}

impl<O: AudioOutput> Drop for PlaybackScheduler<O> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Log {
        clock: f64,
        played: Vec<(BufferHandle, f64)>,
        stopped: Vec<BufferHandle>,
        opened: usize,
        closed: usize,
    }

    #[derive(Clone, Default)]
    struct FakeOutput {
        log: Arc<Mutex<Log>>,
        fail_play: bool,
    }

    impl FakeOutput {
        fn set_clock(&self, t: f64) {
            self.log.lock().unwrap().clock = t;
        }
    }

    impl AudioOutput for FakeOutput {
        fn open(&mut self, _completions: CompletionSender) -> Result<(), PlaybackError> {
            self.log.lock().unwrap().opened += 1;
            Ok(())
        }

        fn now(&self) -> f64 {
            self.log.lock().unwrap().clock
        }

        fn play_at(
            &mut self,
            handle: BufferHandle,
            _buffer: &PlaybackBuffer,
            start_time: f64,
        ) -> Result<(), PlaybackError> {
            if self.fail_play {
                return Err(PlaybackError::StreamFailed("boom".into()));
            }
            self.log.lock().unwrap().played.push((handle, start_time));
            Ok(())
        }

        fn stop(&mut self, handle: BufferHandle) {
            self.log.lock().unwrap().stopped.push(handle);
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closed += 1;
        }
    }

    fn chunk(samples: usize) -> PlaybackBuffer {
        PlaybackBuffer::mono(vec![0.1; samples], 24000)
    }

    fn opened(output: FakeOutput) -> PlaybackScheduler<FakeOutput> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut scheduler = PlaybackScheduler::new(output);
        scheduler.open(tx).unwrap();
        scheduler
    }

    #[test]
    fn test_schedule_requires_open() {
        let mut scheduler = PlaybackScheduler::new(FakeOutput::default());
        assert_eq!(scheduler.schedule(chunk(10)), Err(PlaybackError::NotOpen));
    }

    #[test]
    fn test_open_anchors_timeline_at_clock() {
        let output = FakeOutput::default();
        output.set_clock(3.5);
        let scheduler = opened(output);
        assert_eq!(scheduler.next_start_time(), 3.5);
    }

    #[test]
    fn test_ten_chunks_back_to_back() {
        let output = FakeOutput::default();
        output.set_clock(2.0);
        let mut scheduler = opened(output);

        let mut previous: Option<ScheduledPlayback> = None;
        for _ in 0..10 {
            let s = scheduler.schedule(chunk(1024)).unwrap();
            if let Some(p) = previous {
                assert!((s.start_time - (p.start_time + p.duration)).abs() < 1e-9);
            }
            previous = Some(s);
        }

        let expected = 2.0 + 10.0 * (1024.0 / 24000.0);
        assert!((scheduler.next_start_time() - expected).abs() < 1e-9);
        assert_eq!(scheduler.active_count(), 10);
    }

    #[test]
    fn test_late_arrival_starts_at_clock() {
        let output = FakeOutput::default();
        let mut scheduler = opened(output.clone());

        let first = scheduler.schedule(chunk(2400)).unwrap(); // 0.1s
        assert_eq!(first.start_time, 0.0);

        // Underrun: the next chunk arrives after the first finished
        output.set_clock(0.5);
        let second = scheduler.schedule(chunk(2400)).unwrap();
        assert_eq!(second.start_time, 0.5);
        assert!((scheduler.next_start_time() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_does_not_open_gaps() {
        let output = FakeOutput::default();
        let mut scheduler = opened(output.clone());

        let a = scheduler.schedule(chunk(4800)).unwrap(); // 0.2s
        output.set_clock(0.05);
        let b = scheduler.schedule(chunk(2400)).unwrap();
        output.set_clock(0.19);
        let c = scheduler.schedule(chunk(2400)).unwrap();

        assert!((b.start_time - (a.start_time + a.duration)).abs() < 1e-9);
        assert!((c.start_time - (b.start_time + b.duration)).abs() < 1e-9);
        assert!((scheduler.next_start_time() - (c.start_time + c.duration)).abs() < 1e-9);
    }

    #[test]
    fn test_interrupt_stops_all_and_rewinds() {
        let output = FakeOutput::default();
        let mut scheduler = opened(output.clone());

        let handles: Vec<_> = (0..3)
            .map(|_| scheduler.schedule(chunk(2400)).unwrap().handle)
            .collect();

        output.set_clock(0.12);
        assert_eq!(scheduler.interrupt(), 3);
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.next_start_time(), 0.12);
        assert_eq!(output.log.lock().unwrap().stopped, handles);

        // Completion racing with the interruption is ignored
        assert!(!scheduler.on_finished(handles[0]));

        // Interrupting again is a bounded no-op
        assert_eq!(scheduler.interrupt(), 0);
    }

    #[test]
    fn test_on_finished_drains_active_set() {
        let mut scheduler = opened(FakeOutput::default());
        let a = scheduler.schedule(chunk(100)).unwrap().handle;
        let b = scheduler.schedule(chunk(100)).unwrap().handle;

        assert!(scheduler.on_finished(a));
        assert!(!scheduler.on_finished(a));
        assert!(!scheduler.is_idle());
        assert!(scheduler.on_finished(b));
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_failed_play_leaves_cursor_untouched() {
        let output = FakeOutput {
            fail_play: true,
            ..Default::default()
        };
        let mut scheduler = opened(output);

        assert!(scheduler.schedule(chunk(2400)).is_err());
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.next_start_time(), 0.0);
    }

    #[test]
    fn test_close_is_idempotent_and_reopenable() {
        let output = FakeOutput::default();
        let mut scheduler = opened(output.clone());
        scheduler.schedule(chunk(100)).unwrap();

        scheduler.close();
        scheduler.close();
        assert!(scheduler.is_idle());
        assert!(matches!(
            scheduler.schedule(chunk(100)),
            Err(PlaybackError::NotOpen)
        ));
        {
            let log = output.log.lock().unwrap();
            assert_eq!(log.closed, 1);
            assert_eq!(log.stopped.len(), 1);
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        scheduler.open(tx).unwrap();
        assert_eq!(output.log.lock().unwrap().opened, 2);
        drop(scheduler);
        assert_eq!(output.log.lock().unwrap().closed, 2);
    }
}
