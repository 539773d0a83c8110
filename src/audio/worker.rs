//! Dedicated thread that owns a CPAL stream
//!
//! `cpal::Stream` is not `Send` on every backend, so the stream is built and
//! kept alive on its own thread. The owner only holds a stop channel and the
//! join handle, which keeps the capture and output handles `Send` and lets
//! `stop()` release the device deterministically.

use std::sync::mpsc;
use std::thread::JoinHandle;

use cpal::traits::StreamTrait;

/// Handle to a running stream thread. Dropping it stops the stream.
pub(crate) struct StreamWorker {
    name: String,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamWorker {
    /// Spawn a thread, build the stream on it and start playback/capture.
    ///
    /// Blocks until the stream is either running or has failed to build.
    /// `fail` converts a `play()` or thread failure into the caller's error type.
    pub(crate) fn spawn<E, B>(name: &str, build: B, fail: fn(String) -> E) -> Result<Self, E>
    where
        E: Send + 'static,
        B: FnOnce() -> Result<cpal::Stream, E> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), E>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(fail(e.to_string())));
                    return;
                }

                if ready_tx.send(Ok(())).is_err() {
                    return;
                }

                // Park until stop() or the owner is dropped; the stream is
                // released when it goes out of scope here.
                let _ = stop_rx.recv();
                drop(stream);
            });

        let thread = match thread {
            Ok(t) => t,
            Err(e) => {
                log::error!("Failed to spawn {} thread: {}", name, e);
                return Err(fail(e.to_string()));
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                name: name.to_string(),
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                // Thread died without reporting (panic inside the backend)
                let _ = thread.join();
                log::error!("{} thread exited before reporting readiness", name);
                Err(fail("stream thread exited unexpectedly".to_string()))
            }
        }
    }

    /// Stop the stream and join the thread. Safe to call more than once.
    pub(crate) fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("{} thread panicked during shutdown", self.name);
            }
            log::debug!("{} thread stopped", self.name);
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
