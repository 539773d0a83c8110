//! Shared fakes for the integration tests
//!
//! - `FakeEngine`: a real WebSocket server on 127.0.0.1 that speaks the
//!   engine protocol and lets a test push server messages
//! - `FakeCapture`: a microphone driven by the test
//! - `ManualOutput`: a speaker whose clock only moves when the test says so

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use concierge_lib::audio::capture::{CaptureCallbacks, CaptureError, CaptureSource};
use concierge_lib::audio::codec::{PlaybackBuffer, RawFrame, INPUT_SAMPLE_RATE};
use concierge_lib::audio::output::{AudioOutput, CompletionSender, PlaybackError};
use concierge_lib::playback::BufferHandle;
use concierge_lib::streaming::{ClientMessage, ServerMessage};

pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Fake conversational engine
// ============================================================================

/// How the engine answers the setup message
#[derive(Debug, Clone)]
pub enum SetupBehavior {
    Ack,
    Reject { code: String, message: String },
    /// Never answer (setup timeout)
    Ignore,
}

enum Outgoing {
    Message(ServerMessage),
    Raw(String),
    Close,
}

type SharedOutbox = Arc<Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>>;

pub struct FakeEngine {
    pub url: String,
    connections: Arc<AtomicUsize>,
    inbox: mpsc::UnboundedReceiver<ClientMessage>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    task: JoinHandle<()>,
}

impl FakeEngine {
    pub async fn start(behavior: SetupBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connections = Arc::new(AtomicUsize::new(0));
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let shared: SharedOutbox = Arc::new(Mutex::new(Some(outbox_rx)));

        let counter = connections.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(
                    stream,
                    behavior.clone(),
                    inbox_tx.clone(),
                    shared.clone(),
                ));
            }
        });

        Self {
            url: format!("ws://{}/live", addr),
            connections,
            inbox,
            outbox,
            task,
        }
    }

    /// Number of TCP connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn send(&self, msg: ServerMessage) {
        let _ = self.outbox.send(Outgoing::Message(msg));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.outbox.send(Outgoing::Raw(text.to_string()));
    }

    /// Close the current connection from the server side
    pub fn close_connection(&self) {
        let _ = self.outbox.send(Outgoing::Close);
    }

    /// Next message the client sent, setup included
    pub async fn next_message(&mut self) -> Option<ClientMessage> {
        tokio::time::timeout(WAIT, self.inbox.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next `realtimeInput` frame, skipping anything else
    pub async fn next_frame(&mut self) -> Option<concierge_lib::audio::codec::EncodedFrame> {
        loop {
            match self.next_message().await? {
                ClientMessage::RealtimeInput(frame) => return Some(frame),
                ClientMessage::Setup(_) => continue,
            }
        }
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn recv_outgoing(rx: &mut Option<mpsc::UnboundedReceiver<Outgoing>>) -> Option<Outgoing> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn serve(
    stream: TcpStream,
    behavior: SetupBehavior,
    inbox: mpsc::UnboundedSender<ClientMessage>,
    shared: SharedOutbox,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    // First data frame is the setup message
    let setup = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => break serde_json::from_str::<ClientMessage>(&text).ok(),
            Some(Ok(_)) => continue,
            _ => return,
        }
    };
    if let Some(msg) = setup {
        let _ = inbox.send(msg);
    }

    match behavior {
        SetupBehavior::Ack => {
            let ack = r#"{"setupComplete": {"sessionId": "fake-session"}}"#;
            if write.send(Message::Text(ack.to_string())).await.is_err() {
                return;
            }
        }
        SetupBehavior::Reject { code, message } => {
            let err = serde_json::json!({"error": {"code": code, "message": message}});
            let _ = write.send(Message::Text(err.to_string())).await;
            let _ = write.close().await;
            return;
        }
        SetupBehavior::Ignore => {}
    }

    let mut outbox = shared.lock().unwrap().take();

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(msg) = serde_json::from_str::<ClientMessage>(&text) {
                        let _ = inbox.send(msg);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            out = recv_outgoing(&mut outbox) => match out {
                Some(Outgoing::Message(msg)) => {
                    let text = serde_json::to_string(&msg).unwrap();
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Raw(text)) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = write.close().await;
                    break;
                }
            },
        }
    }

    // Let the next connection pick up the outbox
    if let Some(rx) = outbox {
        *shared.lock().unwrap() = Some(rx);
    }
}

/// Poll `cond` until it holds or `WAIT` elapses
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// A `ws://` URL nothing is listening on
pub async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}/live", addr)
}

/// Little-endian PCM16 bytes of `samples` copies of `value`
pub fn pcm_bytes(samples: usize, value: i16) -> Vec<u8> {
    (0..samples).flat_map(|_| value.to_le_bytes()).collect()
}

// ============================================================================
// Fake microphone
// ============================================================================

#[derive(Default)]
struct CaptureState {
    fail_with: Option<CaptureError>,
    callbacks: Option<CaptureCallbacks>,
    starts: usize,
    stops: usize,
}

#[derive(Clone, Default)]
pub struct FakeCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// A microphone whose `start` always fails with `error`
    pub fn failing(error: CaptureError) -> Self {
        let capture = Self::default();
        capture.state.lock().unwrap().fail_with = Some(error);
        capture
    }

    pub fn mic_active(&self) -> bool {
        self.state.lock().unwrap().callbacks.is_some()
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    /// Emit one 16kHz frame through the capture callback, as the audio thread would
    pub fn push_frame(&self, samples: Vec<f32>) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.callbacks.as_mut() {
            Some(callbacks) => {
                (callbacks.on_frame)(RawFrame::new(samples, INPUT_SAMPLE_RATE));
                true
            }
            None => false,
        }
    }

    /// Report a device failure after the stream started
    pub fn fail_stream(&self, error: CaptureError) {
        let state = self.state.lock().unwrap();
        if let Some(callbacks) = state.callbacks.as_ref() {
            (callbacks.on_error)(error);
        }
    }
}

impl CaptureSource for FakeCapture {
    fn start(&mut self, callbacks: CaptureCallbacks) -> Result<(), CaptureError> {
        let mut state = self.state.lock().unwrap();
        if state.callbacks.is_some() {
            return Ok(());
        }
        if let Some(err) = state.fail_with.clone() {
            return Err(err);
        }
        state.starts += 1;
        state.callbacks = Some(callbacks);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.callbacks.take().is_some() {
            state.stops += 1;
        }
    }

    fn is_active(&self) -> bool {
        self.mic_active()
    }
}

// ============================================================================
// Manual-clock speaker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub handle: BufferHandle,
    pub start: f64,
    pub end: f64,
}

#[derive(Default)]
struct OutputState {
    clock: f64,
    open: bool,
    completions: Option<CompletionSender>,
    playing: Vec<Scheduled>,
    history: Vec<Scheduled>,
    stopped: Vec<BufferHandle>,
    opens: usize,
    closes: usize,
    /// How long `open` blocks, like a device that is slow to come up
    open_delay: Duration,
    open_started: bool,
}

#[derive(Clone, Default)]
pub struct ManualOutput {
    state: Arc<Mutex<OutputState>>,
}

impl ManualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// A speaker whose `open` blocks the calling thread for `delay`
    pub fn slow_to_open(delay: Duration) -> Self {
        let output = Self::default();
        output.state.lock().unwrap().open_delay = delay;
        output
    }

    /// Move the clock forward, reporting every buffer that finished
    pub fn advance(&self, secs: f64) {
        let mut state = self.state.lock().unwrap();
        state.clock += secs;
        let now = state.clock;

        let (done, still): (Vec<_>, Vec<_>) =
            state.playing.drain(..).partition(|s| s.end <= now + 1e-9);
        state.playing = still;

        if let Some(tx) = state.completions.as_ref() {
            for s in done {
                let _ = tx.send(s.handle);
            }
        }
    }

    pub fn clock(&self) -> f64 {
        self.state.lock().unwrap().clock
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    /// True once `open` has been entered, even if it has not returned yet
    pub fn open_started(&self) -> bool {
        self.state.lock().unwrap().open_started
    }

    /// Every buffer ever scheduled, in order
    pub fn history(&self) -> Vec<Scheduled> {
        self.state.lock().unwrap().history.clone()
    }

    pub fn playing(&self) -> usize {
        self.state.lock().unwrap().playing.len()
    }

    pub fn stopped(&self) -> usize {
        self.state.lock().unwrap().stopped.len()
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

impl AudioOutput for ManualOutput {
    fn open(&mut self, completions: CompletionSender) -> Result<(), PlaybackError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.open_started = true;
            state.open_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock().unwrap();
        state.open = true;
        state.opens += 1;
        state.completions = Some(completions);
        Ok(())
    }

    fn now(&self) -> f64 {
        self.clock()
    }

    fn play_at(
        &mut self,
        handle: BufferHandle,
        buffer: &PlaybackBuffer,
        start_time: f64,
    ) -> Result<(), PlaybackError> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(PlaybackError::NotOpen);
        }
        let scheduled = Scheduled {
            handle,
            start: start_time,
            end: start_time + buffer.duration(),
        };
        state.playing.push(scheduled);
        state.history.push(scheduled);
        Ok(())
    }

    fn stop(&mut self, handle: BufferHandle) {
        let mut state = self.state.lock().unwrap();
        state.playing.retain(|s| s.handle != handle);
        state.stopped.push(handle);
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.open {
            state.closes += 1;
        }
        state.open = false;
        state.playing.clear();
        state.completions = None;
    }
}
