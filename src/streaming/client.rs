//! Conversational engine WebSocket client
//!
//! # Connection Flow
//!
//! 1. `outbound_queue()` - create the frame queue before connecting, so
//!    capture can start pushing frames during the handshake
//! 2. `connect()` - open the socket, send setup, wait for `setupComplete`
//! 3. `send()` / `FrameSender::send()` - enqueue frames (never blocks)
//! 4. `on_event()` - inbound events, in arrival order, from one task
//! 5. `close()` - idempotent shutdown
//!
//! There is no retry: a failed connect or a dropped stream is reported to
//! the owner, which decides whether to start over.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientMessage, ConnectConfig, ErrorInfo, ServerMessage};
use super::{StreamEvent, StreamingError};
use crate::audio::codec::EncodedFrame;

/// Connection timeout for the initial WebSocket handshake
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the `setupComplete` acknowledgement
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for the close frame to go out
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where the engine lives and how to authenticate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEndpoint {
    pub url: String,
    pub api_key: Option<String>,
}

impl EngineEndpoint {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            api_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectTimeouts {
    pub connect: Duration,
    pub setup: Duration,
}

impl Default for ConnectTimeouts {
    fn default() -> Self {
        Self {
            connect: CONNECTION_TIMEOUT,
            setup: SETUP_TIMEOUT,
        }
    }
}

/// Cloneable, non-blocking producer side of the outbound queue.
///
/// Safe to call from the audio callback: `send` only pushes onto an
/// unbounded channel and checks an atomic flag.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<EncodedFrame>,
    accepting: Arc<AtomicBool>,
}

impl FrameSender {
    /// Queue a frame. Returns false once the connection is closed.
    pub fn send(&self, frame: EncodedFrame) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(frame).is_ok()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

/// Consumer side of the outbound queue, handed to `connect`
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<EncodedFrame>,
    sender: FrameSender,
}

impl OutboundQueue {
    /// Another producer for this queue
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Stop accepting frames and drop whatever is queued
    pub fn close(&mut self) {
        self.sender.accepting.store(false, Ordering::Release);
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

/// Create a FIFO frame queue
pub fn outbound_queue() -> (FrameSender, OutboundQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = FrameSender {
        tx,
        accepting: Arc::new(AtomicBool::new(true)),
    };
    (sender.clone(), OutboundQueue { rx, sender })
}

/// Handle to a configured engine session
pub struct StreamingSessionClient {
    session_id: Option<String>,
    sender: FrameSender,
    events_rx: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    /// Set by `close()`; late events are discarded once set
    closed: Arc<AtomicBool>,
    frames_sent: Arc<AtomicU64>,
    cancel: CancellationToken,
    writer_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
}

impl StreamingSessionClient {
    /// Connect to the engine and complete the setup handshake.
    ///
    /// A single attempt: connection and setup each have their own timeout.
    /// Frames already waiting in `queue` are sent, in order, after setup.
    pub async fn connect(
        endpoint: &EngineEndpoint,
        config: &ConnectConfig,
        mut queue: OutboundQueue,
        timeouts: ConnectTimeouts,
    ) -> Result<Self, StreamingError> {
        let result = Self::handshake(endpoint, config, timeouts).await;
        let (write, read, session_id) = match result {
            Ok(parts) => parts,
            Err(e) => {
                queue.close();
                return Err(e);
            }
        };

        let sender = queue.sender();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let frames_sent = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        let writer_task = tokio::spawn(run_writer(
            write,
            queue,
            events_tx.clone(),
            closed.clone(),
            frames_sent.clone(),
            cancel.clone(),
        ));
        let reader_task = tokio::spawn(run_reader(
            read,
            events_tx,
            closed.clone(),
            sender.accepting.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            session_id,
            sender,
            events_rx: Some(events_rx),
            closed,
            frames_sent,
            cancel,
            writer_task: Some(writer_task),
            reader_task: Some(reader_task),
        })
    }

    async fn handshake(
        endpoint: &EngineEndpoint,
        config: &ConnectConfig,
        timeouts: ConnectTimeouts,
    ) -> Result<(SplitSink<WsStream, Message>, SplitStream<WsStream>, Option<String>), StreamingError>
    {
        let mut request = endpoint
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamingError::InvalidEndpoint(e.to_string()))?;

        if let Some(key) = endpoint.api_key.as_deref() {
            request.headers_mut().insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {}", key))
                    .map_err(|e| StreamingError::AuthenticationFailed(e.to_string()))?,
            );
        }

        log::info!("Connecting to conversational engine at {}...", endpoint.url);

        let (ws_stream, _response) = timeout(timeouts.connect, connect_async(request))
            .await
            .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
            .map_err(map_connect_error)?;

        let (mut write, mut read) = ws_stream.split();

        log::info!("WebSocket connected, sending setup...");
        let setup = ClientMessage::Setup(config.clone());
        send_message(&mut write, &setup).await?;

        let session_id = timeout(timeouts.setup, async {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        return Err(StreamingError::Disconnected(format!(
                            "Connection closed before setup completed: {}",
                            reason
                        )));
                    }
                    Ok(msg) => {
                        let Some(text) = message_text(&msg) else {
                            continue;
                        };
                        match serde_json::from_str::<ServerMessage>(text) {
                            Ok(ServerMessage::SetupComplete { setup_complete }) => {
                                log::info!(
                                    "Session setup complete: {}",
                                    setup_complete.session_id.as_deref().unwrap_or("<unnamed>")
                                );
                                return Ok(setup_complete.session_id);
                            }
                            Ok(ServerMessage::Error { error }) => {
                                return Err(setup_rejection(error));
                            }
                            Ok(_) => {
                                log::debug!("Ignoring message while waiting for setupComplete");
                            }
                            Err(e) => {
                                log::warn!("Failed to parse message: {}", e);
                            }
                        }
                    }
                    Err(e) => return Err(StreamingError::ProtocolError(e.to_string())),
                }
            }
            Err(StreamingError::Disconnected("Stream ended".to_string()))
        })
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Session setup timeout".to_string()))??;

        Ok((write, read, session_id))
    }

    /// Queue a frame for transmission
    pub fn send(&self, frame: EncodedFrame) -> Result<(), StreamingError> {
        if self.is_closed() || !self.sender.send(frame) {
            return Err(StreamingError::Closed);
        }
        Ok(())
    }

    /// Producer handle for the capture callback
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Deliver events to `handler` one at a time, in arrival order.
    ///
    /// Returns `None` if the event stream was already taken.
    pub fn on_event<F>(&mut self, mut handler: F) -> Option<JoinHandle<()>>
    where
        F: FnMut(StreamEvent) + Send + 'static,
    {
        let mut rx = self.events_rx.take()?;
        let closed = self.closed.clone();
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if closed.load(Ordering::Acquire) {
                    break;
                }
                handler(event);
            }
        }))
    }

    /// Take the raw event receiver instead of registering a handler
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        self.events_rx.take()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Close the connection. Safe to call repeatedly or concurrently.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Closing engine connection");
        self.sender.accepting.store(false, Ordering::Release);
        self.cancel.cancel();
    }

    /// Close and wait for the background tasks to release the socket
    pub async fn shutdown(mut self) {
        self.close();
        for task in [self.writer_task.take(), self.reader_task.take()]
            .into_iter()
            .flatten()
        {
            if timeout(CLOSE_TIMEOUT * 2, task).await.is_err() {
                log::warn!("Connection task did not stop in time");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || !self.sender.is_accepting()
    }
}

impl Drop for StreamingSessionClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn map_connect_error(err: tokio_tungstenite::tungstenite::Error) -> StreamingError {
    use tokio_tungstenite::tungstenite::Error;
    match err {
        Error::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            StreamingError::AuthenticationFailed(format!("HTTP {}", response.status()))
        }
        other => StreamingError::ConnectionFailed(other.to_string()),
    }
}

/// Setup refusals only count as auth failures when the engine's code says so
fn setup_rejection(error: ErrorInfo) -> StreamingError {
    let code = error.code.as_deref().unwrap_or_default().to_ascii_lowercase();
    let is_auth = matches!(code.as_str(), "401" | "403")
        || ["auth", "permission", "api_key"]
            .iter()
            .any(|marker| code.contains(marker));
    log::warn!(
        "Engine rejected setup (code {}): {}",
        if code.is_empty() { "<none>" } else { code.as_str() },
        error.message
    );
    if is_auth {
        StreamingError::AuthenticationFailed(error.message)
    } else {
        StreamingError::ConnectionFailed(error.message)
    }
}

/// JSON payload of a data frame, if it carries one
fn message_text(msg: &Message) -> Option<&str> {
    match msg {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

async fn send_message(
    write: &mut SplitSink<WsStream, Message>,
    msg: &ClientMessage,
) -> Result<(), StreamingError> {
    let json =
        serde_json::to_string(msg).map_err(|e| StreamingError::ProtocolError(e.to_string()))?;

    write
        .send(Message::Text(json))
        .await
        .map_err(|e| StreamingError::SendFailed(e.to_string()))
}

async fn run_writer(
    mut write: SplitSink<WsStream, Message>,
    mut queue: OutboundQueue,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    closed: Arc<AtomicBool>,
    frames_sent: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = queue.rx.recv() => {
                let Some(frame) = frame else { break };
                let msg = ClientMessage::RealtimeInput(frame);
                if let Err(e) = send_message(&mut write, &msg).await {
                    if !closed.load(Ordering::Acquire) {
                        log::warn!("Outbound frame failed: {}", e);
                        let _ = events_tx.send(StreamEvent::Error(e));
                    }
                    cancel.cancel();
                    break;
                }
                let sent = frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
                if sent % 100 == 0 {
                    log::debug!("Sent {} audio frames", sent);
                }
            }
        }
    }

    queue.close();
    match timeout(CLOSE_TIMEOUT, write.close()).await {
        Ok(Err(e)) => log::debug!("Error closing WebSocket: {}", e),
        Err(_) => log::debug!("Timed out sending close frame"),
        Ok(Ok(())) => {}
    }
    log::debug!("Writer task exiting");
}

async fn run_reader(
    mut read: SplitStream<WsStream>,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    closed: Arc<AtomicBool>,
    accepting: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let deliver = |event: StreamEvent| {
        if closed.load(Ordering::Acquire) {
            return false;
        }
        events_tx.send(event).is_ok()
    };

    let failure = loop {
        let msg_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            next = read.next() => next,
        };

        match msg_result {
            Some(Ok(msg)) => {
                if let Message::Close(frame) = &msg {
                    let reason = frame
                        .as_ref()
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed by server".to_string());
                    log::info!("WebSocket closed by server: {}", reason);
                    break Some(StreamingError::Disconnected(reason));
                }
                let Some(text) = message_text(&msg) else {
                    continue;
                };
                match serde_json::from_str::<ServerMessage>(text) {
                    Ok(ServerMessage::Error { error }) => {
                        log::error!("Engine error: {}", error.message);
                        break Some(StreamingError::ProtocolError(error.message));
                    }
                    Ok(ServerMessage::Unknown(value)) => {
                        log::debug!("Ignoring unrecognised message: {}", value);
                    }
                    Ok(msg) => match msg.into_event() {
                        Ok(Some(event)) => {
                            if !deliver(StreamEvent::Inbound(event)) {
                                break None;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("Discarding malformed audio chunk: {}", e),
                    },
                    Err(e) => log::warn!("Failed to parse message: {}", e),
                }
            }
            Some(Err(e)) => {
                log::warn!("WebSocket error: {}", e);
                break Some(StreamingError::ProtocolError(e.to_string()));
            }
            None => break Some(StreamingError::Disconnected("Stream ended".to_string())),
        }
    };

    // Dead connection: stop the writer and refuse further frames
    accepting.store(false, Ordering::Release);
    cancel.cancel();

    if let Some(err) = failure {
        deliver(StreamEvent::Error(err));
    }
    deliver(StreamEvent::Closed);
    log::debug!("Reader task exiting");
}
