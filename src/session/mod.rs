//! Conversation session: the orchestrating actor
//!
//! One task owns everything mutable (state, playback scheduler, transcripts,
//! connection). Everything else talks to it through channels:
//!
//! ```text
//! ConversationHandle ──commands──▶ ┐
//! capture / connect / stream ──▶   ├─▶ actor ──▶ watch<SessionSnapshot>
//! speaker completions ─────────▶   ┘
//! ```
//!
//! The microphone callback never enters the actor: it encodes each frame and
//! pushes it onto the outbound queue.

pub mod transcript;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::capture::{CaptureCallbacks, CaptureError, CaptureSource};
use crate::audio::codec::{self, OUTPUT_CHANNELS};
use crate::audio::output::{AudioOutput, CompletionSender, PlaybackError};
use crate::playback::{BufferHandle, PlaybackScheduler};
use crate::state_machine::{reduce, ConversationState, Effect, Event, State};
use crate::streaming::{
    outbound_queue, ConnectConfig, ConnectTimeouts, EngineEndpoint, FrameSender, InboundEvent,
    OutboundQueue, Speaker, StreamEvent, StreamingError, StreamingSessionClient, VoiceId,
    DEFAULT_MODEL,
};
use transcript::{Transcripts, DEFAULT_MAX_CHARS};

/// Why a conversation ended up in the error state.
///
/// `Display` is the explanation shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum SessionError {
    #[error("could not start: microphone permission denied")]
    PermissionDenied,
    #[error("could not start: no usable audio device ({0})")]
    DeviceUnavailable(String),
    #[error("could not connect to the concierge: {0}")]
    ConnectionFailed(String),
    #[error("conversation interrupted: {0}")]
    StreamError(String),
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied => SessionError::PermissionDenied,
            CaptureError::DeviceUnavailable(msg) | CaptureError::StreamFailed(msg) => {
                SessionError::DeviceUnavailable(msg)
            }
            CaptureError::Cancelled => {
                SessionError::DeviceUnavailable("capture start cancelled".to_string())
            }
        }
    }
}

/// Runtime knobs fixed for the lifetime of a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub model: String,
    pub transcript_max_chars: usize,
    pub timeouts: ConnectTimeouts,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            transcript_max_chars: DEFAULT_MAX_CHARS,
            timeouts: ConnectTimeouts::default(),
        }
    }
}

/// Supplied by the caller at `start()`
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationConfig {
    pub persona: String,
    pub voice: VoiceId,
    /// Facts the assistant may reference, assembled elsewhere
    pub context: String,
}

impl ConversationConfig {
    pub fn new(persona: impl Into<String>, voice: VoiceId, context: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            voice,
            context: context.into(),
        }
    }
}

/// Everything an observer can see about the conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: ConversationState,
    pub user_text: String,
    pub model_text: String,
    pub active_buffers: usize,
    pub next_start_time: f64,
    /// Microphone frames handed to the connection
    pub frames_sent: u64,
    /// Inbound audio chunks discarded as malformed
    pub decode_errors: u64,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: ConversationState::Idle,
            user_text: String::new(),
            model_text: String::new(),
            active_buffers: 0,
            next_start_time: 0.0,
            frames_sent: 0,
            decode_errors: 0,
        }
    }
}

enum Command {
    Start(ConversationConfig),
    Reset,
    Close(oneshot::Sender<()>),
}

/// Messages produced by the session's own tasks and callbacks
enum Internal {
    CaptureStarted {
        id: Uuid,
        result: Result<(), CaptureError>,
    },
    CaptureFailed {
        id: Uuid,
        error: CaptureError,
    },
    Connected {
        id: Uuid,
        client: StreamingSessionClient,
    },
    ConnectFailed {
        id: Uuid,
        error: StreamingError,
    },
    Stream {
        id: Uuid,
        event: StreamEvent,
    },
}

/// The microphone, shared with the blocking start/stop tasks
struct CaptureSlot {
    source: Box<dyn CaptureSource>,
    /// Attempt allowed to start capture; cleared by teardown
    armed_for: Option<Uuid>,
}

/// Opening and closing the speaker block on its stream thread, so those two
/// calls run on the blocking pool; everything else locks briefly in place.
type SharedScheduler = Arc<Mutex<PlaybackScheduler<Box<dyn AudioOutput>>>>;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct ConversationHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    frames_sent: Arc<AtomicU64>,
}

impl ConversationHandle {
    /// Begin a conversation. Ignored unless the session is idle.
    pub fn start(&self, config: ConversationConfig) {
        if self.commands.send(Command::Start(config)).is_err() {
            log::debug!("start() on a closed session ignored");
        }
    }

    /// Stop the current conversation (or clear an error) and go back to idle
    pub fn reset(&self) {
        let _ = self.commands.send(Command::Reset);
    }

    /// Close the session and wait for teardown. Safe to call any number of
    /// times, from any clone, concurrently.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Close(ack_tx)).is_err() {
            return;
        }
        // A dropped ack means another close finished first
        let _ = ack_rx.await;
    }

    pub fn state(&self) -> ConversationState {
        self.snapshots.borrow().state.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = self.snapshots.borrow().clone();
        snapshot.frames_sent = self.frames_sent.load(Ordering::Relaxed);
        snapshot
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`
    pub async fn wait_for<F>(&self, predicate: F, limit: Duration) -> Option<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let mut snapshot = match tokio::time::timeout(limit, rx.wait_for(predicate)).await {
            Ok(Ok(snapshot)) => snapshot.clone(),
            _ => return None,
        };
        snapshot.frames_sent = self.frames_sent.load(Ordering::Relaxed);
        Some(snapshot)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Entry point for creating sessions
pub struct ConversationSession;

impl ConversationSession {
    /// Spawn the session actor on the current tokio runtime
    pub fn spawn(
        settings: SessionSettings,
        endpoint: EngineEndpoint,
        capture: Box<dyn CaptureSource>,
        output: Box<dyn AudioOutput>,
    ) -> ConversationHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let frames_sent = Arc::new(AtomicU64::new(0));

        let actor = SessionActor {
            transcripts: Transcripts::new(settings.transcript_max_chars),
            settings,
            endpoint,
            state: State::default(),
            scheduler: Arc::new(Mutex::new(PlaybackScheduler::new(output))),
            capture: Arc::new(Mutex::new(CaptureSlot {
                source: capture,
                armed_for: None,
            })),
            config: None,
            client: None,
            pending_queue: None,
            connect_task: None,
            attempt_live: false,
            internal_tx,
            completions_tx,
            snapshot_tx,
            frames_sent: frames_sent.clone(),
            decode_errors: 0,
        };

        tokio::spawn(actor.run(command_rx, internal_rx, completions_rx));

        ConversationHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            frames_sent,
        }
    }
}

struct SessionActor {
    settings: SessionSettings,
    endpoint: EngineEndpoint,
    state: State,
    scheduler: SharedScheduler,
    capture: Arc<Mutex<CaptureSlot>>,
    transcripts: Transcripts,
    config: Option<ConversationConfig>,
    client: Option<StreamingSessionClient>,
    /// Queue filled by capture until the connection takes it over
    pending_queue: Option<OutboundQueue>,
    connect_task: Option<JoinHandle<()>>,
    /// Devices or connection may be held for the current attempt
    attempt_live: bool,
    internal_tx: mpsc::UnboundedSender<Internal>,
    completions_tx: CompletionSender,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    frames_sent: Arc<AtomicU64>,
    decode_errors: u64,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut completions: mpsc::UnboundedReceiver<BufferHandle>,
    ) {
        log::info!("Conversation session started");

        loop {
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(Command::Start(config)) => {
                        if matches!(self.state, State::Idle) {
                            self.config = Some(config);
                        }
                        self.dispatch(Event::Start).await;
                    }
                    Some(Command::Reset) => self.dispatch(Event::Reset).await,
                    Some(Command::Close(ack)) => {
                        self.dispatch(Event::Close).await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        log::info!("All handles dropped, closing session");
                        self.dispatch(Event::Close).await;
                        break;
                    }
                },
                Some(msg) = internal.recv() => self.handle_internal(msg).await,
                Some(handle) = completions.recv() => self.on_playback_finished(handle).await,
            }
            self.refresh();
        }

        // Refuse new commands; queued close() acks are released when the
        // mailbox is dropped below
        commands.close();
        log::info!("Conversation session ended");
    }

    async fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            log::debug!("Received event: {:?}", event);

            let old_discriminant = std::mem::discriminant(&self.state);
            let (next, effects) = reduce(&self.state, event);
            let new_discriminant = std::mem::discriminant(&next);

            if old_discriminant != new_discriminant {
                log::info!("State transition: {:?} -> {:?}", self.state, next);
            }

            self.state = next;

            for effect in effects {
                self.run_effect(effect, &mut queue).await;
            }
        }
    }

    async fn run_effect(&mut self, effect: Effect, queue: &mut VecDeque<Event>) {
        match effect {
            Effect::AcquireDevices { id } => self.acquire_devices(id, queue).await,
            Effect::OpenConnection { id } => self.open_connection(id, queue),
            Effect::ResetTimeline => lock(&self.scheduler).reset_timeline(),
            Effect::StopPlayback => {
                lock(&self.scheduler).interrupt();
            }
            Effect::DiscardModelTranscript => self.transcripts.discard_model(),
            Effect::Teardown => self.teardown().await,
            Effect::EmitState => self.publish(),
        }
    }

    /// Open the speaker, then start the microphone off the actor
    async fn acquire_devices(&mut self, id: Uuid, queue: &mut VecDeque<Event>) {
        self.attempt_live = true;
        self.transcripts.clear();

        let scheduler = self.scheduler.clone();
        let completions = self.completions_tx.clone();
        let opened = tokio::task::spawn_blocking(move || lock(&scheduler).open(completions))
            .await
            .unwrap_or_else(|e| Err(PlaybackError::StreamFailed(e.to_string())));

        if let Err(e) = opened {
            log::error!("Failed to open audio output: {}", e);
            queue.push_back(Event::OutputFailed {
                id,
                message: e.to_string(),
            });
            return;
        }

        let (sender, outbound) = outbound_queue();
        self.pending_queue = Some(outbound);

        let callbacks = self.capture_callbacks(id, sender);
        let slot = self.capture.clone();
        let tx = self.internal_tx.clone();
        lock(&slot).armed_for = Some(id);

        tokio::task::spawn_blocking(move || {
            let result = {
                let mut slot = lock(&slot);
                if slot.armed_for == Some(id) {
                    slot.source.start(callbacks)
                } else {
                    Err(CaptureError::Cancelled)
                }
            };
            let _ = tx.send(Internal::CaptureStarted { id, result });
        });
    }

    fn capture_callbacks(&self, id: Uuid, sender: FrameSender) -> CaptureCallbacks {
        let frames_sent = self.frames_sent.clone();
        let errors = self.internal_tx.clone();

        CaptureCallbacks::new(
            move |frame| {
                if sender.send(codec::encode(&frame)) {
                    frames_sent.fetch_add(1, Ordering::Relaxed);
                }
            },
            move |error| {
                let _ = errors.send(Internal::CaptureFailed { id, error });
            },
        )
    }

    fn open_connection(&mut self, id: Uuid, queue: &mut VecDeque<Event>) {
        let (Some(outbound), Some(config)) = (self.pending_queue.take(), self.config.as_ref())
        else {
            queue.push_back(Event::ConnectFailed {
                id,
                message: "session was not prepared".to_string(),
            });
            return;
        };

        let connect_config = ConnectConfig::new(
            self.settings.model.clone(),
            config.persona.clone(),
            config.context.clone(),
            config.voice,
        );
        let endpoint = self.endpoint.clone();
        let timeouts = self.settings.timeouts;
        let tx = self.internal_tx.clone();

        self.connect_task = Some(tokio::spawn(async move {
            let msg =
                match StreamingSessionClient::connect(&endpoint, &connect_config, outbound, timeouts)
                    .await
                {
                    Ok(client) => Internal::Connected { id, client },
                    Err(error) => Internal::ConnectFailed { id, error },
                };
            // If the actor is gone the client is dropped, which closes it
            let _ = tx.send(msg);
        }));
    }

    /// Release microphone, speaker and connection, in that order
    async fn teardown(&mut self) {
        if !self.attempt_live {
            return;
        }
        self.attempt_live = false;
        log::info!("Tearing down conversation resources");

        if let Some(task) = self.connect_task.take() {
            task.abort();
        }

        let slot = self.capture.clone();
        let stopped = tokio::task::spawn_blocking(move || {
            let mut slot = lock(&slot);
            slot.armed_for = None;
            slot.source.stop();
        })
        .await;
        if let Err(e) = stopped {
            log::error!("Microphone stop task failed: {}", e);
        }

        if let Some(mut outbound) = self.pending_queue.take() {
            outbound.close();
        }

        let scheduler = self.scheduler.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || lock(&scheduler).close()).await {
            log::error!("Speaker close task failed: {}", e);
        }

        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::CaptureStarted { id, result } => match result {
                Ok(()) => self.dispatch(Event::CaptureReady { id }).await,
                Err(error) => {
                    log::warn!("Microphone start failed: {}", error);
                    self.dispatch(Event::CaptureFailed { id, error }).await
                }
            },
            Internal::CaptureFailed { id, error } => {
                self.dispatch(Event::StreamFailed {
                    id,
                    message: format!("microphone: {}", error),
                })
                .await
            }
            Internal::Connected { id, mut client } => {
                if self.state.session_id() != Some(id) || !self.attempt_live {
                    log::debug!("Discarding connection for a stale attempt");
                    client.close();
                    return;
                }
                self.connect_task = None;

                let tx = self.internal_tx.clone();
                client.on_event(move |event| {
                    let _ = tx.send(Internal::Stream { id, event });
                });
                self.client = Some(client);
                self.dispatch(Event::Connected { id }).await;
            }
            Internal::ConnectFailed { id, error } => {
                log::error!("Connection failed: {}", error);
                self.connect_task = None;
                self.dispatch(Event::ConnectFailed {
                    id,
                    message: error.to_string(),
                })
                .await
            }
            Internal::Stream { id, event } => {
                if self.state.session_id() != Some(id) {
                    return;
                }
                match event {
                    StreamEvent::Inbound(inbound) => self.handle_inbound(id, inbound).await,
                    StreamEvent::Error(error) => {
                        self.dispatch(Event::StreamFailed {
                            id,
                            message: error.to_string(),
                        })
                        .await
                    }
                    StreamEvent::Closed => {
                        self.dispatch(Event::StreamFailed {
                            id,
                            message: StreamingError::Disconnected(
                                "connection closed by the engine".to_string(),
                            )
                            .to_string(),
                        })
                        .await
                    }
                }
            }
        }
    }

    async fn handle_inbound(&mut self, id: Uuid, event: InboundEvent) {
        if !matches!(self.state, State::Listening { .. } | State::Speaking { .. }) {
            log::debug!("Ignoring inbound event outside a conversation");
            return;
        }

        match event {
            InboundEvent::AudioChunk { data, sample_rate } => {
                let buffer = match codec::decode(&data, sample_rate, OUTPUT_CHANNELS) {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        self.decode_errors += 1;
                        log::warn!("Discarding malformed audio chunk: {}", e);
                        return;
                    }
                };
                if buffer.is_empty() {
                    return;
                }

                let scheduled = lock(&self.scheduler).schedule(buffer);
                match scheduled {
                    Ok(_) => self.dispatch(Event::ModelOutput { id }).await,
                    Err(e) => {
                        self.dispatch(Event::OutputFailed {
                            id,
                            message: e.to_string(),
                        })
                        .await
                    }
                }
            }
            InboundEvent::TranscriptDelta { speaker, text } => {
                self.transcripts.append(speaker, &text);
                if speaker == Speaker::Model && !text.is_empty() {
                    self.dispatch(Event::ModelOutput { id }).await;
                }
            }
            InboundEvent::Interrupted => {
                log::info!("Barge-in: interrupting playback");
                self.dispatch(Event::Interrupted { id }).await;
            }
            InboundEvent::TurnComplete => {
                log::debug!("Turn complete");
                self.transcripts.end_model_turn();
                let idle = lock(&self.scheduler).is_idle();
                if idle {
                    self.dispatch(Event::PlaybackDrained { id }).await;
                }
            }
        }
    }

    async fn on_playback_finished(&mut self, handle: BufferHandle) {
        let idle = {
            let mut scheduler = lock(&self.scheduler);
            if !scheduler.on_finished(handle) {
                return;
            }
            scheduler.is_idle()
        };
        if idle {
            if let Some(id) = self.state.session_id() {
                self.dispatch(Event::PlaybackDrained { id }).await;
            }
        }
    }

    fn build_snapshot(&self) -> SessionSnapshot {
        let scheduler = lock(&self.scheduler);
        SessionSnapshot {
            state: self.state.public(),
            user_text: self.transcripts.user.text().to_string(),
            model_text: self.transcripts.model.text().to_string(),
            active_buffers: scheduler.active_count(),
            next_start_time: scheduler.next_start_time(),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            decode_errors: self.decode_errors,
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.build_snapshot());
    }

    /// Publish only if something other than the frame counter changed
    fn refresh(&self) {
        let next = self.build_snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            let mut comparable = next.clone();
            comparable.frames_sent = current.frames_sent;
            if *current == comparable {
                return false;
            }
            *current = next;
            true
        });
    }
}

impl Drop for SessionActor {
    fn drop(&mut self) {
        // Runtime shutdown can drop the actor mid-flight; never leave the mic open
        if self.attempt_live {
            let mut slot = lock(&self.capture);
            slot.armed_for = None;
            slot.source.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_messages() {
        assert_eq!(
            SessionError::PermissionDenied.to_string(),
            "could not start: microphone permission denied"
        );
        assert!(SessionError::ConnectionFailed("refused".into())
            .to_string()
            .contains("refused"));
    }

    #[test]
    fn test_capture_error_mapping() {
        assert_eq!(
            SessionError::from(CaptureError::PermissionDenied),
            SessionError::PermissionDenied
        );
        assert!(matches!(
            SessionError::from(CaptureError::DeviceUnavailable("none".into())),
            SessionError::DeviceUnavailable(m) if m == "none"
        ));
    }

    #[test]
    fn test_snapshot_serialization() {
        let json = serde_json::to_value(SessionSnapshot::default()).unwrap();
        assert_eq!(json["state"]["status"], "idle");
        assert_eq!(json["activeBuffers"], 0);
        assert_eq!(json["userText"], "");
    }
}
