//! Conversation session controller
//!
//! One tokio task owns the session state, the audio engines and the channel
//! link. Callers talk to it through a cloneable [`SessionHandle`]; capture
//! chunks and channel messages are queued into the same task, so every
//! mutation happens in one place and in arrival order.
//!
//! `connect()` suspends on three steps (negotiation, channel open, device
//! open). A `disconnect()` issued meanwhile bumps a ticket the running step
//! is raced against: the step is dropped, whatever it opened is released and
//! the connect resolves to [`SessionError::Cancelled`].

mod inbound;

use inbound::TrackItems;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::audio::buffer::{CaptureChunk, SampleTap};
use crate::audio::capture::{AudioCaptureEngine, ChunkHandler, InputSource};
use crate::audio::device::DeviceRegistry;
use crate::audio::playback::{AudioPlaybackEngine, OutputSink};
use crate::channel::{ChannelConnector, ChannelLink, ChannelMessage, NegotiationRequest, SessionNegotiator};
use crate::config::AppConfig;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::conversation::{ConversationItem, RecentIds, Transcript};
use crate::error::{ChannelError, SessionError};
use crate::protocol::{OutboundEvent, SessionSettings, WireItem};
use crate::tracks::{PlaybackStats, TrackOffset};

/// Lifecycle of a conversation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Recording,
    Paused,
    Disconnecting,
    Disconnected,
    Errored,
}

impl SessionState {
    /// The channel is open and usable
    pub fn is_connected(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Recording | SessionState::Paused)
    }

    pub fn is_recording(self) -> bool {
        self == SessionState::Recording
    }
}

/// Notifications fanned out to observers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    ItemUpdated(String),
    ItemRemoved(String),
    /// Non-blocking, user-visible message
    Notice(String),
}

/// Collaborators the controller drives
pub struct SessionDeps {
    pub negotiator: Arc<dyn SessionNegotiator>,
    pub connector: Arc<dyn ChannelConnector>,
    pub input: Arc<dyn InputSource>,
    pub output: Arc<dyn OutputSink>,
    /// Source of the selected input device; platform default when absent
    pub registry: Option<Arc<DeviceRegistry>>,
    pub capture_tap: Option<SampleTap>,
    pub playback_tap: Option<SampleTap>,
}

enum Command {
    Connect {
        agent_id: String,
        ticket: u64,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<bool>,
    },
    Pause {
        reply: oneshot::Sender<bool>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SendText {
        text: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    DeleteItem {
        id: String,
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    TrackOffset {
        reply: oneshot::Sender<Option<TrackOffset>>,
    },
    Stats {
        reply: oneshot::Sender<Option<PlaybackStats>>,
    },
}

/// State readable without a round trip through the control task
struct Shared {
    state: RwLock<SessionState>,
    transcript: RwLock<Transcript>,
    last_notice: RwLock<Option<String>>,
    events: broadcast::Sender<SessionEvent>,
    /// Last ticket handed to a connect call
    connect_tickets: AtomicU64,
    /// Connects with a ticket at or below this value are cancelled
    disconnects: watch::Sender<u64>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Cloneable front end of the session controller
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl SessionHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::ControllerGone)?;
        rx.await.map_err(|_| SessionError::ControllerGone)
    }

    /// Negotiate, open the channel and start streaming the microphone
    pub async fn connect(&self, agent_id: &str) -> Result<(), SessionError> {
        let ticket = self.shared.connect_tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let agent_id = agent_id.to_string();
        self.request(|reply| Command::Connect {
            agent_id,
            ticket,
            reply,
        })
        .await?
    }

    /// Cancel any connect issued so far and queue the teardown
    ///
    /// Takes effect on in-flight connect steps immediately, without waiting
    /// for the returned receiver.
    pub fn request_disconnect(&self) -> oneshot::Receiver<bool> {
        let latest = self.shared.connect_tickets.load(Ordering::SeqCst);
        self.shared.disconnects.send_modify(|cancelled| *cancelled = (*cancelled).max(latest));

        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).is_err() {
            tracing::debug!("Disconnect requested after controller shutdown");
        }
        rx
    }

    /// Tear the session down from any state; false only if the controller
    /// is gone
    pub async fn disconnect(&self) -> bool {
        self.request_disconnect().await.unwrap_or(false)
    }

    /// Stop sending microphone audio, keeping the session; false when not
    /// recording
    pub async fn pause(&self) -> bool {
        self.request(|reply| Command::Pause { reply }).await.unwrap_or(false)
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Resume { reply }).await?
    }

    /// Send a user text turn and ask for a response
    pub async fn send_text_message(&self, text: &str) -> Result<(), SessionError> {
        let text = text.to_string();
        self.request(|reply| Command::SendText { text, reply }).await?
    }

    /// Remove an item locally and ask the backend to delete it; true if the
    /// item was present locally
    pub async fn delete_item(&self, id: &str) -> Result<bool, SessionError> {
        let id = id.to_string();
        self.request(|reply| Command::DeleteItem { id, reply }).await?
    }

    /// Progress of the audible track, without interrupting it
    pub async fn active_track_offset(&self) -> Option<TrackOffset> {
        self.request(|reply| Command::TrackOffset { reply }).await.ok().flatten()
    }

    pub async fn playback_stats(&self) -> Option<PlaybackStats> {
        self.request(|reply| Command::Stats { reply }).await.ok().flatten()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_recording(&self) -> bool {
        self.state().is_recording()
    }

    /// Snapshot of the transcript in conversation order
    pub fn items(&self) -> Vec<ConversationItem> {
        self.shared.transcript.read().items().to_vec()
    }

    pub fn item(&self, id: &str) -> Option<ConversationItem> {
        self.shared.transcript.read().get(id).cloned()
    }

    pub fn last_notice(&self) -> Option<String> {
        self.shared.last_notice.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }
}

/// What woke the control loop
enum Wake {
    Command(Option<Command>),
    Channel(Option<ChannelMessage>),
    Chunk(u64, CaptureChunk),
    Tick,
}

/// Owner of the session; runs as a single task
pub struct SessionController {
    config: AppConfig,
    deps: SessionDeps,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    chunks_tx: mpsc::UnboundedSender<(u64, CaptureChunk)>,
    chunks_rx: mpsc::UnboundedReceiver<(u64, CaptureChunk)>,
    /// Bumped whenever capture is (re)opened or released; older chunks are
    /// discarded
    generation: u64,
    link: Option<ChannelLink>,
    playback: Option<AudioPlaybackEngine>,
    capture: Option<AudioCaptureEngine>,
    recent: RecentIds,
    /// Playback track id to the item it voices
    track_items: TrackItems,
}

impl SessionController {
    /// Start the control task and return its handle
    pub fn spawn(config: &AppConfig, deps: SessionDeps) -> SessionHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (chunks_tx, chunks_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (disconnects, _) = watch::channel(0);

        let shared = Arc::new(Shared {
            state: RwLock::new(SessionState::Idle),
            transcript: RwLock::new(Transcript::new()),
            last_notice: RwLock::new(None),
            events,
            connect_tickets: AtomicU64::new(0),
            disconnects,
        });

        let controller = SessionController {
            config: config.clone(),
            deps,
            shared: shared.clone(),
            commands,
            chunks_tx,
            chunks_rx,
            generation: 0,
            link: None,
            playback: None,
            capture: None,
            recent: RecentIds::new(config.channel.dedup_window),
            track_items: TrackItems::default(),
        };
        tokio::spawn(controller.run());

        SessionHandle {
            commands: commands_tx,
            shared,
        }
    }

    async fn run(mut self) {
        let mut health = tokio::time::interval(Duration::from_millis(500));
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                message = next_message(&mut self.link) => Wake::Channel(message),
                Some((generation, chunk)) = self.chunks_rx.recv() => Wake::Chunk(generation, chunk),
                _ = health.tick() => Wake::Tick,
            };

            match wake {
                Wake::Command(None) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Channel(Some(ChannelMessage::Event(message))) => self.handle_inbound(message),
                Wake::Channel(Some(ChannelMessage::Malformed(err))) => {
                    tracing::warn!("Skipping malformed event: {}", err);
                }
                Wake::Channel(Some(ChannelMessage::Fatal(err))) => self.fail(err),
                Wake::Channel(None) => self.fail(ChannelError::Fatal("channel reader stopped".to_string())),
                Wake::Chunk(generation, chunk) => self.forward_chunk(generation, chunk),
                Wake::Tick => self.check_devices(),
            }
        }

        self.release();
        tracing::debug!("Session controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                agent_id,
                ticket,
                reply,
            } => {
                let result = self.connect(&agent_id, ticket).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(self.disconnect());
            }
            Command::Pause { reply } => {
                let _ = reply.send(self.pause());
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.resume());
            }
            Command::SendText { text, reply } => {
                let _ = reply.send(self.send_text(text));
            }
            Command::DeleteItem { id, reply } => {
                let _ = reply.send(self.delete_item(&id));
            }
            Command::TrackOffset { reply } => {
                let offset = self
                    .playback
                    .as_ref()
                    .and_then(|playback| playback.active_track_offset().ok().flatten());
                let _ = reply.send(offset);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.playback.as_ref().map(|playback| playback.stats()));
            }
        }
    }

    fn state(&self) -> SessionState {
        *self.shared.state.read()
    }

    fn set_state(&self, state: SessionState) {
        let previous = std::mem::replace(&mut *self.shared.state.write(), state);
        if previous != state {
            tracing::info!("Session state: {:?} -> {:?}", previous, state);
            self.shared.emit(SessionEvent::StateChanged(state));
        }
    }

    fn notice(&self, message: String) {
        *self.shared.last_notice.write() = Some(message.clone());
        self.shared.emit(SessionEvent::Notice(message));
    }

    fn cancelled(&self, ticket: u64) -> bool {
        *self.shared.disconnects.borrow() >= ticket
    }

    async fn connect(&mut self, agent_id: &str, ticket: u64) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Idle {
            tracing::warn!("Connect ignored in state {:?}", state);
            return Err(SessionError::AlreadyConnected);
        }
        if self.cancelled(ticket) {
            return Err(SessionError::Cancelled);
        }

        self.set_state(SessionState::Connecting);
        match self.establish(agent_id, ticket).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!("Connect to {} aborted: {}", agent_id, err);
                self.release();
                self.set_state(SessionState::Idle);
                if err != SessionError::Cancelled {
                    self.notice(format!("Connection failed: {}", err));
                }
                Err(err)
            }
        }
    }

    async fn establish(&mut self, agent_id: &str, ticket: u64) -> Result<(), SessionError> {
        let request = NegotiationRequest {
            agent_id: agent_id.to_string(),
            distance_threshold: self.config.session.distance_threshold,
            limit: self.config.session.limit,
        };
        let negotiator = self.deps.negotiator.clone();
        let credential = guard(self.shared.disconnects.subscribe(), ticket, async move {
            negotiator.negotiate(&request).await
        })
        .await??;

        let connector = self.deps.connector.clone();
        let link = guard(self.shared.disconnects.subscribe(), ticket, async move {
            connector.open(&credential).await
        })
        .await??;
        link.send(OutboundEvent::SessionUpdate {
            session: SessionSettings::from_config(&self.config.channel),
        })?;
        self.link = Some(link);
        self.recent.clear();
        self.set_state(SessionState::Connected);

        self.generation += 1;
        let generation = self.generation;
        let chunks = self.chunks_tx.clone();
        let handler: ChunkHandler = Arc::new(move |chunk| {
            let _ = chunks.send((generation, chunk));
        });
        let opener = DeviceOpener {
            config: self.config.clone(),
            input: self.deps.input.clone(),
            output: self.deps.output.clone(),
            registry: self.deps.registry.clone(),
            capture_tap: self.deps.capture_tap.clone(),
            playback_tap: self.deps.playback_tap.clone(),
        };
        let opened = guard(self.shared.disconnects.subscribe(), ticket, async move {
            tokio::task::spawn_blocking(move || opener.open(handler)).await
        })
        .await?
            .map_err(|e| SessionError::DeviceUnavailable(format!("device open task failed: {}", e)))?;
        let (playback, capture) = opened?;
        self.playback = Some(playback);
        self.capture = Some(capture);

        if self.cancelled(ticket) {
            return Err(SessionError::Cancelled);
        }
        self.set_state(SessionState::Recording);
        Ok(())
    }

    fn disconnect(&mut self) -> bool {
        if self.state() == SessionState::Idle {
            tracing::debug!("Disconnect while idle");
            return true;
        }

        self.set_state(SessionState::Disconnecting);
        self.release();
        self.shared.transcript.write().clear();
        self.set_state(SessionState::Disconnected);
        self.set_state(SessionState::Idle);
        true
    }

    /// Release engines and channel; safe to call repeatedly
    fn release(&mut self) {
        self.generation += 1;
        if let Some(mut capture) = self.capture.take() {
            capture.end();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.disconnect();
        }
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.recent.clear();
        self.track_items.clear();
    }

    /// The channel is gone; keep devices until disconnect clears the error
    fn fail(&mut self, err: ChannelError) {
        tracing::error!("Fatal channel error: {}", err);
        self.link = None;
        if let Some(capture) = self.capture.as_mut() {
            if capture.is_recording() {
                capture.pause();
            }
        }
        if let Some(playback) = self.playback.as_ref() {
            let _ = playback.interrupt();
        }
        self.notice(format!("Connection lost: {}", err));
        self.set_state(SessionState::Errored);
    }

    fn pause(&mut self) -> bool {
        if self.state() != SessionState::Recording {
            tracing::warn!("Pause ignored in state {:?}", self.state());
            return false;
        }
        let paused = self.capture.as_mut().is_some_and(|capture| capture.pause());
        if paused {
            self.set_state(SessionState::Paused);
        }
        paused
    }

    fn resume(&mut self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Recording => return Ok(()),
            SessionState::Paused => {}
            _ => return Err(SessionError::NotConnected),
        }
        let capture = self.capture.as_mut().ok_or(SessionError::NotConnected)?;
        // The handler registered at connect keeps receiving chunks
        capture.record(Arc::new(|_: CaptureChunk| {}))?;
        self.set_state(SessionState::Recording);
        Ok(())
    }

    fn connected_link(&self) -> Result<&ChannelLink, SessionError> {
        if !self.state().is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.link.as_ref().ok_or(SessionError::NotConnected)
    }

    fn send_text(&mut self, text: String) -> Result<(), SessionError> {
        let link = self.connected_link()?;
        link.send(OutboundEvent::ItemCreate {
            item: WireItem::user_text(text),
        })?;
        link.send(OutboundEvent::ResponseCreate)?;
        Ok(())
    }

    fn delete_item(&mut self, id: &str) -> Result<bool, SessionError> {
        let link = self.connected_link()?;
        link.send(OutboundEvent::ItemDelete {
            item_id: id.to_string(),
        })?;

        let removed = self.shared.transcript.write().remove(id).is_some();
        if removed {
            self.shared.emit(SessionEvent::ItemRemoved(id.to_string()));
        }
        Ok(removed)
    }

    fn forward_chunk(&mut self, generation: u64, chunk: CaptureChunk) {
        if generation != self.generation || self.state() != SessionState::Recording {
            tracing::trace!("Dropping stale capture chunk {}", chunk.sequence);
            return;
        }
        let Some(link) = self.link.as_ref() else {
            return;
        };
        if let Err(e) = link.send(OutboundEvent::audio_append(&chunk.to_bytes())) {
            tracing::warn!("Failed to upload chunk {}: {}", chunk.sequence, e);
        }
    }

    fn check_devices(&mut self) {
        let capture_error = self.capture.as_ref().and_then(|capture| capture.check_errors());
        let playback_error = self.playback.as_ref().and_then(|playback| playback.check_errors());
        for err in capture_error.into_iter().chain(playback_error) {
            tracing::warn!("Audio device error: {}", err);
            self.notice(format!("Audio device error: {}", err));
        }
    }
}

async fn next_message(link: &mut Option<ChannelLink>) -> Option<ChannelMessage> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

/// Run one connect step unless a disconnect covering `ticket` arrives first
async fn guard<F: Future>(disconnects: watch::Receiver<u64>, ticket: u64, step: F) -> Result<F::Output, SessionError> {
    tokio::select! {
        biased;
        _ = disconnect_for(disconnects, ticket) => Err(SessionError::Cancelled),
        output = step => Ok(output),
    }
}

/// Resolves once a disconnect covering `ticket` has been requested
async fn disconnect_for(mut disconnects: watch::Receiver<u64>, ticket: u64) {
    if disconnects.wait_for(|&cancelled| cancelled >= ticket).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Opens playback then capture off the control task; device opens block
struct DeviceOpener {
    config: AppConfig,
    input: Arc<dyn InputSource>,
    output: Arc<dyn OutputSink>,
    registry: Option<Arc<DeviceRegistry>>,
    capture_tap: Option<SampleTap>,
    playback_tap: Option<SampleTap>,
}

impl DeviceOpener {
    fn open(self, handler: ChunkHandler) -> Result<(AudioPlaybackEngine, AudioCaptureEngine), SessionError> {
        let mut playback = AudioPlaybackEngine::new(self.output, self.config.playback.clone(), self.playback_tap);
        playback.connect()?;

        let device_id = match &self.registry {
            Some(registry) => match registry.selected_device() {
                Ok(device) => device.map(|d| d.id),
                Err(e) => {
                    tracing::warn!("Device lookup failed, using platform default: {}", e);
                    None
                }
            },
            None => None,
        };

        let mut capture = AudioCaptureEngine::new(self.input, self.config.audio.clone(), self.capture_tap);
        capture.begin(device_id.as_deref())?;
        capture.record(handler)?;
        Ok((playback, capture))
    }
}
