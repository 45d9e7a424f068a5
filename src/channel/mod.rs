//! Realtime channel adapter
//!
//! A [`ChannelLink`] is the controller's view of an open channel: an outbound
//! queue drained by a writer task and an inbound queue fed by a reader task.
//! How the link is produced sits behind [`ChannelConnector`]; how the
//! credential is obtained sits behind [`SessionNegotiator`].

pub mod negotiate;
pub mod websocket;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ChannelError, SessionError};
use crate::protocol::{decode_inbound, InboundMessage, OutboundEvent, OutboundMessage};

pub use negotiate::HttpNegotiator;
pub use websocket::WebSocketConnector;

/// Short-lived connection credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub value: String,
    /// Unix seconds
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// Body of the negotiation request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NegotiationRequest {
    pub agent_id: String,
    pub distance_threshold: f32,
    pub limit: u32,
}

/// Exchange an agent reference for a channel credential
#[async_trait]
pub trait SessionNegotiator: Send + Sync {
    async fn negotiate(&self, request: &NegotiationRequest) -> Result<Credential, SessionError>;
}

/// Open a realtime channel with a credential
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self, credential: &Credential) -> Result<ChannelLink, ChannelError>;
}

/// What the reader task hands to the controller
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Event(InboundMessage),
    /// Undecodable event; the channel stays open
    Malformed(ChannelError),
    /// The channel is gone
    Fatal(ChannelError),
}

impl ChannelMessage {
    /// Classify one inbound text frame
    pub fn from_text(text: &str) -> Self {
        match decode_inbound(text) {
            Ok(message) => ChannelMessage::Event(message),
            Err(err) => ChannelMessage::Malformed(err),
        }
    }
}

/// Controller side of an open channel
#[derive(Debug)]
pub struct ChannelLink {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    inbound: mpsc::UnboundedReceiver<ChannelMessage>,
    /// Aborted when the link is dropped
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        inbound: mpsc::UnboundedReceiver<ChannelMessage>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks,
        }
    }

    /// In-memory link and the remote end that drives it
    pub fn pair() -> (Self, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self::new(out_tx, in_rx, Vec::new()),
            RemoteEnd {
                sent: out_rx,
                inbound: in_tx,
            },
        )
    }

    /// Queue an event for the writer; returns the event id
    pub fn send(&self, event: OutboundEvent) -> Result<String, ChannelError> {
        let message = OutboundMessage::new(event);
        let event_id = message.event_id.clone();
        tracing::debug!("-> {} ({})", message.event.kind(), event_id);
        self.outbound.send(message).map_err(|_| ChannelError::Closed)?;
        Ok(event_id)
    }

    /// Next inbound message; `None` once the reader is gone
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.inbound.recv().await
    }

    /// Close the channel; queued outbound events are still flushed
    pub fn close(self) {
        tracing::debug!("Closing channel link");
    }
}

impl Drop for ChannelLink {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Remote side of an in-memory [`ChannelLink`]
#[derive(Debug)]
pub struct RemoteEnd {
    sent: mpsc::UnboundedReceiver<OutboundMessage>,
    inbound: mpsc::UnboundedSender<ChannelMessage>,
}

impl RemoteEnd {
    /// Deliver a raw JSON frame as the reader would
    pub fn push_json(&self, text: &str) -> bool {
        self.inbound.send(ChannelMessage::from_text(text)).is_ok()
    }

    pub fn push(&self, message: ChannelMessage) -> bool {
        self.inbound.send(message).is_ok()
    }

    /// Next event the controller sent
    pub async fn next_sent(&mut self) -> Option<OutboundMessage> {
        self.sent.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<OutboundMessage> {
        self.sent.try_recv().ok()
    }

    /// Whether the controller's side has been dropped
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}
