//! WebSocket transport for the realtime channel

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::{ChannelConnector, ChannelLink, ChannelMessage, Credential};
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::protocol::OutboundMessage;

/// Connects to the backend over a WebSocket
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            url: config.url.clone(),
        }
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn open(&self, credential: &Credential) -> Result<ChannelLink, ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::OpenFailed(format!("invalid channel url: {}", e)))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.value))
            .map_err(|e| ChannelError::OpenFailed(format!("invalid credential: {}", e)))?;
        request.headers_mut().insert("Authorization", bearer);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ChannelError::OpenFailed(e.to_string()))?;
        tracing::info!("Channel open: {} (HTTP {})", self.url, response.status());

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ChannelMessage>();

        // Writer ends on its own once the link drops its sender, so queued
        // events and the close frame still go out.
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Dropping unencodable {}: {}", message.event.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::warn!("Channel write failed: {}", e);
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            tracing::debug!("Channel writer finished");
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(ChannelMessage::from_text(&text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!("closed by peer: {} {}", frame.code, frame.reason),
                            None => "closed by peer".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            tracing::warn!("Channel lost: {}", reason);
            let _ = in_tx.send(ChannelMessage::Fatal(ChannelError::Fatal(reason)));
        });

        Ok(ChannelLink::new(out_tx, in_rx, vec![reader]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_open() {
        let connector = WebSocketConnector::new(&ChannelConfig {
            url: "ws://127.0.0.1:1/realtime".to_string(),
            ..Default::default()
        });
        let credential = Credential {
            value: "secret".to_string(),
            expires_at: None,
        };
        assert!(matches!(connector.open(&credential).await, Err(ChannelError::OpenFailed(_))));
    }

    #[tokio::test]
    async fn test_invalid_url_fails_open() {
        let connector = WebSocketConnector::new(&ChannelConfig {
            url: "not a url".to_string(),
            ..Default::default()
        });
        let credential = Credential {
            value: "secret".to_string(),
            expires_at: None,
        };
        assert!(matches!(connector.open(&credential).await, Err(ChannelError::OpenFailed(_))));
    }
}
