//! HTTP session negotiation

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Credential, NegotiationRequest, SessionNegotiator};
use crate::config::SessionConfig;
use crate::error::SessionError;

#[derive(Debug, Deserialize)]
struct NegotiationResponse {
    client_secret: Credential,
}

/// Posts the agent reference to the negotiation endpoint
pub struct HttpNegotiator {
    client: reqwest::Client,
    url: String,
}

impl HttpNegotiator {
    pub fn new(config: &SessionConfig) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SessionError::NegotiationFailed(e.to_string()))?;
        Ok(Self {
            client,
            url: config.negotiate_url.clone(),
        })
    }
}

#[async_trait]
impl SessionNegotiator for HttpNegotiator {
    async fn negotiate(&self, request: &NegotiationRequest) -> Result<Credential, SessionError> {
        tracing::info!("Negotiating session for agent {}", request.agent_id);

        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| SessionError::NegotiationFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::NegotiationFailed(format!("HTTP {}: {}", status, body)));
        }

        let body: NegotiationResponse = response
            .json()
            .await
            .map_err(|e| SessionError::NegotiationFailed(format!("malformed response: {}", e)))?;

        if body.client_secret.value.is_empty() {
            return Err(SessionError::NegotiationFailed("empty credential".to_string()));
        }
        Ok(body.client_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/session", addr)
    }

    fn negotiator(url: String) -> HttpNegotiator {
        HttpNegotiator::new(&SessionConfig {
            negotiate_url: url,
            ..Default::default()
        })
        .unwrap()
    }

    fn request() -> NegotiationRequest {
        NegotiationRequest {
            agent_id: "agent-7".to_string(),
            distance_threshold: 0.5,
            limit: 5,
        }
    }

    #[tokio::test]
    async fn test_negotiate_returns_credential() {
        let app = Router::new().route(
            "/session",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["agent_id"], "agent-7");
                assert_eq!(body["limit"], 5);
                Json(json!({"client_secret": {"value": "ek_123", "expires_at": 1700000000}}))
            }),
        );
        let credential = negotiator(serve(app).await).negotiate(&request()).await.unwrap();
        assert_eq!(credential.value, "ek_123");
        assert_eq!(credential.expires_at, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_server_error_fails_negotiation() {
        let app = Router::new().route(
            "/session",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let err = negotiator(serve(app).await).negotiate(&request()).await.unwrap_err();
        assert!(matches!(err, SessionError::NegotiationFailed(ref msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn test_malformed_body_fails_negotiation() {
        let app = Router::new().route("/session", post(|| async { Json(json!({"token": "x"})) }));
        let err = negotiator(serve(app).await).negotiate(&request()).await.unwrap_err();
        assert!(matches!(err, SessionError::NegotiationFailed(_)));
    }
}
