//! HTTP gateway to the messaging provider.
//!
//! Implements the `MessagingCollaborator` trait against the provider's REST
//! API. The provider owns delivery quirks, auth refresh, rate limits, and
//! quoted-content markup; this gateway only moves the resolved message and
//! thread pointers across the wire. 5xx and transport errors classify as
//! transient (the engine's bounded retry applies), 4xx as permanent.

use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use uuid::Uuid;

use dripline_core::collaborator::{CollaboratorError, MessagingCollaborator};
use dripline_types::subject::{OutgoingMessage, SendReceipt, ThreadContext};

/// Configuration for the messaging gateway.
#[derive(Debug, Clone)]
pub struct MessagingGatewayConfig {
    /// Base URL of the provider API (no trailing slash).
    pub base_url: String,
    /// Bearer token for the provider API.
    pub api_token: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// reqwest-backed implementation of `MessagingCollaborator`.
pub struct HttpMessagingGateway {
    client: reqwest::Client,
    config: MessagingGatewayConfig,
}

#[derive(Deserialize)]
struct SendResponse {
    message_id: String,
    thread_id: String,
}

#[derive(Deserialize)]
struct ThreadResponse {
    #[serde(default)]
    quoted_body_html: Option<String>,
    #[serde(default)]
    quoted_body_text: Option<String>,
    #[serde(default)]
    last_message_id: Option<String>,
}

#[derive(Deserialize)]
struct IdentifierResponse {
    #[serde(default)]
    identifier: Option<String>,
}

impl HttpMessagingGateway {
    pub fn new(config: MessagingGatewayConfig) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("dripline-engine/0.1")
            .build()
            .map_err(|e| CollaboratorError::Permanent(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    fn classify(error: reqwest::Error) -> CollaboratorError {
        if error.is_timeout() || error.is_connect() {
            CollaboratorError::Transient(error.to_string())
        } else {
            CollaboratorError::Permanent(error.to_string())
        }
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> CollaboratorError {
        let detail = format!("provider returned {status}: {body}");
        if status.is_server_error() || status.as_u16() == 429 {
            CollaboratorError::Transient(detail)
        } else {
            CollaboratorError::Permanent(detail)
        }
    }
}

impl MessagingCollaborator for HttpMessagingGateway {
    fn send_message(
        &self,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, Result<SendReceipt, CollaboratorError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url("/v1/messages"))
                .bearer_auth(&self.config.api_token)
                .json(&message)
                .send()
                .await
                .map_err(Self::classify)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Self::classify_status(status, body));
            }

            let parsed: SendResponse = response
                .json()
                .await
                .map_err(|e| CollaboratorError::Permanent(format!("invalid send response: {e}")))?;

            tracing::debug!(
                subject_id = %message.subject_id,
                message_id = parsed.message_id.as_str(),
                "message accepted by provider"
            );

            Ok(SendReceipt {
                message_id: parsed.message_id,
                thread_id: parsed.thread_id,
            })
        })
    }

    fn fetch_thread_context(
        &self,
        subject_id: Uuid,
        thread_id: &str,
    ) -> BoxFuture<'_, Result<Option<ThreadContext>, CollaboratorError>> {
        let url = self.url(&format!("/v1/threads/{thread_id}"));
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .query(&[("subject_id", subject_id.to_string())])
                .bearer_auth(&self.config.api_token)
                .send()
                .await
                .map_err(Self::classify)?;

            // An unresolvable thread is "no history available", not an error.
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Self::classify_status(status, body));
            }

            let parsed: ThreadResponse = response.json().await.map_err(|e| {
                CollaboratorError::Permanent(format!("invalid thread response: {e}"))
            })?;

            Ok(Some(ThreadContext {
                quoted_body_html: parsed.quoted_body_html,
                quoted_body_text: parsed.quoted_body_text,
                last_message_id: parsed.last_message_id,
            }))
        })
    }

    fn resolve_message_identifier_header(
        &self,
        subject_id: Uuid,
        message_id: &str,
    ) -> BoxFuture<'_, Result<Option<String>, CollaboratorError>> {
        let url = self.url(&format!("/v1/messages/{message_id}/identifier"));
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .query(&[("subject_id", subject_id.to_string())])
                .bearer_auth(&self.config.api_token)
                .send()
                .await
                .map_err(Self::classify)?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Self::classify_status(status, body));
            }

            let parsed: IdentifierResponse = response.json().await.map_err(|e| {
                CollaboratorError::Permanent(format!("invalid identifier response: {e}"))
            })?;
            Ok(parsed.identifier)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
