//! Collaborator traits for external services the engine calls into.
//!
//! These are object-safe (Box::pin futures) so the engine can hold them as
//! `Arc<dyn ...>`: the messaging provider owns delivery quirks and quoted
//! content, the segment service owns full predicate evaluation, the
//! engagement source owns open/click/reply tracking, and the HTTP caller
//! executes ExternalCall steps. The trait is defined here, the concrete
//! implementation lives in dripline-infra (dependency inversion, same
//! pattern as the repositories).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use dripline_types::subject::{EngagementKind, OutgoingMessage, SendReceipt, ThreadContext};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from collaborator calls, classified for the retry policy.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// Timeout, 5xx, connection refused -- worth retrying on a later tick.
    #[error("{0}")]
    Transient(String),

    /// Rejected input, 4xx, unknown entity -- retrying cannot help.
    #[error("{0}")]
    Permanent(String),
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

/// The messaging provider boundary.
///
/// The engine never inspects message bodies beyond variable substitution;
/// threading markup, delivery auth, and rate limits live behind this trait.
pub trait MessagingCollaborator: Send + Sync {
    /// Deliver a message, optionally as a reply within an existing thread.
    fn send_message(
        &self,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, Result<SendReceipt, CollaboratorError>>;

    /// Conversation history for reply threading. `Ok(None)` means the
    /// thread cannot be resolved -- treated as "no history available", not
    /// as an error.
    fn fetch_thread_context(
        &self,
        subject_id: Uuid,
        thread_id: &str,
    ) -> BoxFuture<'_, Result<Option<ThreadContext>, CollaboratorError>>;

    /// The protocol-level identifier used in reply-threading headers for a
    /// previously sent message.
    fn resolve_message_identifier_header(
        &self,
        subject_id: Uuid,
        message_id: &str,
    ) -> BoxFuture<'_, Result<Option<String>, CollaboratorError>>;
}

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

/// Full segment-predicate evaluation, delegated per the trigger contract.
pub trait SegmentCollaborator: Send + Sync {
    fn matches(
        &self,
        subject_id: Uuid,
        segment_id: Uuid,
    ) -> BoxFuture<'_, Result<bool, CollaboratorError>>;
}

// ---------------------------------------------------------------------------
// Engagement
// ---------------------------------------------------------------------------

/// A query against the append-only engagement record.
#[derive(Debug, Clone)]
pub struct EngagementQuery {
    pub enrollment_id: Uuid,
    /// Restrict to engagement produced by one step's send. `None` matches
    /// any step of the enrollment.
    pub step_id: Option<String>,
    pub kind: EngagementKind,
    /// Only count engagement at or after this instant (used by the
    /// "since flow start" suppression checks).
    pub since: Option<DateTime<Utc>>,
}

/// Read access to OPENED/CLICKED/REPLIED events correlated to
/// (enrollment, step).
pub trait EngagementSource: Send + Sync {
    fn has_engagement(
        &self,
        query: EngagementQuery,
    ) -> BoxFuture<'_, Result<bool, CollaboratorError>>;
}

// ---------------------------------------------------------------------------
// Outbound HTTP
// ---------------------------------------------------------------------------

/// A fully resolved ExternalCall request.
#[derive(Debug, Clone)]
pub struct HttpCallRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    /// Hard deadline; one slow endpoint must not stall the whole batch.
    pub timeout: Duration,
}

/// Structured response stored into enrollment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCallResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Bounded-timeout HTTP execution for ExternalCall steps.
pub trait HttpCaller: Send + Sync {
    fn call(
        &self,
        request: HttpCallRequest,
    ) -> BoxFuture<'_, Result<HttpCallResponse, CollaboratorError>>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(CollaboratorError::Transient("timeout".to_string()).is_transient());
        assert!(!CollaboratorError::Permanent("bad address".to_string()).is_transient());
    }

    #[test]
    fn http_response_serializes_for_variable_storage() {
        let resp = HttpCallResponse {
            status: 200,
            headers: HashMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: r#"{"ok":true}"#.to_string(),
        };
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["status"], 200);
        assert_eq!(v["headers"]["content-type"], "application/json");
    }
}
