//! Subject (contact) and engagement types, plus the messaging exchange
//! types shared with the messaging collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::flow::CompareOp;

// ---------------------------------------------------------------------------
// Subject
// ---------------------------------------------------------------------------

/// A contact. Created and imported by the surrounding product; the engine
/// only reads attributes and applies Action-step mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    /// UUIDv7 subject id.
    pub id: Uuid,
    pub email: String,
    /// Open attribute map (plan, signup_date, custom fields, ...).
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Engagement events
// ---------------------------------------------------------------------------

/// Engagement kinds recorded by the messaging collaborator's tracking
/// pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    Opened,
    Clicked,
    Replied,
}

/// Append-only engagement record correlated to a sent step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    /// The Message step whose send produced this engagement.
    pub step_id: String,
    pub subject_id: Uuid,
    pub kind: EngagementKind,
    pub occurred_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Messaging exchange types
// ---------------------------------------------------------------------------

/// A resolved message handed to the messaging collaborator for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub subject_id: Uuid,
    pub subject: String,
    pub body: String,
    /// Continue an existing conversation instead of starting a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Protocol-level identifier of the message being replied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

/// Delivery receipt returned by the messaging collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
    pub thread_id: String,
}

/// Conversation history context for reply threading. All fields may be
/// absent; a missing thread is "no history available", not an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_body_html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_body_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

/// A stored segment: a conjunction of attribute clauses evaluated by the
/// segment collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub name: String,
    /// All clauses must hold for a subject to match.
    pub clauses: Vec<SegmentClause>,
}

/// One attribute predicate inside a segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentClause {
    pub field: String,
    pub operator: CompareOp,
    #[serde(default)]
    pub value: Value,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
