//! Enrollment domain types: one subject's live progress through one flow.
//!
//! An enrollment is created by the trigger evaluator (or the manual API) and
//! mutated exclusively by the execution loop. The appended event trail
//! (`EnrollmentEvent`) is the audit record and the substrate for
//! engagement-correlated condition checks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enrollment
// ---------------------------------------------------------------------------

/// Durable record of one contact's progress through one flow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    /// UUIDv7 enrollment id.
    pub id: Uuid,
    /// The flow being executed.
    pub flow_id: Uuid,
    /// The enrolled subject (contact).
    pub subject_id: Uuid,
    /// Lifecycle status.
    pub status: EnrollmentStatus,
    /// Current step pointer. None means "not yet started, begin at the
    /// flow's entry step".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    /// Non-null iff `status == Waiting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<DateTime<Utc>>,
    /// Open key/value map accumulating step results. Append/overwrite only;
    /// the engine never deletes a key.
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Conversation thread in the messaging provider, set on first send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Subject line of the first message in the thread; reply subjects are
    /// derived from this, not from the immediately preceding message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_subject: Option<String>,
    /// Provider id of the most recent sent message (for reply threading).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
    /// When the most recent message was sent. Anchors delay computation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_sent_at: Option<DateTime<Utc>>,
    /// Error text retained for display after a terminal failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Consecutive transient failures on the current step. Reset on any
    /// successful step; terminal Failed once the configured bound is hit.
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Optimistic-concurrency counter, bumped on every persisted update.
    #[serde(default)]
    pub version: i64,
    /// Claim lease: while set and in the future, exactly one worker owns
    /// this enrollment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
}

impl Enrollment {
    /// Create a fresh Active enrollment positioned before the first step.
    pub fn new(flow_id: Uuid, subject_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            flow_id,
            subject_id,
            status: EnrollmentStatus::Active,
            current_step_id: None,
            wait_until: None,
            variables: Map::new(),
            thread_id: None,
            thread_subject: None,
            last_message_id: None,
            last_message_sent_at: None,
            failure_reason: None,
            consecutive_failures: 0,
            version: 0,
            claimed_until: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
            paused_at: None,
        }
    }

    /// The timestamp a pending delay is anchored to: the last completed
    /// action (message send), or enrollment creation if none. Anchoring here
    /// makes re-evaluating an already-elapsed delay idempotent.
    pub fn delay_anchor(&self) -> DateTime<Utc> {
        self.last_message_sent_at.unwrap_or(self.created_at)
    }
}

/// Enrollment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    /// Ready to advance on the next tick.
    Active,
    /// Parked until `wait_until` elapses.
    Waiting,
    /// Externally paused; skipped by the loop until resumed.
    Paused,
    Completed,
    Failed,
    Unsubscribed,
}

impl EnrollmentStatus {
    /// Terminal statuses are never re-entered by the execution loop.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EnrollmentStatus::Completed
                | EnrollmentStatus::Failed
                | EnrollmentStatus::Unsubscribed
        )
    }
}

// ---------------------------------------------------------------------------
// Enrollment events
// ---------------------------------------------------------------------------

/// Kind of an appended enrollment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// The step became the enrollment's current step.
    Entered,
    /// A step attempt finished; the payload is the serialized outcome.
    Exited,
    /// A step attempt failed; the payload carries the error.
    Failed,
}

/// Append-only audit record, one per step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentEvent {
    /// UUIDv7 event id.
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub step_id: String,
    pub event_type: EventType,
    /// The serialized step outcome (or error detail).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl EnrollmentEvent {
    /// Build an event stamped now.
    pub fn new(
        enrollment_id: Uuid,
        step_id: &str,
        event_type: EventType,
        payload: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            enrollment_id,
            step_id: step_id.to_string(),
            event_type,
            payload,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_enrollment_starts_before_first_step() {
        let now = Utc::now();
        let e = Enrollment::new(Uuid::now_v7(), Uuid::now_v7(), now);
        assert_eq!(e.status, EnrollmentStatus::Active);
        assert!(e.current_step_id.is_none());
        assert!(e.wait_until.is_none());
        assert_eq!(e.version, 0);
        assert_eq!(e.delay_anchor(), now);
    }

    #[test]
    fn delay_anchor_prefers_last_send() {
        let created = Utc::now();
        let mut e = Enrollment::new(Uuid::now_v7(), Uuid::now_v7(), created);
        let sent = created + chrono::Duration::hours(3);
        e.last_message_sent_at = Some(sent);
        assert_eq!(e.delay_anchor(), sent);
    }

    #[test]
    fn terminal_statuses() {
        assert!(EnrollmentStatus::Completed.is_terminal());
        assert!(EnrollmentStatus::Failed.is_terminal());
        assert!(EnrollmentStatus::Unsubscribed.is_terminal());
        assert!(!EnrollmentStatus::Active.is_terminal());
        assert!(!EnrollmentStatus::Waiting.is_terminal());
        assert!(!EnrollmentStatus::Paused.is_terminal());
    }

    #[test]
    fn enrollment_json_roundtrip_preserves_variables() {
        let mut e = Enrollment::new(Uuid::now_v7(), Uuid::now_v7(), Utc::now());
        e.variables
            .insert("lookup".to_string(), json!({ "status": 200 }));
        e.current_step_id = Some("check".to_string());

        let raw = serde_json::to_string(&e).unwrap();
        let parsed: Enrollment = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.variables["lookup"]["status"], json!(200));
        assert_eq!(parsed.current_step_id.as_deref(), Some("check"));
    }

    #[test]
    fn event_serde_snake_case_type() {
        let ev = EnrollmentEvent::new(
            Uuid::now_v7(),
            "m1",
            EventType::Exited,
            Some(json!({ "outcome": "advance" })),
        );
        let raw = serde_json::to_string(&ev).unwrap();
        assert!(raw.contains("\"event_type\":\"exited\""));
    }
}
