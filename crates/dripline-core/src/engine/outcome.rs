//! The result a step processor returns to the execution loop.
//!
//! Exactly one of advance / finish / wait / fail applies per attempt; the
//! enum makes any other combination unrepresentable. The serialized
//! outcome is the payload of the appended enrollment event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result of one step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    /// The step completed; move to the next step (or the branch target).
    Advance {
        /// Branch label selected by a Condition step.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        /// Variables to merge into the enrollment (append/overwrite only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variables: Option<Map<String, Value>>,
        /// Receipt of a message sent by this attempt.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<SentMessage>,
        /// The step was skipped by a suppression rule rather than executed.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        skipped: bool,
    },
    /// Terminate the enrollment as Completed without advancing further
    /// (suppression rules, END branch targets).
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Park the enrollment until `until`; it re-enters the ready set once
    /// the wait elapses.
    Wait { until: DateTime<Utc> },
    /// The attempt failed. Transient failures are retried by later ticks up
    /// to the engine's bound; permanent failures go terminal immediately.
    Fail {
        error: String,
        transient: bool,
        /// Error markers to persist even on failure (e.g. the external-call
        /// variable slot).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variables: Option<Map<String, Value>>,
    },
}

impl Outcome {
    pub fn advance() -> Self {
        Outcome::Advance {
            branch: None,
            variables: None,
            message: None,
            skipped: false,
        }
    }

    pub fn advance_branch(label: impl Into<String>) -> Self {
        Outcome::Advance {
            branch: Some(label.into()),
            variables: None,
            message: None,
            skipped: false,
        }
    }

    pub fn skip() -> Self {
        Outcome::Advance {
            branch: None,
            variables: None,
            message: None,
            skipped: true,
        }
    }

    pub fn fail_permanent(error: impl Into<String>) -> Self {
        Outcome::Fail {
            error: error.into(),
            transient: false,
            variables: None,
        }
    }

    pub fn fail_transient(error: impl Into<String>) -> Self {
        Outcome::Fail {
            error: error.into(),
            transient: true,
            variables: None,
        }
    }

    /// Event-payload rendering.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Receipt of a message sent during a step attempt; the executor copies
/// these onto the enrollment's thread pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentMessage {
    pub message_id: String,
    pub thread_id: String,
    pub sent_at: DateTime<Utc>,
    /// Set on the first send of a thread; later sends derive their reply
    /// subject from this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_subject: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
