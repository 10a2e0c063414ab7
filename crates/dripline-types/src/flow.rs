//! Flow domain types for Dripline.
//!
//! Defines the canonical representation of a contact workflow: a trigger
//! configuration plus a collection of typed steps in one of two encodings
//! (linear array or node/edge graph). Both encodings normalize to the same
//! abstract step graph before execution (see `dripline-core::flow`).

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved branch/edge target meaning "terminate the enrollment".
pub const END_TARGET: &str = "END";

// ---------------------------------------------------------------------------
// Flow Definition
// ---------------------------------------------------------------------------

/// A workflow definition: trigger + steps in one of two encodings.
///
/// The visual canvas produces the graph encoding, the sequence editor
/// produces the linear encoding. The engine treats a definition as immutable
/// once activated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// UUIDv7 assigned on first save.
    pub id: Uuid,
    /// Human-readable flow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Monotonic definition version, bumped on every save.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Lifecycle status. Only `Active` flows are polled.
    #[serde(default)]
    pub status: FlowStatus,
    /// Entry condition that creates new enrollments.
    pub trigger: TriggerConfig,
    /// Step collection in either encoding.
    #[serde(flatten)]
    pub encoding: FlowEncoding,
    /// When the definition was first saved.
    pub created_at: DateTime<Utc>,
    /// When the definition was last saved.
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl FlowDefinition {
    /// The step definitions regardless of encoding.
    pub fn step_definitions(&self) -> &[StepDefinition] {
        match &self.encoding {
            FlowEncoding::Linear { steps } => steps,
            FlowEncoding::Graph { nodes, .. } => nodes,
        }
    }
}

/// Lifecycle status of a flow definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Editable, never polled.
    #[default]
    Draft,
    /// Validated and live: triggers fire, enrollments advance.
    Active,
    /// Retired: triggers stop, existing enrollments drain.
    Archived,
}

// ---------------------------------------------------------------------------
// Flow encodings
// ---------------------------------------------------------------------------

/// The two supported step-collection encodings.
///
/// Linear: steps execute in array order with an implicit `next = index + 1`,
/// overridable per step via `next_step_id`; Condition steps carry explicit
/// branch-target lists.
///
/// Graph: explicit edges; an edge with a `source_handle` maps to a branch
/// label, an edge without one maps to `next`. The reserved target `END`
/// terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum FlowEncoding {
    Linear {
        steps: Vec<StepDefinition>,
    },
    Graph {
        nodes: Vec<StepDefinition>,
        edges: Vec<FlowEdge>,
    },
}

/// A directed edge between two steps in the graph encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdge {
    /// Source step id.
    pub source: String,
    /// Target step id, or the reserved `END` sentinel.
    pub target: String,
    /// Branch label on the source node (e.g. "true"/"false"). Absent for
    /// plain sequential edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single typed step in a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step id, unique within the flow.
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// Kind-specific configuration payload.
    pub config: StepConfig,
    /// Linear encoding only: overrides the positional `next`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
}

/// Kind-specific step configuration.
///
/// Internally tagged by `type`:
/// ```json
/// { "type": "message", "subject": "Hi", "body": "Hello {{first_name}}" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Entry pseudo-step emitted by the graph editor. Never dispatched; the
    /// engine starts at the step it points to.
    Trigger {},
    /// Send a message to the enrolled subject.
    Message {
        #[serde(default)]
        subject: String,
        #[serde(default)]
        body: String,
        /// Resolve content from a stored template instead of inline fields.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template_id: Option<Uuid>,
        /// Send as a reply in the enrollment's existing thread.
        #[serde(default)]
        continue_thread: bool,
        /// Suppress the send (and complete the enrollment) if the subject
        /// has replied since flow start.
        #[serde(default)]
        send_only_if_no_reply: bool,
        /// Skip the send (and advance) if the subject has opened a message
        /// since flow start.
        #[serde(default)]
        skip_if_opened: bool,
    },
    /// Pause the enrollment for a duration.
    Delay { delay: DelaySpec },
    /// Branch on a predicate.
    Condition {
        condition: ConditionSpec,
        /// Target for the "true" branch. Empty = fall through positionally.
        #[serde(default)]
        true_branch: Vec<String>,
        /// Target for the "false" branch. Empty = fall through positionally.
        #[serde(default)]
        false_branch: Vec<String>,
    },
    /// Mutate subject-level state.
    Action { action: ActionOp },
    /// Call an external HTTP endpoint and store the response in variables.
    ExternalCall {
        method: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        /// Variables key under which `{status, headers, body}` is stored.
        response_variable: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
}

impl StepConfig {
    /// Short kind name for logging and events.
    pub fn kind(&self) -> &'static str {
        match self {
            StepConfig::Trigger {} => "trigger",
            StepConfig::Message { .. } => "message",
            StepConfig::Delay { .. } => "delay",
            StepConfig::Condition { .. } => "condition",
            StepConfig::Action { .. } => "action",
            StepConfig::ExternalCall { .. } => "external_call",
        }
    }
}

// ---------------------------------------------------------------------------
// Delay
// ---------------------------------------------------------------------------

/// Delay duration in either the duration+unit form or the legacy fixed
/// days/hours/minutes form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelaySpec {
    Interval {
        amount: i64,
        unit: DelayUnit,
    },
    Fixed {
        #[serde(default)]
        days: i64,
        #[serde(default)]
        hours: i64,
        #[serde(default)]
        minutes: i64,
    },
}

impl DelaySpec {
    /// Total delay as a chrono `Duration`. May be zero or negative for
    /// degenerate configurations; the delay processor treats those as no-ops.
    pub fn as_duration(&self) -> Duration {
        match self {
            DelaySpec::Interval { amount, unit } => match unit {
                DelayUnit::Minutes => Duration::minutes(*amount),
                DelayUnit::Hours => Duration::hours(*amount),
                DelayUnit::Days => Duration::days(*amount),
                DelayUnit::Weeks => Duration::weeks(*amount),
            },
            DelaySpec::Fixed {
                days,
                hours,
                minutes,
            } => Duration::days(*days) + Duration::hours(*hours) + Duration::minutes(*minutes),
        }
    }
}

/// Unit for the duration+unit delay form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// Predicate evaluated by a Condition step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConditionSpec {
    /// Compare a value from one of three sources against a literal.
    Comparison {
        source: ValueSource,
        operator: CompareOp,
        #[serde(default)]
        value: serde_json::Value,
    },
    /// Check engagement events recorded against a referenced Message step.
    Engagement {
        predicate: EngagementPredicate,
        /// Step whose engagement is checked. Defaults to the nearest
        /// preceding Message step.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference_step: Option<String>,
    },
}

/// Where a comparison reads its left-hand value from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ValueSource {
    /// A subject attribute.
    Attribute { field: String },
    /// A dotted path into the enrollment's accumulated variables
    /// (e.g. `"lookup.status"`).
    Variable { path: String },
    /// A static literal.
    Literal { value: serde_json::Value },
}

/// Comparison operator set.
///
/// String comparisons are case-insensitive and trimmed; numeric comparisons
/// coerce both sides with a best-effort parse and evaluate to false when the
/// parse fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    Exists,
    NotExists,
    In,
    NotIn,
}

/// Engagement predicate resolved against recorded engagement events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementPredicate {
    Opened,
    NotOpened,
    Clicked,
    NotClicked,
    Replied,
    NotReplied,
    OpenedNoReply,
    OpenedNoClick,
    ClickedNoReply,
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// Subject-level mutation performed by an Action step. Each operation is
/// idempotent: applying it twice has the same effect as once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ActionOp {
    AddTag { tag: String },
    RemoveTag { tag: String },
    AddToList { list_id: Uuid },
    RemoveFromList { list_id: Uuid },
    /// Update one of a fixed allow-list of free-text fields.
    SetField { field: String, value: String },
}

// ---------------------------------------------------------------------------
// Trigger Configuration
// ---------------------------------------------------------------------------

/// Entry condition that causes enrollments to be created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Subjects created within a trailing lookback window.
    NewSubject {
        #[serde(default = "default_lookback_minutes")]
        lookback_minutes: i64,
    },
    /// Recently mutated subjects matching a stored segment predicate.
    AttributeSegment {
        segment_id: Uuid,
        #[serde(default = "default_lookback_minutes")]
        lookback_minutes: i64,
    },
    /// Subjects whose date attribute falls inside a symmetric window around
    /// `now + offset_days`. The window must be at least the poll interval or
    /// activation is rejected.
    ScheduledDate {
        attribute: String,
        #[serde(default)]
        offset_days: i64,
        #[serde(default = "default_window_minutes")]
        window_minutes: i64,
    },
    /// Enrollment created by an external webhook ingestion path; the
    /// evaluator itself never fires.
    External {},
    /// Enrollment created only by explicit API calls.
    Manual {},
}

fn default_lookback_minutes() -> i64 {
    60
}

fn default_window_minutes() -> i64 {
    30
}

// ---------------------------------------------------------------------------
// Message templates
// ---------------------------------------------------------------------------

/// A stored message template referenced by Message steps via `template_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: Uuid,
    pub name: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Flow statistics
// ---------------------------------------------------------------------------

/// Best-effort per-flow aggregate counters, recomputed after each tick
/// batch. Never used for control decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStats {
    pub flow_id: Uuid,
    pub active_count: i64,
    pub completed_count: i64,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
