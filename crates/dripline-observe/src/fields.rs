//! Shared span/field name constants for engine instrumentation.
//!
//! Using one vocabulary across the executor, trigger evaluator, and API
//! layer keeps log queries and trace filters consistent. All constants are
//! string slices usable in `tracing::span!` and `tracing::info_span!`
//! field names.

// --- Entity identifiers ---

/// The flow definition being executed.
pub const FLOW_ID: &str = "flow.id";

/// The flow's human-readable name.
pub const FLOW_NAME: &str = "flow.name";

/// The enrollment being advanced.
pub const ENROLLMENT_ID: &str = "enrollment.id";

/// The subject (contact) the enrollment belongs to.
pub const SUBJECT_ID: &str = "subject.id";

/// The step currently being processed.
pub const STEP_ID: &str = "step.id";

/// The step's kind (message, delay, condition, action, external_call).
pub const STEP_KIND: &str = "step.kind";

// --- Tick metrics ---

/// Enrollments created by the trigger pass of a tick.
pub const TICK_TRIGGERED: &str = "tick.triggered";

/// Enrollments processed by a tick.
pub const TICK_PROCESSED: &str = "tick.processed";

/// Wall-clock duration of a tick in milliseconds.
pub const TICK_ELAPSED_MS: &str = "tick.elapsed_ms";

// --- Operation name values ---

/// One poll-loop tick.
pub const OP_TICK: &str = "tick";

/// One trigger-evaluation pass for a flow.
pub const OP_EVALUATE_TRIGGER: &str = "evaluate_trigger";

/// One step attempt for an enrollment.
pub const OP_PROCESS_STEP: &str = "process_step";
