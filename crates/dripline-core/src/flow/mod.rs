//! Flow model: normalization of both flow encodings into one abstract step
//! graph, plus the fail-fast validation that runs at activation time.
//!
//! - `graph` -- `StepGraph` and the encoding-specific normalization
//! - `validate` -- activation checks (cycles, trigger windows, step configs)

pub mod graph;
pub mod validate;

use thiserror::Error;

/// Errors raised while normalizing or validating a flow definition.
///
/// These surface at flow-activation time, never during execution.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// Two steps share an id.
    #[error("duplicate step id: '{0}'")]
    DuplicateStepId(String),

    /// A branch or edge points at a step that does not exist.
    #[error("step '{step}' targets unknown step '{target}'")]
    UnknownTarget { step: String, target: String },

    /// A cycle with no intervening Delay or Condition step would spin
    /// forever inside one poll tick.
    #[error("synchronous cycle through step '{0}'")]
    SynchronousCycle(String),

    /// A step is missing required configuration.
    #[error("step '{step}': {detail}")]
    MissingConfig { step: String, detail: String },

    /// The flow has no dispatchable entry step.
    #[error("flow has no entry step")]
    NoEntryStep,

    /// The trigger configuration is unusable.
    #[error("trigger error: {0}")]
    Trigger(String),
}
