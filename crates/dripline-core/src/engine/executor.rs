//! The per-tick executor.
//!
//! One tick: re-evaluate triggers for every active flow, load a bounded
//! batch of ready enrollments, and advance each one through its step graph.
//! Advancement is an explicit bounded loop (never recursion): Delay /
//! Condition / Action chains resolve within one tick, capped by
//! `max_steps_per_tick` to guard against zero-delay cycles.
//!
//! Concurrency contract: an enrollment is claimed (short-lived lease)
//! before any processor runs, and the final persist is a version
//! compare-and-set that clears the lease. Overlapping ticks and scaled-out
//! workers therefore get at-most-one in-flight processor per enrollment; a
//! crashed worker's claim simply expires.
//!
//! A failure in one enrollment never aborts the batch -- each enrollment is
//! processed in isolation, recorded, and the loop moves on.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use dripline_types::enrollment::{Enrollment, EnrollmentEvent, EnrollmentStatus, EventType};
use dripline_types::error::RepositoryError;
use dripline_types::flow::{FlowDefinition, FlowStatus};

use crate::collaborator::{
    EngagementSource, HttpCaller, MessagingCollaborator, SegmentCollaborator,
};
use crate::flow::FlowError;
use crate::flow::graph::{StepGraph, StepTarget};
use crate::repository::enrollment::EnrollmentRepository;
use crate::repository::flow::FlowRepository;
use crate::repository::subject::SubjectRepository;

use super::outcome::{Outcome, SentMessage};
use super::step_runner::{StepContext, StepRunner};
use super::trigger::TriggerEvaluator;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine tuning knobs. The defaults match a few-minute poll cadence.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed interval between ticks.
    pub poll_interval: Duration,
    /// Max enrollments processed per tick; the remainder rolls over.
    pub batch_limit: u32,
    /// Max synchronous step advancements per enrollment per tick.
    pub max_steps_per_tick: u32,
    /// Claim lease length; must exceed the slowest plausible step chain.
    pub claim_lease: Duration,
    /// Consecutive transient failures tolerated before terminal Failed.
    pub max_transient_failures: u32,
    /// Hard cap on any ExternalCall timeout.
    pub external_call_timeout_cap: Duration,
    /// Max trigger candidates considered per flow per tick.
    pub trigger_candidate_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_limit: 100,
            max_steps_per_tick: 25,
            claim_lease: Duration::from_secs(60),
            max_transient_failures: 3,
            external_call_timeout_cap: Duration::from_secs(30),
            trigger_candidate_limit: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Tick summary
// ---------------------------------------------------------------------------

/// What one tick did; logged by the runner, never used for control.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub triggered: usize,
    pub processed: usize,
    pub completed: usize,
    pub waiting: usize,
    pub failed: usize,
    pub retrying: usize,
    pub skipped: usize,
}

/// Per-enrollment processing result, folded into the tick summary.
enum Processed {
    /// Lost the claim race or went stale; someone else owns it.
    Skipped,
    /// Still active: hit the per-tick step budget.
    Budgeted,
    Completed,
    Waiting,
    Failed,
    /// Transient failure, left Active for the next tick's natural retry.
    Retrying,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that escape a single enrollment's processing. The tick loop
/// records them and continues with the next enrollment.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

/// The execution loop. Stateless between ticks apart from the resolved
/// step-graph cache; safe to share behind an `Arc` and safe to run from
/// several workers against one store.
pub struct FlowEngine<F, E, S>
where
    F: FlowRepository,
    E: EnrollmentRepository,
    S: SubjectRepository,
{
    flows: Arc<F>,
    enrollments: Arc<E>,
    subjects: Arc<S>,
    runner: StepRunner<F, S>,
    triggers: TriggerEvaluator<E, S>,
    /// Normalized graphs keyed by (flow id, definition version).
    graphs: DashMap<(Uuid, u32), Arc<StepGraph>>,
    config: EngineConfig,
}

impl<F, E, S> FlowEngine<F, E, S>
where
    F: FlowRepository,
    E: EnrollmentRepository,
    S: SubjectRepository,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flows: Arc<F>,
        enrollments: Arc<E>,
        subjects: Arc<S>,
        messaging: Arc<dyn MessagingCollaborator>,
        segments: Arc<dyn SegmentCollaborator>,
        engagement: Arc<dyn EngagementSource>,
        http: Arc<dyn HttpCaller>,
        config: EngineConfig,
    ) -> Self {
        let runner = StepRunner::new(
            flows.clone(),
            subjects.clone(),
            messaging,
            engagement,
            http,
            config.external_call_timeout_cap,
        );
        let triggers = TriggerEvaluator::new(
            enrollments.clone(),
            subjects.clone(),
            segments,
            config.trigger_candidate_limit,
        );
        Self {
            flows,
            enrollments,
            subjects,
            runner,
            triggers,
            graphs: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one poll tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();

        // Trigger pass over all active flows.
        let active_flows = match self.flows.list_definitions(Some(FlowStatus::Active)).await {
            Ok(flows) => flows,
            Err(error) => {
                tracing::error!(%error, "failed to list active flows, skipping tick");
                return summary;
            }
        };
        for flow in &active_flows {
            match self.triggers.evaluate_and_enroll(flow, now).await {
                Ok(created) => summary.triggered += created,
                Err(error) => {
                    tracing::error!(flow_id = %flow.id, %error, "trigger evaluation failed");
                }
            }
        }

        // Bounded ready batch.
        let ready = match self
            .enrollments
            .load_ready(now, self.config.batch_limit)
            .await
        {
            Ok(batch) => batch,
            Err(error) => {
                tracing::error!(%error, "failed to load ready enrollments");
                return summary;
            }
        };

        let mut touched_flows = HashSet::new();
        for candidate in ready {
            touched_flows.insert(candidate.flow_id);
            let enrollment_id = candidate.id;
            summary.processed += 1;

            match self.process_one(candidate, now).await {
                Ok(Processed::Completed) => summary.completed += 1,
                Ok(Processed::Waiting) => summary.waiting += 1,
                Ok(Processed::Failed) => summary.failed += 1,
                Ok(Processed::Retrying) => summary.retrying += 1,
                Ok(Processed::Skipped) => summary.skipped += 1,
                Ok(Processed::Budgeted) => {}
                Err(error) => {
                    // Isolation: record, release the claim, move on.
                    tracing::error!(
                        enrollment_id = %enrollment_id,
                        %error,
                        "enrollment processing failed"
                    );
                    if let Err(release_error) = self.enrollments.release(&enrollment_id).await {
                        tracing::warn!(
                            enrollment_id = %enrollment_id,
                            error = %release_error,
                            "failed to release claim"
                        );
                    }
                }
            }
        }

        // Best-effort aggregate counters per touched flow.
        for flow_id in touched_flows {
            if let Err(error) = self.enrollments.recompute_stats(&flow_id, now).await {
                tracing::warn!(flow_id = %flow_id, %error, "stats recompute failed");
            }
        }

        summary
    }

    // -----------------------------------------------------------------------
    // Per-enrollment processing
    // -----------------------------------------------------------------------

    async fn process_one(
        &self,
        candidate: Enrollment,
        now: DateTime<Utc>,
    ) -> Result<Processed, EngineError> {
        // Claim before any processor runs.
        let lease_until = now + chrono::Duration::from_std(self.config.claim_lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let Some(mut enrollment) = self
            .enrollments
            .claim(&candidate.id, lease_until, now)
            .await?
        else {
            tracing::debug!(enrollment_id = %candidate.id, "claim lost, skipping");
            return Ok(Processed::Skipped);
        };
        let expected_version = enrollment.version;

        // Resolve flow, graph, and subject. A missing referent is a
        // permanent failure for this enrollment, not an engine error.
        let Some(flow) = self.flows.get_definition(&enrollment.flow_id).await? else {
            fail_terminal(&mut enrollment, "flow definition missing", now);
            self.persist(&enrollment, expected_version, now).await?;
            return Ok(Processed::Failed);
        };
        let graph = match self.graph_for(&flow) {
            Ok(graph) => graph,
            Err(error) => {
                fail_terminal(&mut enrollment, &format!("flow unusable: {error}"), now);
                self.persist(&enrollment, expected_version, now).await?;
                return Ok(Processed::Failed);
            }
        };
        let Some(subject) = self.subjects.get(&enrollment.subject_id).await? else {
            fail_terminal(&mut enrollment, "subject missing", now);
            self.persist(&enrollment, expected_version, now).await?;
            return Ok(Processed::Failed);
        };

        // Bounded synchronous advancement within this tick.
        let mut steps_run = 0u32;
        let result = loop {
            if steps_run >= self.config.max_steps_per_tick {
                tracing::warn!(
                    enrollment_id = %enrollment.id,
                    budget = self.config.max_steps_per_tick,
                    "step budget exhausted, deferring to next tick"
                );
                enrollment.status = EnrollmentStatus::Active;
                break Processed::Budgeted;
            }

            // Resolve the current step; a null pointer means "begin at the
            // flow's entry step".
            let step_id = match &enrollment.current_step_id {
                Some(id) => id.clone(),
                None => {
                    let entry = graph.entry_step_id().to_string();
                    self.enter_step(&enrollment, &entry).await;
                    enrollment.current_step_id = Some(entry.clone());
                    entry
                }
            };

            let Some(step) = graph.step(&step_id) else {
                fail_terminal(
                    &mut enrollment,
                    &format!("current step '{step_id}' not in flow"),
                    now,
                );
                break Processed::Failed;
            };

            let outcome = self
                .runner
                .run(&StepContext {
                    enrollment: &enrollment,
                    step,
                    graph: &graph,
                    subject: &subject,
                    now,
                })
                .await;
            steps_run += 1;

            self.record_attempt(&enrollment, &step_id, &outcome).await;

            match outcome {
                Outcome::Advance {
                    branch,
                    variables,
                    message,
                    skipped: _,
                } => {
                    merge_variables(&mut enrollment, variables);
                    apply_sent_message(&mut enrollment, message);
                    enrollment.consecutive_failures = 0;
                    enrollment.status = EnrollmentStatus::Active;
                    enrollment.wait_until = None;

                    let target = match branch {
                        Some(label) => graph.resolve_branch(&step_id, &label),
                        None => graph.next_target(&step_id).cloned(),
                    };
                    match target {
                        Some(StepTarget::Step(next_id)) => {
                            self.enter_step(&enrollment, &next_id).await;
                            enrollment.current_step_id = Some(next_id);
                            // Same-tick advancement continues.
                        }
                        Some(StepTarget::End) | None => {
                            complete(&mut enrollment, now);
                            break Processed::Completed;
                        }
                    }
                }
                Outcome::Finish { reason } => {
                    if let Some(reason) = reason {
                        tracing::debug!(
                            enrollment_id = %enrollment.id,
                            step_id = step_id.as_str(),
                            reason = reason.as_str(),
                            "enrollment finished early"
                        );
                    }
                    complete(&mut enrollment, now);
                    break Processed::Completed;
                }
                Outcome::Wait { until } => {
                    enrollment.status = EnrollmentStatus::Waiting;
                    enrollment.wait_until = Some(until);
                    break Processed::Waiting;
                }
                Outcome::Fail {
                    error,
                    transient,
                    variables,
                } => {
                    merge_variables(&mut enrollment, variables);
                    if transient
                        && enrollment.consecutive_failures + 1 < self.config.max_transient_failures
                    {
                        // Leave the enrollment Active and unclaimed; the
                        // next tick retries the same step.
                        enrollment.consecutive_failures += 1;
                        enrollment.status = EnrollmentStatus::Active;
                        tracing::warn!(
                            enrollment_id = %enrollment.id,
                            step_id = step_id.as_str(),
                            failures = enrollment.consecutive_failures,
                            error = error.as_str(),
                            "transient step failure, will retry next tick"
                        );
                        break Processed::Retrying;
                    }
                    fail_terminal(&mut enrollment, &error, now);
                    break Processed::Failed;
                }
            }
        };

        self.persist(&enrollment, expected_version, now).await?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn graph_for(&self, flow: &FlowDefinition) -> Result<Arc<StepGraph>, FlowError> {
        let key = (flow.id, flow.version);
        if let Some(graph) = self.graphs.get(&key) {
            return Ok(graph.clone());
        }
        let graph = Arc::new(StepGraph::normalize(flow)?);
        self.graphs.insert(key, graph.clone());
        Ok(graph)
    }

    async fn persist(
        &self,
        enrollment: &Enrollment,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut updated = enrollment.clone();
        updated.updated_at = now;
        let stored = self.enrollments.update(&updated, expected_version).await?;
        if !stored {
            // A pause or another worker got there first; the appended
            // events stand, the state change is theirs.
            tracing::warn!(
                enrollment_id = %enrollment.id,
                expected_version,
                "stale write discarded (version conflict)"
            );
        }
        Ok(())
    }

    async fn enter_step(&self, enrollment: &Enrollment, step_id: &str) {
        let event = EnrollmentEvent::new(enrollment.id, step_id, EventType::Entered, None);
        if let Err(error) = self.enrollments.record_event(&event).await {
            tracing::warn!(enrollment_id = %enrollment.id, %error, "failed to record event");
        }
    }

    async fn record_attempt(&self, enrollment: &Enrollment, step_id: &str, outcome: &Outcome) {
        let event_type = match outcome {
            Outcome::Fail { .. } => EventType::Failed,
            _ => EventType::Exited,
        };
        let event =
            EnrollmentEvent::new(enrollment.id, step_id, event_type, Some(outcome.to_value()));
        if let Err(error) = self.enrollments.record_event(&event).await {
            tracing::warn!(enrollment_id = %enrollment.id, %error, "failed to record event");
        }
    }
}

fn complete(enrollment: &mut Enrollment, now: DateTime<Utc>) {
    enrollment.status = EnrollmentStatus::Completed;
    enrollment.completed_at = Some(now);
    enrollment.wait_until = None;
}

fn fail_terminal(enrollment: &mut Enrollment, reason: &str, now: DateTime<Utc>) {
    tracing::warn!(
        enrollment_id = %enrollment.id,
        reason,
        "enrollment failed terminally"
    );
    enrollment.status = EnrollmentStatus::Failed;
    enrollment.failure_reason = Some(reason.to_string());
    enrollment.failed_at = Some(now);
    enrollment.wait_until = None;
}

/// Append/overwrite variables; existing keys are never deleted.
fn merge_variables(enrollment: &mut Enrollment, patch: Option<Map<String, Value>>) {
    if let Some(patch) = patch {
        for (key, value) in patch {
            enrollment.variables.insert(key, value);
        }
    }
}

fn apply_sent_message(enrollment: &mut Enrollment, message: Option<SentMessage>) {
    let Some(message) = message else {
        return;
    };
    enrollment.thread_id = Some(message.thread_id);
    enrollment.last_message_id = Some(message.message_id);
    enrollment.last_message_sent_at = Some(message.sent_at);
    if enrollment.thread_subject.is_none() {
        enrollment.thread_subject = message.thread_subject;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
