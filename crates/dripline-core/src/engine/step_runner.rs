//! Step processors for the five dispatchable step kinds.
//!
//! `StepRunner` dispatches on the step's `StepConfig` variant and returns an
//! `Outcome`. Processor errors never escape this module: `run` converts
//! every error into `Outcome::Fail`, classified transient or permanent for
//! the executor's retry policy. Processors are stateless; every call gets
//! its inputs through `StepContext`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use thiserror::Error;
use uuid::Uuid;

use dripline_types::enrollment::Enrollment;
use dripline_types::error::RepositoryError;
use dripline_types::flow::{ActionOp, ConditionSpec, DelaySpec, EngagementPredicate, StepConfig, ValueSource};
use dripline_types::subject::{EngagementKind, OutgoingMessage, Subject};

use crate::collaborator::{
    CollaboratorError, EngagementQuery, EngagementSource, HttpCallRequest, HttpCaller,
    MessagingCollaborator,
};
use crate::flow::graph::{NormalizedStep, StepGraph};
use crate::repository::flow::FlowRepository;
use crate::repository::subject::SubjectRepository;

use super::outcome::{Outcome, SentMessage};
use super::predicate::compare;
use super::template::{path_lookup, resolve_template};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Free-text subject fields an Action step may overwrite.
pub const FIELD_ALLOW_LIST: &[&str] = &["first_name", "last_name", "company", "phone", "notes"];

/// Default ExternalCall timeout when the step does not set one.
pub const DEFAULT_EXTERNAL_CALL_TIMEOUT_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Everything a processor needs for one attempt.
pub struct StepContext<'a> {
    pub enrollment: &'a Enrollment,
    pub step: &'a NormalizedStep,
    pub graph: &'a StepGraph,
    pub subject: &'a Subject,
    pub now: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Internal processor errors; `run` folds these into `Outcome::Fail`.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("missing required config: {0}")]
    MissingConfig(String),

    #[error("message template {0} not found")]
    TemplateNotFound(Uuid),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("{0}")]
    Collaborator(#[from] CollaboratorError),
}

impl StepError {
    fn is_transient(&self) -> bool {
        match self {
            StepError::Repository(_) => true,
            StepError::Collaborator(e) => e.is_transient(),
            StepError::MissingConfig(_) | StepError::TemplateNotFound(_) => false,
        }
    }

    fn into_outcome(self) -> Outcome {
        Outcome::Fail {
            transient: self.is_transient(),
            error: self.to_string(),
            variables: None,
        }
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Dispatches step execution to the handler for the step's kind.
pub struct StepRunner<F: FlowRepository, S: SubjectRepository> {
    flows: Arc<F>,
    subjects: Arc<S>,
    messaging: Arc<dyn MessagingCollaborator>,
    engagement: Arc<dyn EngagementSource>,
    http: Arc<dyn HttpCaller>,
    /// Upper bound on any ExternalCall timeout, whatever the step asks for.
    external_call_timeout_cap: Duration,
}

impl<F: FlowRepository, S: SubjectRepository> StepRunner<F, S> {
    pub fn new(
        flows: Arc<F>,
        subjects: Arc<S>,
        messaging: Arc<dyn MessagingCollaborator>,
        engagement: Arc<dyn EngagementSource>,
        http: Arc<dyn HttpCaller>,
        external_call_timeout_cap: Duration,
    ) -> Self {
        Self {
            flows,
            subjects,
            messaging,
            engagement,
            http,
            external_call_timeout_cap,
        }
    }

    /// Run one step attempt. Never returns an error: failures come back as
    /// `Outcome::Fail` so the executor is the single point that persists
    /// them.
    pub async fn run(&self, ctx: &StepContext<'_>) -> Outcome {
        let result = match &ctx.step.config {
            // Entry pseudo-step; nothing to do.
            StepConfig::Trigger {} => Ok(Outcome::advance()),
            StepConfig::Message {
                subject,
                body,
                template_id,
                continue_thread,
                send_only_if_no_reply,
                skip_if_opened,
            } => {
                self.run_message(
                    ctx,
                    subject,
                    body,
                    template_id.as_ref(),
                    *continue_thread,
                    *send_only_if_no_reply,
                    *skip_if_opened,
                )
                .await
            }
            StepConfig::Delay { delay } => Ok(run_delay(ctx, delay)),
            StepConfig::Condition { condition, .. } => self.run_condition(ctx, condition).await,
            StepConfig::Action { action } => self.run_action(ctx, action).await,
            StepConfig::ExternalCall {
                method,
                url,
                headers,
                body,
                response_variable,
                timeout_secs,
            } => {
                self.run_external_call(
                    ctx,
                    method,
                    url,
                    headers,
                    body.as_deref(),
                    response_variable,
                    *timeout_secs,
                )
                .await
            }
        };

        match result {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    enrollment_id = %ctx.enrollment.id,
                    step_id = ctx.step.id.as_str(),
                    error = %err,
                    "step attempt failed"
                );
                err.into_outcome()
            }
        }
    }

    // -----------------------------------------------------------------------
    // Message
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_message(
        &self,
        ctx: &StepContext<'_>,
        subject_line: &str,
        body: &str,
        template_id: Option<&Uuid>,
        continue_thread: bool,
        send_only_if_no_reply: bool,
        skip_if_opened: bool,
    ) -> Result<Outcome, StepError> {
        // Send-suppression checks run before any content work. A reply
        // completes the enrollment; an open skips just this step.
        if send_only_if_no_reply
            && self
                .engaged_since_start(ctx, EngagementKind::Replied)
                .await?
        {
            return Ok(Outcome::Finish {
                reason: Some("suppressed: subject replied since flow start".to_string()),
            });
        }
        if skip_if_opened
            && self
                .engaged_since_start(ctx, EngagementKind::Opened)
                .await?
        {
            tracing::debug!(
                enrollment_id = %ctx.enrollment.id,
                step_id = ctx.step.id.as_str(),
                "subject already opened, skipping send"
            );
            return Ok(Outcome::skip());
        }

        let (raw_subject, raw_body) = match template_id {
            Some(id) => {
                let template = self
                    .flows
                    .get_template(id)
                    .await?
                    .ok_or(StepError::TemplateNotFound(*id))?;
                (template.subject, template.body)
            }
            None => (subject_line.to_string(), body.to_string()),
        };

        let resolved_subject = resolve_template(&raw_subject, ctx.subject, &ctx.enrollment.variables);
        let resolved_body = resolve_template(&raw_body, ctx.subject, &ctx.enrollment.variables);

        // Continue the conversation only when the step asks for it and a
        // thread already exists.
        let existing_thread = continue_thread
            .then(|| ctx.enrollment.thread_id.clone())
            .flatten();
        let (thread_id, reply_to, final_subject) = if let Some(thread_id) = existing_thread {
            // Recover the originating message id from the provider when the
            // cached pointer is missing. A null thread context means "no
            // history available" and the send proceeds without a reply
            // header.
            let mut last_message_id = ctx.enrollment.last_message_id.clone();
            if last_message_id.is_none() {
                if let Some(history) = self
                    .messaging
                    .fetch_thread_context(ctx.subject.id, &thread_id)
                    .await?
                {
                    last_message_id = history.last_message_id;
                }
            }

            let reply_to = match &last_message_id {
                Some(message_id) => {
                    self.messaging
                        .resolve_message_identifier_header(ctx.subject.id, message_id)
                        .await?
                }
                None => None,
            };

            // The reply subject derives from the thread's first subject so
            // the whole conversation stays under one subject line.
            let base = ctx
                .enrollment
                .thread_subject
                .clone()
                .unwrap_or_else(|| resolved_subject.clone());
            (Some(thread_id), reply_to, reply_subject(&base))
        } else {
            (None, None, resolved_subject.clone())
        };

        let receipt = self
            .messaging
            .send_message(OutgoingMessage {
                subject_id: ctx.subject.id,
                subject: final_subject,
                body: resolved_body,
                thread_id,
                reply_to_message_id: reply_to,
            })
            .await?;

        tracing::info!(
            enrollment_id = %ctx.enrollment.id,
            step_id = ctx.step.id.as_str(),
            message_id = receipt.message_id.as_str(),
            thread_id = receipt.thread_id.as_str(),
            "message sent"
        );

        let thread_subject = ctx
            .enrollment
            .thread_subject
            .is_none()
            .then(|| resolved_subject);

        Ok(Outcome::Advance {
            branch: None,
            variables: None,
            message: Some(SentMessage {
                message_id: receipt.message_id,
                thread_id: receipt.thread_id,
                sent_at: ctx.now,
                thread_subject,
            }),
            skipped: false,
        })
    }

    async fn engaged_since_start(
        &self,
        ctx: &StepContext<'_>,
        kind: EngagementKind,
    ) -> Result<bool, StepError> {
        Ok(self
            .engagement
            .has_engagement(EngagementQuery {
                enrollment_id: ctx.enrollment.id,
                step_id: None,
                kind,
                since: Some(ctx.enrollment.created_at),
            })
            .await?)
    }

    // -----------------------------------------------------------------------
    // Condition
    // -----------------------------------------------------------------------

    async fn run_condition(
        &self,
        ctx: &StepContext<'_>,
        spec: &ConditionSpec,
    ) -> Result<Outcome, StepError> {
        let verdict = match spec {
            ConditionSpec::Comparison {
                source,
                operator,
                value,
            } => {
                let actual: Option<Value> = match source {
                    ValueSource::Attribute { field } => {
                        if field == "email" {
                            Some(Value::String(ctx.subject.email.clone()))
                        } else {
                            path_lookup(&ctx.subject.attributes, field).cloned()
                        }
                    }
                    ValueSource::Variable { path } => {
                        path_lookup(&ctx.enrollment.variables, path).cloned()
                    }
                    ValueSource::Literal { value } => Some(value.clone()),
                };
                compare(*operator, actual.as_ref(), value)
            }
            ConditionSpec::Engagement {
                predicate,
                reference_step,
            } => {
                let reference = reference_step
                    .as_deref()
                    .or_else(|| ctx.graph.default_reference_step(&ctx.step.id));
                match reference {
                    // No message to correlate against: the predicate is false.
                    None => false,
                    Some(step_id) => self.engagement_verdict(ctx, *predicate, step_id).await?,
                }
            }
        };

        tracing::debug!(
            enrollment_id = %ctx.enrollment.id,
            step_id = ctx.step.id.as_str(),
            verdict,
            "condition evaluated"
        );

        Ok(Outcome::advance_branch(if verdict { "true" } else { "false" }))
    }

    async fn engagement_verdict(
        &self,
        ctx: &StepContext<'_>,
        predicate: EngagementPredicate,
        step_id: &str,
    ) -> Result<bool, StepError> {
        let has = |kind: EngagementKind| {
            self.engagement.has_engagement(EngagementQuery {
                enrollment_id: ctx.enrollment.id,
                step_id: Some(step_id.to_string()),
                kind,
                since: None,
            })
        };

        use EngagementKind::{Clicked, Opened, Replied};
        Ok(match predicate {
            EngagementPredicate::Opened => has(Opened).await?,
            EngagementPredicate::NotOpened => !has(Opened).await?,
            EngagementPredicate::Clicked => has(Clicked).await?,
            EngagementPredicate::NotClicked => !has(Clicked).await?,
            EngagementPredicate::Replied => has(Replied).await?,
            EngagementPredicate::NotReplied => !has(Replied).await?,
            EngagementPredicate::OpenedNoReply => has(Opened).await? && !has(Replied).await?,
            EngagementPredicate::OpenedNoClick => has(Opened).await? && !has(Clicked).await?,
            EngagementPredicate::ClickedNoReply => has(Clicked).await? && !has(Replied).await?,
        })
    }

    // -----------------------------------------------------------------------
    // Action
    // -----------------------------------------------------------------------

    async fn run_action(
        &self,
        ctx: &StepContext<'_>,
        action: &ActionOp,
    ) -> Result<Outcome, StepError> {
        match action {
            ActionOp::AddTag { tag } => self.subjects.add_tag(&ctx.subject.id, tag).await?,
            ActionOp::RemoveTag { tag } => self.subjects.remove_tag(&ctx.subject.id, tag).await?,
            ActionOp::AddToList { list_id } => {
                self.subjects.add_to_list(&ctx.subject.id, list_id).await?
            }
            ActionOp::RemoveFromList { list_id } => {
                self.subjects
                    .remove_from_list(&ctx.subject.id, list_id)
                    .await?
            }
            ActionOp::SetField { field, value } => {
                if !FIELD_ALLOW_LIST.contains(&field.as_str()) {
                    return Err(StepError::MissingConfig(format!(
                        "field '{field}' is not updatable"
                    )));
                }
                let resolved = resolve_template(value, ctx.subject, &ctx.enrollment.variables);
                self.subjects
                    .set_field(&ctx.subject.id, field, &resolved)
                    .await?;
            }
        }
        Ok(Outcome::advance())
    }

    // -----------------------------------------------------------------------
    // ExternalCall
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_external_call(
        &self,
        ctx: &StepContext<'_>,
        method: &str,
        url: &str,
        headers: &std::collections::HashMap<String, String>,
        body: Option<&str>,
        response_variable: &str,
        timeout_secs: Option<u64>,
    ) -> Result<Outcome, StepError> {
        let resolve = |s: &str| resolve_template(s, ctx.subject, &ctx.enrollment.variables);

        let request = HttpCallRequest {
            method: method.to_ascii_uppercase(),
            url: resolve(url),
            headers: headers
                .iter()
                .map(|(k, v)| (k.clone(), resolve(v)))
                .collect(),
            body: body.map(resolve),
            timeout: Duration::from_secs(
                timeout_secs.unwrap_or(DEFAULT_EXTERNAL_CALL_TIMEOUT_SECS),
            )
            .min(self.external_call_timeout_cap),
        };

        match self.http.call(request).await {
            Ok(response) => {
                let mut variables = Map::new();
                variables.insert(
                    response_variable.to_string(),
                    serde_json::to_value(&response).unwrap_or(Value::Null),
                );
                Ok(Outcome::Advance {
                    branch: None,
                    variables: Some(variables),
                    message: None,
                    skipped: false,
                })
            }
            Err(err) => {
                // Store an error marker in the same variable slot so later
                // steps can observe the failure, then fail the attempt.
                let mut variables = Map::new();
                variables.insert(
                    response_variable.to_string(),
                    json!({ "error": err.to_string() }),
                );
                Ok(Outcome::Fail {
                    error: format!("external call failed: {err}"),
                    transient: err.is_transient(),
                    variables: Some(variables),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// Delay evaluation, anchored to the enrollment's last completed action.
///
/// Anchoring makes re-evaluating an already-elapsed delay idempotent: the
/// same enrollment evaluated again after the wait produces an advance, not
/// a second wait.
fn run_delay(ctx: &StepContext<'_>, delay: &DelaySpec) -> Outcome {
    let duration = delay.as_duration();
    if duration <= chrono::Duration::zero() {
        return Outcome::advance();
    }
    let until = ctx.enrollment.delay_anchor() + duration;
    if until <= ctx.now {
        Outcome::advance()
    } else {
        Outcome::Wait { until }
    }
}

/// Prefix a reply marker unless the base subject already carries one.
fn reply_subject(base: &str) -> String {
    if base.trim_start().to_lowercase().starts_with("re:") {
        base.to_string()
    } else {
        format!("Re: {base}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{
        MemEngagement, MemFlows, MemHttp, MemMessaging, MemSubjects, linear_flow, message_step,
    };
    use crate::flow::graph::StepGraph;
    use chrono::Duration as ChronoDuration;
    use dripline_types::flow::{DelayUnit, StepDefinition};

    fn runner(
        flows: Arc<MemFlows>,
        subjects: Arc<MemSubjects>,
        messaging: Arc<MemMessaging>,
        engagement: Arc<MemEngagement>,
        http: Arc<MemHttp>,
    ) -> StepRunner<MemFlows, MemSubjects> {
        StepRunner::new(
            flows,
            subjects,
            messaging,
            engagement,
            http,
            Duration::from_secs(30),
        )
    }

    struct Fixture {
        flows: Arc<MemFlows>,
        subjects: Arc<MemSubjects>,
        messaging: Arc<MemMessaging>,
        engagement: Arc<MemEngagement>,
        http: Arc<MemHttp>,
        graph: StepGraph,
        subject: Subject,
        enrollment: Enrollment,
    }

    fn fixture(steps: Vec<StepDefinition>) -> Fixture {
        let flow = linear_flow(steps);
        let graph = StepGraph::normalize(&flow).unwrap();
        let subjects = Arc::new(MemSubjects::default());
        let subject = subjects.seed("ada@example.com", json!({ "first_name": "Ada" }));
        let enrollment = Enrollment::new(flow.id, subject.id, Utc::now());
        Fixture {
            flows: Arc::new(MemFlows::default()),
            subjects,
            messaging: Arc::new(MemMessaging::default()),
            engagement: Arc::new(MemEngagement::default()),
            http: Arc::new(MemHttp::default()),
            graph,
            subject,
            enrollment,
        }
    }

    fn ctx<'a>(f: &'a Fixture, step_id: &str, now: DateTime<Utc>) -> StepContext<'a> {
        StepContext {
            enrollment: &f.enrollment,
            step: f.graph.step(step_id).unwrap(),
            graph: &f.graph,
            subject: &f.subject,
            now,
        }
    }

    // -------------------------------------------------------------------
    // Message
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn message_substitutes_and_sends() {
        let f = fixture(vec![message_step("m1", "Welcome {{first_name}}", "Hi {{first_name}}!")]);
        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );

        let outcome = r.run(&ctx(&f, "m1", Utc::now())).await;
        let Outcome::Advance { message: Some(sent), .. } = outcome else {
            panic!("expected advance with message, got {outcome:?}");
        };
        assert_eq!(sent.thread_subject.as_deref(), Some("Welcome Ada"));

        let deliveries = f.messaging.sent();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].subject, "Welcome Ada");
        assert_eq!(deliveries[0].body, "Hi Ada!");
        assert!(deliveries[0].thread_id.is_none());
    }

    #[tokio::test]
    async fn message_reply_threads_under_first_subject() {
        let mut f = fixture(vec![{
            let mut step = message_step("m2", "Totally different", "Ping");
            if let StepConfig::Message {
                continue_thread, ..
            } = &mut step.config
            {
                *continue_thread = true;
            }
            step
        }]);
        f.enrollment.thread_id = Some("thread-1".to_string());
        f.enrollment.thread_subject = Some("Welcome Ada".to_string());
        f.enrollment.last_message_id = Some("msg-1".to_string());

        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );
        let outcome = r.run(&ctx(&f, "m2", Utc::now())).await;
        assert!(matches!(outcome, Outcome::Advance { message: Some(_), .. }));

        let deliveries = f.messaging.sent();
        assert_eq!(deliveries[0].subject, "Re: Welcome Ada");
        assert_eq!(deliveries[0].thread_id.as_deref(), Some("thread-1"));
        assert_eq!(
            deliveries[0].reply_to_message_id.as_deref(),
            Some("hdr-msg-1")
        );
    }

    #[tokio::test]
    async fn message_suppressed_by_reply_finishes_enrollment() {
        let f = fixture(vec![{
            let mut step = message_step("m1", "Hi", "Hello");
            if let StepConfig::Message {
                send_only_if_no_reply,
                ..
            } = &mut step.config
            {
                *send_only_if_no_reply = true;
            }
            step
        }]);
        f.engagement
            .record(f.enrollment.id, "earlier", EngagementKind::Replied, Utc::now());

        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );
        let outcome = r.run(&ctx(&f, "m1", Utc::now())).await;
        assert!(matches!(outcome, Outcome::Finish { .. }), "got {outcome:?}");
        assert!(f.messaging.sent().is_empty(), "nothing may be sent");
    }

    #[tokio::test]
    async fn message_skipped_by_open_advances_without_sending() {
        let f = fixture(vec![{
            let mut step = message_step("m1", "Hi", "Hello");
            if let StepConfig::Message { skip_if_opened, .. } = &mut step.config {
                *skip_if_opened = true;
            }
            step
        }]);
        f.engagement
            .record(f.enrollment.id, "earlier", EngagementKind::Opened, Utc::now());

        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );
        let outcome = r.run(&ctx(&f, "m1", Utc::now())).await;
        assert!(
            matches!(outcome, Outcome::Advance { skipped: true, message: None, .. }),
            "got {outcome:?}"
        );
        assert!(f.messaging.sent().is_empty());
    }

    #[tokio::test]
    async fn message_send_failure_is_transient_fail() {
        let f = fixture(vec![message_step("m1", "Hi", "Hello")]);
        f.messaging.fail_with("smtp 451 temporary");

        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );
        let outcome = r.run(&ctx(&f, "m1", Utc::now())).await;
        let Outcome::Fail { transient, error, .. } = outcome else {
            panic!("expected fail, got {outcome:?}");
        };
        assert!(transient);
        assert!(error.contains("smtp 451"));
    }

    // -------------------------------------------------------------------
    // Delay
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn delay_waits_then_advances_idempotently() {
        let f = fixture(vec![StepDefinition {
            id: "wait".to_string(),
            name: "wait".to_string(),
            config: StepConfig::Delay {
                delay: DelaySpec::Interval {
                    amount: 1,
                    unit: DelayUnit::Days,
                },
            },
            next_step_id: None,
        }]);
        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );

        let anchor = f.enrollment.delay_anchor();

        // At the anchor and at half the delay: still waiting, same deadline.
        for offset in [ChronoDuration::zero(), ChronoDuration::hours(12)] {
            let outcome = r.run(&ctx(&f, "wait", anchor + offset)).await;
            let Outcome::Wait { until } = outcome else {
                panic!("expected wait at +{offset}, got {outcome:?}");
            };
            assert_eq!(until, anchor + ChronoDuration::days(1));
        }

        // At (and past) the full delay: advance.
        let outcome = r.run(&ctx(&f, "wait", anchor + ChronoDuration::days(1))).await;
        assert!(matches!(outcome, Outcome::Advance { .. }), "got {outcome:?}");
    }

    #[tokio::test]
    async fn zero_delay_is_a_noop() {
        let f = fixture(vec![StepDefinition {
            id: "wait".to_string(),
            name: "wait".to_string(),
            config: StepConfig::Delay {
                delay: DelaySpec::Fixed {
                    days: 0,
                    hours: 0,
                    minutes: 0,
                },
            },
            next_step_id: None,
        }]);
        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );
        let outcome = r.run(&ctx(&f, "wait", Utc::now())).await;
        assert!(matches!(outcome, Outcome::Advance { .. }));
    }

    // -------------------------------------------------------------------
    // Condition
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn condition_compares_subject_attribute() {
        let f = fixture(vec![StepDefinition {
            id: "check".to_string(),
            name: "check".to_string(),
            config: StepConfig::Condition {
                condition: ConditionSpec::Comparison {
                    source: ValueSource::Attribute {
                        field: "first_name".to_string(),
                    },
                    operator: dripline_types::flow::CompareOp::Equals,
                    value: json!("ada"),
                },
                true_branch: vec![],
                false_branch: vec![],
            },
            next_step_id: None,
        }]);
        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );
        let outcome = r.run(&ctx(&f, "check", Utc::now())).await;
        assert!(
            matches!(outcome, Outcome::Advance { branch: Some(ref b), .. } if b == "true"),
            "got {outcome:?}"
        );
    }

    #[tokio::test]
    async fn condition_engagement_defaults_to_preceding_message() {
        let f = fixture(vec![
            message_step("m1", "Hi", "Hello"),
            StepDefinition {
                id: "check".to_string(),
                name: "check".to_string(),
                config: StepConfig::Condition {
                    condition: ConditionSpec::Engagement {
                        predicate: EngagementPredicate::Opened,
                        reference_step: None,
                    },
                    true_branch: vec![],
                    false_branch: vec![],
                },
                next_step_id: None,
            },
        ]);
        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );

        // No engagement yet: false.
        let outcome = r.run(&ctx(&f, "check", Utc::now())).await;
        assert!(matches!(outcome, Outcome::Advance { branch: Some(ref b), .. } if b == "false"));

        // An open recorded against m1 flips it.
        f.engagement
            .record(f.enrollment.id, "m1", EngagementKind::Opened, Utc::now());
        let outcome = r.run(&ctx(&f, "check", Utc::now())).await;
        assert!(matches!(outcome, Outcome::Advance { branch: Some(ref b), .. } if b == "true"));
    }

    #[tokio::test]
    async fn condition_opened_no_reply_combination() {
        let f = fixture(vec![
            message_step("m1", "Hi", "Hello"),
            StepDefinition {
                id: "check".to_string(),
                name: "check".to_string(),
                config: StepConfig::Condition {
                    condition: ConditionSpec::Engagement {
                        predicate: EngagementPredicate::OpenedNoReply,
                        reference_step: Some("m1".to_string()),
                    },
                    true_branch: vec![],
                    false_branch: vec![],
                },
                next_step_id: None,
            },
        ]);
        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );

        f.engagement
            .record(f.enrollment.id, "m1", EngagementKind::Opened, Utc::now());
        let outcome = r.run(&ctx(&f, "check", Utc::now())).await;
        assert!(matches!(outcome, Outcome::Advance { branch: Some(ref b), .. } if b == "true"));

        f.engagement
            .record(f.enrollment.id, "m1", EngagementKind::Replied, Utc::now());
        let outcome = r.run(&ctx(&f, "check", Utc::now())).await;
        assert!(matches!(outcome, Outcome::Advance { branch: Some(ref b), .. } if b == "false"));
    }

    // -------------------------------------------------------------------
    // Action
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn action_add_tag_is_idempotent() {
        let f = fixture(vec![StepDefinition {
            id: "tag".to_string(),
            name: "tag".to_string(),
            config: StepConfig::Action {
                action: ActionOp::AddTag {
                    tag: "vip".to_string(),
                },
            },
            next_step_id: None,
        }]);
        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );

        for _ in 0..2 {
            let outcome = r.run(&ctx(&f, "tag", Utc::now())).await;
            assert!(matches!(outcome, Outcome::Advance { .. }));
        }
        assert_eq!(f.subjects.tags_of(&f.subject.id), vec!["vip"]);
    }

    #[tokio::test]
    async fn action_set_field_outside_allow_list_fails_permanently() {
        let f = fixture(vec![StepDefinition {
            id: "mutate".to_string(),
            name: "mutate".to_string(),
            config: StepConfig::Action {
                action: ActionOp::SetField {
                    field: "email".to_string(),
                    value: "evil@example.com".to_string(),
                },
            },
            next_step_id: None,
        }]);
        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );
        let outcome = r.run(&ctx(&f, "mutate", Utc::now())).await;
        assert!(
            matches!(outcome, Outcome::Fail { transient: false, .. }),
            "got {outcome:?}"
        );
    }

    // -------------------------------------------------------------------
    // ExternalCall
    // -------------------------------------------------------------------

    fn external_call_step(id: &str) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            config: StepConfig::ExternalCall {
                method: "post".to_string(),
                url: "https://api.example.com/score?email={{email}}".to_string(),
                headers: std::collections::HashMap::new(),
                body: Some(r#"{"name":"{{first_name}}"}"#.to_string()),
                response_variable: "lookup".to_string(),
                timeout_secs: Some(5),
            },
            next_step_id: None,
        }
    }

    #[tokio::test]
    async fn external_call_stores_structured_response() {
        let f = fixture(vec![external_call_step("call")]);
        f.http.respond(200, r#"{"score":7}"#);

        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );
        let outcome = r.run(&ctx(&f, "call", Utc::now())).await;
        let Outcome::Advance { variables: Some(vars), .. } = outcome else {
            panic!("expected advance with variables, got {outcome:?}");
        };
        assert_eq!(vars["lookup"]["status"], json!(200));
        assert_eq!(vars["lookup"]["body"], json!(r#"{"score":7}"#));

        let requests = f.http.requests();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(
            requests[0].url,
            "https://api.example.com/score?email=ada@example.com"
        );
        assert_eq!(requests[0].body.as_deref(), Some(r#"{"name":"Ada"}"#));
    }

    #[tokio::test]
    async fn external_call_failure_stores_error_marker() {
        let f = fixture(vec![external_call_step("call")]);
        f.http.fail_with("connection timed out");

        let r = runner(
            f.flows.clone(),
            f.subjects.clone(),
            f.messaging.clone(),
            f.engagement.clone(),
            f.http.clone(),
        );
        let outcome = r.run(&ctx(&f, "call", Utc::now())).await;
        let Outcome::Fail { transient, variables: Some(vars), .. } = outcome else {
            panic!("expected fail with variables, got {outcome:?}");
        };
        assert!(transient);
        assert!(
            vars["lookup"]["error"]
                .as_str()
                .unwrap()
                .contains("timed out")
        );
    }

    // -------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------

    #[test]
    fn reply_subject_prefixes_once() {
        assert_eq!(reply_subject("Welcome"), "Re: Welcome");
        assert_eq!(reply_subject("Re: Welcome"), "Re: Welcome");
        assert_eq!(reply_subject("re: welcome"), "re: welcome");
    }
}
