//! Trigger evaluation: which subjects newly satisfy a flow's entry
//! condition on this tick.
//!
//! Every variant excludes subjects already enrolled in the flow, and
//! enrollment creation is an upsert-or-skip, so firing the evaluator twice
//! against an unchanged subject set never produces two enrollments for the
//! same (flow, subject) pair.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use dripline_types::enrollment::Enrollment;
use dripline_types::error::RepositoryError;
use dripline_types::flow::{FlowDefinition, TriggerConfig};

use crate::collaborator::{CollaboratorError, SegmentCollaborator};
use crate::repository::enrollment::EnrollmentRepository;
use crate::repository::subject::SubjectRepository;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors during trigger evaluation.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("segment evaluation failed: {0}")]
    Segment(#[from] CollaboratorError),
}

// ---------------------------------------------------------------------------
// TriggerEvaluator
// ---------------------------------------------------------------------------

/// Evaluates a flow's entry condition against the subject store.
pub struct TriggerEvaluator<E: EnrollmentRepository, S: SubjectRepository> {
    enrollments: Arc<E>,
    subjects: Arc<S>,
    segments: Arc<dyn SegmentCollaborator>,
    /// Cap on candidates considered per flow per tick; the rest are picked
    /// up by later ticks as long as they stay inside the trigger window.
    candidate_limit: u32,
}

impl<E: EnrollmentRepository, S: SubjectRepository> TriggerEvaluator<E, S> {
    pub fn new(
        enrollments: Arc<E>,
        subjects: Arc<S>,
        segments: Arc<dyn SegmentCollaborator>,
        candidate_limit: u32,
    ) -> Self {
        Self {
            enrollments,
            subjects,
            segments,
            candidate_limit,
        }
    }

    /// Subject ids that newly satisfy the flow's trigger, excluding anyone
    /// already enrolled.
    pub async fn evaluate(
        &self,
        flow: &FlowDefinition,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, TriggerError> {
        let candidates = match &flow.trigger {
            TriggerConfig::NewSubject { lookback_minutes } => {
                self.subjects
                    .created_since(now - Duration::minutes(*lookback_minutes), self.candidate_limit)
                    .await?
            }
            TriggerConfig::AttributeSegment {
                segment_id,
                lookback_minutes,
            } => {
                let touched = self
                    .subjects
                    .touched_since(now - Duration::minutes(*lookback_minutes), self.candidate_limit)
                    .await?;
                let mut matched = Vec::new();
                for subject_id in touched {
                    if self.segments.matches(subject_id, *segment_id).await? {
                        matched.push(subject_id);
                    }
                }
                matched
            }
            TriggerConfig::ScheduledDate {
                attribute,
                offset_days,
                window_minutes,
            } => {
                let center = now + Duration::days(*offset_days);
                let window = Duration::minutes(*window_minutes);
                self.subjects
                    .with_date_attribute_between(
                        attribute,
                        center - window,
                        center + window,
                        self.candidate_limit,
                    )
                    .await?
            }
            // External enrollments arrive through the webhook ingestion
            // path, manual ones through the admin API; neither polls.
            TriggerConfig::External {} | TriggerConfig::Manual {} => return Ok(Vec::new()),
        };

        Ok(self
            .enrollments
            .filter_unenrolled(&flow.id, &candidates)
            .await?)
    }

    /// Evaluate the trigger and create enrollments for the matches. Returns
    /// the number actually created; racing ticks lose the upsert and count
    /// zero.
    pub async fn evaluate_and_enroll(
        &self,
        flow: &FlowDefinition,
        now: DateTime<Utc>,
    ) -> Result<usize, TriggerError> {
        let subject_ids = self.evaluate(flow, now).await?;
        let mut created = 0;
        for subject_id in subject_ids {
            let enrollment = Enrollment::new(flow.id, subject_id, now);
            if self.enrollments.create(&enrollment).await? {
                created += 1;
            }
        }
        if created > 0 {
            tracing::info!(
                flow_id = %flow.id,
                flow = flow.name.as_str(),
                created,
                "trigger created enrollments"
            );
        }
        Ok(created)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{
        MemEnrollments, MemSegments, MemSubjects, linear_flow_with_trigger, message_step,
    };
    use serde_json::json;

    fn evaluator(
        enrollments: Arc<MemEnrollments>,
        subjects: Arc<MemSubjects>,
        segments: Arc<MemSegments>,
    ) -> TriggerEvaluator<MemEnrollments, MemSubjects> {
        TriggerEvaluator::new(enrollments, subjects, segments, 500)
    }

    #[tokio::test]
    async fn new_subject_trigger_enrolls_recent_subjects_once() {
        let enrollments = Arc::new(MemEnrollments::default());
        let subjects = Arc::new(MemSubjects::default());
        let segments = Arc::new(MemSegments::default());
        let now = Utc::now();

        let recent = subjects.seed("new@example.com", json!({}));
        let _old = subjects.seed_at("old@example.com", json!({}), now - Duration::hours(5));

        let flow = linear_flow_with_trigger(
            vec![message_step("m1", "Hi", "Hello")],
            TriggerConfig::NewSubject {
                lookback_minutes: 60,
            },
        );

        let eval = evaluator(enrollments.clone(), subjects, segments);
        assert_eq!(eval.evaluate_and_enroll(&flow, now).await.unwrap(), 1);
        let enrolled = enrollments.find(&flow.id, &recent.id).await.unwrap();
        assert!(enrolled.is_some());

        // Idempotent firing: an unchanged subject set creates nothing new.
        assert_eq!(eval.evaluate_and_enroll(&flow, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn segment_trigger_consults_collaborator() {
        let enrollments = Arc::new(MemEnrollments::default());
        let subjects = Arc::new(MemSubjects::default());
        let segments = Arc::new(MemSegments::default());
        let now = Utc::now();

        let matching = subjects.seed("pro@example.com", json!({ "plan": "pro" }));
        let _other = subjects.seed("basic@example.com", json!({ "plan": "basic" }));

        let segment_id = Uuid::now_v7();
        segments.set_match(matching.id, segment_id);

        let flow = linear_flow_with_trigger(
            vec![message_step("m1", "Hi", "Hello")],
            TriggerConfig::AttributeSegment {
                segment_id,
                lookback_minutes: 60,
            },
        );

        let eval = evaluator(enrollments, subjects, segments);
        let ids = eval.evaluate(&flow, now).await.unwrap();
        assert_eq!(ids, vec![matching.id]);
    }

    #[tokio::test]
    async fn scheduled_date_trigger_uses_symmetric_window() {
        let enrollments = Arc::new(MemEnrollments::default());
        let subjects = Arc::new(MemSubjects::default());
        let segments = Arc::new(MemSegments::default());
        let now = Utc::now();

        // Renewal in exactly 7 days: inside the window of a +7d trigger.
        let due = subjects.seed(
            "due@example.com",
            json!({ "renewal_date": (now + Duration::days(7)).to_rfc3339() }),
        );
        let _far = subjects.seed(
            "far@example.com",
            json!({ "renewal_date": (now + Duration::days(30)).to_rfc3339() }),
        );
        let _bad = subjects.seed("bad@example.com", json!({ "renewal_date": "soon" }));

        let flow = linear_flow_with_trigger(
            vec![message_step("m1", "Renewal", "Coming up")],
            TriggerConfig::ScheduledDate {
                attribute: "renewal_date".to_string(),
                offset_days: 7,
                window_minutes: 30,
            },
        );

        let eval = evaluator(enrollments, subjects, segments);
        let ids = eval.evaluate(&flow, now).await.unwrap();
        assert_eq!(ids, vec![due.id]);
    }

    #[tokio::test]
    async fn external_and_manual_triggers_never_fire() {
        let enrollments = Arc::new(MemEnrollments::default());
        let subjects = Arc::new(MemSubjects::default());
        let segments = Arc::new(MemSegments::default());
        subjects.seed("someone@example.com", json!({}));

        let eval = evaluator(enrollments, subjects, segments);
        for trigger in [TriggerConfig::External {}, TriggerConfig::Manual {}] {
            let flow =
                linear_flow_with_trigger(vec![message_step("m1", "Hi", "Hello")], trigger);
            assert!(eval.evaluate(&flow, Utc::now()).await.unwrap().is_empty());
        }
    }
}
