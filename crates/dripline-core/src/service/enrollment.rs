//! Enrollment administration service.
//!
//! The thin CRUD surface the UI layer consumes: manual enrollment, bulk
//! enrollment, pause/resume/remove, and status reads. All mutations of a
//! *running* enrollment stay in the execution loop; this service only
//! performs the externally-triggered transitions.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use dripline_types::enrollment::{Enrollment, EnrollmentEvent};
use dripline_types::error::RepositoryError;
use dripline_types::flow::{FlowStats, FlowStatus};

use crate::repository::enrollment::EnrollmentRepository;
use crate::repository::flow::FlowRepository;
use crate::repository::subject::SubjectRepository;

/// Errors from enrollment administration.
#[derive(Debug, Error)]
pub enum EnrollmentServiceError {
    #[error("flow not found")]
    FlowNotFound,

    #[error("flow is not active")]
    FlowNotActive,

    #[error("subject not found")]
    SubjectNotFound,

    #[error("enrollment not found")]
    NotFound,

    #[error("enrollment is not in a {0} state")]
    InvalidTransition(&'static str),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Enrollment administration over the stores.
pub struct EnrollmentService<F, E, S>
where
    F: FlowRepository,
    E: EnrollmentRepository,
    S: SubjectRepository,
{
    flows: Arc<F>,
    enrollments: Arc<E>,
    subjects: Arc<S>,
}

impl<F, E, S> EnrollmentService<F, E, S>
where
    F: FlowRepository,
    E: EnrollmentRepository,
    S: SubjectRepository,
{
    pub fn new(flows: Arc<F>, enrollments: Arc<E>, subjects: Arc<S>) -> Self {
        Self {
            flows,
            enrollments,
            subjects,
        }
    }

    /// Enroll one subject. Idempotent: an existing enrollment for the same
    /// (flow, subject) pair is returned with `created = false`.
    pub async fn enroll(
        &self,
        flow_id: &Uuid,
        subject_id: &Uuid,
    ) -> Result<(Enrollment, bool), EnrollmentServiceError> {
        let flow = self
            .flows
            .get_definition(flow_id)
            .await?
            .ok_or(EnrollmentServiceError::FlowNotFound)?;
        if flow.status != FlowStatus::Active {
            return Err(EnrollmentServiceError::FlowNotActive);
        }
        if self.subjects.get(subject_id).await?.is_none() {
            return Err(EnrollmentServiceError::SubjectNotFound);
        }

        let enrollment = Enrollment::new(*flow_id, *subject_id, Utc::now());
        if self.enrollments.create(&enrollment).await? {
            tracing::info!(
                flow_id = %flow_id,
                subject_id = %subject_id,
                enrollment_id = %enrollment.id,
                "subject enrolled"
            );
            return Ok((enrollment, true));
        }
        let existing = self
            .enrollments
            .find(flow_id, subject_id)
            .await?
            .ok_or(EnrollmentServiceError::NotFound)?;
        Ok((existing, false))
    }

    /// Enroll many subjects; unknown subjects are skipped and counted
    /// separately rather than failing the batch.
    pub async fn bulk_enroll(
        &self,
        flow_id: &Uuid,
        subject_ids: &[Uuid],
    ) -> Result<BulkEnrollOutcome, EnrollmentServiceError> {
        let flow = self
            .flows
            .get_definition(flow_id)
            .await?
            .ok_or(EnrollmentServiceError::FlowNotFound)?;
        if flow.status != FlowStatus::Active {
            return Err(EnrollmentServiceError::FlowNotActive);
        }

        let mut outcome = BulkEnrollOutcome::default();
        for subject_id in subject_ids {
            if self.subjects.get(subject_id).await?.is_none() {
                outcome.unknown_subjects += 1;
                continue;
            }
            let enrollment = Enrollment::new(*flow_id, *subject_id, Utc::now());
            if self.enrollments.create(&enrollment).await? {
                outcome.created += 1;
            } else {
                outcome.already_enrolled += 1;
            }
        }
        tracing::info!(
            flow_id = %flow_id,
            created = outcome.created,
            already_enrolled = outcome.already_enrolled,
            unknown = outcome.unknown_subjects,
            "bulk enrollment"
        );
        Ok(outcome)
    }

    /// Pause: the enrollment leaves the ready set at the next `load_ready`.
    /// An in-flight step runs to completion; its write loses the version
    /// CAS against the pause and is discarded.
    pub async fn pause(&self, id: &Uuid) -> Result<(), EnrollmentServiceError> {
        if self.enrollments.get(id).await?.is_none() {
            return Err(EnrollmentServiceError::NotFound);
        }
        if !self.enrollments.pause(id, Utc::now()).await? {
            return Err(EnrollmentServiceError::InvalidTransition("pausable"));
        }
        Ok(())
    }

    pub async fn resume(&self, id: &Uuid) -> Result<(), EnrollmentServiceError> {
        if self.enrollments.get(id).await?.is_none() {
            return Err(EnrollmentServiceError::NotFound);
        }
        if !self.enrollments.resume(id, Utc::now()).await? {
            return Err(EnrollmentServiceError::InvalidTransition("paused"));
        }
        Ok(())
    }

    pub async fn remove(&self, id: &Uuid) -> Result<(), EnrollmentServiceError> {
        if !self.enrollments.remove(id).await? {
            return Err(EnrollmentServiceError::NotFound);
        }
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> Result<Enrollment, EnrollmentServiceError> {
        self.enrollments
            .get(id)
            .await?
            .ok_or(EnrollmentServiceError::NotFound)
    }

    /// Current status/position for a flow's enrollments.
    pub async fn list_by_flow(
        &self,
        flow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<Enrollment>, EnrollmentServiceError> {
        Ok(self.enrollments.list_by_flow(flow_id, limit).await?)
    }

    pub async fn events(
        &self,
        enrollment_id: &Uuid,
    ) -> Result<Vec<EnrollmentEvent>, EnrollmentServiceError> {
        Ok(self.enrollments.list_events(enrollment_id).await?)
    }

    pub async fn stats(&self, flow_id: &Uuid) -> Result<Option<FlowStats>, EnrollmentServiceError> {
        Ok(self.enrollments.get_stats(flow_id).await?)
    }
}

/// Result of a bulk enrollment request.
#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct BulkEnrollOutcome {
    pub created: usize,
    pub already_enrolled: usize,
    pub unknown_subjects: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{
        MemEnrollments, MemFlows, MemSubjects, linear_flow, message_step,
    };
    use serde_json::json;

    struct Fixture {
        svc: EnrollmentService<MemFlows, MemEnrollments, MemSubjects>,
        flows: Arc<MemFlows>,
        subjects: Arc<MemSubjects>,
    }

    fn fixture() -> Fixture {
        let flows = Arc::new(MemFlows::default());
        let enrollments = Arc::new(MemEnrollments::default());
        let subjects = Arc::new(MemSubjects::default());
        Fixture {
            svc: EnrollmentService::new(flows.clone(), enrollments, subjects.clone()),
            flows,
            subjects,
        }
    }

    #[tokio::test]
    async fn enroll_is_idempotent() {
        let f = fixture();
        let flow = linear_flow(vec![message_step("m1", "Hi", "Hello")]);
        let flow_id = f.flows.seed(flow);
        let subject = f.subjects.seed("ada@example.com", json!({}));

        let (first, created) = f.svc.enroll(&flow_id, &subject.id).await.unwrap();
        assert!(created);
        let (second, created) = f.svc.enroll(&flow_id, &subject.id).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn enroll_requires_active_flow_and_known_subject() {
        let f = fixture();
        let mut flow = linear_flow(vec![message_step("m1", "Hi", "Hello")]);
        flow.status = FlowStatus::Draft;
        let flow_id = f.flows.seed(flow);
        let subject = f.subjects.seed("ada@example.com", json!({}));

        let err = f.svc.enroll(&flow_id, &subject.id).await.unwrap_err();
        assert!(matches!(err, EnrollmentServiceError::FlowNotActive));

        let err = f
            .svc
            .enroll(&Uuid::now_v7(), &subject.id)
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollmentServiceError::FlowNotFound));
    }

    #[tokio::test]
    async fn bulk_enroll_counts_outcomes() {
        let f = fixture();
        let flow = linear_flow(vec![message_step("m1", "Hi", "Hello")]);
        let flow_id = f.flows.seed(flow);
        let a = f.subjects.seed("a@example.com", json!({}));
        let b = f.subjects.seed("b@example.com", json!({}));

        // Enroll `a` ahead of the batch.
        f.svc.enroll(&flow_id, &a.id).await.unwrap();

        let outcome = f
            .svc
            .bulk_enroll(&flow_id, &[a.id, b.id, Uuid::now_v7()])
            .await
            .unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.already_enrolled, 1);
        assert_eq!(outcome.unknown_subjects, 1);
    }

    #[tokio::test]
    async fn pause_resume_transitions() {
        let f = fixture();
        let flow = linear_flow(vec![message_step("m1", "Hi", "Hello")]);
        let flow_id = f.flows.seed(flow);
        let subject = f.subjects.seed("ada@example.com", json!({}));
        let (enrollment, _) = f.svc.enroll(&flow_id, &subject.id).await.unwrap();

        f.svc.pause(&enrollment.id).await.unwrap();
        // Pausing twice is an invalid transition.
        let err = f.svc.pause(&enrollment.id).await.unwrap_err();
        assert!(matches!(err, EnrollmentServiceError::InvalidTransition(_)));

        f.svc.resume(&enrollment.id).await.unwrap();
        let state = f.svc.get(&enrollment.id).await.unwrap();
        assert_eq!(
            state.status,
            dripline_types::enrollment::EnrollmentStatus::Active
        );
    }
}
