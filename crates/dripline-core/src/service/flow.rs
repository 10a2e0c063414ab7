//! Flow lifecycle service.
//!
//! Owns the rules the repositories cannot enforce alone: definitions are
//! validated (and their graphs normalized) at activation time, and a flow
//! with live enrollments can neither be edited nor deleted -- it must be
//! archived and drained first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use dripline_types::error::RepositoryError;
use dripline_types::flow::{FlowDefinition, FlowStatus, MessageTemplate};

use crate::flow::FlowError;
use crate::flow::validate::validate_for_activation;
use crate::repository::enrollment::EnrollmentRepository;
use crate::repository::flow::FlowRepository;

/// Errors from flow administration.
#[derive(Debug, Error)]
pub enum FlowServiceError {
    #[error("flow not found")]
    NotFound,

    /// Validation failure surfaced at activation, never at execution time.
    #[error(transparent)]
    Invalid(#[from] FlowError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Flow administration: save, activate, archive, delete, templates.
pub struct FlowService<F: FlowRepository, E: EnrollmentRepository> {
    flows: Arc<F>,
    enrollments: Arc<E>,
    /// The engine's tick interval, needed to validate date-trigger windows.
    poll_interval: Duration,
}

impl<F: FlowRepository, E: EnrollmentRepository> FlowService<F, E> {
    pub fn new(flows: Arc<F>, enrollments: Arc<E>, poll_interval: Duration) -> Self {
        Self {
            flows,
            enrollments,
            poll_interval,
        }
    }

    /// Save a definition. New flows start as Draft; updating a flow that is
    /// Active with enrollments in flight is rejected (archive and drain
    /// first). Saves bump the definition version, which also invalidates
    /// any cached step graph.
    pub async fn save(&self, mut def: FlowDefinition) -> Result<FlowDefinition, FlowServiceError> {
        let now = Utc::now();
        match self.flows.get_definition(&def.id).await? {
            Some(existing) => {
                if existing.status == FlowStatus::Active
                    && self.enrollments.has_live_enrollments(&def.id).await?
                {
                    return Err(FlowServiceError::Conflict(
                        "flow is active with enrollments in flight; archive it first".to_string(),
                    ));
                }
                def.version = existing.version + 1;
                def.status = existing.status;
                def.created_at = existing.created_at;
            }
            None => {
                def.version = 1;
                def.status = FlowStatus::Draft;
                def.created_at = now;
            }
        }
        def.updated_at = now;
        self.flows.save_definition(&def).await?;
        tracing::info!(flow_id = %def.id, version = def.version, "flow saved");
        Ok(def)
    }

    /// Validate and activate a flow. Malformed definitions are rejected
    /// here so they never reach the execution loop.
    pub async fn activate(&self, id: &Uuid) -> Result<FlowDefinition, FlowServiceError> {
        let mut def = self
            .flows
            .get_definition(id)
            .await?
            .ok_or(FlowServiceError::NotFound)?;

        validate_for_activation(&def, self.poll_interval)?;
        self.flows.set_status(id, FlowStatus::Active).await?;
        def.status = FlowStatus::Active;
        tracing::info!(flow_id = %id, flow = def.name.as_str(), "flow activated");
        Ok(def)
    }

    /// Archive a flow: triggers stop firing, existing enrollments drain.
    pub async fn archive(&self, id: &Uuid) -> Result<(), FlowServiceError> {
        if self.flows.get_definition(id).await?.is_none() {
            return Err(FlowServiceError::NotFound);
        }
        self.flows.set_status(id, FlowStatus::Archived).await?;
        tracing::info!(flow_id = %id, "flow archived");
        Ok(())
    }

    pub async fn get(&self, id: &Uuid) -> Result<FlowDefinition, FlowServiceError> {
        self.flows
            .get_definition(id)
            .await?
            .ok_or(FlowServiceError::NotFound)
    }

    pub async fn list(
        &self,
        status: Option<FlowStatus>,
    ) -> Result<Vec<FlowDefinition>, FlowServiceError> {
        Ok(self.flows.list_definitions(status).await?)
    }

    /// Delete a definition. Rejected while enrollments are in flight.
    pub async fn delete(&self, id: &Uuid) -> Result<(), FlowServiceError> {
        if self.enrollments.has_live_enrollments(id).await? {
            return Err(FlowServiceError::Conflict(
                "flow has enrollments in flight; archive and drain first".to_string(),
            ));
        }
        if !self.flows.delete_definition(id).await? {
            return Err(FlowServiceError::NotFound);
        }
        tracing::info!(flow_id = %id, "flow deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    pub async fn save_template(
        &self,
        template: &MessageTemplate,
    ) -> Result<(), FlowServiceError> {
        Ok(self.flows.save_template(template).await?)
    }

    pub async fn get_template(&self, id: &Uuid) -> Result<MessageTemplate, FlowServiceError> {
        self.flows
            .get_template(id)
            .await?
            .ok_or(FlowServiceError::NotFound)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{MemEnrollments, MemFlows, linear_flow, message_step};
    use dripline_types::enrollment::Enrollment;

    const POLL: Duration = Duration::from_secs(60);

    fn service(
        flows: Arc<MemFlows>,
        enrollments: Arc<MemEnrollments>,
    ) -> FlowService<MemFlows, MemEnrollments> {
        FlowService::new(flows, enrollments, POLL)
    }

    #[tokio::test]
    async fn save_then_activate() {
        let flows = Arc::new(MemFlows::default());
        let enrollments = Arc::new(MemEnrollments::default());
        let svc = service(flows.clone(), enrollments);

        let mut def = linear_flow(vec![message_step("m1", "Hi", "Hello")]);
        def.status = FlowStatus::Draft;
        let saved = svc.save(def).await.unwrap();
        assert_eq!(saved.status, FlowStatus::Draft);
        assert_eq!(saved.version, 1);

        let activated = svc.activate(&saved.id).await.unwrap();
        assert_eq!(activated.status, FlowStatus::Active);
    }

    #[tokio::test]
    async fn activation_rejects_invalid_definitions() {
        let flows = Arc::new(MemFlows::default());
        let enrollments = Arc::new(MemEnrollments::default());
        let svc = service(flows.clone(), enrollments);

        // Synchronous two-step cycle.
        let mut steps = vec![
            message_step("a", "Hi", "Hello"),
            message_step("b", "Yo", "Hey"),
        ];
        steps[0].next_step_id = Some("b".to_string());
        steps[1].next_step_id = Some("a".to_string());
        let mut def = linear_flow(steps);
        def.status = FlowStatus::Draft;
        let saved = svc.save(def).await.unwrap();

        let err = svc.activate(&saved.id).await.unwrap_err();
        assert!(matches!(err, FlowServiceError::Invalid(_)), "got {err}");
    }

    #[tokio::test]
    async fn editing_active_flow_with_live_enrollments_conflicts() {
        let flows = Arc::new(MemFlows::default());
        let enrollments = Arc::new(MemEnrollments::default());
        let svc = service(flows.clone(), enrollments.clone());

        let def = linear_flow(vec![message_step("m1", "Hi", "Hello")]);
        let saved = svc.save(def).await.unwrap();
        svc.activate(&saved.id).await.unwrap();

        let enrollment = Enrollment::new(saved.id, uuid::Uuid::now_v7(), Utc::now());
        enrollments.create(&enrollment).await.unwrap();

        let err = svc.save(saved.clone()).await.unwrap_err();
        assert!(matches!(err, FlowServiceError::Conflict(_)), "got {err}");

        let err = svc.delete(&saved.id).await.unwrap_err();
        assert!(matches!(err, FlowServiceError::Conflict(_)), "got {err}");
    }

    #[tokio::test]
    async fn saves_bump_version() {
        let flows = Arc::new(MemFlows::default());
        let enrollments = Arc::new(MemEnrollments::default());
        let svc = service(flows.clone(), enrollments);

        let def = linear_flow(vec![message_step("m1", "Hi", "Hello")]);
        let saved = svc.save(def).await.unwrap();
        let resaved = svc.save(saved.clone()).await.unwrap();
        assert_eq!(resaved.version, saved.version + 1);
    }
}
