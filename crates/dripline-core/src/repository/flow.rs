//! Flow repository trait definition.
//!
//! Storage interface for flow definitions (stored as JSON blobs) and message
//! templates. A definition is immutable while Active; the service layer
//! enforces that before calling `save_definition`.

use dripline_types::error::RepositoryError;
use dripline_types::flow::{FlowDefinition, FlowStatus, MessageTemplate};
use uuid::Uuid;

/// Repository trait for flow persistence.
pub trait FlowRepository: Send + Sync {
    /// Upsert a flow definition (insert or replace by id).
    fn save_definition(
        &self,
        def: &FlowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a flow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<FlowDefinition>, RepositoryError>> + Send;

    /// List flow definitions, optionally filtered by status.
    fn list_definitions(
        &self,
        status: Option<FlowStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<FlowDefinition>, RepositoryError>> + Send;

    /// Transition a flow's lifecycle status.
    fn set_status(
        &self,
        id: &Uuid,
        status: FlowStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a flow definition by id. Returns `true` if it existed.
    fn delete_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Message templates
    // -----------------------------------------------------------------------

    /// Upsert a message template.
    fn save_template(
        &self,
        template: &MessageTemplate,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a message template by id.
    fn get_template(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<MessageTemplate>, RepositoryError>> + Send;
}
