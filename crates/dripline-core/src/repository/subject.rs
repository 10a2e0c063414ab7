//! Subject repository trait definition.
//!
//! Subjects are created and imported by the surrounding product; the engine
//! reads them for trigger evaluation and template substitution, and mutates
//! them through the idempotent Action-step operations.

use chrono::{DateTime, Utc};
use dripline_types::error::RepositoryError;
use dripline_types::subject::{Segment, Subject};
use uuid::Uuid;

/// Repository trait for subjects, tags, list memberships, and stored
/// segments.
pub trait SubjectRepository: Send + Sync {
    fn insert(
        &self,
        subject: &Subject,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Subject>, RepositoryError>> + Send;

    /// Subjects created since `since` (new-subject trigger candidates).
    fn created_since(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    /// Subjects mutated since `since` (segment trigger candidates).
    fn touched_since(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    /// Subjects whose date attribute falls inside `[from, to]`
    /// (scheduled-date trigger candidates). Attribute values that do not
    /// parse as dates never match.
    fn with_date_attribute_between(
        &self,
        attribute: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Action-step mutations (all idempotent)
    // -----------------------------------------------------------------------

    /// Add a tag; a no-op if the subject already carries it.
    fn add_tag(
        &self,
        id: &Uuid,
        tag: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove a tag; a no-op if absent.
    fn remove_tag(
        &self,
        id: &Uuid,
        tag: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Add the subject to a list, adjusting the membership count only when
    /// a row was actually inserted.
    fn add_to_list(
        &self,
        id: &Uuid,
        list_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove the subject from a list, adjusting the membership count only
    /// when a row was actually deleted.
    fn remove_from_list(
        &self,
        id: &Uuid,
        list_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Overwrite one attribute field. Callers restrict the field to the
    /// engine's allow-list before reaching the repository.
    fn set_field(
        &self,
        id: &Uuid,
        field: &str,
        value: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Segments
    // -----------------------------------------------------------------------

    fn save_segment(
        &self,
        segment: &Segment,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_segment(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Segment>, RepositoryError>> + Send;
}
