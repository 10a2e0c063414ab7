//! Enrollment repository trait definition.
//!
//! The concurrency-critical interface of the engine. `load_ready` + `claim`
//! + `update` together guarantee at-most-one in-flight processor per
//! enrollment across overlapping ticks and horizontally scaled workers:
//!
//! 1. `load_ready` only returns unclaimed (or lease-expired) enrollments.
//! 2. `claim` atomically takes a short-lived lease before dispatch; a racer
//!    gets `None` back instead of the row.
//! 3. `update` is a full-row compare-and-set on the `version` counter and
//!    clears the lease; a worker that outlived its lease loses the CAS.
//!
//! A worker that crashes mid-step leaves only an expiring lease behind.

use chrono::{DateTime, Utc};
use dripline_types::enrollment::{Enrollment, EnrollmentEvent};
use dripline_types::error::RepositoryError;
use dripline_types::flow::FlowStats;
use uuid::Uuid;

/// Repository trait for enrollment persistence, the event trail, and the
/// per-flow aggregate counters.
pub trait EnrollmentRepository: Send + Sync {
    /// Insert a new enrollment unless one already exists for the same
    /// (flow, subject) pair. Returns `true` if a row was created -- trigger
    /// firing is idempotent because of this.
    fn create(
        &self,
        enrollment: &Enrollment,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Enrollment>, RepositoryError>> + Send;

    /// Find the enrollment for a (flow, subject) pair.
    fn find(
        &self,
        flow_id: &Uuid,
        subject_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Enrollment>, RepositoryError>> + Send;

    /// List enrollments for a flow, newest first, bounded by `limit`.
    fn list_by_flow(
        &self,
        flow_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Enrollment>, RepositoryError>> + Send;

    /// Enrollments ready to run: Active, or Waiting with `wait_until <= now`;
    /// unclaimed or lease-expired only. Bounded by `limit` for batch
    /// fairness; the remainder rolls to the next tick.
    fn load_ready(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Enrollment>, RepositoryError>> + Send;

    /// Atomically take the processing lease on an enrollment. Returns the
    /// freshly-read row when the claim succeeded, `None` when another worker
    /// holds an unexpired lease or the enrollment left the ready set.
    fn claim(
        &self,
        id: &Uuid,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<Enrollment>, RepositoryError>> + Send;

    /// Clear the processing lease without changing anything else. Used by
    /// failure paths that bail out before reaching `update`.
    fn release(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist the full enrollment row if `version` still equals
    /// `expected_version` (the CAS). Bumps the version and clears the lease.
    /// Returns `false` on a version conflict.
    fn update(
        &self,
        enrollment: &Enrollment,
        expected_version: i64,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Pause an Active or Waiting enrollment. Returns `false` if the
    /// enrollment was not pausable (terminal or already paused).
    fn pause(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Resume a Paused enrollment back into the ready set. Returns `false`
    /// if it was not paused.
    fn resume(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Delete an enrollment and its event trail. Returns `true` if it
    /// existed.
    fn remove(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Whether the flow has any non-terminal enrollments (guards flow
    /// mutation).
    fn has_live_enrollments(
        &self,
        flow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Of `subject_ids`, the ones with no enrollment in `flow_id` yet.
    fn filter_unenrolled(
        &self,
        flow_id: &Uuid,
        subject_ids: &[Uuid],
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Event trail
    // -----------------------------------------------------------------------

    /// Append an event record. Events are never updated or deleted.
    fn record_event(
        &self,
        event: &EnrollmentEvent,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All events for an enrollment, oldest first.
    fn list_events(
        &self,
        enrollment_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<EnrollmentEvent>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Aggregate counters
    // -----------------------------------------------------------------------

    /// Recompute and store the per-flow counters. Best-effort, eventually
    /// consistent; never used for control decisions.
    fn recompute_stats(
        &self,
        flow_id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<FlowStats, RepositoryError>> + Send;

    /// Read the last stored counters for a flow.
    fn get_stats(
        &self,
        flow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<FlowStats>, RepositoryError>> + Send;
}
