//! SQLite enrollment repository.
//!
//! Implements `EnrollmentRepository` from `dripline-core` using sqlx with
//! split read/write pools. The concurrency protocol maps to three guarded
//! statements:
//!
//! - `claim`: one conditional UPDATE on the `claimed_until` lease column;
//!   a row already leased into the future is not matched, so exactly one
//!   racer wins.
//! - `update`: a full-row UPDATE guarded by `version = ?`; the version is
//!   bumped and the lease cleared in the same statement.
//! - `create`: `ON CONFLICT (flow_id, subject_id) DO NOTHING` makes trigger
//!   firing idempotent.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use dripline_core::repository::enrollment::EnrollmentRepository;
use dripline_types::enrollment::{Enrollment, EnrollmentEvent, EnrollmentStatus, EventType};
use dripline_types::error::RepositoryError;
use dripline_types::flow::FlowStats;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, status_from_str, status_to_str};

/// SQLite-backed implementation of `EnrollmentRepository`.
pub struct SqliteEnrollmentRepository {
    pool: DatabasePool,
}

impl SqliteEnrollmentRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct EnrollmentRow {
    id: String,
    flow_id: String,
    subject_id: String,
    status: String,
    current_step_id: Option<String>,
    wait_until: Option<String>,
    variables: String,
    thread_id: Option<String>,
    thread_subject: Option<String>,
    last_message_id: Option<String>,
    last_message_sent_at: Option<String>,
    failure_reason: Option<String>,
    consecutive_failures: i64,
    version: i64,
    claimed_until: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    failed_at: Option<String>,
    paused_at: Option<String>,
}

impl EnrollmentRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            flow_id: row.try_get("flow_id")?,
            subject_id: row.try_get("subject_id")?,
            status: row.try_get("status")?,
            current_step_id: row.try_get("current_step_id")?,
            wait_until: row.try_get("wait_until")?,
            variables: row.try_get("variables")?,
            thread_id: row.try_get("thread_id")?,
            thread_subject: row.try_get("thread_subject")?,
            last_message_id: row.try_get("last_message_id")?,
            last_message_sent_at: row.try_get("last_message_sent_at")?,
            failure_reason: row.try_get("failure_reason")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            version: row.try_get("version")?,
            claimed_until: row.try_get("claimed_until")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
            paused_at: row.try_get("paused_at")?,
        })
    }

    fn into_enrollment(self) -> Result<Enrollment, RepositoryError> {
        let variables = serde_json::from_str(&self.variables)
            .map_err(|e| RepositoryError::Query(format!("invalid variables JSON: {e}")))?;

        let opt_dt = |value: Option<String>| value.as_deref().map(parse_datetime).transpose();

        Ok(Enrollment {
            id: parse_uuid(&self.id)?,
            flow_id: parse_uuid(&self.flow_id)?,
            subject_id: parse_uuid(&self.subject_id)?,
            status: status_from_str::<EnrollmentStatus>(&self.status)?,
            current_step_id: self.current_step_id,
            wait_until: opt_dt(self.wait_until)?,
            variables,
            thread_id: self.thread_id,
            thread_subject: self.thread_subject,
            last_message_id: self.last_message_id,
            last_message_sent_at: opt_dt(self.last_message_sent_at)?,
            failure_reason: self.failure_reason,
            consecutive_failures: self.consecutive_failures as u32,
            version: self.version,
            claimed_until: opt_dt(self.claimed_until)?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: opt_dt(self.completed_at)?,
            failed_at: opt_dt(self.failed_at)?,
            paused_at: opt_dt(self.paused_at)?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, flow_id, subject_id, status, current_step_id, wait_until, \
     variables, thread_id, thread_subject, last_message_id, last_message_sent_at, \
     failure_reason, consecutive_failures, version, claimed_until, created_at, updated_at, \
     completed_at, failed_at, paused_at";

async fn fetch_by_id(
    pool: &sqlx::SqlitePool,
    id: &Uuid,
) -> Result<Option<Enrollment>, RepositoryError> {
    let query = format!("SELECT {SELECT_COLUMNS} FROM enrollments WHERE id = ?");
    let row = sqlx::query(&query)
        .bind(id.to_string())
        .fetch_optional(pool)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

    match row {
        Some(row) => {
            let r = EnrollmentRow::from_row(&row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            Ok(Some(r.into_enrollment()?))
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// EnrollmentRepository impl
// ---------------------------------------------------------------------------

impl EnrollmentRepository for SqliteEnrollmentRepository {
    async fn create(&self, enrollment: &Enrollment) -> Result<bool, RepositoryError> {
        let variables = serde_json::to_string(&enrollment.variables)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let result = sqlx::query(
            r#"INSERT INTO enrollments
               (id, flow_id, subject_id, status, current_step_id, wait_until, variables,
                thread_id, thread_subject, last_message_id, last_message_sent_at,
                failure_reason, consecutive_failures, version, claimed_until,
                created_at, updated_at, completed_at, failed_at, paused_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (flow_id, subject_id) DO NOTHING"#,
        )
        .bind(enrollment.id.to_string())
        .bind(enrollment.flow_id.to_string())
        .bind(enrollment.subject_id.to_string())
        .bind(status_to_str(&enrollment.status)?)
        .bind(&enrollment.current_step_id)
        .bind(enrollment.wait_until.as_ref().map(format_datetime))
        .bind(&variables)
        .bind(&enrollment.thread_id)
        .bind(&enrollment.thread_subject)
        .bind(&enrollment.last_message_id)
        .bind(enrollment.last_message_sent_at.as_ref().map(format_datetime))
        .bind(&enrollment.failure_reason)
        .bind(enrollment.consecutive_failures as i64)
        .bind(enrollment.version)
        .bind(enrollment.claimed_until.as_ref().map(format_datetime))
        .bind(format_datetime(&enrollment.created_at))
        .bind(format_datetime(&enrollment.updated_at))
        .bind(enrollment.completed_at.as_ref().map(format_datetime))
        .bind(enrollment.failed_at.as_ref().map(format_datetime))
        .bind(enrollment.paused_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Enrollment>, RepositoryError> {
        fetch_by_id(&self.pool.reader, id).await
    }

    async fn find(
        &self,
        flow_id: &Uuid,
        subject_id: &Uuid,
    ) -> Result<Option<Enrollment>, RepositoryError> {
        let query =
            format!("SELECT {SELECT_COLUMNS} FROM enrollments WHERE flow_id = ? AND subject_id = ?");
        let row = sqlx::query(&query)
            .bind(flow_id.to_string())
            .bind(subject_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = EnrollmentRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_enrollment()?))
            }
            None => Ok(None),
        }
    }

    async fn list_by_flow(
        &self,
        flow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<Enrollment>, RepositoryError> {
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM enrollments WHERE flow_id = ? \
             ORDER BY created_at DESC LIMIT ?"
        );
        let rows = sqlx::query(&query)
            .bind(flow_id.to_string())
            .bind(limit as i64)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                EnrollmentRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_enrollment()
            })
            .collect()
    }

    async fn load_ready(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Enrollment>, RepositoryError> {
        let now_str = format_datetime(&now);
        let query = format!(
            "SELECT {SELECT_COLUMNS} FROM enrollments \
             WHERE (status = 'active' OR (status = 'waiting' AND wait_until <= ?1)) \
               AND (claimed_until IS NULL OR claimed_until <= ?1) \
             ORDER BY updated_at ASC LIMIT ?2"
        );
        let rows = sqlx::query(&query)
            .bind(&now_str)
            .bind(limit as i64)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                EnrollmentRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_enrollment()
            })
            .collect()
    }

    async fn claim(
        &self,
        id: &Uuid,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Enrollment>, RepositoryError> {
        let now_str = format_datetime(&now);
        let result = sqlx::query(
            r#"UPDATE enrollments SET claimed_until = ?1
               WHERE id = ?2
                 AND (claimed_until IS NULL OR claimed_until <= ?3)
                 AND (status = 'active' OR (status = 'waiting' AND wait_until <= ?3))"#,
        )
        .bind(format_datetime(&lease_until))
        .bind(id.to_string())
        .bind(&now_str)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        fetch_by_id(&self.pool.writer, id).await
    }

    async fn release(&self, id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE enrollments SET claimed_until = NULL WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }

    async fn update(
        &self,
        enrollment: &Enrollment,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let variables = serde_json::to_string(&enrollment.variables)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let result = sqlx::query(
            r#"UPDATE enrollments SET
                 status = ?,
                 current_step_id = ?,
                 wait_until = ?,
                 variables = ?,
                 thread_id = ?,
                 thread_subject = ?,
                 last_message_id = ?,
                 last_message_sent_at = ?,
                 failure_reason = ?,
                 consecutive_failures = ?,
                 version = ? + 1,
                 claimed_until = NULL,
                 updated_at = ?,
                 completed_at = ?,
                 failed_at = ?,
                 paused_at = ?
               WHERE id = ? AND version = ?"#,
        )
        .bind(status_to_str(&enrollment.status)?)
        .bind(&enrollment.current_step_id)
        .bind(enrollment.wait_until.as_ref().map(format_datetime))
        .bind(&variables)
        .bind(&enrollment.thread_id)
        .bind(&enrollment.thread_subject)
        .bind(&enrollment.last_message_id)
        .bind(enrollment.last_message_sent_at.as_ref().map(format_datetime))
        .bind(&enrollment.failure_reason)
        .bind(enrollment.consecutive_failures as i64)
        .bind(expected_version)
        .bind(format_datetime(&enrollment.updated_at))
        .bind(enrollment.completed_at.as_ref().map(format_datetime))
        .bind(enrollment.failed_at.as_ref().map(format_datetime))
        .bind(enrollment.paused_at.as_ref().map(format_datetime))
        .bind(enrollment.id.to_string())
        .bind(expected_version)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn pause(&self, id: &Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let now_str = format_datetime(&now);
        // Bumping the version here makes any in-flight tick's CAS write
        // lose, so a pause cannot be overwritten by a racing worker. The
        // wait pointer drops with the status; a pending Delay re-derives
        // the same deadline from its anchor after resume.
        let result = sqlx::query(
            r#"UPDATE enrollments
               SET status = 'paused', wait_until = NULL, paused_at = ?1, updated_at = ?1,
                   version = version + 1
               WHERE id = ?2 AND status IN ('active', 'waiting')"#,
        )
        .bind(&now_str)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn resume(&self, id: &Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let now_str = format_datetime(&now);
        let result = sqlx::query(
            r#"UPDATE enrollments
               SET status = 'active', paused_at = NULL, updated_at = ?1, version = version + 1
               WHERE id = ?2 AND status = 'paused'"#,
        )
        .bind(&now_str)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        sqlx::query("DELETE FROM enrollment_events WHERE enrollment_id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let result = sqlx::query("DELETE FROM enrollments WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn has_live_enrollments(&self, flow_id: &Uuid) -> Result<bool, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT EXISTS(
                 SELECT 1 FROM enrollments
                 WHERE flow_id = ? AND status NOT IN ('completed', 'failed', 'unsubscribed')
               ) AS live"#,
        )
        .bind(flow_id.to_string())
        .fetch_one(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let live: i64 = row
            .try_get("live")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(live != 0)
    }

    async fn filter_unenrolled(
        &self,
        flow_id: &Uuid,
        subject_ids: &[Uuid],
    ) -> Result<Vec<Uuid>, RepositoryError> {
        if subject_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT subject_id FROM enrollments WHERE flow_id = ?")
            .bind(flow_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut enrolled = std::collections::HashSet::new();
        for row in &rows {
            let raw: String = row
                .try_get("subject_id")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            enrolled.insert(parse_uuid(&raw)?);
        }

        Ok(subject_ids
            .iter()
            .filter(|id| !enrolled.contains(id))
            .copied()
            .collect())
    }

    async fn record_event(&self, event: &EnrollmentEvent) -> Result<(), RepositoryError> {
        let payload = event
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO enrollment_events (id, enrollment_id, step_id, event_type, payload, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(event.id.to_string())
        .bind(event.enrollment_id.to_string())
        .bind(&event.step_id)
        .bind(status_to_str(&event.event_type)?)
        .bind(&payload)
        .bind(format_datetime(&event.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_events(
        &self,
        enrollment_id: &Uuid,
    ) -> Result<Vec<EnrollmentEvent>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id, enrollment_id, step_id, event_type, payload, created_at
               FROM enrollment_events WHERE enrollment_id = ? ORDER BY created_at ASC, id ASC"#,
        )
        .bind(enrollment_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let payload: Option<String> = row
                .try_get("payload")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let payload = payload
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| RepositoryError::Query(format!("invalid event payload: {e}")))?;

            let id: String = row
                .try_get("id")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let enrollment_id_raw: String = row
                .try_get("enrollment_id")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let event_type_raw: String = row
                .try_get("event_type")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let created_at_raw: String = row
                .try_get("created_at")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;

            events.push(EnrollmentEvent {
                id: parse_uuid(&id)?,
                enrollment_id: parse_uuid(&enrollment_id_raw)?,
                step_id: row
                    .try_get("step_id")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?,
                event_type: status_from_str::<EventType>(&event_type_raw)?,
                payload,
                created_at: parse_datetime(&created_at_raw)?,
            });
        }
        Ok(events)
    }

    async fn recompute_stats(
        &self,
        flow_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<FlowStats, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT
                 COUNT(*) FILTER (WHERE status NOT IN ('completed', 'failed', 'unsubscribed')) AS active,
                 COUNT(*) FILTER (WHERE status = 'completed') AS completed
               FROM enrollments WHERE flow_id = ?"#,
        )
        .bind(flow_id.to_string())
        .fetch_one(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let active_count: i64 = row
            .try_get("active")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let completed_count: i64 = row
            .try_get("completed")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO flow_stats (flow_id, active_count, completed_count, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (flow_id) DO UPDATE SET
                 active_count = excluded.active_count,
                 completed_count = excluded.completed_count,
                 updated_at = excluded.updated_at"#,
        )
        .bind(flow_id.to_string())
        .bind(active_count)
        .bind(completed_count)
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(FlowStats {
            flow_id: *flow_id,
            active_count,
            completed_count,
            updated_at: now,
        })
    }

    async fn get_stats(&self, flow_id: &Uuid) -> Result<Option<FlowStats>, RepositoryError> {
        let row = sqlx::query(
            "SELECT flow_id, active_count, completed_count, updated_at FROM flow_stats WHERE flow_id = ?",
        )
        .bind(flow_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let flow_id_raw: String = row
            .try_get("flow_id")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let updated_at_raw: String = row
            .try_get("updated_at")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(Some(FlowStats {
            flow_id: parse_uuid(&flow_id_raw)?,
            active_count: row
                .try_get("active_count")
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            completed_count: row
                .try_get("completed_count")
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            updated_at: parse_datetime(&updated_at_raw)?,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
