//! SQLite engagement event source.
//!
//! The append-only open/click/reply record the messaging provider's
//! tracking pipeline writes into, and the engine's Condition steps and
//! send-suppression checks query. Implements the dyn-compatible
//! `EngagementSource` collaborator trait.

use futures_util::future::BoxFuture;
use sqlx::Row;
use uuid::Uuid;

use dripline_core::collaborator::{CollaboratorError, EngagementQuery, EngagementSource};
use dripline_types::error::RepositoryError;
use dripline_types::subject::{EngagementEvent, EngagementKind};

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, status_from_str, status_to_str};

/// SQLite-backed engagement record.
pub struct SqliteEngagementSource {
    pool: DatabasePool,
}

impl SqliteEngagementSource {
    /// Create a new source backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Append an engagement event (ingestion path).
    pub async fn record(&self, event: &EngagementEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO engagement_events (id, enrollment_id, step_id, subject_id, kind, occurred_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(event.id.to_string())
        .bind(event.enrollment_id.to_string())
        .bind(&event.step_id)
        .bind(event.subject_id.to_string())
        .bind(status_to_str(&event.kind)?)
        .bind(format_datetime(&event.occurred_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    /// All engagement events for an enrollment, oldest first.
    pub async fn list(
        &self,
        enrollment_id: &Uuid,
    ) -> Result<Vec<EngagementEvent>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id, enrollment_id, step_id, subject_id, kind, occurred_at
               FROM engagement_events WHERE enrollment_id = ? ORDER BY occurred_at ASC"#,
        )
        .bind(enrollment_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row
                .try_get("id")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let enrollment_raw: String = row
                .try_get("enrollment_id")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let subject_raw: String = row
                .try_get("subject_id")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let kind_raw: String = row
                .try_get("kind")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let occurred_raw: String = row
                .try_get("occurred_at")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;

            events.push(EngagementEvent {
                id: parse_uuid(&id)?,
                enrollment_id: parse_uuid(&enrollment_raw)?,
                step_id: row
                    .try_get("step_id")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?,
                subject_id: parse_uuid(&subject_raw)?,
                kind: status_from_str::<EngagementKind>(&kind_raw)?,
                occurred_at: parse_datetime(&occurred_raw)?,
            });
        }
        Ok(events)
    }
}

impl EngagementSource for SqliteEngagementSource {
    fn has_engagement(
        &self,
        query: EngagementQuery,
    ) -> BoxFuture<'_, Result<bool, CollaboratorError>> {
        Box::pin(async move {
            let kind = status_to_str(&query.kind)
                .map_err(|e| CollaboratorError::Permanent(e.to_string()))?;
            let since = query.since.map(|s| format_datetime(&s));

            let row = sqlx::query(
                r#"SELECT EXISTS(
                     SELECT 1 FROM engagement_events
                     WHERE enrollment_id = ?1 AND kind = ?2
                       AND (?3 IS NULL OR step_id = ?3)
                       AND (?4 IS NULL OR occurred_at >= ?4)
                   ) AS found"#,
            )
            .bind(query.enrollment_id.to_string())
            .bind(&kind)
            .bind(&query.step_id)
            .bind(&since)
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| CollaboratorError::Transient(e.to_string()))?;

            let found: i64 = row
                .try_get("found")
                .map_err(|e| CollaboratorError::Permanent(e.to_string()))?;
            Ok(found != 0)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn source() -> (tempfile::TempDir, SqliteEngagementSource) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteEngagementSource::new(pool))
    }

    fn event(enrollment_id: Uuid, step_id: &str, kind: EngagementKind) -> EngagementEvent {
        EngagementEvent {
            id: Uuid::now_v7(),
            enrollment_id,
            step_id: step_id.to_string(),
            subject_id: Uuid::now_v7(),
            kind,
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn queries_filter_by_step_kind_and_time() {
        let (_dir, source) = source().await;
        let enrollment_id = Uuid::now_v7();

        source
            .record(&event(enrollment_id, "m1", EngagementKind::Opened))
            .await
            .unwrap();

        // Step-scoped lookup.
        let found = source
            .has_engagement(EngagementQuery {
                enrollment_id,
                step_id: Some("m1".to_string()),
                kind: EngagementKind::Opened,
                since: None,
            })
            .await
            .unwrap();
        assert!(found);

        // Different step: no match.
        let found = source
            .has_engagement(EngagementQuery {
                enrollment_id,
                step_id: Some("m2".to_string()),
                kind: EngagementKind::Opened,
                since: None,
            })
            .await
            .unwrap();
        assert!(!found);

        // Different kind: no match.
        let found = source
            .has_engagement(EngagementQuery {
                enrollment_id,
                step_id: None,
                kind: EngagementKind::Replied,
                since: None,
            })
            .await
            .unwrap();
        assert!(!found);

        // Since-bound after the event: no match.
        let found = source
            .has_engagement(EngagementQuery {
                enrollment_id,
                step_id: None,
                kind: EngagementKind::Opened,
                since: Some(Utc::now() + chrono::Duration::minutes(5)),
            })
            .await
            .unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn list_returns_appended_events() {
        let (_dir, source) = source().await;
        let enrollment_id = Uuid::now_v7();

        source
            .record(&event(enrollment_id, "m1", EngagementKind::Opened))
            .await
            .unwrap();
        source
            .record(&event(enrollment_id, "m1", EngagementKind::Replied))
            .await
            .unwrap();

        let events = source.list(&enrollment_id).await.unwrap();
        assert_eq!(events.len(), 2);
    }
}
