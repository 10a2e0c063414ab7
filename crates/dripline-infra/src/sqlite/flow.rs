//! SQLite flow repository.
//!
//! Flow definitions are stored as JSON blobs with a few denormalized
//! columns (name, status, version) for querying. Status transitions rewrite
//! both the column and the blob via `json_set` so the two never diverge.

use sqlx::Row;
use uuid::Uuid;

use dripline_core::repository::flow::FlowRepository;
use dripline_types::error::RepositoryError;
use dripline_types::flow::{FlowDefinition, FlowStatus, MessageTemplate};

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, status_to_str};

/// SQLite-backed implementation of `FlowRepository`.
pub struct SqliteFlowRepository {
    pool: DatabasePool,
}

impl SqliteFlowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn definition_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<FlowDefinition, RepositoryError> {
    let raw: String = row
        .try_get("definition")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    serde_json::from_str(&raw)
        .map_err(|e| RepositoryError::Query(format!("invalid flow definition JSON: {e}")))
}

impl FlowRepository for SqliteFlowRepository {
    async fn save_definition(&self, def: &FlowDefinition) -> Result<(), RepositoryError> {
        let definition_json =
            serde_json::to_string(def).map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO flows (id, name, status, version, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (id) DO UPDATE SET
                 name = excluded.name,
                 status = excluded.status,
                 version = excluded.version,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(status_to_str(&def.status)?)
        .bind(def.version as i64)
        .bind(&definition_json)
        .bind(format_datetime(&def.created_at))
        .bind(format_datetime(&def.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<FlowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM flows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(definition_from_row).transpose()
    }

    async fn list_definitions(
        &self,
        status: Option<FlowStatus>,
    ) -> Result<Vec<FlowDefinition>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT definition FROM flows WHERE status = ? ORDER BY name ASC")
                    .bind(status_to_str(&status)?)
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                sqlx::query("SELECT definition FROM flows ORDER BY name ASC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(definition_from_row).collect()
    }

    async fn set_status(&self, id: &Uuid, status: FlowStatus) -> Result<(), RepositoryError> {
        let status_str = status_to_str(&status)?;
        let result = sqlx::query(
            r#"UPDATE flows
               SET status = ?1, definition = json_set(definition, '$.status', ?1)
               WHERE id = ?2"#,
        )
        .bind(&status_str)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM flows WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_template(&self, template: &MessageTemplate) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO message_templates (id, name, subject, body, created_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT (id) DO UPDATE SET
                 name = excluded.name,
                 subject = excluded.subject,
                 body = excluded.body"#,
        )
        .bind(template.id.to_string())
        .bind(&template.name)
        .bind(&template.subject)
        .bind(&template.body)
        .bind(format_datetime(&template.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_template(&self, id: &Uuid) -> Result<Option<MessageTemplate>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, subject, body, created_at FROM message_templates WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id_raw: String = row
            .try_get("id")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let created_at_raw: String = row
            .try_get("created_at")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(Some(MessageTemplate {
            id: parse_uuid(&id_raw)?,
            name: row
                .try_get("name")
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            subject: row
                .try_get("subject")
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            body: row
                .try_get("body")
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            created_at: parse_datetime(&created_at_raw)?,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dripline_types::flow::{FlowEncoding, StepConfig, StepDefinition, TriggerConfig};

    async fn repo() -> (tempfile::TempDir, SqliteFlowRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteFlowRepository::new(pool))
    }

    fn sample_flow(name: &str, status: FlowStatus) -> FlowDefinition {
        let now = Utc::now();
        FlowDefinition {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: None,
            version: 1,
            status,
            trigger: TriggerConfig::Manual {},
            encoding: FlowEncoding::Linear {
                steps: vec![StepDefinition {
                    id: "m1".to_string(),
                    name: "Hello".to_string(),
                    config: StepConfig::Message {
                        subject: "Hi".to_string(),
                        body: "Hello".to_string(),
                        template_id: None,
                        continue_thread: false,
                        send_only_if_no_reply: false,
                        skip_if_opened: false,
                    },
                    next_step_id: None,
                }],
            },
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn save_and_get_roundtrip() {
        let (_dir, repo) = repo().await;
        let flow = sample_flow("welcome", FlowStatus::Draft);
        repo.save_definition(&flow).await.unwrap();

        let loaded = repo.get_definition(&flow.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "welcome");
        assert_eq!(loaded.step_definitions().len(), 1);
    }

    #[tokio::test]
    async fn set_status_updates_column_and_blob() {
        let (_dir, repo) = repo().await;
        let flow = sample_flow("welcome", FlowStatus::Draft);
        repo.save_definition(&flow).await.unwrap();

        repo.set_status(&flow.id, FlowStatus::Active).await.unwrap();

        // The parsed blob must agree with the column filter.
        let loaded = repo.get_definition(&flow.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, FlowStatus::Active);
        let active = repo
            .list_definitions(Some(FlowStatus::Active))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn set_status_unknown_flow_is_not_found() {
        let (_dir, repo) = repo().await;
        let err = repo
            .set_status(&Uuid::now_v7(), FlowStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn template_roundtrip() {
        let (_dir, repo) = repo().await;
        let template = MessageTemplate {
            id: Uuid::now_v7(),
            name: "welcome".to_string(),
            subject: "Hi {{first_name}}".to_string(),
            body: "Welcome aboard!".to_string(),
            created_at: Utc::now(),
        };
        repo.save_template(&template).await.unwrap();

        let loaded = repo.get_template(&template.id).await.unwrap().unwrap();
        assert_eq!(loaded.subject, "Hi {{first_name}}");
        assert!(repo.get_template(&Uuid::now_v7()).await.unwrap().is_none());
    }
}
