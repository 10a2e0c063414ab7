//! SQLite subject repository.
//!
//! Attributes live in a JSON column (queried with the json_* functions),
//! tags and list memberships in join tables. The Action-step mutations are
//! idempotent at the SQL level: `INSERT OR IGNORE` / keyed `DELETE`, with
//! list member counts adjusted only when a row actually changed.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use dripline_core::repository::subject::SubjectRepository;
use dripline_types::error::RepositoryError;
use dripline_types::subject::{Segment, Subject};

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid};

/// SQLite-backed implementation of `SubjectRepository`.
pub struct SqliteSubjectRepository {
    pool: DatabasePool,
}

impl SqliteSubjectRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn tags_for(&self, id: &str) -> Result<Vec<String>, RepositoryError> {
        let rows = sqlx::query("SELECT tag FROM subject_tags WHERE subject_id = ? ORDER BY tag")
            .bind(id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("tag")
                    .map_err(|e| RepositoryError::Query(e.to_string()))
            })
            .collect()
    }

    async fn touch(&self, id: &Uuid) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE subjects SET updated_at = ? WHERE id = ?")
            .bind(format_datetime(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }
}

impl SubjectRepository for SqliteSubjectRepository {
    async fn insert(&self, subject: &Subject) -> Result<(), RepositoryError> {
        let attributes = serde_json::to_string(&subject.attributes)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO subjects (id, email, attributes, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT (id) DO UPDATE SET
                 email = excluded.email,
                 attributes = excluded.attributes,
                 updated_at = excluded.updated_at"#,
        )
        .bind(subject.id.to_string())
        .bind(&subject.email)
        .bind(&attributes)
        .bind(format_datetime(&subject.created_at))
        .bind(format_datetime(&subject.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for tag in &subject.tags {
            sqlx::query("INSERT OR IGNORE INTO subject_tags (subject_id, tag) VALUES (?, ?)")
                .bind(subject.id.to_string())
                .bind(tag)
                .execute(&self.pool.writer)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Subject>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, email, attributes, created_at, updated_at FROM subjects WHERE id = ?",
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
        let attributes_raw: String = row
            .try_get("attributes")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let created_at_raw: String = row
            .try_get("created_at")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let updated_at_raw: String = row
            .try_get("updated_at")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(Some(Subject {
            id: parse_uuid(&id_raw)?,
            email: row
                .try_get("email")
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            attributes: serde_json::from_str(&attributes_raw)
                .map_err(|e| RepositoryError::Query(format!("invalid attributes JSON: {e}")))?,
            tags: self.tags_for(&id_raw).await?,
            created_at: parse_datetime(&created_at_raw)?,
            updated_at: parse_datetime(&updated_at_raw)?,
        }))
    }

    async fn created_since(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id FROM subjects WHERE created_at >= ? ORDER BY created_at ASC LIMIT ?",
        )
        .bind(format_datetime(&since))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let raw: String = row
                    .try_get("id")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                parse_uuid(&raw)
            })
            .collect()
    }

    async fn touched_since(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id FROM subjects WHERE updated_at >= ? ORDER BY updated_at ASC LIMIT ?",
        )
        .bind(format_datetime(&since))
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let raw: String = row
                    .try_get("id")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                parse_uuid(&raw)
            })
            .collect()
    }

    async fn with_date_attribute_between(
        &self,
        attribute: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        // Attribute date formats vary (RFC 3339 or bare dates), so the rows
        // with a value are fetched and parsed here rather than compared as
        // strings in SQL.
        let rows = sqlx::query(
            "SELECT id, json_extract(attributes, ?) AS value FROM subjects \
             WHERE json_extract(attributes, ?) IS NOT NULL",
        )
        .bind(format!("$.{attribute}"))
        .bind(format!("$.{attribute}"))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut matches = Vec::new();
        for row in &rows {
            if matches.len() >= limit as usize {
                break;
            }
            let raw_id: String = row
                .try_get("id")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let value: String = match row.try_get("value") {
                Ok(v) => v,
                Err(_) => continue, // non-text attribute value
            };
            if let Some(date) = parse_date_attribute(&value) {
                if date >= from && date <= to {
                    matches.push(parse_uuid(&raw_id)?);
                }
            }
        }
        Ok(matches)
    }

    async fn add_tag(&self, id: &Uuid, tag: &str) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO subject_tags (subject_id, tag) VALUES (?, ?)")
                .bind(id.to_string())
                .bind(tag)
                .execute(&self.pool.writer)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() > 0 {
            self.touch(id).await?;
        }
        Ok(())
    }

    async fn remove_tag(&self, id: &Uuid, tag: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM subject_tags WHERE subject_id = ? AND tag = ?")
            .bind(id.to_string())
            .bind(tag)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() > 0 {
            self.touch(id).await?;
        }
        Ok(())
    }

    async fn add_to_list(&self, id: &Uuid, list_id: &Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO list_members (list_id, subject_id, added_at) VALUES (?, ?, ?)",
        )
        .bind(list_id.to_string())
        .bind(id.to_string())
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        // Membership count moves only when the row was actually inserted.
        if result.rows_affected() > 0 {
            sqlx::query("UPDATE lists SET member_count = member_count + 1 WHERE id = ?")
                .bind(list_id.to_string())
                .execute(&self.pool.writer)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }
        Ok(())
    }

    async fn remove_from_list(&self, id: &Uuid, list_id: &Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM list_members WHERE list_id = ? AND subject_id = ?")
            .bind(list_id.to_string())
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() > 0 {
            sqlx::query(
                "UPDATE lists SET member_count = MAX(member_count - 1, 0) WHERE id = ?",
            )
            .bind(list_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }
        Ok(())
    }

    async fn set_field(&self, id: &Uuid, field: &str, value: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE subjects SET attributes = json_set(attributes, ?, ?), updated_at = ? WHERE id = ?",
        )
        .bind(format!("$.{field}"))
        .bind(value)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn save_segment(&self, segment: &Segment) -> Result<(), RepositoryError> {
        let clauses = serde_json::to_string(&segment.clauses)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO segments (id, name, clauses) VALUES (?, ?, ?)
               ON CONFLICT (id) DO UPDATE SET
                 name = excluded.name,
                 clauses = excluded.clauses"#,
        )
        .bind(segment.id.to_string())
        .bind(&segment.name)
        .bind(&clauses)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_segment(&self, id: &Uuid) -> Result<Option<Segment>, RepositoryError> {
        let row = sqlx::query("SELECT id, name, clauses FROM segments WHERE id = ?")
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
        let clauses_raw: String = row
            .try_get("clauses")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(Some(Segment {
            id: parse_uuid(&id_raw)?,
            name: row
                .try_get("name")
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            clauses: serde_json::from_str(&clauses_raw)
                .map_err(|e| RepositoryError::Query(format!("invalid clauses JSON: {e}")))?,
        }))
    }
}

fn parse_date_attribute(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = raw.parse::<chrono::NaiveDate>().ok()?;
    Some(date.and_time(chrono::NaiveTime::MIN).and_utc())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn repo() -> (tempfile::TempDir, SqliteSubjectRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteSubjectRepository::new(pool))
    }

    fn sample(email: &str, attributes: serde_json::Value) -> Subject {
        let now = Utc::now();
        Subject {
            id: Uuid::now_v7(),
            email: email.to_string(),
            attributes: attributes.as_object().cloned().unwrap_or_default(),
            tags: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let (_dir, repo) = repo().await;
        let subject = sample("ada@example.com", json!({ "first_name": "Ada" }));
        repo.insert(&subject).await.unwrap();

        let loaded = repo.get(&subject.id).await.unwrap().unwrap();
        assert_eq!(loaded.email, "ada@example.com");
        assert_eq!(loaded.attributes["first_name"], json!("Ada"));
    }

    #[tokio::test]
    async fn tags_are_idempotent() {
        let (_dir, repo) = repo().await;
        let subject = sample("ada@example.com", json!({}));
        repo.insert(&subject).await.unwrap();

        repo.add_tag(&subject.id, "vip").await.unwrap();
        repo.add_tag(&subject.id, "vip").await.unwrap();
        let loaded = repo.get(&subject.id).await.unwrap().unwrap();
        assert_eq!(loaded.tags, vec!["vip"]);

        repo.remove_tag(&subject.id, "vip").await.unwrap();
        repo.remove_tag(&subject.id, "vip").await.unwrap();
        let loaded = repo.get(&subject.id).await.unwrap().unwrap();
        assert!(loaded.tags.is_empty());
    }

    #[tokio::test]
    async fn list_membership_counts_move_once() {
        let (_dir, repo) = repo().await;
        let subject = sample("ada@example.com", json!({}));
        repo.insert(&subject).await.unwrap();

        let list_id = Uuid::now_v7();
        sqlx::query("INSERT INTO lists (id, name) VALUES (?, 'newsletter')")
            .bind(list_id.to_string())
            .execute(&repo.pool.writer)
            .await
            .unwrap();

        repo.add_to_list(&subject.id, &list_id).await.unwrap();
        repo.add_to_list(&subject.id, &list_id).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT member_count FROM lists WHERE id = ?")
            .bind(list_id.to_string())
            .fetch_one(&repo.pool.reader)
            .await
            .unwrap();
        assert_eq!(count, 1);

        repo.remove_from_list(&subject.id, &list_id).await.unwrap();
        repo.remove_from_list(&subject.id, &list_id).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT member_count FROM lists WHERE id = ?")
            .bind(list_id.to_string())
            .fetch_one(&repo.pool.reader)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn set_field_writes_json_attribute() {
        let (_dir, repo) = repo().await;
        let subject = sample("ada@example.com", json!({ "first_name": "Ada" }));
        repo.insert(&subject).await.unwrap();

        repo.set_field(&subject.id, "notes", "called back").await.unwrap();
        let loaded = repo.get(&subject.id).await.unwrap().unwrap();
        assert_eq!(loaded.attributes["notes"], json!("called back"));
        assert_eq!(loaded.attributes["first_name"], json!("Ada"));
    }

    #[tokio::test]
    async fn date_attribute_window_query() {
        let (_dir, repo) = repo().await;
        let now = Utc::now();

        let due = sample(
            "due@example.com",
            json!({ "renewal_date": (now + chrono::Duration::days(7)).to_rfc3339() }),
        );
        let bare_date = sample(
            "bare@example.com",
            json!({ "renewal_date": (now + chrono::Duration::days(7)).format("%Y-%m-%d").to_string() }),
        );
        let far = sample(
            "far@example.com",
            json!({ "renewal_date": (now + chrono::Duration::days(60)).to_rfc3339() }),
        );
        let junk = sample("junk@example.com", json!({ "renewal_date": "whenever" }));
        for s in [&due, &bare_date, &far, &junk] {
            repo.insert(s).await.unwrap();
        }

        let from = now + chrono::Duration::days(6);
        let to = now + chrono::Duration::days(8);
        let ids = repo
            .with_date_attribute_between("renewal_date", from, to, 100)
            .await
            .unwrap();
        assert!(ids.contains(&due.id));
        assert!(ids.contains(&bare_date.id));
        assert!(!ids.contains(&far.id));
        assert!(!ids.contains(&junk.id));
    }

    #[tokio::test]
    async fn segment_roundtrip() {
        let (_dir, repo) = repo().await;
        let segment = Segment {
            id: Uuid::now_v7(),
            name: "pro-plan".to_string(),
            clauses: vec![dripline_types::subject::SegmentClause {
                field: "plan".to_string(),
                operator: dripline_types::flow::CompareOp::Equals,
                value: json!("pro"),
            }],
        };
        repo.save_segment(&segment).await.unwrap();

        let loaded = repo.get_segment(&segment.id).await.unwrap().unwrap();
        assert_eq!(loaded.clauses.len(), 1);
        assert_eq!(loaded.clauses[0].field, "plan");
    }
}
