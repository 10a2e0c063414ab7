//! Stored-segment evaluator.
//!
//! Implements the `SegmentCollaborator` trait over locally stored segment
//! definitions: a segment matches when every clause holds against the
//! subject's attributes, using the same comparison semantics as Condition
//! steps.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use dripline_core::collaborator::{CollaboratorError, SegmentCollaborator};
use dripline_core::engine::predicate::compare;
use dripline_core::engine::template::path_lookup;
use dripline_core::repository::subject::SubjectRepository;

/// Evaluates stored segments against subject attributes.
pub struct StoredSegmentEvaluator<S: SubjectRepository> {
    subjects: Arc<S>,
}

impl<S: SubjectRepository> StoredSegmentEvaluator<S> {
    pub fn new(subjects: Arc<S>) -> Self {
        Self { subjects }
    }
}

impl<S: SubjectRepository + 'static> SegmentCollaborator for StoredSegmentEvaluator<S> {
    fn matches(
        &self,
        subject_id: Uuid,
        segment_id: Uuid,
    ) -> BoxFuture<'_, Result<bool, CollaboratorError>> {
        Box::pin(async move {
            let segment = self
                .subjects
                .get_segment(&segment_id)
                .await
                .map_err(|e| CollaboratorError::Transient(e.to_string()))?
                .ok_or_else(|| {
                    CollaboratorError::Permanent(format!("segment {segment_id} not found"))
                })?;

            let Some(subject) = self
                .subjects
                .get(&subject_id)
                .await
                .map_err(|e| CollaboratorError::Transient(e.to_string()))?
            else {
                return Ok(false);
            };

            Ok(segment.clauses.iter().all(|clause| {
                let actual: Option<Value> = if clause.field == "email" {
                    Some(Value::String(subject.email.clone()))
                } else {
                    path_lookup(&subject.attributes, &clause.field).cloned()
                };
                compare(clause.operator, actual.as_ref(), &clause.value)
            }))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::DatabasePool;
    use crate::sqlite::subject::SqliteSubjectRepository;
    use chrono::Utc;
    use dripline_types::flow::CompareOp;
    use dripline_types::subject::{Segment, SegmentClause, Subject};
    use serde_json::json;

    async fn fixture() -> (tempfile::TempDir, Arc<SqliteSubjectRepository>) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, Arc::new(SqliteSubjectRepository::new(pool)))
    }

    fn subject(email: &str, attributes: serde_json::Value) -> Subject {
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
    async fn all_clauses_must_hold() {
        let (_dir, subjects) = fixture().await;
        let evaluator = StoredSegmentEvaluator::new(subjects.clone());

        let pro = subject("pro@example.com", json!({ "plan": "pro", "seats": 12 }));
        let small = subject("small@example.com", json!({ "plan": "pro", "seats": 2 }));
        subjects.insert(&pro).await.unwrap();
        subjects.insert(&small).await.unwrap();

        let segment = Segment {
            id: Uuid::now_v7(),
            name: "big-pro".to_string(),
            clauses: vec![
                SegmentClause {
                    field: "plan".to_string(),
                    operator: CompareOp::Equals,
                    value: json!("pro"),
                },
                SegmentClause {
                    field: "seats".to_string(),
                    operator: CompareOp::GreaterThan,
                    value: json!(10),
                },
            ],
        };
        subjects.save_segment(&segment).await.unwrap();

        assert!(evaluator.matches(pro.id, segment.id).await.unwrap());
        assert!(!evaluator.matches(small.id, segment.id).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_subject_never_matches() {
        let (_dir, subjects) = fixture().await;
        let evaluator = StoredSegmentEvaluator::new(subjects.clone());

        let segment = Segment {
            id: Uuid::now_v7(),
            name: "anyone".to_string(),
            clauses: vec![],
        };
        subjects.save_segment(&segment).await.unwrap();

        assert!(
            !evaluator
                .matches(Uuid::now_v7(), segment.id)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn unknown_segment_is_permanent_error() {
        let (_dir, subjects) = fixture().await;
        let evaluator = StoredSegmentEvaluator::new(subjects);

        let err = evaluator
            .matches(Uuid::now_v7(), Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
