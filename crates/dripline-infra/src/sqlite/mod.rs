//! SQLite persistence layer.

pub mod engagement;
pub mod enrollment;
pub mod flow;
pub mod pool;
pub mod subject;

use chrono::{DateTime, SecondsFormat, Utc};
use dripline_types::error::RepositoryError;
use uuid::Uuid;

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

// Fixed-width UTC rendering so lexicographic order in SQL matches time
// order.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Serialize a serde-friendly status enum to its snake_case string form.
pub(crate) fn status_to_str<T: serde::Serialize>(status: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(status).map_err(|e| RepositoryError::Query(e.to_string()))? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(RepositoryError::Query(format!(
            "status did not serialize to a string: {other}"
        ))),
    }
}

/// Parse a snake_case status string back into its enum.
pub(crate) fn status_from_str<T: serde::de::DeserializeOwned>(
    s: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid status: {s}")))
}
