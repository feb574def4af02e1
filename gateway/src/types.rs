//! Shared identifiers and storage rows.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Output entry returned by a worker for one job, including its `id`.
pub type JobOutput = Map<String, Value>;

/// Opaque identifier of an open connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Fresh random identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Generate a job id. UUID v4, unique for the process lifetime.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A persisted media frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaUnit {
    pub id: String,
    pub tenant_id: String,
    pub media_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at_time: DateTime<Utc>,
    pub path: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

/// Partial update of a media unit. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaUnitUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MediaUnitUpdate {
    /// Build an update from a worker output entry. Picks up `description`
    /// and `embedding` when present; returns `None` if neither is.
    pub fn from_output(id: &str, output: &JobOutput) -> Option<Self> {
        let description = output
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        let embedding = output
            .get("embedding")
            .and_then(|v| serde_json::from_value::<Vec<f32>>(v.clone()).ok());

        if description.is_none() && embedding.is_none() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            description,
            embedding,
        })
    }

    /// Fold a later update into this one, field by field. Later values win.
    pub fn merge(&mut self, later: MediaUnitUpdate) {
        if later.description.is_some() {
            self.description = later.description;
        }
        if later.embedding.is_some() {
            self.embedding = later.embedding;
        }
    }

    /// Apply to a stored row.
    pub fn apply(&self, unit: &mut MediaUnit) {
        if let Some(description) = &self.description {
            unit.description = Some(description.clone());
        }
        if let Some(embedding) = &self.embedding {
            unit.embedding = Some(embedding.clone());
        }
    }
}

/// Presentation view of a media unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaskedMediaUnit {
    pub id: String,
    pub description: Option<String>,
    pub at_time: DateTime<Utc>,
    pub media_id: String,
}

impl From<&MediaUnit> for MaskedMediaUnit {
    fn from(unit: &MediaUnit) -> Self {
        Self {
            id: unit.id.clone(),
            description: unit.description.clone(),
            at_time: unit.at_time,
            media_id: unit.media_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output(value: Value) -> JobOutput {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_update_from_output() {
        let update = MediaUnitUpdate::from_output(
            "mu",
            &output(json!({"id": "job", "embedding": [0.5, 1.0], "description": "a cat"})),
        )
        .unwrap();
        assert_eq!(update.id, "mu");
        assert_eq!(update.embedding, Some(vec![0.5, 1.0]));
        assert_eq!(update.description.as_deref(), Some("a cat"));

        assert!(MediaUnitUpdate::from_output("mu", &output(json!({"id": "job"}))).is_none());
    }

    #[test]
    fn test_merge_last_writer_per_field() {
        let mut first = MediaUnitUpdate {
            id: "mu".into(),
            description: Some("old".into()),
            embedding: Some(vec![1.0]),
        };
        first.merge(MediaUnitUpdate {
            id: "mu".into(),
            description: Some("new".into()),
            embedding: None,
        });
        assert_eq!(first.description.as_deref(), Some("new"));
        assert_eq!(first.embedding, Some(vec![1.0]));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
        assert_ne!(new_job_id(), new_job_id());
    }
}
