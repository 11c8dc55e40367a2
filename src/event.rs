//! Raw change records and the normalized [`Event`] shape derived from them.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resume token, opaque to everything but the [`ResumeStore`](crate::resume_store::ResumeStore)
/// and the underlying driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken(pub bson::Document);

/// The kind of mutation a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Invalidate,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Invalidate => "invalidate",
        };
        write!(f, "{s}")
    }
}

/// Namespace (database + collection) a change occurred in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

/// The `updateDescription` of a MongoDB change stream update event: fields that were set,
/// and fields that were removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    pub updated_fields: HashMap<String, bson::Bson>,
    pub removed_fields: Vec<String>,
}

/// A single raw change record as emitted by the change feed, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub operation_type: OperationType,
    pub ns: Namespace,
    pub document_key: bson::Document,
    pub update_description: Option<UpdateDescription>,
    pub full_document: Option<bson::Document>,
    pub full_document_before_change: Option<bson::Document>,
    pub cluster_time: DateTime<Utc>,
    /// Resume token positioned *after* this record.
    pub resume_token: ResumeToken,
}

/// A field-level diff entry in a normalized [`Event`]. Either a value transition or a removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldChange {
    Transition {
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<serde_json::Value>,
    },
    Removed {
        removed: bool,
    },
}

/// Time-ordered unique event id, monotone within a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The normalized document view carried in an [`Event`]'s `data` field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedData {
    pub id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_on: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: String,
}

/// A canonical, normalized change event. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    /// `<entity>.<action>`, matches `^[a-z_]+\.[a-z_]+$`.
    pub event_type: String,
    pub workspace: String,
    pub timestamp: DateTime<Utc>,
    pub data: NormalizedData,
    pub changes: HashMap<String, FieldChange>,
    pub resume_token: ResumeToken,
    pub collection: String,
    pub operation_type: OperationType,
}

/// The public payload sent over HTTP — internal fields (`resumeToken`, `collection`,
/// `operationType`) are never leaked to webhook receivers.
#[derive(Debug, Clone, Serialize)]
pub struct PublicPayload<'a> {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: &'a str,
    pub timestamp: DateTime<Utc>,
    pub workspace: &'a str,
    pub data: &'a NormalizedData,
    pub changes: &'a HashMap<String, FieldChange>,
}

impl Event {
    pub fn public_payload(&self) -> PublicPayload<'_> {
        PublicPayload {
            id: self.event_id,
            event_type: &self.event_type,
            timestamp: self.timestamp,
            workspace: &self.workspace,
            data: &self.data,
            changes: &self.changes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_payload_excludes_internal_fields() {
        let event = Event {
            event_id: EventId(1),
            event_type: "issue.created".into(),
            workspace: "p1".into(),
            timestamp: Utc::now(),
            data: NormalizedData {
                id: "i1".into(),
                ..Default::default()
            },
            changes: HashMap::new(),
            resume_token: ResumeToken(bson::doc! {"_data": "x"}),
            collection: "issues".into(),
            operation_type: OperationType::Insert,
        };
        let json = serde_json::to_value(event.public_payload()).unwrap();
        assert!(json.get("resumeToken").is_none());
        assert!(json.get("collection").is_none());
        assert!(json.get("operationType").is_none());
        assert_eq!(json["type"], "issue.created");
    }
}
