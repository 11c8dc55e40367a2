//! Classifies raw change records into canonical `entity.action` events.
//!
//! A pure function of `(RawChange, rule tables)`: no I/O, no shared mutable state beyond the
//! rule tables themselves, which are built once at startup and may be extended via the
//! `maps` configuration block.

use std::collections::HashMap;
use std::sync::Arc;

use bson::Bson;
use chrono::{DateTime, TimeZone, Utc};

use crate::event::{Event, EventId, FieldChange, NormalizedData, OperationType, ProjectRef, RawChange};

/// A classification rule's output: either a fixed event type, or a callback for cases that
/// need to inspect the raw change.
#[derive(Clone)]
pub enum RuleOutcome {
    Template(String),
    Callback(Arc<dyn Fn(&RawChange) -> String + Send + Sync>),
}

impl RuleOutcome {
    fn resolve(&self, raw: &RawChange) -> String {
        match self {
            RuleOutcome::Template(s) => s.clone(),
            RuleOutcome::Callback(f) => f(raw),
        }
    }
}

impl std::fmt::Debug for RuleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleOutcome::Template(s) => write!(f, "Template({s:?})"),
            RuleOutcome::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

/// Rule tables plus collection/field name maps driving classification.
#[derive(Debug, Clone)]
pub struct EventTypeDetector {
    collection_map: HashMap<String, String>,
    field_map: HashMap<String, String>,
    collection_rules: HashMap<(String, OperationKey), RuleOutcome>,
    wildcard_rules: HashMap<OperationKey, RuleOutcome>,
}

/// `OperationType` doesn't derive `Hash`/`Eq` (it's a wire enum); this mirrors it for use as a
/// rule-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OperationKey {
    Insert,
    Update,
    Replace,
    Delete,
    Invalidate,
}

impl From<OperationType> for OperationKey {
    fn from(op: OperationType) -> Self {
        match op {
            OperationType::Insert => OperationKey::Insert,
            OperationType::Update => OperationKey::Update,
            OperationType::Replace => OperationKey::Replace,
            OperationType::Delete => OperationKey::Delete,
            OperationType::Invalidate => OperationKey::Invalidate,
        }
    }
}

fn default_collection_map() -> HashMap<String, String> {
    [
        ("issues", "issue"),
        ("projects", "project"),
        ("comments", "comment"),
        ("attachments", "attachment"),
        ("spaces", "space"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_field_map() -> HashMap<String, String> {
    [
        ("status", "status_changed"),
        ("assignee", "assigned"),
        ("priority", "priority_changed"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl EventTypeDetector {
    pub fn new() -> Self {
        Self {
            collection_map: default_collection_map(),
            field_map: default_field_map(),
            collection_rules: HashMap::new(),
            wildcard_rules: HashMap::new(),
        }
    }

    /// Merges configured overrides/additions into the default collection and field maps.
    pub fn with_map_overrides(mut self, collection: HashMap<String, String>, field: HashMap<String, String>) -> Self {
        self.collection_map.extend(collection);
        self.field_map.extend(field);
        self
    }

    pub fn register_collection_rule(&mut self, collection: impl Into<String>, op: OperationType, rule: RuleOutcome) {
        self.collection_rules.insert((collection.into(), op.into()), rule);
    }

    pub fn register_wildcard_rule(&mut self, op: OperationType, rule: RuleOutcome) {
        self.wildcard_rules.insert(op.into(), rule);
    }

    fn entity_for(&self, raw: &RawChange) -> String {
        if raw.ns.coll.is_empty() {
            return "unknown".to_string();
        }
        self.collection_map
            .get(&raw.ns.coll)
            .cloned()
            .unwrap_or_else(|| raw.ns.coll.clone())
    }

    /// The update classifier: field map lookup (exact, then dotted-prefix), then structural
    /// fallbacks (`$` → array, `.` → nested, else → generic `updated`).
    fn update_action(&self, changed_keys: &[String]) -> String {
        for key in changed_keys {
            if let Some(action) = self.field_map.get(key) {
                return action.clone();
            }
            if let Some((prefix, _)) = key.split_once('.') {
                if let Some(action) = self.field_map.get(prefix) {
                    return action.clone();
                }
            }
        }
        if changed_keys.iter().any(|k| k.contains('$')) {
            "array_updated".to_string()
        } else if changed_keys.iter().any(|k| k.contains('.')) {
            "nested_updated".to_string()
        } else {
            "updated".to_string()
        }
    }

    fn classify_event_type(&self, raw: &RawChange) -> String {
        let op_key: OperationKey = raw.operation_type.into();

        if let Some(rule) = self.collection_rules.get(&(raw.ns.coll.clone(), op_key)) {
            return rule.resolve(raw);
        }
        if let Some(rule) = self.wildcard_rules.get(&op_key) {
            return rule.resolve(raw);
        }

        let entity = self.entity_for(raw);
        match raw.operation_type {
            OperationType::Insert => format!("{entity}.created"),
            OperationType::Delete => format!("{entity}.deleted"),
            OperationType::Replace => format!("{entity}.replaced"),
            OperationType::Invalidate => "collection.invalidated".to_string(),
            OperationType::Update => {
                let mut keys: Vec<String> = Vec::new();
                if let Some(desc) = &raw.update_description {
                    keys.extend(desc.updated_fields.keys().cloned());
                    keys.extend(desc.removed_fields.iter().cloned());
                }
                format!("{entity}.{}", self.update_action(&keys))
            }
        }
    }

    fn changes_map(&self, raw: &RawChange) -> HashMap<String, FieldChange> {
        let mut changes = HashMap::new();
        if let Some(desc) = &raw.update_description {
            for (field, value) in &desc.updated_fields {
                changes.insert(
                    field.clone(),
                    FieldChange::Transition {
                        from: None,
                        to: Some(bson_to_json(value)),
                    },
                );
            }
            for field in &desc.removed_fields {
                changes.insert(field.clone(), FieldChange::Removed { removed: true });
            }
        }
        changes
    }

    /// `delete` operations never carry `fullDocument`, so every getter here falls back to
    /// `fullDocumentBeforeChange` (when the collection has pre-image capture enabled) and, for
    /// the id alone, to `documentKey` — the one field MongoDB guarantees on every operation
    /// including `delete`.
    fn normalized_data(&self, raw: &RawChange) -> NormalizedData {
        let doc = raw.full_document.as_ref().or(raw.full_document_before_change.as_ref());
        let get_str = |key: &str| -> Option<String> {
            doc.and_then(|d| d.get_str(key).ok()).map(|s| s.to_string())
        };
        let get_epoch_millis = |key: &str| -> Option<DateTime<Utc>> {
            doc.and_then(|d| d.get_i64(key).ok()).and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        };

        let id = doc
            .and_then(|d| d.get("_id"))
            .or_else(|| raw.document_key.get("_id"))
            .map(bson_id_to_string)
            .unwrap_or_default();
        let space = get_str("space");

        NormalizedData {
            id,
            doc_type: get_str("_class"),
            title: get_str("title"),
            description: get_str("description"),
            status: get_str("status"),
            priority: get_str("priority"),
            assignee: get_str("assignee"),
            space: space.clone(),
            project: space.map(|id| ProjectRef { id }),
            created_on: get_epoch_millis("createdOn"),
            modified_on: get_epoch_millis("modifiedOn"),
        }
    }

    /// Classifies a raw change record into a normalized [`Event`]. Never panics: classification
    /// errors are caught and yield `unknown.event`, so a single malformed record cannot halt
    /// ingestion.
    pub fn detect(&self, event_id: EventId, raw: RawChange) -> Event {
        let event_type = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.classify_event_type(&raw)))
            .unwrap_or_else(|_| "unknown.event".to_string());

        let workspace = raw
            .full_document
            .as_ref()
            .or(raw.full_document_before_change.as_ref())
            .and_then(|d| d.get_str("space").ok())
            .unwrap_or("default")
            .to_string();

        Event {
            event_id,
            event_type,
            workspace,
            timestamp: raw.cluster_time,
            data: self.normalized_data(&raw),
            changes: self.changes_map(&raw),
            resume_token: raw.resume_token.clone(),
            collection: raw.ns.coll.clone(),
            operation_type: raw.operation_type,
        }
    }
}

impl Default for EventTypeDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn bson_id_to_string(bson: &Bson) -> String {
    match bson {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        other => other.to_string(),
    }
}

fn bson_to_json(bson: &Bson) -> serde_json::Value {
    serde_json::to_value(bson).unwrap_or(serde_json::Value::Null)
}
