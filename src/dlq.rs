//! Dead-letter sink for deliveries that exhausted their retry budget.
//!
//! Treated as an external collaborator; this module ships the trait boundary plus an
//! in-memory implementation suitable for single-process deployments and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::delivery::DeliveryId;
use crate::error::Result;
use crate::event::{Event, EventId};
use crate::webhook::WebhookId;

/// One failed delivery attempt, kept as part of a DLQ entry's error history.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub error: String,
    pub response_code: Option<u16>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub delivery_id: DeliveryId,
    pub event: Event,
    pub webhook_id: WebhookId,
    pub error_history: Vec<AttemptRecord>,
    pub dead_at: DateTime<Utc>,
}

#[async_trait]
pub trait Dlq: Send + Sync {
    async fn push(&self, entry: DlqEntry) -> Result<()>;
    async fn list(&self, event_id: Option<EventId>) -> Result<Vec<DlqEntry>>;
}

#[derive(Default)]
pub struct InMemoryDlq {
    entries: Mutex<Vec<DlqEntry>>,
}

impl InMemoryDlq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Dlq for InMemoryDlq {
    async fn push(&self, entry: DlqEntry) -> Result<()> {
        tracing::warn!(
            delivery_id = %entry.delivery_id,
            webhook_id = %entry.webhook_id,
            attempts = entry.error_history.len(),
            "delivery exhausted retries, sunk to DLQ"
        );
        self.entries.lock().push(entry);
        Ok(())
    }

    async fn list(&self, event_id: Option<EventId>) -> Result<Vec<DlqEntry>> {
        let entries = self.entries.lock();
        Ok(match event_id {
            Some(id) => entries.iter().filter(|e| e.event.event_id == id).cloned().collect(),
            None => entries.clone(),
        })
    }
}
