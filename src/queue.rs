//! The durable pending-delivery set: enqueue, claim-with-lease, complete.
//!
//! Treated as the one piece of durably shared state between replicas; this
//! module ships the trait plus an in-memory implementation, in the style of
//! `batcher::storage::InMemoryStorage` — a concurrent map scanned and filtered on claim, with
//! state transitions validated through the [`crate::delivery`] typestate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::delivery::{AnyDelivery, Delivery, DeliveryId, Inflight, Pending, RetrySchedule};
use crate::dlq::{AttemptRecord, Dlq, DlqEntry};
use crate::error::{Error, Result};
use crate::event::{Event, EventId};
use crate::webhook::WebhookId;

/// Outcome of a completed attempt, passed to [`DeliveryQueue::complete`].
pub enum Outcome {
    Success { response_code: u16, response_latency_ms: u64 },
    /// A retryable failure. `retry_after` overrides the computed backoff when present
    /// (honoring an endpoint's `Retry-After` header).
    Retryable {
        error: String,
        response_code: Option<u16>,
        retry_after: Option<chrono::Duration>,
    },
    /// A client-permanent failure (4xx other than 408/425/429): skip retry, go straight to DLQ.
    Permanent { error: String, response_code: Option<u16> },
}

/// What happened to a delivery as a result of [`DeliveryQueue::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionResult {
    Succeeded,
    Requeued,
    Dead,
}

struct AttemptHistory {
    event_id: EventId,
    webhook_id: WebhookId,
    records: Vec<AttemptRecord>,
}

/// A durable ordered set of deliveries keyed by `(next_attempt_at, delivery_id)`, plus the
/// events they reference.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Atomically persists an event and its matched deliveries.
    async fn enqueue(&self, event: Event, deliveries: Vec<Delivery<Pending>>) -> Result<()>;

    /// Claims up to `batch` deliveries due at or before `now`, moving them to `Inflight` under
    /// a lease of `lease`.
    async fn claim(&self, batch: usize, now: DateTime<Utc>, lease: chrono::Duration) -> Result<Vec<Delivery<Inflight>>>;

    /// Looks up the event an inflight delivery references, so the Dispatcher can build its
    /// request without a separate round-trip.
    async fn event_for(&self, event_id: EventId) -> Result<Option<Event>>;

    /// Records the outcome of an inflight delivery. For a retryable failure within budget,
    /// computes the next attempt and requeues; for a permanent failure or exhausted retries,
    /// transitions to `dead` and pushes to the DLQ.
    async fn complete(&self, delivery_id: DeliveryId, outcome: Outcome, schedule: &RetrySchedule, now: DateTime<Utc>) -> Result<CompletionResult>;

    /// Reverts any `Inflight` delivery whose lease expired before completion back to `Pending`,
    /// so another worker can claim it. Returns the number reverted.
    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Gives up a claim voluntarily (e.g. the per-webhook ordering mutex was contended) rather
    /// than letting the lease expire, reverting to `Pending` at `next_attempt_at`.
    async fn requeue_contended(&self, delivery_id: DeliveryId, next_attempt_at: DateTime<Utc>) -> Result<()>;

    async fn pending_count(&self) -> Result<usize>;
}

/// Single-process in-memory implementation, sufficient for tests and a standalone binary.
pub struct InMemoryDeliveryQueue {
    events: RwLock<HashMap<EventId, Event>>,
    deliveries: RwLock<HashMap<DeliveryId, AnyDelivery>>,
    histories: RwLock<HashMap<DeliveryId, AttemptHistory>>,
    dlq: Arc<dyn Dlq>,
}

impl InMemoryDeliveryQueue {
    pub fn new(dlq: Arc<dyn Dlq>) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            deliveries: RwLock::new(HashMap::new()),
            histories: RwLock::new(HashMap::new()),
            dlq,
        }
    }

    fn record_attempt(&self, id: DeliveryId, event_id: EventId, webhook_id: WebhookId, attempt: u32, error: String, response_code: Option<u16>, at: DateTime<Utc>) {
        let mut histories = self.histories.write();
        histories
            .entry(id)
            .or_insert_with(|| AttemptHistory {
                event_id,
                webhook_id,
                records: Vec::new(),
            })
            .records
            .push(AttemptRecord {
                attempt,
                error,
                response_code,
                at,
            });
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn enqueue(&self, event: Event, deliveries: Vec<Delivery<Pending>>) -> Result<()> {
        let event_id = event.event_id;
        self.events.write().insert(event_id, event);
        let mut by_id = self.deliveries.write();
        for delivery in deliveries {
            by_id.insert(delivery.data.id, delivery.into());
        }
        Ok(())
    }

    async fn claim(&self, batch: usize, now: DateTime<Utc>, lease: chrono::Duration) -> Result<Vec<Delivery<Inflight>>> {
        let mut by_id = self.deliveries.write();

        let mut due: Vec<DeliveryId> = by_id
            .values()
            .filter_map(|d| d.as_pending())
            .filter(|d| d.state.next_attempt_at <= now)
            .map(|d| d.data.id)
            .collect();
        due.sort_by_key(|id| {
            let d = by_id.get(id).and_then(|d| d.as_pending());
            d.map(|d| (d.state.next_attempt_at, d.data.event_id)).unwrap_or((now, EventId(0)))
        });
        due.truncate(batch);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let Some(AnyDelivery::Pending(pending)) = by_id.remove(&id) else {
                continue;
            };
            let inflight = pending.claim(now, lease);
            by_id.insert(id, inflight.clone().into());
            claimed.push(inflight);
        }
        Ok(claimed)
    }

    async fn event_for(&self, event_id: EventId) -> Result<Option<Event>> {
        Ok(self.events.read().get(&event_id).cloned())
    }

    async fn complete(&self, delivery_id: DeliveryId, outcome: Outcome, schedule: &RetrySchedule, now: DateTime<Utc>) -> Result<CompletionResult> {
        let inflight = {
            let mut by_id = self.deliveries.write();
            match by_id.remove(&delivery_id) {
                Some(AnyDelivery::Inflight(d)) => d,
                Some(other) => {
                    // Lease already reaped and reclaimed by another worker, or already terminal;
                    // put it back untouched and let the caller's outcome be a no-op.
                    by_id.insert(delivery_id, other);
                    return Err(Error::TerminalDelivery(delivery_id));
                }
                None => return Err(Error::DeliveryNotFound(delivery_id)),
            }
        };

        let event_id = inflight.data.event_id;
        let webhook_id = inflight.data.webhook_id.clone();
        let attempt = inflight.state.attempt;

        match outcome {
            Outcome::Success { response_code, response_latency_ms } => {
                let succeeded = inflight.succeed(response_code, response_latency_ms, now);
                self.deliveries.write().insert(delivery_id, succeeded.into());
                Ok(CompletionResult::Succeeded)
            }
            Outcome::Retryable {
                error,
                response_code,
                retry_after,
            } => {
                self.record_attempt(delivery_id, event_id, webhook_id.clone(), attempt, error.clone(), response_code, now);
                let failed = inflight.fail(error, response_code, now);

                let result = if let Some(retry_after) = retry_after {
                    Ok(failed.retry_after(retry_after, schedule.cap_ms, now))
                } else {
                    failed.into_retry(schedule, now)
                };

                match result {
                    Ok(pending) => {
                        self.deliveries.write().insert(delivery_id, pending.into());
                        Ok(CompletionResult::Requeued)
                    }
                    Err(dead) => {
                        self.sink_to_dlq(delivery_id, event_id, webhook_id, dead.state.last_error.clone(), dead.state.response_code, now)
                            .await?;
                        self.deliveries.write().insert(delivery_id, dead.into());
                        Ok(CompletionResult::Dead)
                    }
                }
            }
            Outcome::Permanent { error, response_code } => {
                self.record_attempt(delivery_id, event_id, webhook_id.clone(), attempt, error.clone(), response_code, now);
                let dead = inflight.kill(error.clone(), response_code, now);
                self.sink_to_dlq(delivery_id, event_id, webhook_id, error, response_code, now).await?;
                self.deliveries.write().insert(delivery_id, dead.into());
                Ok(CompletionResult::Dead)
            }
        }
    }

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut by_id = self.deliveries.write();
        let expired: Vec<DeliveryId> = by_id
            .values()
            .filter_map(|d| d.as_inflight())
            .filter(|d| d.state.lease_expires_at <= now)
            .map(|d| d.data.id)
            .collect();
        let count = expired.len();
        for id in expired {
            if let Some(AnyDelivery::Inflight(inflight)) = by_id.remove(&id) {
                by_id.insert(id, inflight.unclaim().into());
            }
        }
        Ok(count)
    }

    async fn requeue_contended(&self, delivery_id: DeliveryId, next_attempt_at: DateTime<Utc>) -> Result<()> {
        let mut by_id = self.deliveries.write();
        match by_id.remove(&delivery_id) {
            Some(AnyDelivery::Inflight(inflight)) => {
                by_id.insert(delivery_id, inflight.unclaim_at(next_attempt_at).into());
                Ok(())
            }
            Some(other) => {
                by_id.insert(delivery_id, other);
                Ok(())
            }
            None => Err(Error::DeliveryNotFound(delivery_id)),
        }
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(self.deliveries.read().values().filter(|d| d.is_pending()).count())
    }
}

impl InMemoryDeliveryQueue {
    async fn sink_to_dlq(&self, delivery_id: DeliveryId, event_id: EventId, webhook_id: WebhookId, last_error: String, response_code: Option<u16>, now: DateTime<Utc>) -> Result<()> {
        let Some(event) = self.events.read().get(&event_id).cloned() else {
            return Ok(());
        };
        let mut error_history = self
            .histories
            .write()
            .remove(&delivery_id)
            .map(|h| h.records)
            .unwrap_or_default();
        if error_history.last().map(|r| &r.error) != Some(&last_error) {
            error_history.push(AttemptRecord {
                attempt: error_history.len() as u32 + 1,
                error: last_error,
                response_code,
                at: now,
            });
        }
        self.dlq
            .push(DlqEntry {
                delivery_id,
                event,
                webhook_id,
                error_history,
                dead_at: now,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::InMemoryDlq;
    use crate::event::{EventId, FieldChange, NormalizedData, OperationType, ResumeToken};
    use crate::webhook::WebhookId;
    use std::collections::HashMap as StdHashMap;

    fn sample_event(id: u64) -> Event {
        Event {
            event_id: EventId(id),
            event_type: "issue.created".into(),
            workspace: "p1".into(),
            timestamp: Utc::now(),
            data: NormalizedData {
                id: "i1".into(),
                ..Default::default()
            },
            changes: StdHashMap::<String, FieldChange>::new(),
            resume_token: ResumeToken(bson::doc! {"_data": "x"}),
            collection: "issues".into(),
            operation_type: OperationType::Insert,
        }
    }

    fn queue() -> InMemoryDeliveryQueue {
        InMemoryDeliveryQueue::new(Arc::new(InMemoryDlq::new()))
    }

    #[tokio::test]
    async fn enqueue_then_claim_then_succeed() {
        let q = queue();
        let now = Utc::now();
        let pending = Delivery::new_initial(EventId(1), WebhookId::from("w1"), now);
        q.enqueue(sample_event(1), vec![pending]).await.unwrap();

        let claimed = q.claim(10, now, chrono::Duration::seconds(60)).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let result = q
            .complete(
                claimed[0].data.id,
                Outcome::Success {
                    response_code: 200,
                    response_latency_ms: 10,
                },
                &RetrySchedule::default(),
                now,
            )
            .await
            .unwrap();
        assert_eq!(result, CompletionResult::Succeeded);
        assert_eq!(q.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retryable_failure_requeues_until_budget_exhausted() {
        let q = queue();
        let now = Utc::now();
        let schedule = RetrySchedule {
            base_ms: 1,
            cap_ms: 10,
            max_attempts: 2,
        };
        let pending = Delivery::new_initial(EventId(1), WebhookId::from("w1"), now);
        q.enqueue(sample_event(1), vec![pending]).await.unwrap();

        let claimed = q.claim(10, now, chrono::Duration::seconds(60)).await.unwrap();
        let id = claimed[0].data.id;
        let result = q
            .complete(
                id,
                Outcome::Retryable {
                    error: "boom".into(),
                    response_code: Some(500),
                    retry_after: None,
                },
                &schedule,
                now,
            )
            .await
            .unwrap();
        assert_eq!(result, CompletionResult::Requeued);
        assert_eq!(q.pending_count().await.unwrap(), 1);

        let later = now + chrono::Duration::seconds(1);
        let claimed2 = q.claim(10, later, chrono::Duration::seconds(60)).await.unwrap();
        assert_eq!(claimed2.len(), 1);
        let result2 = q
            .complete(
                id,
                Outcome::Retryable {
                    error: "boom again".into(),
                    response_code: Some(500),
                    retry_after: None,
                },
                &schedule,
                later,
            )
            .await
            .unwrap();
        assert_eq!(result2, CompletionResult::Dead);
    }

    #[tokio::test]
    async fn permanent_failure_skips_straight_to_dead() {
        let q = queue();
        let now = Utc::now();
        let pending = Delivery::new_initial(EventId(1), WebhookId::from("w1"), now);
        q.enqueue(sample_event(1), vec![pending]).await.unwrap();
        let claimed = q.claim(10, now, chrono::Duration::seconds(60)).await.unwrap();

        let result = q
            .complete(
                claimed[0].data.id,
                Outcome::Permanent {
                    error: "HTTP 400".into(),
                    response_code: Some(400),
                },
                &RetrySchedule::default(),
                now,
            )
            .await
            .unwrap();
        assert_eq!(result, CompletionResult::Dead);
    }

    #[tokio::test]
    async fn expired_lease_reverts_to_pending() {
        let q = queue();
        let now = Utc::now();
        let pending = Delivery::new_initial(EventId(1), WebhookId::from("w1"), now);
        q.enqueue(sample_event(1), vec![pending]).await.unwrap();
        q.claim(10, now, chrono::Duration::seconds(1)).await.unwrap();

        let later = now + chrono::Duration::seconds(5);
        let reverted = q.reap_expired_leases(later).await.unwrap();
        assert_eq!(reverted, 1);
        assert_eq!(q.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn requeue_contended_reverts_to_pending_at_given_time() {
        let q = queue();
        let now = Utc::now();
        let pending = Delivery::new_initial(EventId(1), WebhookId::from("w1"), now);
        q.enqueue(sample_event(1), vec![pending]).await.unwrap();
        let claimed = q.claim(10, now, chrono::Duration::seconds(60)).await.unwrap();
        let id = claimed[0].data.id;

        let retry_at = now + chrono::Duration::milliseconds(100);
        q.requeue_contended(id, retry_at).await.unwrap();
        assert_eq!(q.pending_count().await.unwrap(), 1);

        let claimed2 = q.claim(10, retry_at, chrono::Duration::seconds(60)).await.unwrap();
        assert_eq!(claimed2.len(), 1);
        assert_eq!(claimed2[0].data.id, id);
    }

    #[tokio::test]
    async fn claim_respects_batch_ordering_by_next_attempt_at() {
        let q = queue();
        let now = Utc::now();
        let p1 = Delivery::new_initial(EventId(1), WebhookId::from("w1"), now + chrono::Duration::seconds(5));
        let p2 = Delivery::new_initial(EventId(2), WebhookId::from("w1"), now);
        q.enqueue(sample_event(1), vec![p1]).await.unwrap();
        q.enqueue(sample_event(2), vec![p2]).await.unwrap();

        let claimed = q.claim(1, now + chrono::Duration::seconds(10), chrono::Duration::seconds(60)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].data.event_id, EventId(2));
    }
}
