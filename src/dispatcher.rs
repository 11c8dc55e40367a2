//! The worker pool that claims due deliveries, signs them, sends them over HTTP, and records
//! the outcome against the delivery queue and circuit breaker.
//!
//! Structured as claim/sign workers (own queue access and webhook secrets) feeding a
//! semaphore-bounded sender pool that performs only HTTP I/O, mirroring the split already used
//! by this codebase's own webhook dispatcher for a different notification system: the sender
//! task never touches a secret, so it cannot leak one even if its error paths are sloppy.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::circuit_breaker::{CircuitBreaker, Permit};
use crate::delivery::{DeliveryId, RetrySchedule};
use crate::error::DispatchError;
use crate::queue::{CompletionResult, DeliveryQueue, Outcome};
use crate::registry::WebhookRegistry;
use crate::webhook::WebhookId;

const USER_AGENT: &str = concat!("webhook-dispatcher/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub claim_batch_size: usize,
    pub claim_interval_ms: u64,
    pub per_request_timeout_ms: u64,
    pub lease_ms: u64,
    pub grace_period_sec: u64,
    pub max_concurrent_sends: usize,
    pub channel_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            claim_batch_size: 16,
            claim_interval_ms: 200,
            per_request_timeout_ms: 30_000,
            // 2x the per-request timeout, so a stalled send always loses its lease before a
            // second worker could otherwise claim the same delivery.
            lease_ms: 60_000,
            grace_period_sec: 30,
            max_concurrent_sends: 64,
            channel_capacity: 256,
        }
    }
}

/// A signed, ready-to-send HTTP request, carrying the per-webhook ordering guard that must stay
/// held until its outcome is recorded.
struct SendRequest {
    delivery_id: DeliveryId,
    webhook_id: WebhookId,
    url: String,
    headers: Vec<(String, String)>,
    body: String,
    order_guard: OwnedMutexGuard<()>,
}

enum SendOutcome {
    Success {
        status: u16,
        latency_ms: u64,
    },
    Retryable {
        error: DispatchError,
        status: Option<u16>,
        retry_after: Option<chrono::Duration>,
        latency_ms: u64,
    },
    Permanent {
        error: DispatchError,
        status: Option<u16>,
    },
}

struct SendResult {
    delivery_id: DeliveryId,
    webhook_id: WebhookId,
    outcome: SendOutcome,
    order_guard: OwnedMutexGuard<()>,
}

/// One ordering mutex per webhook, created lazily. Acquired non-blockingly: on contention the
/// claiming worker gives the delivery straight back rather than waiting on another webhook's
/// inflight attempt.
#[derive(Default)]
struct OrderLocks {
    locks: DashMap<WebhookId, Arc<AsyncMutex<()>>>,
}

impl OrderLocks {
    fn handle_for(&self, webhook_id: &WebhookId) -> Arc<AsyncMutex<()>> {
        self.locks.entry(webhook_id.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

/// Claims due deliveries, signs and sends them, and records the outcome. See module docs for
/// the claim/sign vs. sender-pool split.
pub struct Dispatcher {
    queue: Arc<dyn DeliveryQueue>,
    registry: Arc<WebhookRegistry>,
    breaker: Arc<CircuitBreaker>,
    config: DispatcherConfig,
    retry_schedule: RetrySchedule,
    http_client: reqwest::Client,
    order_locks: OrderLocks,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn DeliveryQueue>, registry: Arc<WebhookRegistry>, breaker: Arc<CircuitBreaker>, config: DispatcherConfig, retry_schedule: RetrySchedule) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(StdDuration::from_millis(config.per_request_timeout_ms))
            .build()
            .expect("failed to build dispatcher HTTP client");
        Self {
            queue,
            registry,
            breaker,
            config,
            retry_schedule,
            http_client,
            order_locks: OrderLocks::default(),
        }
    }

    /// Runs the claim workers, sender pool, and result drain loop until `shutdown` fires, then
    /// waits up to `gracePeriodSec` for inflight sends to finish before returning.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let (send_tx, send_rx) = mpsc::channel(self.config.channel_capacity);
        let (result_tx, result_rx) = mpsc::channel(self.config.channel_capacity);

        let sender_handle = tokio::spawn(run_sender(send_rx, result_tx, self.http_client.clone(), self.config.max_concurrent_sends, shutdown.clone()));

        let drain_handle = {
            let this = self.clone();
            let drain_shutdown = shutdown.clone();
            tokio::spawn(async move { this.drain_results(result_rx, drain_shutdown).await })
        };

        let mut claim_handles = Vec::with_capacity(self.config.workers);
        for worker in 0..self.config.workers {
            let this = self.clone();
            let send_tx = send_tx.clone();
            let claim_shutdown = shutdown.clone();
            claim_handles.push(tokio::spawn(async move { this.claim_loop(worker, send_tx, claim_shutdown).await }));
        }
        drop(send_tx);

        for handle in claim_handles {
            let _ = handle.await;
        }

        let grace = StdDuration::from_secs(self.config.grace_period_sec);
        if tokio::time::timeout(grace, async {
            let _ = drain_handle.await;
            let _ = sender_handle.await;
        })
        .await
        .is_err()
        {
            warn!("dispatcher grace period elapsed with sends still inflight; their leases will expire and requeue");
        }
    }

    async fn claim_loop(&self, worker: usize, send_tx: mpsc::Sender<SendRequest>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(StdDuration::from_millis(self.config.claim_interval_ms));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(worker, "dispatcher claim worker received shutdown");
                    break;
                }
                _ = interval.tick() => {
                    self.claim_and_sign(&send_tx).await;
                }
            }
        }
    }

    #[instrument(skip(self, send_tx))]
    async fn claim_and_sign(&self, send_tx: &mpsc::Sender<SendRequest>) {
        let now = Utc::now();
        let lease = chrono::Duration::milliseconds(self.config.lease_ms as i64);
        let claimed = match self.queue.claim(self.config.claim_batch_size, now, lease).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to claim deliveries");
                return;
            }
        };

        for delivery in claimed {
            let delivery_id = delivery.data.id;
            let webhook_id = delivery.data.webhook_id.clone();

            let Some(registered) = self.registry.get(&webhook_id) else {
                // The webhook was fully removed from the registry (not merely deactivated —
                // deactivated-but-registered webhooks still drain their queue). Nothing left to
                // notify.
                self.complete_permanently(delivery_id, "webhook no longer registered".to_string(), None, now).await;
                continue;
            };
            let webhook = &registered.webhook;

            match self.breaker.poll(&webhook_id, &webhook.circuit_breaker_overrides, now) {
                Permit::Rejected { retry_after_secs } => {
                    // A breaker rejection counts as an attempt but must not feed back into the
                    // breaker itself, or it would reinforce its own open state.
                    let dispatch_error = DispatchError::BreakerOpen {
                        webhook_id: webhook_id.clone(),
                        retry_after_secs,
                    };
                    if let Err(e) = self
                        .queue
                        .complete(
                            delivery_id,
                            Outcome::Retryable {
                                error: dispatch_error.to_string(),
                                response_code: None,
                                retry_after: Some(chrono::Duration::seconds(retry_after_secs as i64)),
                            },
                            &self.retry_schedule,
                            now,
                        )
                        .await
                    {
                        warn!(%delivery_id, error = %e, "failed to record breaker-open completion");
                    }
                    continue;
                }
                Permit::Allowed => {}
            }

            let order_lock = self.order_locks.handle_for(&webhook_id);
            let Ok(order_guard) = order_lock.try_lock_owned() else {
                // Another attempt for this webhook is still inflight: give the delivery back
                // rather than blocking this worker on an unrelated webhook's turnaround.
                let _ = self.queue.requeue_contended(delivery_id, now + chrono::Duration::milliseconds(100)).await;
                continue;
            };

            let event = match self.queue.event_for(delivery.data.event_id).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    self.complete_permanently(delivery_id, "referenced event missing".to_string(), None, now).await;
                    continue;
                }
                Err(e) => {
                    warn!(%delivery_id, error = %e, "failed to load event for delivery");
                    continue;
                }
            };

            let body = match serde_json::to_string(&event.public_payload()) {
                Ok(b) => b,
                Err(e) => {
                    self.complete_permanently(delivery_id, format!("failed to serialize payload: {e}"), None, now).await;
                    continue;
                }
            };

            let ts = now.timestamp();
            let signature = crate::signing::sign(&webhook.secret, ts, &body);

            let mut headers = vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("User-Agent".to_string(), USER_AGENT.to_string()),
                ("X-Webhook-Id".to_string(), webhook_id.to_string()),
                ("X-Webhook-Event".to_string(), event.event_type.clone()),
                ("X-Webhook-Delivery".to_string(), delivery_id.to_string()),
                ("X-Webhook-Signature".to_string(), format!("sha256={signature}")),
                ("X-Webhook-Timestamp".to_string(), ts.to_string()),
            ];
            headers.extend(webhook.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

            let request = SendRequest {
                delivery_id,
                webhook_id: webhook_id.clone(),
                url: webhook.url.clone(),
                headers,
                body,
                order_guard,
            };

            if send_tx.try_send(request).is_err() {
                warn!(%delivery_id, "sender channel saturated, requeuing");
                let _ = self.queue.requeue_contended(delivery_id, now + chrono::Duration::milliseconds(100)).await;
            }
        }
    }

    async fn complete_permanently(&self, delivery_id: DeliveryId, error: String, response_code: Option<u16>, now: DateTime<Utc>) {
        if let Err(e) = self.queue.complete(delivery_id, Outcome::Permanent { error, response_code }, &self.retry_schedule, now).await {
            warn!(%delivery_id, error = %e, "failed to record completion");
        }
    }

    async fn drain_results(&self, mut result_rx: mpsc::Receiver<SendResult>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                result = result_rx.recv() => {
                    match result {
                        Some(result) => self.record_result(result).await,
                        None => break,
                    }
                }
                _ = shutdown.cancelled() => {
                    // Keep draining synchronously until the channel is empty, so sends already
                    // in flight still get their outcome recorded during the grace period.
                    while let Ok(result) = result_rx.try_recv() {
                        self.record_result(result).await;
                    }
                    break;
                }
            }
        }
    }

    #[instrument(skip(self, result), fields(delivery_id = %result.delivery_id, webhook_id = %result.webhook_id))]
    async fn record_result(&self, result: SendResult) {
        let now = Utc::now();
        let overrides = self
            .registry
            .get(&result.webhook_id)
            .map(|r| r.webhook.circuit_breaker_overrides.clone())
            .unwrap_or_default();

        let outcome = match result.outcome {
            SendOutcome::Success { status, latency_ms } => {
                self.breaker.record_outcome(&result.webhook_id, &overrides, now, true, latency_ms);
                Outcome::Success {
                    response_code: status,
                    response_latency_ms: latency_ms,
                }
            }
            SendOutcome::Retryable { error, status, retry_after, latency_ms } => {
                self.breaker.record_outcome(&result.webhook_id, &overrides, now, false, latency_ms);
                Outcome::Retryable {
                    error: error.to_string(),
                    response_code: status,
                    retry_after,
                }
            }
            SendOutcome::Permanent { error, status } => {
                // Client-permanent failures are the caller's fault, not the endpoint's; the
                // breaker is left untouched.
                Outcome::Permanent { error: error.to_string(), response_code: status }
            }
        };

        match self.queue.complete(result.delivery_id, outcome, &self.retry_schedule, now).await {
            Ok(CompletionResult::Succeeded) => debug!("delivery succeeded"),
            Ok(CompletionResult::Requeued) => debug!("delivery requeued"),
            Ok(CompletionResult::Dead) => warn!("delivery exhausted retries, sunk to DLQ"),
            Err(e) => warn!(error = %e, "failed to record delivery outcome"),
        }
        drop(result.order_guard);
    }
}

/// Long-lived task pool that receives signed requests and performs HTTP delivery. Never sees a
/// webhook secret or the delivery queue — only HTTP in, result out.
async fn run_sender(mut rx: mpsc::Receiver<SendRequest>, result_tx: mpsc::Sender<SendResult>, http_client: reqwest::Client, max_concurrent: usize, shutdown: CancellationToken) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));

    loop {
        let request = tokio::select! {
            req = rx.recv() => match req {
                Some(r) => r,
                None => {
                    debug!("dispatcher sender channel closed, shutting down");
                    break;
                }
            },
            _ = shutdown.cancelled() => {
                debug!("dispatcher sender received shutdown");
                break;
            }
        };

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let client = http_client.clone();
        let tx = result_tx.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let started = Instant::now();

            let mut builder = client.post(&request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            let send_result = builder.body(request.body.clone()).send().await;
            let latency_ms = started.elapsed().as_millis() as u64;
            let outcome = classify_response(send_result, latency_ms);

            let result = SendResult {
                delivery_id: request.delivery_id,
                webhook_id: request.webhook_id,
                outcome,
                order_guard: request.order_guard,
            };
            if tx.send(result).await.is_err() {
                warn!("failed to report send result, receiver dropped");
            }
        });
    }

    debug!("dispatcher sender task exited");
}

/// Maps a raw transport/HTTP outcome onto the [`DispatchError`] taxonomy explicitly, rather than
/// via string matching on an error message: 4xx other than 408/425/429 is `ClientPermanent`; 429
/// is `RateLimited`; everything else (408/425, 5xx, transport failure, timeout) is
/// `TransientTransport`.
fn classify_response(send_result: reqwest::Result<reqwest::Response>, latency_ms: u64) -> SendOutcome {
    match send_result {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                return SendOutcome::Success { status: status.as_u16(), latency_ms };
            }
            let code = status.as_u16();
            let retry_after_header = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            if status.is_client_error() && !matches!(code, 408 | 425 | 429) {
                return SendOutcome::Permanent {
                    error: DispatchError::ClientPermanent { status: code },
                    status: Some(code),
                };
            }

            let retry_after = retry_after_header.as_deref().and_then(|h| parse_retry_after(h, Utc::now()));

            let error = if code == 429 {
                DispatchError::RateLimited {
                    retry_after_secs: retry_after.map(|d| d.num_seconds().max(0) as u64).unwrap_or(0),
                }
            } else {
                DispatchError::TransientTransport(format!("HTTP {code}"))
            };

            SendOutcome::Retryable {
                error,
                status: Some(code),
                retry_after,
                latency_ms,
            }
        }
        Err(e) => {
            let error = if e.is_timeout() {
                DispatchError::TransientTransport("request timed out".to_string())
            } else {
                DispatchError::TransientTransport(e.to_string())
            };
            SendOutcome::Retryable {
                error,
                status: None,
                retry_after: None,
                latency_ms,
            }
        }
    }
}

/// Parses a `Retry-After` header: either delta-seconds or an HTTP-date.
fn parse_retry_after(header: &str, now: DateTime<Utc>) -> Option<chrono::Duration> {
    let header = header.trim();
    if let Ok(secs) = header.parse::<i64>() {
        return Some(chrono::Duration::seconds(secs.max(0)));
    }
    DateTime::parse_from_rfc2822(header)
        .ok()
        .map(|at| (at.with_timezone(&Utc) - now).max(chrono::Duration::zero()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use crate::circuit_breaker::BreakerState;
    use crate::delivery::Delivery;
    use crate::dlq::{Dlq, InMemoryDlq};
    use crate::event::{EventId, FieldChange, NormalizedData, OperationType, ResumeToken};
    use crate::queue::InMemoryDeliveryQueue;
    use crate::webhook::Webhook;
    use std::collections::HashMap;

    fn header(request: &Request, name: &str) -> String {
        request.headers.get(name).expect("header present").to_str().unwrap().to_string()
    }

    fn https_webhook(id: &str, mock_server: &MockServer) -> Webhook {
        let mut webhook = Webhook::new(id, "https://example.invalid/hook", "s".repeat(32), vec!["issue.*".to_string()]).unwrap();
        webhook.url = format!("{}/hook", mock_server.uri());
        webhook
    }

    fn sample_event(id: u64) -> crate::event::Event {
        crate::event::Event {
            event_id: EventId(id),
            event_type: "issue.created".into(),
            workspace: "p1".into(),
            timestamp: Utc::now(),
            data: NormalizedData {
                id: "i1".into(),
                ..Default::default()
            },
            changes: HashMap::<String, FieldChange>::new(),
            resume_token: ResumeToken(bson::doc! {"_data": "x"}),
            collection: "issues".into(),
            operation_type: OperationType::Insert,
        }
    }

    #[tokio::test]
    async fn claim_and_sign_skips_missing_webhook() {
        let queue: Arc<dyn DeliveryQueue> = Arc::new(InMemoryDeliveryQueue::new(Arc::new(InMemoryDlq::new())));
        let registry = Arc::new(WebhookRegistry::new());
        let breaker = Arc::new(CircuitBreaker::default());
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), registry, breaker, DispatcherConfig::default(), RetrySchedule::default()));

        let now = Utc::now();
        let pending = Delivery::new_initial(EventId(1), WebhookId::from("nope"), now);
        queue.enqueue(sample_event(1), vec![pending]).await.unwrap();

        let (send_tx, _send_rx) = mpsc::channel(8);
        dispatcher.claim_and_sign(&send_tx).await;

        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn end_to_end_delivery_records_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        // `Webhook::new` requires https; construct with a placeholder https URL, then point
        // `url` at wiremock's plain-http listener to exercise the send pipeline.
        let queue: Arc<dyn DeliveryQueue> = Arc::new(InMemoryDeliveryQueue::new(Arc::new(InMemoryDlq::new())));
        let registry = Arc::new(WebhookRegistry::new());
        let mut webhook = Webhook::new("w1", "https://example.invalid/hook", "s".repeat(32), vec!["issue.*".to_string()]).unwrap();
        webhook.url = format!("{}/hook", mock_server.uri());
        registry.upsert(webhook).unwrap();

        let breaker = Arc::new(CircuitBreaker::default());
        let config = DispatcherConfig {
            claim_interval_ms: 10,
            grace_period_sec: 2,
            ..DispatcherConfig::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), registry, breaker, config, RetrySchedule::default()));

        let now = Utc::now();
        let pending = Delivery::new_initial(EventId(1), WebhookId::from("w1"), now);
        queue.enqueue(sample_event(1), vec![pending]).await.unwrap();

        let shutdown = CancellationToken::new();
        let run_handle = tokio::spawn(dispatcher.clone().run(shutdown.clone()));

        tokio::time::sleep(StdDuration::from_millis(200)).await;
        shutdown.cancel();
        let _ = tokio::time::timeout(StdDuration::from_secs(3), run_handle).await;

        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    /// The `X-Webhook-Signature` header a receiver sees
    /// must equal `hex(hmac_sha256(secret, "{timestamp}.{body}"))` recomputed independently from
    /// the other headers and the captured body.
    #[tokio::test]
    async fn signature_header_matches_independently_recomputed_hmac() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let secret = "s".repeat(32);
        let queue: Arc<dyn DeliveryQueue> = Arc::new(InMemoryDeliveryQueue::new(Arc::new(InMemoryDlq::new())));
        let registry = Arc::new(WebhookRegistry::new());
        let mut webhook = https_webhook("w1", &mock_server);
        webhook.secret = secret.clone();
        registry.upsert(webhook).unwrap();

        let breaker = Arc::new(CircuitBreaker::default());
        let config = DispatcherConfig {
            claim_interval_ms: 10,
            grace_period_sec: 2,
            ..DispatcherConfig::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), registry, breaker, config, RetrySchedule::default()));

        let now = Utc::now();
        let pending = Delivery::new_initial(EventId(1), WebhookId::from("w1"), now);
        queue.enqueue(sample_event(1), vec![pending]).await.unwrap();

        let shutdown = CancellationToken::new();
        let run_handle = tokio::spawn(dispatcher.clone().run(shutdown.clone()));
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        shutdown.cancel();
        let _ = tokio::time::timeout(StdDuration::from_secs(3), run_handle).await;

        let received = mock_server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let request = &received[0];

        let ts: i64 = header(request, "X-Webhook-Timestamp").parse().unwrap();
        let body = String::from_utf8(request.body.clone()).unwrap();
        let expected = format!("sha256={}", crate::signing::sign(&secret, ts, &body));
        assert_eq!(header(request, "X-Webhook-Signature"), expected);
    }

    /// S5: a client-permanent (4xx other than 408/425/429) response skips retry entirely, lands
    /// the delivery in the DLQ on the first attempt, and never touches the circuit breaker —
    /// the caller is at fault, not the endpoint.
    #[tokio::test]
    async fn s5_permanent_failure_lands_in_dlq_without_tripping_breaker() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&mock_server)
            .await;

        let dlq = Arc::new(InMemoryDlq::new());
        let queue: Arc<dyn DeliveryQueue> = Arc::new(InMemoryDeliveryQueue::new(dlq.clone()));
        let registry = Arc::new(WebhookRegistry::new());
        registry.upsert(https_webhook("w1", &mock_server)).unwrap();

        let breaker = Arc::new(CircuitBreaker::default());
        let config = DispatcherConfig {
            claim_interval_ms: 10,
            grace_period_sec: 2,
            ..DispatcherConfig::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), registry, breaker.clone(), config, RetrySchedule::default()));

        let now = Utc::now();
        let pending = Delivery::new_initial(EventId(1), WebhookId::from("w1"), now);
        let delivery_id = pending.data.id;
        queue.enqueue(sample_event(1), vec![pending]).await.unwrap();

        let shutdown = CancellationToken::new();
        let run_handle = tokio::spawn(dispatcher.clone().run(shutdown.clone()));
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        shutdown.cancel();
        let _ = tokio::time::timeout(StdDuration::from_secs(3), run_handle).await;

        assert_eq!(queue.pending_count().await.unwrap(), 0);
        assert_eq!(breaker.state(&WebhookId::from("w1")), Some(BreakerState::Closed));

        assert_eq!(dlq.len(), 1);
        let entries = dlq.list(None).await.unwrap();
        assert_eq!(entries[0].delivery_id, delivery_id);
        assert_eq!(entries[0].error_history.len(), 1);
        assert_eq!(entries[0].error_history[0].response_code, Some(400));
    }

    /// S6: while one webhook has an attempt inflight (or awaiting retry), other deliveries for
    /// the same webhook queue up behind it rather than racing ahead — requests reach the
    /// endpoint in the order their events were enqueued, even across a retry.
    #[tokio::test]
    async fn s6_per_webhook_ordering_holds_under_retry() {
        let mock_server = MockServer::start().await;
        // First request to /hook fails once, after which every subsequent request succeeds —
        // models a transient endpoint hiccup on the very first delivery.
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .with_priority(2)
            .mount(&mock_server)
            .await;

        let queue: Arc<dyn DeliveryQueue> = Arc::new(InMemoryDeliveryQueue::new(Arc::new(InMemoryDlq::new())));
        let registry = Arc::new(WebhookRegistry::new());
        registry.upsert(https_webhook("w1", &mock_server)).unwrap();

        let breaker = Arc::new(CircuitBreaker::default());
        let config = DispatcherConfig {
            claim_interval_ms: 5,
            grace_period_sec: 2,
            ..DispatcherConfig::default()
        };
        // Fast, near-fixed backoff so the retried first delivery is due well before the 100ms
        // contention-requeue delay the dispatcher applies to the deliveries behind it.
        let schedule = RetrySchedule {
            base_ms: 1,
            cap_ms: 5,
            max_attempts: 8,
        };
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), registry, breaker, config, schedule));

        let now = Utc::now();
        let p1 = Delivery::new_initial(EventId(1), WebhookId::from("w1"), now);
        let p2 = Delivery::new_initial(EventId(2), WebhookId::from("w1"), now);
        let p3 = Delivery::new_initial(EventId(3), WebhookId::from("w1"), now);
        let id1 = p1.data.id;
        let id2 = p2.data.id;
        let id3 = p3.data.id;
        queue.enqueue(sample_event(1), vec![p1]).await.unwrap();
        queue.enqueue(sample_event(2), vec![p2]).await.unwrap();
        queue.enqueue(sample_event(3), vec![p3]).await.unwrap();

        let shutdown = CancellationToken::new();
        let run_handle = tokio::spawn(dispatcher.clone().run(shutdown.clone()));
        tokio::time::sleep(StdDuration::from_millis(500)).await;
        shutdown.cancel();
        let _ = tokio::time::timeout(StdDuration::from_secs(3), run_handle).await;

        assert_eq!(queue.pending_count().await.unwrap(), 0);

        let received = mock_server.received_requests().await.unwrap();
        let mut first_seen = Vec::new();
        for request in &received {
            let delivery_id = header(request, "X-Webhook-Delivery");
            if !first_seen.contains(&delivery_id) {
                first_seen.push(delivery_id);
            }
        }
        assert_eq!(first_seen, vec![id1.to_string(), id2.to_string(), id3.to_string()]);
    }

    #[test]
    fn parse_retry_after_accepts_seconds() {
        let now = Utc::now();
        let d = parse_retry_after("120", now).unwrap();
        assert_eq!(d.num_seconds(), 120);
    }

    #[test]
    fn parse_retry_after_rejects_garbage() {
        assert!(parse_retry_after("not-a-date", Utc::now()).is_none());
    }
}
