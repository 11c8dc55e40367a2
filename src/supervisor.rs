//! Orchestrates startup and shutdown of every long-running component: change-stream reader,
//! ingest loop (detector → matcher → queue), dispatcher worker pool, and maintenance tasks, all
//! driven by a single [`CancellationToken`] threaded through each of them — the same
//! shutdown-token pattern already used for this codebase's other background services.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use mongodb::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::change_stream::{ChangeStreamConfig, ChangeStreamReader};
use crate::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::delivery::{Delivery, Pending, RetrySchedule};
use crate::detector::EventTypeDetector;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::event::{EventId, RawChange};
use crate::queue::DeliveryQueue;
use crate::registry::WebhookRegistry;
use crate::resume_store::ResumeStore;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub partition_id: String,
    pub change_channel_capacity: usize,
    pub lease_reap_interval_ms: u64,
    pub breaker_stats_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            partition_id: "default".to_string(),
            change_channel_capacity: 256,
            lease_reap_interval_ms: 10_000,
            breaker_stats_interval_ms: 30_000,
        }
    }
}

/// Wires the ingestion pipeline (change stream → detector → matcher → queue) to the delivery
/// pipeline (dispatcher, guarded by the circuit breaker) and owns their combined lifecycle.
///
/// Start order follows the dependency chain: ResumeStore, WebhookRegistry, DeliveryQueue and
/// CircuitBreaker are constructed by the caller and handed in already-running; this type starts
/// the tasks layered on top of them (Dispatcher, then the classify/match/route ingest loop, then
/// the ChangeStreamReader that feeds it). Shutdown reverses that order implicitly: cancelling
/// the token stops the reader first (no new raw changes), which drains the ingest loop, while
/// the dispatcher keeps draining its own queue until its grace period elapses.
pub struct Supervisor {
    resume_store: Arc<dyn ResumeStore>,
    registry: Arc<WebhookRegistry>,
    queue: Arc<dyn DeliveryQueue>,
    breaker: Arc<CircuitBreaker>,
    dispatcher: Arc<Dispatcher>,
    detector: Arc<EventTypeDetector>,
    reader: Arc<ChangeStreamReader>,
    config: SupervisorConfig,
    next_event_id: AtomicU64,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mongo_client: Client,
        change_stream_config: ChangeStreamConfig,
        resume_store: Arc<dyn ResumeStore>,
        registry: Arc<WebhookRegistry>,
        queue: Arc<dyn DeliveryQueue>,
        breaker: Arc<CircuitBreaker>,
        dispatcher_config: DispatcherConfig,
        retry_schedule: RetrySchedule,
        detector: EventTypeDetector,
        config: SupervisorConfig,
    ) -> Self {
        let reader = Arc::new(ChangeStreamReader::new(mongo_client, change_stream_config));
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), registry.clone(), breaker.clone(), dispatcher_config, retry_schedule));
        Self {
            resume_store,
            registry,
            queue,
            breaker,
            dispatcher,
            detector: Arc::new(detector),
            reader,
            config,
            next_event_id: AtomicU64::new(now_millis()),
        }
    }

    /// Starts every component, then blocks until `shutdown` fires (or the reader halts on its
    /// own, e.g. on an `invalidate` event) and every task has wound down.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let start_after = match self.resume_store.load(&self.config.partition_id).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "failed to load resume checkpoint, starting from now");
                None
            }
        };

        let (change_tx, change_rx) = mpsc::channel(self.config.change_channel_capacity);

        let reader_handle: JoinHandle<()> = {
            let reader = self.reader.clone();
            let reader_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = reader.run(start_after, change_tx, reader_shutdown).await {
                    warn!(error = %e, "change stream reader halted");
                }
            })
        };

        let dispatcher_handle: JoinHandle<()> = {
            let dispatcher = self.dispatcher.clone();
            let dispatcher_shutdown = shutdown.clone();
            tokio::spawn(async move { dispatcher.run(dispatcher_shutdown).await })
        };

        let reaper_handle: JoinHandle<()> = {
            let this = self.clone();
            let reaper_shutdown = shutdown.clone();
            tokio::spawn(async move { this.lease_reaper_loop(reaper_shutdown).await })
        };

        let stats_handle: JoinHandle<()> = {
            let this = self.clone();
            let stats_shutdown = shutdown.clone();
            tokio::spawn(async move { this.breaker_stats_loop(stats_shutdown).await })
        };

        let ingest_handle: JoinHandle<()> = {
            let this = self.clone();
            tokio::spawn(async move { this.ingest_loop(change_rx).await })
        };

        info!(partition_id = %self.config.partition_id, "supervisor started");

        // The reader only returns once shut down (or after a hard halt, e.g. invalidate); once
        // it's gone, nothing feeds the ingest loop, so that unwinds next.
        let _ = reader_handle.await;
        let _ = ingest_handle.await;

        // A reader halt that wasn't already a shutdown (invalidate, unrecoverable error) must
        // still bring the rest of the process down.
        shutdown.cancel();

        let _ = reaper_handle.await;
        let _ = stats_handle.await;
        let _ = dispatcher_handle.await;

        info!("supervisor shut down");
    }

    /// Classifies and routes each raw change: detect its event type, match it against the
    /// registry, enqueue the event with its matched deliveries, and only then advance the
    /// resume checkpoint — so a crash before the checkpoint write simply replays the change on
    /// restart rather than losing it.
    async fn ingest_loop(&self, mut change_rx: mpsc::Receiver<RawChange>) {
        while let Some(raw) = change_rx.recv().await {
            let event_id = EventId(self.next_event_id.fetch_add(1, Ordering::SeqCst));
            let resume_token = raw.resume_token.clone();
            let event = self.detector.detect(event_id, raw);

            let matched = self.registry.matching(&event.event_type, &event.workspace);
            let now = chrono::Utc::now();
            let deliveries: Vec<Delivery<Pending>> = matched.iter().map(|rw| Delivery::new_initial(event_id, rw.webhook.id.clone(), now)).collect();

            debug!(event_id = event_id.0, event_type = %event.event_type, matched = deliveries.len(), "routing event");

            if let Err(e) = self.queue.enqueue(event, deliveries).await {
                warn!(error = %e, event_id = event_id.0, "failed to persist event/deliveries, resume token not advanced");
                continue;
            }

            if let Err(e) = self.resume_store.save(&self.config.partition_id, resume_token).await {
                warn!(error = %e, "failed to persist resume checkpoint after enqueue");
            }
        }
        debug!("ingest loop exited: change stream channel closed");
    }

    async fn lease_reaper_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(StdDuration::from_millis(self.config.lease_reap_interval_ms));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.queue.reap_expired_leases(chrono::Utc::now()).await {
                        Ok(0) => {}
                        Ok(n) => debug!(reverted = n, "reaped expired delivery leases"),
                        Err(e) => warn!(error = %e, "failed to reap expired leases"),
                    }
                }
            }
        }
        debug!("lease reaper exited");
    }

    /// Periodic observability rollup: logs the current breaker state distribution across
    /// registered webhooks. The breaker's own transition logic never depends on this task.
    async fn breaker_stats_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(StdDuration::from_millis(self.config.breaker_stats_interval_ms));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let (mut open, mut half_open, mut closed) = (0u32, 0u32, 0u32);
                    for webhook_id in self.registry.all_ids() {
                        match self.breaker.state(&webhook_id) {
                            Some(BreakerState::Open) => open += 1,
                            Some(BreakerState::HalfOpen) => half_open += 1,
                            Some(BreakerState::Closed) | None => closed += 1,
                        }
                    }
                    info!(open, half_open, closed, "circuit breaker stats rollup");
                }
            }
        }
        debug!("breaker stats rollup exited");
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
