//! Per-webhook circuit breaker guarding Dispatcher calls.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::webhook::{CircuitBreakerOverrides, WebhookId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_ms: u64,
    pub reset_timeout_ms: u64,
    pub success_threshold: u32,
    pub volume_threshold: u32,
    pub error_threshold_pct: u8,
    pub slow_call_ms: u64,
    pub slow_call_rate_pct: u8,
    pub monitoring_period_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_ms: 30_000,
            reset_timeout_ms: 60_000,
            success_threshold: 2,
            volume_threshold: 10,
            error_threshold_pct: 50,
            slow_call_ms: 5_000,
            slow_call_rate_pct: 50,
            monitoring_period_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Applies a webhook's per-field overrides on top of these defaults.
    pub fn with_overrides(mut self, overrides: &CircuitBreakerOverrides) -> Self {
        if let Some(v) = overrides.failure_threshold {
            self.failure_threshold = v;
        }
        if let Some(v) = overrides.timeout_ms {
            self.timeout_ms = v;
        }
        if let Some(v) = overrides.reset_timeout_ms {
            self.reset_timeout_ms = v;
        }
        if let Some(v) = overrides.success_threshold {
            self.success_threshold = v;
        }
        if let Some(v) = overrides.volume_threshold {
            self.volume_threshold = v;
        }
        if let Some(v) = overrides.error_threshold_pct {
            self.error_threshold_pct = v;
        }
        if let Some(v) = overrides.slow_call_ms {
            self.slow_call_ms = v;
        }
        if let Some(v) = overrides.slow_call_rate_pct {
            self.slow_call_rate_pct = v;
        }
        if let Some(v) = overrides.monitoring_period_ms {
            self.monitoring_period_ms = v;
        }
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    at: DateTime<Utc>,
    success: bool,
    slow: bool,
}

/// A single webhook's breaker: state plus a sliding window of recent call outcomes.
struct BreakerInner {
    state: BreakerState,
    config: CircuitBreakerConfig,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Option<DateTime<Utc>>,
    window: VecDeque<CallRecord>,
}

impl BreakerInner {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            config,
            failure_count: 0,
            success_count: 0,
            next_attempt_at: None,
            window: VecDeque::new(),
        }
    }

    fn prune_window(&mut self, now: DateTime<Utc>) {
        let horizon = now - chrono::Duration::milliseconds(self.config.monitoring_period_ms as i64);
        while let Some(front) = self.window.front() {
            if front.at < horizon {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Checks whether a call is currently permitted, performing `OPEN -> HALF_OPEN` transitions
    /// as a side effect when the reset timeout has elapsed.
    fn poll_permit(&mut self, now: DateTime<Utc>) -> Result<(), u64> {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let next = self.next_attempt_at.expect("OPEN state always carries a next_attempt_at");
                if now >= next {
                    self.state = BreakerState::HalfOpen;
                    self.success_count = 0;
                    Ok(())
                } else {
                    let retry_after_secs = ((next - now).num_milliseconds().max(0) as f64 / 1000.0).ceil() as u64;
                    Err(retry_after_secs)
                }
            }
        }
    }

    fn record_outcome(&mut self, now: DateTime<Utc>, success: bool, latency_ms: u64) {
        let slow = latency_ms >= self.config.slow_call_ms;
        self.window.push_back(CallRecord { at: now, success, slow });
        self.prune_window(now);

        match self.state {
            BreakerState::HalfOpen => {
                if success {
                    self.success_count += 1;
                    if self.success_count >= self.config.success_threshold {
                        self.trip_closed();
                    }
                } else {
                    self.trip_open(now);
                }
            }
            BreakerState::Closed => {
                if success {
                    self.failure_count = 0;
                } else {
                    self.failure_count += 1;
                }
                if self.failure_count >= self.config.failure_threshold {
                    self.trip_open(now);
                    return;
                }
                if self.window.len() as u32 >= self.config.volume_threshold {
                    let total = self.window.len() as f64;
                    let failures = self.window.iter().filter(|c| !c.success).count() as f64;
                    let slow = self.window.iter().filter(|c| c.slow).count() as f64;
                    let error_rate = failures / total * 100.0;
                    let slow_rate = slow / total * 100.0;
                    if error_rate >= self.config.error_threshold_pct as f64 || slow_rate >= self.config.slow_call_rate_pct as f64 {
                        self.trip_open(now);
                    }
                }
            }
            BreakerState::Open => {}
        }
    }

    fn trip_open(&mut self, now: DateTime<Utc>) {
        self.state = BreakerState::Open;
        self.next_attempt_at = Some(now + chrono::Duration::milliseconds(self.config.reset_timeout_ms as i64));
        self.failure_count = 0;
        self.success_count = 0;
    }

    fn trip_closed(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.next_attempt_at = None;
        self.window.clear();
    }
}

/// Emitted on every breaker state transition, published on a bounded drop-oldest broadcast
/// channel since listeners are observability-only.
#[derive(Debug, Clone)]
pub struct BreakerStateChange {
    pub webhook_id: WebhookId,
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
}

/// The outcome of attempting a gated call: either permitted, or rejected with the breaker's
/// computed retry delay.
pub enum Permit {
    Allowed,
    Rejected { retry_after_secs: u64 },
}

/// Per-webhook breaker registry. Each webhook's state lives behind its own mutex, keyed in a
/// `DashMap` so breakers for unrelated webhooks never contend on a shared table lock.
pub struct CircuitBreaker {
    default_config: CircuitBreakerConfig,
    breakers: DashMap<WebhookId, Arc<Mutex<BreakerInner>>>,
    change_tx: broadcast::Sender<BreakerStateChange>,
}

impl CircuitBreaker {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        let (change_tx, _) = broadcast::channel(256);
        Self {
            default_config,
            breakers: DashMap::new(),
            change_tx,
        }
    }

    fn breaker_for(&self, webhook_id: &WebhookId, overrides: &CircuitBreakerOverrides) -> Arc<Mutex<BreakerInner>> {
        self.breakers
            .entry(webhook_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerInner::new(self.default_config.with_overrides(overrides)))))
            .clone()
    }

    /// Checks whether a call for `webhook_id` is currently permitted. Does not itself perform
    /// the call; callers invoke `record_outcome` after the attempt completes.
    pub fn poll(&self, webhook_id: &WebhookId, overrides: &CircuitBreakerOverrides, now: DateTime<Utc>) -> Permit {
        let breaker = self.breaker_for(webhook_id, overrides);
        let mut inner = breaker.lock();
        match inner.poll_permit(now) {
            Ok(()) => Permit::Allowed,
            Err(retry_after_secs) => Permit::Rejected { retry_after_secs },
        }
    }

    /// Records the outcome of a permitted call, driving state transitions. Breaker-open
    /// rejections must never be recorded here: they do not count toward the per-webhook
    /// failure counters.
    pub fn record_outcome(&self, webhook_id: &WebhookId, overrides: &CircuitBreakerOverrides, now: DateTime<Utc>, success: bool, latency_ms: u64) {
        let breaker = self.breaker_for(webhook_id, overrides);
        let (before, after) = {
            let mut inner = breaker.lock();
            let before = inner.state;
            inner.record_outcome(now, success, latency_ms);
            (before, inner.state)
        };
        if before != after {
            let _ = self.change_tx.send(BreakerStateChange {
                webhook_id: webhook_id.clone(),
                from: before,
                to: after,
                at: now,
            });
        }
    }

    pub fn state(&self, webhook_id: &WebhookId) -> Option<BreakerState> {
        self.breakers.get(webhook_id).map(|b| b.lock().state)
    }

    /// Replaces a webhook's effective config (defaults merged with `overrides`) without
    /// disturbing its current state or sliding window. Creates the breaker if it doesn't exist
    /// yet, same as `poll`/`record_outcome` would on first use.
    pub fn update_config(&self, webhook_id: &WebhookId, overrides: &CircuitBreakerOverrides) {
        let breaker = self.breaker_for(webhook_id, overrides);
        breaker.lock().config = self.default_config.with_overrides(overrides);
    }

    pub fn force(&self, webhook_id: &WebhookId, state: BreakerState, now: DateTime<Utc>) {
        let breaker = self.breaker_for(webhook_id, &CircuitBreakerOverrides::default());
        let mut inner = breaker.lock();
        let before = inner.state;
        inner.state = state;
        if state == BreakerState::Open {
            inner.next_attempt_at = Some(now + chrono::Duration::milliseconds(inner.config.reset_timeout_ms as i64));
        }
        if state == BreakerState::Closed {
            inner.trip_closed();
        }
        drop(inner);
        if before != state {
            let _ = self.change_tx.send(BreakerStateChange {
                webhook_id: webhook_id.clone(),
                from: before,
                to: state,
                at: now,
            });
        }
    }

    pub fn reset(&self, webhook_id: &WebhookId) {
        self.force(webhook_id, BreakerState::Closed, Utc::now());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerStateChange> {
        self.change_tx.subscribe()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc) + chrono::Duration::seconds(secs)
    }

    #[test]
    fn s4_circuit_opens_after_threshold_and_recovers() {
        let config = CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout_ms: 10_000,
            success_threshold: 2,
            volume_threshold: 100,
            ..CircuitBreakerConfig::default()
        };
        let cb = CircuitBreaker::new(config);
        let id = WebhookId::from("w1");
        let overrides = CircuitBreakerOverrides::default();

        for i in 0..5 {
            assert!(matches!(cb.poll(&id, &overrides, t(i)), Permit::Allowed));
            cb.record_outcome(&id, &overrides, t(i), false, 10);
        }
        assert_eq!(cb.state(&id), Some(BreakerState::Open));

        // 6th call, still within reset window: rejected without I/O.
        match cb.poll(&id, &overrides, t(5)) {
            Permit::Rejected { retry_after_secs } => assert!(retry_after_secs > 0),
            Permit::Allowed => panic!("expected breaker to reject while open"),
        }

        // After resetTimeoutMs, one trial call is allowed (HALF_OPEN).
        assert!(matches!(cb.poll(&id, &overrides, t(11)), Permit::Allowed));
        cb.record_outcome(&id, &overrides, t(11), true, 10);
        assert_eq!(cb.state(&id), Some(BreakerState::HalfOpen));

        assert!(matches!(cb.poll(&id, &overrides, t(12)), Permit::Allowed));
        cb.record_outcome(&id, &overrides, t(12), true, 10);
        assert_eq!(cb.state(&id), Some(BreakerState::Closed));
    }

    #[test]
    fn half_open_failure_reopens() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 1_000,
            volume_threshold: 100,
            ..CircuitBreakerConfig::default()
        };
        let cb = CircuitBreaker::new(config);
        let id = WebhookId::from("w1");
        let overrides = CircuitBreakerOverrides::default();

        cb.record_outcome(&id, &overrides, t(0), false, 10);
        assert_eq!(cb.state(&id), Some(BreakerState::Open));

        assert!(matches!(cb.poll(&id, &overrides, t(2)), Permit::Allowed));
        cb.record_outcome(&id, &overrides, t(2), false, 10);
        assert_eq!(cb.state(&id), Some(BreakerState::Open));
    }

    #[test]
    fn error_rate_trips_open_on_volume() {
        let config = CircuitBreakerConfig {
            failure_threshold: 100,
            volume_threshold: 4,
            error_threshold_pct: 50,
            ..CircuitBreakerConfig::default()
        };
        let cb = CircuitBreaker::new(config);
        let id = WebhookId::from("w1");
        let overrides = CircuitBreakerOverrides::default();

        cb.record_outcome(&id, &overrides, t(0), true, 10);
        cb.record_outcome(&id, &overrides, t(1), false, 10);
        cb.record_outcome(&id, &overrides, t(2), true, 10);
        assert_eq!(cb.state(&id), Some(BreakerState::Closed));
        cb.record_outcome(&id, &overrides, t(3), false, 10);
        assert_eq!(cb.state(&id), Some(BreakerState::Open));
    }

    #[test]
    fn force_and_reset_override_state() {
        let cb = CircuitBreaker::default();
        let id = WebhookId::from("w1");
        cb.force(&id, BreakerState::Open, t(0));
        assert_eq!(cb.state(&id), Some(BreakerState::Open));
        cb.reset(&id);
        assert_eq!(cb.state(&id), Some(BreakerState::Closed));
    }

    #[test]
    fn update_config_applies_tighter_threshold_without_resetting_state() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            volume_threshold: 100,
            ..CircuitBreakerConfig::default()
        });
        let id = WebhookId::from("w1");
        let overrides = CircuitBreakerOverrides::default();

        cb.record_outcome(&id, &overrides, t(0), false, 10);
        cb.record_outcome(&id, &overrides, t(1), false, 10);
        assert_eq!(cb.state(&id), Some(BreakerState::Closed));

        let tightened = CircuitBreakerOverrides {
            failure_threshold: Some(2),
            ..CircuitBreakerOverrides::default()
        };
        cb.update_config(&id, &tightened);
        assert_eq!(cb.state(&id), Some(BreakerState::Closed), "config update must not itself trip the breaker");

        cb.record_outcome(&id, &tightened, t(2), false, 10);
        assert_eq!(cb.state(&id), Some(BreakerState::Open));
    }
}
