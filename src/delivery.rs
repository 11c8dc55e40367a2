//! The `Delivery` typestate: one attempt relation between an [`Event`](crate::event::Event) and a
//! [`Webhook`](crate::webhook::Webhook).
//!
//! Mirrors the request lifecycle typestate used elsewhere in this codebase: a delivery keeps a
//! single identity across retries (`attempt` increments in place) rather than spawning a new row
//! per attempt. See DESIGN.md for why this reading was chosen over a literal one-row-per-attempt
//! scheme.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventId;
use crate::webhook::WebhookId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marker trait for valid delivery states, enabling the typestate pattern.
pub trait DeliveryState: Send + Sync {}

/// Data shared across all states of a delivery's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryData {
    pub id: DeliveryId,
    pub event_id: EventId,
    pub webhook_id: WebhookId,
}

/// A delivery in a particular lifecycle state. Operations are only defined for states where
/// they are valid, so illegal transitions are caught at compile time.
#[derive(Debug, Clone)]
pub struct Delivery<T: DeliveryState> {
    pub state: T,
    pub data: DeliveryData,
}

/// Waiting to be claimed by a dispatcher worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Pending {
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
}
impl DeliveryState for Pending {}

/// Claimed by a worker, HTTP attempt in flight, under a lease.
#[derive(Debug, Clone, PartialEq)]
pub struct Inflight {
    pub attempt: u32,
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}
impl DeliveryState for Inflight {}

/// Terminal: the HTTP call succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct Succeeded {
    pub attempt: u32,
    pub response_code: u16,
    pub response_latency_ms: u64,
    pub completed_at: DateTime<Utc>,
}
impl DeliveryState for Succeeded {}

/// Non-terminal: the attempt failed but the retry budget may not yet be exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct Failed {
    pub attempt: u32,
    pub last_error: String,
    pub response_code: Option<u16>,
    pub failed_at: DateTime<Utc>,
}
impl DeliveryState for Failed {}

/// Terminal: retries exhausted, or a client-permanent failure. Sunk to the DLQ.
#[derive(Debug, Clone, PartialEq)]
pub struct Dead {
    pub attempt: u32,
    pub last_error: String,
    pub response_code: Option<u16>,
    pub died_at: DateTime<Utc>,
}
impl DeliveryState for Dead {}

/// Enum wrapping a delivery in any state, for storage and uniform inspection.
#[derive(Debug, Clone)]
pub enum AnyDelivery {
    Pending(Delivery<Pending>),
    Inflight(Delivery<Inflight>),
    Succeeded(Delivery<Succeeded>),
    Failed(Delivery<Failed>),
    Dead(Delivery<Dead>),
}

impl AnyDelivery {
    pub fn id(&self) -> DeliveryId {
        match self {
            AnyDelivery::Pending(d) => d.data.id,
            AnyDelivery::Inflight(d) => d.data.id,
            AnyDelivery::Succeeded(d) => d.data.id,
            AnyDelivery::Failed(d) => d.data.id,
            AnyDelivery::Dead(d) => d.data.id,
        }
    }

    pub fn webhook_id(&self) -> &WebhookId {
        match self {
            AnyDelivery::Pending(d) => &d.data.webhook_id,
            AnyDelivery::Inflight(d) => &d.data.webhook_id,
            AnyDelivery::Succeeded(d) => &d.data.webhook_id,
            AnyDelivery::Failed(d) => &d.data.webhook_id,
            AnyDelivery::Dead(d) => &d.data.webhook_id,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AnyDelivery::Pending(_))
    }

    /// `Succeeded` and `Dead` never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyDelivery::Succeeded(_) | AnyDelivery::Dead(_))
    }

    pub fn as_pending(&self) -> Option<&Delivery<Pending>> {
        match self {
            AnyDelivery::Pending(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_inflight(&self) -> Option<&Delivery<Inflight>> {
        match self {
            AnyDelivery::Inflight(d) => Some(d),
            _ => None,
        }
    }
}

macro_rules! any_delivery_from {
    ($state:ty, $variant:ident) => {
        impl From<Delivery<$state>> for AnyDelivery {
            fn from(d: Delivery<$state>) -> Self {
                AnyDelivery::$variant(d)
            }
        }
    };
}

any_delivery_from!(Pending, Pending);
any_delivery_from!(Inflight, Inflight);
any_delivery_from!(Succeeded, Succeeded);
any_delivery_from!(Failed, Failed);
any_delivery_from!(Dead, Dead);

impl Delivery<Pending> {
    /// Construct the first attempt for a freshly matched (event, webhook) pair.
    pub fn new_initial(event_id: EventId, webhook_id: WebhookId, now: DateTime<Utc>) -> Self {
        Delivery {
            data: DeliveryData {
                id: DeliveryId::new(),
                event_id,
                webhook_id,
            },
            state: Pending {
                attempt: 1,
                next_attempt_at: now,
            },
        }
    }

    /// A worker claims this delivery, moving it to `Inflight` under a lease.
    pub fn claim(self, now: DateTime<Utc>, lease: chrono::Duration) -> Delivery<Inflight> {
        Delivery {
            data: self.data,
            state: Inflight {
                attempt: self.state.attempt,
                claimed_at: now,
                lease_expires_at: now + lease,
            },
        }
    }
}

impl Delivery<Inflight> {
    pub fn succeed(self, response_code: u16, response_latency_ms: u64, now: DateTime<Utc>) -> Delivery<Succeeded> {
        Delivery {
            data: self.data,
            state: Succeeded {
                attempt: self.state.attempt,
                response_code,
                response_latency_ms,
                completed_at: now,
            },
        }
    }

    pub fn fail(self, error: impl Into<String>, response_code: Option<u16>, now: DateTime<Utc>) -> Delivery<Failed> {
        Delivery {
            data: self.data,
            state: Failed {
                attempt: self.state.attempt,
                last_error: error.into(),
                response_code,
                failed_at: now,
            },
        }
    }

    /// A client-permanent failure (4xx other than 408/425/429) skips retry entirely.
    pub fn kill(self, error: impl Into<String>, response_code: Option<u16>, now: DateTime<Utc>) -> Delivery<Dead> {
        Delivery {
            data: self.data,
            state: Dead {
                attempt: self.state.attempt,
                last_error: error.into(),
                response_code,
                died_at: now,
            },
        }
    }

    /// The lease expired before the worker recorded an outcome; reverts to `Pending` so another
    /// worker can claim it.
    pub fn unclaim(self) -> Delivery<Pending> {
        Delivery {
            data: self.data,
            state: Pending {
                attempt: self.state.attempt,
                next_attempt_at: self.state.claimed_at,
            },
        }
    }

    /// Reverts to `Pending` at an explicit `next_attempt_at`, for a worker that voluntarily gives
    /// up a claim (e.g. lost the per-webhook ordering mutex) rather than one whose lease expired.
    pub fn unclaim_at(self, next_attempt_at: DateTime<Utc>) -> Delivery<Pending> {
        Delivery {
            data: self.data,
            state: Pending {
                attempt: self.state.attempt,
                next_attempt_at,
            },
        }
    }
}

/// Retry backoff schedule: `delay(attempt) = min(baseMs * 2^(attempt-1), capMs) * (1 + jitter)`.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            cap_ms: 3_600_000,
            max_attempts: 8,
        }
    }
}

impl RetrySchedule {
    /// Computes the delay before `attempt`'s retry, with full `[-0.2, 0.2]` relative jitter.
    pub fn delay(&self, attempt: u32) -> chrono::Duration {
        let exp = attempt.saturating_sub(1).min(62);
        let unjittered = self.base_ms.saturating_mul(1u64 << exp).min(self.cap_ms);
        let jitter = rand::random::<f64>() * 0.4 - 0.2;
        let jittered = (unjittered as f64 * (1.0 + jitter)).max(0.0) as u64;
        chrono::Duration::milliseconds(jittered as i64)
    }
}

impl Delivery<Failed> {
    /// Attempt to retry. Returns `None` if the retry budget for this delivery is exhausted.
    pub fn retry(&self, schedule: &RetrySchedule, now: DateTime<Utc>) -> Option<Pending> {
        let next_attempt = self.state.attempt + 1;
        if next_attempt > schedule.max_attempts {
            return None;
        }
        Some(Pending {
            attempt: next_attempt,
            next_attempt_at: now + schedule.delay(next_attempt),
        })
    }

    /// Consume `self` and transition to `Pending` for the next attempt.
    pub fn into_retry(self, schedule: &RetrySchedule, now: DateTime<Utc>) -> std::result::Result<Delivery<Pending>, Delivery<Dead>> {
        match self.retry(schedule, now) {
            Some(pending) => Ok(Delivery {
                data: self.data,
                state: pending,
            }),
            None => {
                let attempt = self.state.attempt;
                let last_error = self.state.last_error.clone();
                let response_code = self.state.response_code;
                Err(Delivery {
                    data: self.data,
                    state: Dead {
                        attempt,
                        last_error,
                        response_code,
                        died_at: now,
                    },
                })
            }
        }
    }

    /// Honor an explicit `Retry-After` directive (408/425/429), capped at `capMs`.
    pub fn retry_after(self, retry_after: chrono::Duration, cap_ms: u64, now: DateTime<Utc>) -> Delivery<Pending> {
        let capped = retry_after.num_milliseconds().clamp(0, cap_ms as i64);
        Delivery {
            data: self.data,
            state: Pending {
                attempt: self.state.attempt,
                next_attempt_at: now + chrono::Duration::milliseconds(capped),
            },
        }
    }
}
