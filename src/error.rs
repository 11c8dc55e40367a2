//! Crate-wide error taxonomy.
//!
//! Each module-facing error composes into [`Error`] via `#[from]`. Library code returns
//! `Result<T>` and propagates with `?`; only the binary entrypoint reaches for `anyhow`.

use thiserror::Error;

use crate::delivery::DeliveryId;
use crate::webhook::WebhookId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("webhook not found: {0}")]
    WebhookNotFound(WebhookId),

    #[error("delivery not found: {0}")]
    DeliveryNotFound(DeliveryId),

    #[error("delivery {0} is in a terminal state and cannot be modified")]
    TerminalDelivery(DeliveryId),

    #[error("invalid webhook: {0}")]
    InvalidWebhook(String),

    #[error("invalid filter pattern: {0}")]
    InvalidFilter(String),

    #[error(transparent)]
    ChangeStream(#[from] ChangeStreamError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors surfaced while tailing the change feed.
#[derive(Debug, Error)]
pub enum ChangeStreamError {
    #[error("transient driver error: {0}")]
    Transient(#[from] mongodb::error::Error),

    #[error("change feed reported invalidate, ingestion halted")]
    Invalidated,

    #[error("cursor lost and no resume token available, cold restart required")]
    CursorLostNoToken,

    #[error("failed to persist event/deliveries before checkpoint: {0}")]
    PersistenceFailure(String),
}

/// Outcome taxonomy for a single delivery attempt.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    #[error("client-permanent error: HTTP {status}")]
    ClientPermanent { status: u16 },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("circuit breaker open for webhook {webhook_id}, retry after {retry_after_secs}s")]
    BreakerOpen { webhook_id: WebhookId, retry_after_secs: u64 },

    #[error("signing failed: {0}")]
    SigningFailed(String),
}
