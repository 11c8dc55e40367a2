//! The `Webhook` subscription record.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque webhook identifier, unique across the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookId(pub String);

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WebhookId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WebhookId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A subset of [`CircuitBreakerConfig`](crate::circuit_breaker::CircuitBreakerConfig) a webhook
/// can override. `None` fields fall back to the global defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerOverrides {
    pub failure_threshold: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub reset_timeout_ms: Option<u64>,
    pub success_threshold: Option<u32>,
    pub volume_threshold: Option<u32>,
    pub error_threshold_pct: Option<u8>,
    pub slow_call_ms: Option<u64>,
    pub slow_call_rate_pct: Option<u8>,
    pub monitoring_period_ms: Option<u64>,
}

/// A registered webhook subscription.
///
/// Minimum secret length is enforced at construction via [`Webhook::new`]; callers that already
/// hold validated data (e.g. loaded from storage) may still construct this directly, but should
/// have validated it on the way in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub url: String,
    pub secret: String,
    pub active: bool,
    pub filters: Vec<String>,
    pub workspaces: Vec<String>,
    pub headers: HashMap<String, String>,
    pub circuit_breaker_overrides: CircuitBreakerOverrides,
}

const MIN_SECRET_LEN: usize = 32;

impl Webhook {
    /// Construct a webhook, validating its invariants.
    pub fn new(
        id: impl Into<WebhookId>,
        url: impl Into<String>,
        secret: impl Into<String>,
        filters: Vec<String>,
    ) -> Result<Self> {
        let webhook = Self {
            id: id.into(),
            url: url.into(),
            secret: secret.into(),
            active: true,
            filters,
            workspaces: Vec::new(),
            headers: HashMap::new(),
            circuit_breaker_overrides: CircuitBreakerOverrides::default(),
        };
        webhook.validate()?;
        Ok(webhook)
    }

    pub fn validate(&self) -> Result<()> {
        let parsed = url::Url::parse(&self.url).map_err(|e| Error::InvalidWebhook(format!("invalid url: {e}")))?;
        if parsed.scheme() != "https" {
            return Err(Error::InvalidWebhook("url must use https".to_string()));
        }
        if parsed.host_str().is_none() {
            return Err(Error::InvalidWebhook("url must have a host".to_string()));
        }
        if self.secret.len() < MIN_SECRET_LEN {
            return Err(Error::InvalidWebhook(format!(
                "secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if self.filters.is_empty() {
            return Err(Error::InvalidWebhook("at least one filter is required".to_string()));
        }
        for pattern in &self.filters {
            crate::matcher::compile_filter(pattern)?;
        }
        Ok(())
    }

    /// Whether `workspace` is within this webhook's allowlist (empty allowlist accepts all).
    pub fn accepts_workspace(&self, workspace: &str) -> bool {
        self.workspaces.is_empty() || self.workspaces.iter().any(|w| w == workspace)
    }
}
