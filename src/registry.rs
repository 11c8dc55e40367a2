//! The webhook registry: a copy-on-write snapshot of all registered subscriptions, so the
//! dispatch hot path never blocks on a writer.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::matcher::{self, CompiledFilter};
use crate::webhook::{Webhook, WebhookId};

/// A webhook with its filters pre-compiled, so matching never re-parses a pattern.
#[derive(Debug, Clone)]
pub struct RegisteredWebhook {
    pub webhook: Webhook,
    pub compiled_filters: Vec<CompiledFilter>,
}

impl RegisteredWebhook {
    fn compile(webhook: Webhook) -> Result<Self> {
        let compiled_filters = webhook
            .filters
            .iter()
            .map(|p| matcher::compile_filter(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { webhook, compiled_filters })
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    by_id: HashMap<WebhookId, Arc<RegisteredWebhook>>,
}

/// Holds the current set of registered webhooks. Reads take an `Arc` of the current snapshot
/// with no locking; writes build a new snapshot and publish it atomically.
pub struct WebhookRegistry {
    snapshot: ArcSwap<Snapshot>,
    change_tx: broadcast::Sender<()>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(64);
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            change_tx,
        }
    }

    /// Inserts or replaces a webhook. Re-validates and re-compiles filters before publishing.
    pub fn upsert(&self, webhook: Webhook) -> Result<()> {
        webhook.validate()?;
        let registered = Arc::new(RegisteredWebhook::compile(webhook)?);
        self.snapshot.rcu(|current| {
            let mut by_id = current.by_id.clone();
            by_id.insert(registered.webhook.id.clone(), registered.clone());
            Arc::new(Snapshot { by_id })
        });
        let _ = self.change_tx.send(());
        Ok(())
    }

    pub fn remove(&self, id: &WebhookId) -> Result<()> {
        if !self.snapshot.load().by_id.contains_key(id) {
            return Err(Error::WebhookNotFound(id.clone()));
        }
        self.snapshot.rcu(|current| {
            let mut by_id = current.by_id.clone();
            by_id.remove(id);
            Arc::new(Snapshot { by_id })
        });
        let _ = self.change_tx.send(());
        Ok(())
    }

    pub fn get(&self, id: &WebhookId) -> Option<Arc<RegisteredWebhook>> {
        self.snapshot.load().by_id.get(id).cloned()
    }

    /// All active webhooks whose filters match `event_type` and whose workspace allowlist
    /// accepts `workspace`.
    pub fn matching(&self, event_type: &str, workspace: &str) -> Vec<Arc<RegisteredWebhook>> {
        self.snapshot
            .load()
            .by_id
            .values()
            .filter(|rw| rw.webhook.active)
            .filter(|rw| rw.webhook.accepts_workspace(workspace))
            .filter(|rw| matcher::matches_any(&rw.compiled_filters, event_type))
            .cloned()
            .collect()
    }

    /// All registered webhook ids, active or not — used by maintenance tasks that need to walk
    /// every webhook rather than only those matching a particular event.
    pub fn all_ids(&self) -> Vec<WebhookId> {
        self.snapshot.load().by_id.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to a notification fired on every upsert/remove, so components holding their
    /// own caches (e.g. the circuit breaker's per-webhook overrides) can refresh.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.change_tx.subscribe()
    }
}

impl Default for WebhookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook(id: &str, filter: &str) -> Webhook {
        Webhook::new(id, "https://example.com/hook", "s".repeat(32), vec![filter.to_string()]).unwrap()
    }

    #[test]
    fn upsert_then_matching_finds_it() {
        let registry = WebhookRegistry::new();
        registry.upsert(webhook("w1", "issue.*")).unwrap();
        let matches = registry.matching("issue.created", "any");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].webhook.id, WebhookId::from("w1"));
    }

    #[test]
    fn inactive_webhook_does_not_match() {
        let registry = WebhookRegistry::new();
        let mut w = webhook("w1", "issue.*");
        w.active = false;
        registry.upsert(w).unwrap();
        assert!(registry.matching("issue.created", "any").is_empty());
    }

    #[test]
    fn workspace_allowlist_filters_matches() {
        let registry = WebhookRegistry::new();
        let mut w = webhook("w1", "issue.*");
        w.workspaces = vec!["p1".to_string()];
        registry.upsert(w).unwrap();
        assert!(registry.matching("issue.created", "p1").len() == 1);
        assert!(registry.matching("issue.created", "p2").is_empty());
    }

    #[test]
    fn remove_unknown_errors() {
        let registry = WebhookRegistry::new();
        assert!(registry.remove(&WebhookId::from("nope")).is_err());
    }

    #[test]
    fn remove_drops_from_matching() {
        let registry = WebhookRegistry::new();
        registry.upsert(webhook("w1", "issue.*")).unwrap();
        registry.remove(&WebhookId::from("w1")).unwrap();
        assert!(registry.matching("issue.created", "any").is_empty());
    }
}
