//! Durable checkpoint of the last processed change-feed position.
//!
//! An external collaborator; this module ships the trait boundary plus an in-memory
//! implementation. A real deployment persists this to the same store as everything else so a
//! restart resumes from the last good token rather than replaying from "now".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::Result;
use crate::event::ResumeToken;

#[derive(Debug, Clone)]
pub struct ResumeCheckpoint {
    pub partition_id: String,
    pub resume_token: ResumeToken,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ResumeStore: Send + Sync {
    async fn load(&self, partition_id: &str) -> Result<Option<ResumeToken>>;
    async fn save(&self, partition_id: &str, token: ResumeToken) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryResumeStore {
    checkpoints: Mutex<std::collections::HashMap<String, ResumeCheckpoint>>,
}

impl InMemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResumeStore for InMemoryResumeStore {
    async fn load(&self, partition_id: &str) -> Result<Option<ResumeToken>> {
        Ok(self.checkpoints.lock().get(partition_id).map(|c| c.resume_token.clone()))
    }

    async fn save(&self, partition_id: &str, token: ResumeToken) -> Result<()> {
        self.checkpoints.lock().insert(
            partition_id.to_string(),
            ResumeCheckpoint {
                partition_id: partition_id.to_string(),
                resume_token: token,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }
}
