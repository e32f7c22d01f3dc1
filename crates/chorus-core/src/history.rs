//! Chat history collaborator.
//!
//! The engine only appends to history, and never waits for the append
//! before replying: [`record_detached`] hands the entry to a background task
//! that logs failures. The returned handle lets a short-lived caller flush
//! the write before its runtime shuts down.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::Result;

/// Default number of entries kept per user.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub user_id: String,
    pub question: String,
    pub answer: String,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(
        user_id: impl Into<String>,
        question: impl Into<String>,
        answer: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            question: question.into(),
            answer: answer.into(),
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: HistoryEntry) -> Result<()>;

    /// Most recent entries for a user, oldest first.
    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<HistoryEntry>>;
}

/// Append `entry` on a background task. Failures are logged, never returned.
pub fn record_detached(store: Arc<dyn HistoryStore>, entry: HistoryEntry) -> JoinHandle<()> {
    tokio::spawn(async move {
        let user_id = entry.user_id.clone();
        match store.append(entry).await {
            Ok(()) => trace!(user_id = %user_id, "History entry recorded"),
            Err(e) => warn!(user_id = %user_id, error = %e, "Failed to record history"),
        }
    })
}

/// In-memory history keeping the last `limit` entries per user.
pub struct BoundedHistory {
    limit: usize,
    entries: RwLock<HashMap<String, VecDeque<HistoryEntry>>>,
}

impl Default for BoundedHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl BoundedHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl HistoryStore for BoundedHistory {
    async fn append(&self, entry: HistoryEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        let log = entries.entry(entry.user_id.clone()).or_default();
        log.push_back(entry);
        while log.len() > self.limit {
            log.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(user_id)
            .map(|log| {
                let skip = log.len().saturating_sub(limit);
                log.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }
}
