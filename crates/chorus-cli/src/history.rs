//! File-backed history: one JSON object per line, trimmed per user.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use chorus_core::{Error, HistoryEntry, HistoryStore};

pub struct JsonlHistory {
    path: PathBuf,
    limit: usize,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl JsonlHistory {
    pub fn new(path: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            path: path.into(),
            limit: limit.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<HistoryEntry>, Error> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::storage(format!(
                    "reading {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let mut entries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping malformed history line"
                ),
            }
        }
        Ok(entries)
    }

    async fn write_all(&self, entries: &[HistoryEntry]) -> Result<(), Error> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(format!("creating {}: {}", parent.display(), e)))?;
        }

        let mut content = String::new();
        for entry in entries {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| Error::storage(format!("writing {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::storage(format!("replacing {}: {}", self.path.display(), e)))
    }

    /// Drop all but the newest `limit` entries of each user, keeping file order.
    fn trim(&self, entries: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
        let mut remaining: HashMap<String, usize> = HashMap::new();
        for entry in &entries {
            *remaining.entry(entry.user_id.clone()).or_default() += 1;
        }

        entries
            .into_iter()
            .filter(|entry| {
                let count = remaining.get_mut(&entry.user_id).map(|c| {
                    *c -= 1;
                    *c
                });
                count.is_some_and(|left| left < self.limit)
            })
            .collect()
    }
}

#[async_trait]
impl HistoryStore for JsonlHistory {
    async fn append(&self, entry: HistoryEntry) -> chorus_core::Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_all().await?;
        debug!(user_id = %entry.user_id, existing = entries.len(), "Appending history entry");
        entries.push(entry);
        let entries = self.trim(entries);
        self.write_all(&entries).await
    }

    async fn recent(&self, user_id: &str, limit: usize) -> chorus_core::Result<Vec<HistoryEntry>> {
        let _guard = self.lock.lock().await;
        let mut entries: Vec<HistoryEntry> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|e| e.user_id == user_id)
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }
}
