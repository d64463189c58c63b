//! Session record persistence
//!
//! Completed tracking runs are summarized into a [`BreathSessionRecord`]
//! and handed to a [`SessionStore`]. The store is a trait seam so the
//! orchestrator never cares whether records land on disk or in a remote
//! service.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::info;

/// One down-sampled point of a finished session's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSample {
    /// Milliseconds since session start
    pub t: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub inhale: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exhale: Option<u32>,
    /// Respiratory rate at this instant, breaths per minute
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rr: Option<f64>,
}

/// Summary of one completed tracking run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreathSessionRecord {
    pub user_id: String,
    /// Unix epoch milliseconds
    pub started_at: u64,
    pub ended_at: u64,
    pub duration_seconds: u64,
    pub avg_respiratory_rate: f64,
    pub samples: Vec<RecordSample>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub notes: Option<String>,
}

/// Where finished session records go.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a record, returning its assigned id.
    async fn save(&self, record: &BreathSessionRecord) -> Result<String>;
}

/// Filesystem store: one pretty-printed JSON file per session under a
/// root directory, named by user and start time.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl SessionStore for LocalStore {
    async fn save(&self, record: &BreathSessionRecord) -> Result<String> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating session store at {}", self.root.display()))?;

        let id = format!("{}-{}", record.user_id, record.started_at);
        let path = self.root.join(format!("{id}.json"));
        let json = serde_json::to_vec_pretty(record).context("encoding session record")?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("writing session record to {}", path.display()))?;

        info!(
            id = %id,
            duration_s = record.duration_seconds,
            avg_rr = record.avg_respiratory_rate,
            "Saved session record"
        );
        Ok(id)
    }
}

/// In-memory store for tests.
#[cfg(test)]
pub struct MemoryStore {
    records: std::sync::Mutex<Vec<BreathSessionRecord>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<BreathSessionRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl SessionStore for MemoryStore {
    async fn save(&self, record: &BreathSessionRecord) -> Result<String> {
        let id = format!("{}-{}", record.user_id, record.started_at);
        self.records.lock().unwrap().push(record.clone());
        Ok(id)
    }
}
